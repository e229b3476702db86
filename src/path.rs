//! Path parsing: tokenizing a `/`-separated path into validated component
//! names without ever copying or mutating the caller's string.
//!
//! Grounded on the teacher's `fs/path.rs` (`Path`, `FileName`): a thin
//! borrowed-slice wrapper plus an iterator over components, rather than the
//! `Vec<String>` a naive port would reach for.

use itertools::Itertools;

use crate::error::{Error, Result};
use crate::layout::NAME_MAX;

/// A borrowed path, not yet split into components.
#[derive(Clone, Copy, Debug)]
pub struct Path<'a> {
    raw: &'a str,
}

impl<'a> Path<'a> {
    pub fn new(raw: &'a str) -> Self {
        Self { raw }
    }

    /// Whether this path began with `/`, i.e. should be resolved from the
    /// root directory rather than the caller's current working directory.
    pub fn is_absolute(&self) -> bool {
        self.raw.starts_with('/')
    }

    /// Iterates over the validated, non-empty components of this path, in
    /// order. `.`/`..` are yielded as ordinary components — resolving them
    /// is the directory layer's job, not the tokenizer's.
    pub fn components(&self) -> impl Iterator<Item = Result<FileName<'a>>> {
        self.raw
            .split('/')
            .filter(|s| !s.is_empty())
            .map(FileName::validate)
    }

    /// Splits off the final component (the name being created, removed, or
    /// looked up) from everything before it (the directory it lives in).
    /// `None` for a path with no components at all (empty or all slashes).
    pub fn split_last(&self) -> Option<(Path<'a>, Result<FileName<'a>>)> {
        let trimmed = self.raw.trim_end_matches('/');
        let slash = trimmed.rfind('/');
        let (dir_part, name_part) = match slash {
            Some(i) => (&self.raw[..=i], &trimmed[i + 1..]),
            None => ("", trimmed),
        };
        if name_part.is_empty() {
            return None;
        }
        Some((Path::new(dir_part), FileName::validate(name_part)))
    }

    /// True if this path, once split into components, is empty — `""`, or
    /// `"/"`, or any run of slashes.
    pub fn is_empty(&self) -> bool {
        self.components().next().is_none()
    }
}

/// One validated path component, at most [`NAME_MAX`] characters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileName<'a>(&'a str);

impl<'a> FileName<'a> {
    fn validate(raw: &'a str) -> Result<Self> {
        if raw.is_empty() || raw.len() > NAME_MAX {
            return Err(Error::NameTooLong);
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &'a str {
        self.0
    }

    pub fn is_dot(&self) -> bool {
        self.0 == "."
    }

    pub fn is_dot_dot(&self) -> bool {
        self.0 == ".."
    }
}

/// Joins path components back into a displayable string, purely for
/// logging/diagnostics — never used for on-disk comparisons.
pub fn rejoin<'a>(components: impl Iterator<Item = &'a str>) -> String {
    components.intersperse("/").collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_vs_relative() {
        assert!(Path::new("/a/b").is_absolute());
        assert!(!Path::new("a/b").is_absolute());
    }

    #[test]
    fn components_skip_repeated_slashes() {
        let names: Vec<&str> = Path::new("/a//b///c")
            .components()
            .map(|c| c.unwrap().as_str())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn name_too_long_is_rejected() {
        let long = "x".repeat(NAME_MAX + 1);
        let path = format!("/{long}");
        let result: Result<Vec<_>> = Path::new(&path).components().collect();
        assert!(matches!(result, Err(Error::NameTooLong)));
    }

    #[test]
    fn split_last_separates_parent_from_name() {
        let (parent, name) = Path::new("/a/b/c").split_last().unwrap();
        assert_eq!(parent.raw, "/a/b/");
        assert_eq!(name.unwrap().as_str(), "c");
    }

    #[test]
    fn split_last_on_bare_name_has_empty_parent() {
        let (parent, name) = Path::new("c").split_last().unwrap();
        assert!(parent.is_empty());
        assert_eq!(name.unwrap().as_str(), "c");
    }

    #[test]
    fn split_last_on_empty_path_is_none() {
        assert!(Path::new("").split_last().is_none());
        assert!(Path::new("///").split_last().is_none());
    }

    #[test]
    fn dot_and_dot_dot_are_recognized() {
        let mut it = Path::new("./..").components();
        assert!(it.next().unwrap().unwrap().is_dot());
        assert!(it.next().unwrap().unwrap().is_dot_dot());
    }
}

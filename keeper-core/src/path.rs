//! Node path helpers.
//!
//! Paths are absolute, slash-delimited and never end with a slash (except the
//! root). Sequential nodes carry a ten digit, zero-padded counter suffix.

use crate::{KeeperError, KeeperResult};

pub const ROOT: &str = "/";

/// Width of the counter the service appends to sequential node names.
pub const SEQUENCE_WIDTH: usize = 10;

/// Checks that `path` is a well-formed absolute node path.
pub fn validate_path(path: &str) -> KeeperResult<()> {
    if path.is_empty() {
        return Err(KeeperError::invalid_path(path, "path cannot be empty"));
    }
    if !path.starts_with('/') {
        return Err(KeeperError::invalid_path(path, "path must start with '/'"));
    }
    if path == ROOT {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(KeeperError::invalid_path(path, "path must not end with '/'"));
    }
    if path.contains('\0') {
        return Err(KeeperError::invalid_path(path, "null character not allowed"));
    }
    for segment in path[1..].split('/') {
        match segment {
            "" => return Err(KeeperError::invalid_path(path, "empty node name")),
            "." | ".." => {
                return Err(KeeperError::invalid_path(
                    path,
                    "relative segments are not allowed",
                ))
            }
            _ => {}
        }
    }
    Ok(())
}

/// Parent of `path`, or `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of `path`.
pub fn node_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

pub fn join(parent: &str, child: &str) -> String {
    if parent == ROOT {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Proper ancestors of `path`, outermost first, excluding the root.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut current = parent(path);
    while let Some(p) = current {
        if p == ROOT {
            break;
        }
        result.push(p.to_string());
        current = parent(p);
    }
    result.reverse();
    result
}

/// Sequence number encoded in the suffix of a sequential node name.
///
/// Names written by other clients may hold arbitrary UTF-8, so the suffix is
/// inspected as bytes.
pub fn sequence_of(name: &str) -> Option<u64> {
    let bytes = name.as_bytes();
    let start = bytes.len().checked_sub(SEQUENCE_WIDTH)?;
    let suffix = &bytes[start..];
    if !suffix.iter().all(u8::is_ascii_digit) {
        return None;
    }
    suffix
        .iter()
        .try_fold(0u64, |acc, digit| acc.checked_mul(10)?.checked_add(u64::from(digit - b'0')))
}

pub fn sequential_name(prefix: &str, sequence: u64) -> String {
    format!("{prefix}{sequence:0width$}", width = SEQUENCE_WIDTH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/").is_ok());
        assert!(validate_path("/a").is_ok());
        assert!(validate_path("/a/b/c").is_ok());

        assert!(validate_path("").is_err());
        assert!(validate_path("a/b").is_err());
        assert!(validate_path("/a/").is_err());
        assert!(validate_path("/a//b").is_err());
        assert!(validate_path("/a/./b").is_err());
        assert!(validate_path("/a/../b").is_err());
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(parent("/"), None);
        assert_eq!(parent("/a"), Some("/"));
        assert_eq!(parent("/a/b"), Some("/a"));
        assert_eq!(node_name("/a/b"), "b");
        assert_eq!(node_name("/a"), "a");
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
    }

    #[test]
    fn test_ancestors() {
        assert!(ancestors("/a").is_empty());
        assert_eq!(ancestors("/a/b/c"), vec!["/a".to_string(), "/a/b".to_string()]);
    }

    #[test]
    fn test_sequence_suffix() {
        let name = sequential_name("lock-", 42);
        assert_eq!(name, "lock-0000000042");
        assert_eq!(sequence_of(&name), Some(42));
        assert_eq!(sequence_of("lock-"), None);
        assert_eq!(sequence_of("lock-00000000x1"), None);
    }

    #[test]
    fn test_sequence_of_multibyte_names() {
        assert_eq!(sequence_of("éééééx"), None);
        assert_eq!(sequence_of("ééééé"), None);
        assert_eq!(sequence_of("été-0000000007"), Some(7));
        assert_eq!(sequence_of("0000000é12"), None);
    }

    proptest! {
        #[test]
        fn prop_join_roundtrips_through_parent_and_name(
            segments in prop::collection::vec("[a-z0-9_-]{1,8}", 1..6),
            child in "[a-z0-9_-]{1,8}",
        ) {
            let parent_path = format!("/{}", segments.join("/"));
            let path = join(&parent_path, &child);
            prop_assert!(validate_path(&path).is_ok());
            prop_assert_eq!(parent(&path), Some(parent_path.as_str()));
            prop_assert_eq!(node_name(&path), child.as_str());
            prop_assert_eq!(ancestors(&path).len(), segments.len());
        }

        #[test]
        fn prop_sequence_of_never_panics(name in "\\PC{0,16}") {
            let _ = sequence_of(&name);
        }
    }
}

//! Path validation and depth tagging.
//!
//! All keys stored in the backend are *tagged*: the path's segment count is
//! baked into the key as a `"/<depth>"` prefix, so `"/a/b"` is stored as
//! `"/2/a/b"`. Keys at different depths therefore live in disjoint prefix
//! ranges, which lets a range query ask for "children of `/a` at depth 2"
//! without ever matching `/a/b/c`. Tagging is bijective; [`untag_depth`]
//! recovers the caller-visible path.

use crate::error::{CResult, Error};

/// Characters permitted in paths, besides the `/` separator. The `:` and `.`
/// are needed for workflow definition keys (`/workflow/<type>:<id>:<version>`).
fn permitted(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':' | '.' | '/')
}

/// Number of `/`-separated segments in a path. The root `/` has depth 1,
/// `/a/b` has depth 2. Also valid on prefix paths (`/a/` has depth 2 plus
/// the open level, i.e. 3).
pub fn depth_of(path: &str) -> usize {
    path.bytes().filter(|&b| b == b'/').count()
}

fn check_common(path: &str) -> CResult<()> {
    if !path.starts_with('/') {
        return Err(Error::invalid_path(path, "must start with '/'"));
    }
    if !path.chars().all(permitted) {
        return Err(Error::invalid_path(path, "contains non-permissible characters"));
    }
    Ok(())
}

/// Validate a key path: absolute, permitted characters, no trailing `/`.
pub fn check_path(path: &str) -> CResult<()> {
    check_common(path)?;
    if path.ends_with('/') {
        return Err(Error::invalid_path(path, "must not end with '/'"));
    }
    Ok(())
}

/// Validate a prefix path, as accepted by listing operations. A trailing `/`
/// selects child paths instead of same-level prefix matches.
pub fn check_path_prefix(path: &str) -> CResult<()> {
    check_common(path)
}

/// Add the depth tag to a path. If no explicit depth is given, the path's own
/// depth is used, which is the form under which keys are stored.
pub fn tag_depth(path: &str, depth: Option<usize>) -> CResult<String> {
    if !path.starts_with('/') {
        return Err(Error::invalid_path(path, "must start with '/'"));
    }
    let depth = depth.unwrap_or_else(|| depth_of(path));
    Ok(format!("/{}{}", depth, path))
}

/// Remove the depth tag from a stored key, recovering the original path.
pub fn untag_depth(key: &str) -> CResult<String> {
    if !key.starts_with('/') {
        return Err(Error::invalid_path(key, "tagged key must start with '/'"));
    }
    match key[1..].find('/') {
        Some(ix) => Ok(key[1 + ix..].to_owned()),
        None => Err(Error::invalid_path(key, "tagged key carries no depth prefix")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_untag_roundtrip() -> CResult<()> {
        for path in ["/x", "/pb/pb-test-20240101-00000", "/workflow/batch:test:0.1.0", "/a/b/c/d"] {
            let tagged = tag_depth(path, None)?;
            assert_eq!(untag_depth(&tagged)?, path);
        }
        Ok(())
    }

    #[test]
    fn tagging_is_depth_prefixed() -> CResult<()> {
        assert_eq!(tag_depth("/a/b", None)?, "/2/a/b");
        assert_eq!(tag_depth("/a", None)?, "/1/a");
        assert_eq!(tag_depth("/a/", Some(2))?, "/2/a/");
        assert_eq!(tag_depth("/", Some(1))?, "/1/");
        Ok(())
    }

    #[test]
    fn depth_ranges_are_disjoint() -> CResult<()> {
        // A child at the next level never falls into the parent's level range.
        let level = tag_depth("/a/", Some(2))?;
        assert!(tag_depth("/a/b", None)?.starts_with(&level));
        assert!(!tag_depth("/a/b/c", None)?.starts_with(&level));
        Ok(())
    }

    #[test]
    fn depth_counts_segments() {
        assert_eq!(depth_of("/"), 1);
        assert_eq!(depth_of("/a"), 1);
        assert_eq!(depth_of("/a/b"), 2);
        assert_eq!(depth_of("/a/b/"), 3);
    }

    #[test]
    fn validation() {
        assert!(check_path("/a/b").is_ok());
        assert!(check_path("/workflow/batch:test:0.1.0").is_ok());
        assert!(check_path("a/b").is_err());
        assert!(check_path("/a/b/").is_err());
        assert!(check_path("/a b").is_err());
        assert!(check_path("/a#b").is_err());
        assert!(check_path_prefix("/a/b/").is_ok());
        assert!(check_path_prefix("a/").is_err());
    }

    #[test]
    fn untag_rejects_garbage() {
        assert!(untag_depth("nope").is_err());
        assert!(untag_depth("/2").is_err());
    }
}

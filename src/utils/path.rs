//! Helpers for slash separated node paths.

use crate::SessionError;

/// Joins a child name onto a parent path (`"/"` + `"a"` is `"/a"`).
pub fn join_path(
    parent: &str,
    child: &str,
) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), child)
}

/// Parent of `path`, or `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last path segment.
pub fn node_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Sequence number appended to a sequential node name, if any.
pub fn sequence_suffix(name: &str) -> Option<u64> {
    if name.len() < 10 {
        return None;
    }
    let (_, suffix) = name.split_at(name.len() - 10);
    suffix.parse().ok()
}

pub fn validate_path(path: &str) -> std::result::Result<(), SessionError> {
    let invalid = path.is_empty()
        || !path.starts_with('/')
        || (path.len() > 1 && path.ends_with('/'))
        || path.contains("//");
    if invalid {
        return Err(SessionError::InvalidPath(path.to_string()));
    }
    Ok(())
}

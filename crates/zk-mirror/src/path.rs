//! Slash-delimited node path helpers.
//!
//! Paths are absolute (`/a/b`), the root is `/`, and no path other than the
//! root ends with a slash.

use thiserror::Error;

/// The root path.
pub const ROOT: &str = "/";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("Path must not be empty")]
    Empty,

    #[error("Path must start with '/': {0}")]
    NotAbsolute(String),

    #[error("Path must not end with '/': {0}")]
    TrailingSlash(String),

    #[error("Empty segment in path: {0}")]
    EmptySegment(String),

    #[error("Relative segment in path: {0}")]
    RelativeSegment(String),

    #[error("Invalid character in path: {0}")]
    InvalidCharacter(String),
}

/// Check that `path` is a well-formed absolute node path.
pub fn validate(path: &str) -> Result<(), PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    if !path.starts_with('/') {
        return Err(PathError::NotAbsolute(path.to_string()));
    }
    if path == ROOT {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(PathError::TrailingSlash(path.to_string()));
    }
    if path.chars().any(|c| c == '\0' || c.is_control()) {
        return Err(PathError::InvalidCharacter(path.to_string()));
    }
    for segment in path[1..].split('/') {
        match segment {
            "" => return Err(PathError::EmptySegment(path.to_string())),
            "." | ".." => return Err(PathError::RelativeSegment(path.to_string())),
            _ => {}
        }
    }
    Ok(())
}

/// Join a parent path and a child name.
///
/// `full_path("/", "a")` is `/a`, `full_path("/a", "b")` is `/a/b`.
pub fn full_path(parent: &str, child: &str) -> String {
    if parent == ROOT {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Parent of `path`, or `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT),
        Some(pos) => Some(&path[..pos]),
        None => None,
    }
}

/// Last segment of `path`; the root's name is `/`.
pub fn name(path: &str) -> &str {
    if path == ROOT {
        return ROOT;
    }
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

/// Whether `ancestor` is a strict ancestor of `path`.
pub fn is_ancestor(ancestor: &str, path: &str) -> bool {
    if ancestor == path {
        return false;
    }
    if ancestor == ROOT {
        return path.starts_with('/');
    }
    path.strip_prefix(ancestor)
        .map(|rest| rest.starts_with('/'))
        .unwrap_or(false)
}

/// Number of segments below the root (`/` is 0, `/a/b` is 2).
pub fn depth(path: &str) -> usize {
    if path == ROOT {
        0
    } else {
        path.matches('/').count()
    }
}

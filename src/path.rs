//! Node path validation
//!
//! Paths are absolute, slash-delimited and checked before anything is put
//! on the wire.

use crate::error::ZkError;

pub const SEPARATOR: char = '/';

/// Validate a node path.
///
/// `sequential` permits a trailing separator, since the server appends the
/// sequence suffix to whatever prefix it is given.
pub fn validate_path(path: &str, sequential: bool) -> Result<(), ZkError> {
    if path.is_empty() {
        return Err(invalid(path, "path must not be empty"));
    }
    if !path.starts_with(SEPARATOR) {
        return Err(invalid(path, "path must start with '/'"));
    }
    if path.len() == 1 {
        // A sequential create under the root names "/<suffix>"
        return Ok(());
    }

    let checked = if sequential {
        // "/app/lock-" and "/app/" are both valid prefixes
        path.strip_suffix(SEPARATOR).unwrap_or(path)
    } else {
        if path.ends_with(SEPARATOR) {
            return Err(invalid(path, "path must not end with '/'"));
        }
        path
    };

    for segment in checked[1..].split(SEPARATOR) {
        match segment {
            "" => return Err(invalid(path, "empty path segment")),
            "." | ".." => return Err(invalid(path, "relative path segment")),
            _ => {}
        }
        if segment.chars().any(|c| c == '\0' || c.is_control()) {
            return Err(invalid(path, "control character in path"));
        }
    }
    Ok(())
}

fn invalid(path: &str, reason: &str) -> ZkError {
    ZkError::InvalidArgument(format!("{}: {:?}", reason, path))
}

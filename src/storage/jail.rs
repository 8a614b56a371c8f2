//! Path jail
//!
//! Maps client-supplied logical paths onto absolute paths beneath the root
//! directory. Resolution is purely lexical; it never touches the filesystem.

use std::path::{Path, PathBuf};

use crate::error::StorageError;

/// Normalizes `logical` and joins it under `root`.
///
/// `.` segments and empty segments are dropped and `..` pops one segment.
/// A path that normalizes to the root itself, or that climbs above it, is a
/// file name error.
pub fn resolve(root: &Path, logical: &str) -> Result<PathBuf, StorageError> {
    let segments = normalize(logical)?;
    if segments.is_empty() {
        return Err(StorageError::InvalidPath(logical.to_string()));
    }

    let mut resolved = root.to_path_buf();
    for segment in segments {
        resolved.push(segment);
    }
    Ok(resolved)
}

/// Canonical `/a/b` form of a logical path, for logging and lock keys.
pub fn clean(logical: &str) -> Result<String, StorageError> {
    let segments = normalize(logical)?;
    Ok(format!("/{}", segments.join("/")))
}

fn normalize(logical: &str) -> Result<Vec<&str>, StorageError> {
    if logical.contains('\0') {
        return Err(StorageError::InvalidPath(logical.escape_default().to_string()));
    }

    let mut segments = Vec::new();
    for segment in logical.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(StorageError::InvalidPath(logical.to_string()));
                }
            }
            #[cfg(windows)]
            s if s.contains(['\\', ':']) => {
                return Err(StorageError::InvalidPath(logical.to_string()));
            }
            s => segments.push(s),
        }
    }
    Ok(segments)
}

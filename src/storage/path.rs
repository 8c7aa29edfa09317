//! Lexical resolution of user-supplied relative paths against a root.

use super::{StorageError, StorageResult};
use std::{
    ffi::OsStr,
    path::{Component, Path, PathBuf},
};

const MAX_PATH_LEN: usize = 1024;

/// Collapse `.`, empty segments and inner `..` in `user_path`.
///
/// Fails with `PathTraversal` when a `..` would climb above the start, or
/// when the path is absolute.
fn segments(user_path: &str) -> StorageResult<Vec<&OsStr>> {
    if user_path.len() > MAX_PATH_LEN {
        return Err(StorageError::InvalidPath(format!(
            "path exceeds {MAX_PATH_LEN} bytes"
        )));
    }
    if user_path.bytes().any(|b| b == b'\0' || b.is_ascii_control()) {
        return Err(StorageError::InvalidPath(
            "path contains control characters".into(),
        ));
    }

    let mut parts = Vec::new();
    for component in Path::new(user_path).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(StorageError::PathTraversal(user_path.to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::PathTraversal(user_path.to_string()));
            }
        }
    }
    Ok(parts)
}

/// Canonical `/`-joined form of a logical path, used as the metadata key.
pub fn normalize(user_path: &str) -> StorageResult<String> {
    let parts = segments(user_path)?;
    if parts.is_empty() {
        return Err(StorageError::InvalidPath("path is empty".into()));
    }
    Ok(parts
        .iter()
        .map(|part| part.to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

/// Resolve `user_path` beneath `base`.
///
/// The result is either `base` itself or a path with `base` as a strict
/// component prefix. Nothing on disk is consulted or modified.
pub fn resolve(base: &Path, user_path: &str) -> StorageResult<PathBuf> {
    let mut resolved = base.to_path_buf();
    for part in segments(user_path)? {
        resolved.push(part);
    }

    if resolved != base && !resolved.starts_with(base) {
        return Err(StorageError::PathTraversal(user_path.to_string()));
    }
    Ok(resolved)
}

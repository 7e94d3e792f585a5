use std::path::{Component, Path, PathBuf};

use docsync_core::PARTIAL_SUFFIX;
use thiserror::Error;

/// Reserved subfolder of every pairing root; holds the metadata store and
/// is never scanned.
pub const RESERVED_DIR: &str = ".docsync";

/// Extension appended to a file name to form its sentinel marker.
pub const SENTINEL_EXT: &str = "docsync";

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("path contains unsupported component")]
    UnsupportedComponent,
    #[error("path is outside the pairing root: {0}")]
    OutsideRoot(PathBuf),
}

/// Normalizes a relative path to `/`-separated form without leading or
/// trailing separators. The root itself normalizes to `""`.
pub fn normalize(path: &str) -> Result<String, PathError> {
    let mut parts = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => return Err(PathError::UnsupportedComponent),
            other => parts.push(other),
        }
    }
    Ok(parts.join("/"))
}

pub fn relative_to(root: &Path, path: &Path) -> Result<String, PathError> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| PathError::OutsideRoot(path.to_path_buf()))?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => continue,
            _ => return Err(PathError::UnsupportedComponent),
        }
    }
    Ok(parts.join("/"))
}

pub fn local_path_for(root: &Path, relative: &str) -> Result<PathBuf, PathError> {
    if relative.is_empty() {
        return Ok(root.to_path_buf());
    }

    let mut out = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Splits a normalized path into `(parent, name)`.
pub fn split(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", path),
    }
}

/// True when `path` lies strictly below `folder`.
pub fn is_within(path: &str, folder: &str) -> bool {
    if folder.is_empty() {
        return !path.is_empty();
    }
    path.len() > folder.len()
        && path.starts_with(folder)
        && path.as_bytes()[folder.len()] == b'/'
}

/// Moves `path` from below `old_prefix` to below `new_prefix`.
pub fn rebase(path: &str, old_prefix: &str, new_prefix: &str) -> Option<String> {
    if path == old_prefix {
        return Some(new_prefix.to_string());
    }
    if !is_within(path, old_prefix) {
        return None;
    }
    let rest = &path[old_prefix.len() + 1..];
    Some(join(new_prefix, rest))
}

pub fn sentinel_name(name: &str) -> String {
    format!("{name}.{SENTINEL_EXT}")
}

pub fn is_sentinel(name: &str) -> bool {
    name.len() > SENTINEL_EXT.len() + 1
        && name.ends_with(SENTINEL_EXT)
        && name.as_bytes()[name.len() - SENTINEL_EXT.len() - 1] == b'.'
}

/// An in-flight download; it only becomes a real entry once renamed.
pub fn is_partial(name: &str) -> bool {
    name.len() > PARTIAL_SUFFIX.len() && name.ends_with(PARTIAL_SUFFIX)
}

/// Hidden entries and anything under the reserved folder are never synced.
pub fn is_ignored(relative: &str) -> bool {
    relative
        .split('/')
        .any(|part| part == RESERVED_DIR || part.starts_with('.'))
}

//! Path normalization utilities for paths persisted across processes.
//!
//! Every path that is written to disk and read back by another process
//! (alternates pointers, repo metadata, mapping records) goes through these
//! functions so that all enlistments agree on one spelling of a path.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Expand a leading `~` to the home directory.
///
/// Paths without a leading `~` (or when no home directory is known) are
/// returned unchanged.
pub fn expand_tilde(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

/// Make a path absolute without requiring it to exist.
///
/// Existing paths are canonicalized. For paths that do not exist yet the
/// nearest existing ancestor is canonicalized and the remainder appended.
pub fn absolute(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = expand_tilde(path);
    let path = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .context("Failed to get current directory")?
            .join(path)
    };

    if let Ok(canonical) = path.canonicalize() {
        return Ok(canonical);
    }

    let mut missing = Vec::new();
    let mut cursor = path.as_path();
    while !cursor.exists() {
        match (cursor.parent(), cursor.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                cursor = parent;
            }
            _ => return Ok(path),
        }
    }

    let mut resolved = cursor
        .canonicalize()
        .with_context(|| format!("Failed to resolve path: {}", cursor.display()))?;
    for name in missing.into_iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}

/// Generate a stable enlistment ID from an enlistment root path using BLAKE3.
pub fn compute_enlistment_id(enlistment_root: impl AsRef<Path>) -> String {
    let path = enlistment_root.as_ref();
    let canon = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let mut hasher = blake3::Hasher::new();
    hasher.update(canon.to_string_lossy().as_bytes());
    hasher.finalize().to_hex()[..32].to_string()
}

/// Render a path the way it is persisted: no trailing separator.
pub fn persisted_form(path: impl AsRef<Path>) -> String {
    let rendered = path.as_ref().to_string_lossy().into_owned();
    let trimmed = rendered.trim_end_matches(std::path::MAIN_SEPARATOR);
    if trimmed.is_empty() {
        rendered
    } else {
        trimmed.to_string()
    }
}

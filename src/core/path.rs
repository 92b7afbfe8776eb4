//! Path sanitization and safe joining.
//!
//! Every client-supplied path fragment passes through [`sanitize`] before it
//! reaches the engine, and every backend path passes through [`safe_join`]
//! before it reaches the local filesystem. The sanitizer tracks a depth
//! counter across segments so that `..` can never climb above the root, and
//! the joiner re-checks the symlink-resolved result against the trusted root.

use std::path::{Component, Path, PathBuf};

use super::error::{FsError, FsResult};

/// A canonical absolute path split into the parts the metadata layer needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedPath {
    /// Canonical absolute path, starting with `/`
    pub full: String,
    /// Parent path (`/` for top-level entries, `/` for the root itself)
    pub parent: String,
    /// Final segment (empty for the root)
    pub name: String,
}

/// Normalize a client-supplied path fragment into a canonical absolute path.
///
/// Rejects empty input, NUL and non-tab control bytes, and any traversal
/// sequence that would logically escape the root.
pub fn sanitize(raw: &str) -> FsResult<SanitizedPath> {
    if raw.is_empty() {
        return Err(FsError::InvalidInput("empty path".to_string()));
    }

    for b in raw.bytes() {
        if b < 0x20 && b != b'\t' {
            return Err(FsError::InvalidInput(format!(
                "path contains control byte 0x{b:02x}"
            )));
        }
    }

    let mut segments: Vec<&str> = Vec::new();
    let mut depth: i64 = 0;
    for segment in raw.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                depth -= 1;
                if depth < 0 {
                    return Err(FsError::InvalidInput(format!(
                        "path {raw:?} escapes the root"
                    )));
                }
                segments.pop();
            }
            name => {
                depth += 1;
                segments.push(name);
            }
        }
    }

    let full = if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    };
    let (parent, name) = split_parent(&full);

    Ok(SanitizedPath {
        full,
        parent,
        name,
    })
}

/// Split a canonical path into (parent, name). The root parents itself.
pub fn split_parent(full: &str) -> (String, String) {
    if full == "/" {
        return ("/".to_string(), String::new());
    }
    match full.rfind('/') {
        Some(0) => ("/".to_string(), full[1..].to_string()),
        Some(idx) => (full[..idx].to_string(), full[idx + 1..].to_string()),
        None => ("/".to_string(), full.to_string()),
    }
}

/// Parent path of a canonical absolute path.
pub fn parent_of(full: &str) -> String {
    split_parent(full).0
}

/// Join a trusted root with an already-sanitized relative path, resolving
/// symlinks in the existing ancestry. Fails with forbidden when the resolved
/// location falls outside the root.
pub fn safe_join(root: &Path, relative: &str) -> FsResult<PathBuf> {
    let sanitized = sanitize(relative)?;
    let rel = sanitized.full.trim_start_matches('/');

    let root = root
        .canonicalize()
        .map_err(|e| FsError::Internal(format!("root {root:?} not resolvable: {e}")))?;

    let joined = root.join(rel);

    // Resolve the longest existing ancestor so symlinks inside it cannot
    // redirect the tail outside the root.
    let mut existing = joined.clone();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(resolved) => {
                let mut rebuilt = resolved;
                for part in tail.iter().rev() {
                    rebuilt.push(part);
                }
                if !rebuilt.starts_with(&root) {
                    return Err(FsError::Forbidden(format!(
                        "path {relative:?} resolves outside the storage root"
                    )));
                }
                return Ok(rebuilt);
            }
            Err(_) => {
                let name = existing.file_name().map(|n| n.to_os_string());
                let parent = existing.parent().map(|p| p.to_path_buf());
                match (name, parent) {
                    (Some(name), Some(parent)) => {
                        tail.push(name);
                        existing = parent;
                    }
                    _ => {
                        return Err(FsError::Forbidden(format!(
                            "path {relative:?} has no resolvable ancestor"
                        )))
                    }
                }
            }
        }
    }
}

/// Strip any leading slash so a canonical path can be used backend-relative.
pub fn to_relative(full: &str) -> &str {
    full.trim_start_matches('/')
}

/// Check whether `path` sits directly or transitively under `prefix`.
pub fn has_prefix(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    path == prefix || path.starts_with(&format!("{prefix}/"))
}

#[allow(unused)]
fn component_count(path: &Path) -> usize {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count()
}

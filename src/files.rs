//! File maps handed over by the code-generation layer.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use crate::error::{Result, RunboxError};

/// Relative path -> UTF-8 content.
pub type FileMap = BTreeMap<String, String>;

/// Normalize a runtime-relative path, rejecting anything that could escape
/// the runtime's workspace.
pub fn normalize_rel_path(rel: &str) -> Result<PathBuf> {
    let invalid = |reason| RunboxError::InvalidPath {
        path: rel.to_string(),
        reason,
    };

    if rel.trim().is_empty() {
        return Err(invalid("path is empty"));
    }

    let p = Path::new(rel);
    if p.is_absolute() {
        return Err(invalid("path must be relative"));
    }

    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => return Err(invalid("path traversal is not allowed")),
            Component::Prefix(_) | Component::RootDir => {
                return Err(invalid("path must be relative"))
            }
        }
    }

    if out.as_os_str().is_empty() {
        return Err(invalid("path is empty"));
    }
    Ok(out)
}

/// Validate every path of a file map and return it keyed by normalized path.
pub fn normalize_file_map(files: &FileMap) -> Result<FileMap> {
    let mut out = FileMap::new();
    for (path, content) in files {
        let normalized = normalize_rel_path(path)?;
        out.insert(normalized.to_string_lossy().into_owned(), content.clone());
    }
    Ok(out)
}

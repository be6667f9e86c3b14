//! SQL source discovery.
//!
//! A [`SourceUnit`] is one named piece of SQL text, either supplied inline or
//! read from a `*.sql` file below a root directory. File names are derived
//! from the path relative to the root: `users/find_by_id.sql` becomes the key
//! `users.find_by_id` and the name `users_find_by_id`.

use crate::error::{DbError, DbResult};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

const SQL_EXTENSION: &str = "sql";

/// One named SQL text, before compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    /// Path parts joined by `_`; must be unique across all sources
    pub name: String,
    /// Path parts joined by `.`; the lookup key used by `sql()`
    pub key: String,
    /// Absolute file path, `None` for inline sources
    pub path: Option<PathBuf>,
    /// Identity reported in conflict errors
    pub relative_path: String,
    pub text: String,
    pub path_parts: Vec<String>,
}

impl SourceUnit {
    /// Create a source from an in-memory key such as `users.find`.
    pub fn inline(key: impl Into<String>, text: impl Into<String>) -> Self {
        let key = key.into();
        let path_parts: Vec<String> = key.split('.').map(String::from).collect();
        Self::from_parts(path_parts, None, key, text.into())
    }

    fn from_parts(
        path_parts: Vec<String>,
        path: Option<PathBuf>,
        relative_path: String,
        text: String,
    ) -> Self {
        Self {
            name: path_parts.join("_"),
            key: path_parts.join("."),
            path,
            relative_path,
            text,
            path_parts,
        }
    }
}

/// Recursively load every `*.sql` file below each root, in root order.
///
/// Traversal within a root is sorted by file name so load order (and
/// therefore conflict reporting) is deterministic.
pub fn load_sql_files(roots: &[PathBuf]) -> DbResult<Vec<SourceUnit>> {
    let mut sources = Vec::new();
    for root in roots {
        sources.extend(load_root(root)?);
    }
    Ok(sources)
}

fn load_root(root: &Path) -> DbResult<Vec<SourceUnit>> {
    let root = root
        .canonicalize()
        .map_err(|e| DbError::io(root.display().to_string(), e.to_string()))?;

    let mut sources = Vec::new();
    for entry in WalkDir::new(&root).sort_by_file_name() {
        let entry = entry.map_err(|e| DbError::io(root.display().to_string(), e.to_string()))?;
        let file_path = entry.path();

        let is_sql = entry.file_type().is_file()
            && file_path
                .extension()
                .is_some_and(|ext| ext == SQL_EXTENSION);
        if !is_sql {
            continue;
        }

        let relative = file_path
            .strip_prefix(&root)
            .map_err(|e| DbError::internal(format!("{}: {}", file_path.display(), e)))?;

        let text = std::fs::read_to_string(file_path)
            .map_err(|e| DbError::io(file_path.display().to_string(), e.to_string()))?;

        let source = SourceUnit::from_parts(
            path_parts(relative),
            Some(file_path.to_path_buf()),
            relative_path_string(relative),
            text,
        );
        debug!(key = %source.key, path = %file_path.display(), "Loaded SQL source");
        sources.push(source);
    }

    Ok(sources)
}

/// Directory components followed by the file stem.
fn path_parts(relative: &Path) -> Vec<String> {
    let mut parts: Vec<String> = relative
        .parent()
        .into_iter()
        .flat_map(|dir| dir.components())
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();

    if let Some(stem) = relative.file_stem() {
        parts.push(stem.to_string_lossy().into_owned());
    }
    parts
}

fn relative_path_string(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

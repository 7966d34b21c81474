//! Locating and loading the AsyncAPI description.

use std::path::{Path, PathBuf};

use asyncbridge_spec::{parse_document_file, Document};
use asyncbridge_telemetry::log_document_loaded;

use crate::error::BridgeError;

/// Resolve `path` to a description file.
///
/// A directory stands for an upload area holding a single description: its
/// first regular file by name is used. Hidden files are skipped.
pub fn locate_document(path: &Path) -> Result<PathBuf, BridgeError> {
    if !path.is_dir() {
        return Ok(path.to_path_buf());
    }

    let entries = std::fs::read_dir(path).map_err(asyncbridge_spec::ParseError::Io)?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with('.'))
        })
        .collect();
    files.sort();

    files
        .into_iter()
        .next()
        .ok_or_else(|| BridgeError::NoDocument(path.to_path_buf()))
}

/// Locate and parse the description at `path`.
pub fn load_document(path: &Path) -> Result<(PathBuf, Document), BridgeError> {
    let file = locate_document(path)?;
    let document = parse_document_file(&file)?;
    log_document_loaded!(
        path = %file.display(),
        title = %document.title,
        channels = document.channels.len(),
        servers = document.servers.len()
    );
    Ok((file, document))
}

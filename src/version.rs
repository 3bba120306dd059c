//! File-version oracle. A version token is `"<mtime-ms>:<size-bytes>"`;
//! equality is the only signal anyone uses for cache validity. Never
//! cached at this layer.

use std::fs::Metadata;
use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Format a version token from already-fetched metadata.
pub fn version_of(meta: &Metadata) -> String {
    let mtime_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("{}:{}", mtime_ms, meta.len())
}

/// Version of the file at `path`. `Ok(None)` for missing paths or
/// non-files (ENOENT / ENOTDIR are non-matches, not failures); genuine
/// I/O errors propagate.
pub async fn file_version(path: &Path) -> io::Result<Option<String>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(Some(version_of(&meta))),
        Ok(_) => Ok(None),
        Err(err) if is_missing(&err) => Ok(None),
        Err(err) => Err(err),
    }
}

/// ENOENT and ENOTDIR both mean "nothing routable here".
pub fn is_missing(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}

//! Static file dispatch. Runs only after a handler miss: GET/HEAD, no
//! bare directory index, never `.mjs` source, never outside the root.

use std::io;
use std::path::{Path, PathBuf};

use axum::http::Method;
use tokio::fs::File;

use crate::request_path::ParsedPath;
use crate::resolver::is_under_root;
use crate::version::is_missing;

/// A static file ready to stream. `file` is `None` for HEAD requests;
/// headers are identical either way.
#[derive(Debug)]
pub struct StaticFileReply {
    pub path: PathBuf,
    pub content_type: &'static str,
    pub content_length: u64,
    pub file: Option<File>,
}

/// Content-Type by file extension. The table is deliberately small; the
/// default is an opaque octet stream.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("css") => "text/css; charset=utf-8",
        Some("html") => "text/html; charset=utf-8",
        Some("ico") => "image/x-icon",
        Some("js") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("map") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("txt") => "text/plain; charset=utf-8",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

/// Try to serve `parsed` as a static file. `Ok(None)` is a clean miss
/// (caller answers 404); only genuine I/O errors propagate.
pub async fn serve_static(
    root: &Path,
    parsed: &ParsedPath,
    method: &Method,
) -> io::Result<Option<StaticFileReply>> {
    if method != Method::GET && method != Method::HEAD {
        return Ok(None);
    }
    if parsed.segments.is_empty() || parsed.names_module_source() {
        return Ok(None);
    }

    let mut path = root.to_path_buf();
    for segment in &parsed.segments {
        path.push(segment);
    }
    if path.extension().and_then(|e| e.to_str()) == Some("mjs") {
        return Ok(None);
    }
    if !is_under_root(root, &path).await? {
        return Ok(None);
    }

    let meta = match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => meta,
        Ok(_) => return Ok(None),
        Err(err) if is_missing(&err) => return Ok(None),
        Err(err) => return Err(err),
    };

    let file = if method == Method::HEAD {
        None
    } else {
        match File::open(&path).await {
            Ok(f) => Some(f),
            Err(err) if is_missing(&err) => return Ok(None),
            Err(err) => return Err(err),
        }
    };

    Ok(Some(StaticFileReply {
        content_type: content_type_for(&path),
        content_length: meta.len(),
        path,
        file,
    }))
}

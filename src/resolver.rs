//! Handler resolution: map validated segments to candidate `.mjs` files
//! under the dynamic root and pick the first one that exists.
//!
//! `index.mjs` at a directory wins over a sibling `<dir>.mjs` (priority
//! 0 < 1). A pathname that literally ends in `.mjs` never resolves.

use std::io;
use std::path::{Path, PathBuf};

use crate::request_path::ParsedPath;
use crate::version::{file_version, is_missing};

pub const HANDLER_SUFFIX: &str = "mjs";
pub const INDEX_FILE: &str = "index.mjs";

/// A handler file that exists right now, with its current version token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHandler {
    pub file_path: PathBuf,
    pub version: String,
}

/// Candidate paths for a parsed request, in priority order.
pub fn candidates(root: &Path, parsed: &ParsedPath) -> Vec<PathBuf> {
    if parsed.segments.is_empty() {
        return vec![root.join(INDEX_FILE)];
    }
    let mut dir = root.to_path_buf();
    for segment in &parsed.segments {
        dir.push(segment);
    }
    let leaf = {
        let last = parsed.segments.last().expect("segments checked non-empty");
        dir.parent()
            .expect("joined path always has a parent")
            .join(format!("{last}.{HANDLER_SUFFIX}"))
    };
    vec![dir.join(INDEX_FILE), leaf]
}

/// Resolve the request to a handler file, or `None` on miss.
///
/// `root` must already be canonical. Each existing candidate is
/// re-checked to still be under the root after symlink resolution; C1
/// already blocked `..`, this is defense in depth.
pub async fn resolve_handler(
    root: &Path,
    parsed: &ParsedPath,
) -> io::Result<Option<ResolvedHandler>> {
    if parsed.names_module_source() {
        return Ok(None);
    }
    for candidate in candidates(root, parsed) {
        if !is_under_root(root, &candidate).await? {
            continue;
        }
        if let Some(version) = file_version(&candidate).await? {
            return Ok(Some(ResolvedHandler {
                file_path: candidate,
                version,
            }));
        }
    }
    Ok(None)
}

/// True when `candidate`, after resolving symlinks, still lives under
/// `root`. Missing candidates pass (they carry no version and are skipped
/// by the caller anyway).
pub async fn is_under_root(root: &Path, candidate: &Path) -> io::Result<bool> {
    match tokio::fs::canonicalize(candidate).await {
        Ok(real) => Ok(real.starts_with(root)),
        Err(err) if is_missing(&err) => Ok(true),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request_path::parse;

    async fn canonical(dir: &tempfile::TempDir) -> PathBuf {
        tokio::fs::canonicalize(dir.path()).await.unwrap()
    }

    #[tokio::test]
    async fn empty_path_resolves_root_index() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.mjs"), b"export default () => {}").unwrap();
        let root = canonical(&dir).await;

        let hit = resolve_handler(&root, &parse("/").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.file_path, root.join("index.mjs"));
    }

    #[tokio::test]
    async fn index_wins_over_sibling_module() {
        let dir = tempfile::tempdir().unwrap();
        let root = canonical(&dir).await;
        std::fs::create_dir_all(root.join("aaa/bb/cc")).unwrap();
        std::fs::write(root.join("aaa/bb/cc/index.mjs"), b"export default () => 'index'").unwrap();
        std::fs::write(root.join("aaa/bb/cc.mjs"), b"export default () => 'leaf'").unwrap();

        let hit = resolve_handler(&root, &parse("/aaa/bb/cc").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.file_path, root.join("aaa/bb/cc/index.mjs"));
    }

    #[tokio::test]
    async fn falls_back_to_leaf_module() {
        let dir = tempfile::tempdir().unwrap();
        let root = canonical(&dir).await;
        std::fs::create_dir_all(root.join("aaa/bb")).unwrap();
        std::fs::write(root.join("aaa/bb/cc.mjs"), b"export default () => 'leaf'").unwrap();

        let hit = resolve_handler(&root, &parse("/aaa/bb/cc").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.file_path, root.join("aaa/bb/cc.mjs"));
    }

    #[tokio::test]
    async fn literal_module_path_never_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let root = canonical(&dir).await;
        std::fs::write(root.join("cc.mjs"), b"export default () => {}").unwrap();

        let miss = resolve_handler(&root, &parse("/cc.mjs").unwrap())
            .await
            .unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn dotted_segment_keeps_its_name_in_leaf_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let root = canonical(&dir).await;
        let cands = candidates(&root, &parse("/v1.2/info").unwrap());
        assert_eq!(cands[0], root.join("v1.2/info/index.mjs"));
        assert_eq!(cands[1], root.join("v1.2/info.mjs"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escaping_root_is_skipped() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("escape.mjs"), b"export default () => {}").unwrap();

        let dir = tempfile::tempdir().unwrap();
        let root = canonical(&dir).await;
        std::os::unix::fs::symlink(
            outside.path().join("escape.mjs"),
            root.join("escape.mjs"),
        )
        .unwrap();

        let miss = resolve_handler(&root, &parse("/escape").unwrap())
            .await
            .unwrap();
        assert!(miss.is_none());
    }
}

//! Module archive installer. Accepts `.tar`, `.tar.gz` and `.tgz`
//! archives only; zip (and everything else) is rejected up front.
//!
//! Layout detection: an archive whose entries all live under a single
//! top-level directory is *nested* — that directory name is the module.
//! Anything else is *flat* and lands under a directory named after the
//! archive base name.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::info;

use crate::error::InstallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
}

/// Result of a successful install.
#[derive(Debug, Clone)]
pub struct InstalledModule {
    pub name: String,
    pub dir: PathBuf,
    pub files: usize,
}

pub fn detect_format(archive: &Path) -> Result<ArchiveFormat, InstallError> {
    let name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_ascii_lowercase)
        .ok_or(InstallError::NoBaseName)?;
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Ok(ArchiveFormat::TarGz)
    } else if name.ends_with(".tar") {
        Ok(ArchiveFormat::Tar)
    } else {
        Err(InstallError::UnsupportedFormat(
            archive
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or(&name)
                .to_string(),
        ))
    }
}

/// The module name an archive would install as in flat layout.
fn base_name(archive: &Path) -> Result<String, InstallError> {
    let name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(InstallError::NoBaseName)?;
    let lowered = name.to_ascii_lowercase();
    let stem = if lowered.ends_with(".tar.gz") {
        &name[..name.len() - ".tar.gz".len()]
    } else if lowered.ends_with(".tgz") {
        &name[..name.len() - ".tgz".len()]
    } else if lowered.ends_with(".tar") {
        &name[..name.len() - ".tar".len()]
    } else {
        name
    };
    if stem.is_empty() {
        return Err(InstallError::NoBaseName);
    }
    Ok(stem.to_string())
}

fn open_archive(
    archive: &Path,
    format: ArchiveFormat,
) -> io::Result<Archive<Box<dyn Read>>> {
    let file = File::open(archive)?;
    let reader: Box<dyn Read> = match format {
        ArchiveFormat::Tar => Box::new(file),
        ArchiveFormat::TarGz => Box::new(GzDecoder::new(file)),
    };
    Ok(Archive::new(reader))
}

/// Every component must be a normal name; absolute paths and `..` refuse
/// the whole archive.
fn sanitized(entry_path: &Path) -> Result<PathBuf, InstallError> {
    let mut out = PathBuf::new();
    for component in entry_path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => {
                return Err(InstallError::UnsafeEntry(
                    entry_path.to_string_lossy().into_owned(),
                ))
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(InstallError::UnsafeEntry(
            entry_path.to_string_lossy().into_owned(),
        ));
    }
    Ok(out)
}

/// Install a module archive into the dynamic directory.
pub fn install_archive(root: &Path, archive: &Path) -> Result<InstalledModule, InstallError> {
    let format = detect_format(archive)?;

    // Pass 1: list entries, decide the layout.
    let mut file_paths = Vec::new();
    let mut top_level: BTreeSet<String> = BTreeSet::new();
    {
        let mut tar = open_archive(archive, format)?;
        for entry in tar.entries()? {
            let entry = entry?;
            let path = sanitized(&entry.path()?)?;
            let first = path
                .components()
                .next()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .unwrap_or_default();
            top_level.insert(first);
            if entry.header().entry_type().is_file() {
                file_paths.push(path);
            }
        }
    }
    if file_paths.is_empty() {
        return Err(InstallError::EmptyArchive);
    }

    // Nested: one shared top-level directory, and it is a directory (a
    // lone top-level file is flat by definition).
    let nested_dir = if top_level.len() == 1 {
        let only = top_level.iter().next().cloned().unwrap_or_default();
        let is_dir = file_paths
            .iter()
            .all(|p| p.components().count() > 1);
        is_dir.then_some(only)
    } else {
        None
    };

    let (module_name, dest) = match &nested_dir {
        Some(dir) => (dir.clone(), root.to_path_buf()),
        None => {
            let name = base_name(archive)?;
            (name.clone(), root.join(&name))
        }
    };

    // Pass 2: extract.
    let mut files = 0usize;
    let mut tar = open_archive(archive, format)?;
    for entry in tar.entries()? {
        let mut entry = entry?;
        let rel = sanitized(&entry.path()?)?;
        let target = dest.join(&rel);
        if entry.header().entry_type().is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if !entry.header().entry_type().is_file() {
            // Links and specials never make it into the dynamic tree.
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
        files += 1;
    }

    let module_dir = match nested_dir {
        Some(dir) => root.join(dir),
        None => dest,
    };
    info!(module = %module_name, dir = %module_dir.display(), files, "installed module");
    Ok(InstalledModule {
        name: module_name,
        dir: module_dir,
        files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    // Writes the entry name into the header's raw name field, bypassing the
    // `tar` crate's `set_path` validation so fixtures can include traversal
    // segments (`..`) for the rejection tests below.
    fn set_raw_name(header: &mut tar::Header, name: &str) {
        let bytes = name.as_bytes();
        let dst = &mut header.as_old_mut().name;
        dst.fill(0);
        dst[..bytes.len()].copy_from_slice(bytes);
    }

    fn write_tar(path: &Path, entries: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(file);
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            set_raw_name(&mut header, name);
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, content.as_bytes()).unwrap();
        }
        builder.finish().unwrap();
    }

    fn write_tar_gz(path: &Path, entries: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let gz = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(gz);
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            set_raw_name(&mut header, name);
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, content.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn zip_archives_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let zip = dir.path().join("mod.zip");
        std::fs::write(&zip, b"PK\x03\x04").unwrap();
        assert!(matches!(
            install_archive(dir.path(), &zip),
            Err(InstallError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn empty_archive_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("empty.tar");
        write_tar(&tar_path, &[]);
        assert!(matches!(
            install_archive(dir.path(), &tar_path),
            Err(InstallError::EmptyArchive)
        ));
    }

    #[test]
    fn nested_layout_takes_the_top_directory_name() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        let tar_path = dir.path().join("whatever.tar");
        write_tar(
            &tar_path,
            &[
                ("blog/index.mjs", "export default () => 'blog'"),
                ("blog/style.css", "body {}"),
            ],
        );

        let installed = install_archive(&root, &tar_path).unwrap();
        assert_eq!(installed.name, "blog");
        assert_eq!(installed.files, 2);
        assert!(root.join("blog/index.mjs").is_file());
    }

    #[test]
    fn flat_layout_uses_the_archive_base_name() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        let tar_path = dir.path().join("shop.tar.gz");
        write_tar_gz(
            &tar_path,
            &[("index.mjs", "export default () => 'shop'"), ("a.txt", "x")],
        );

        let installed = install_archive(&root, &tar_path).unwrap();
        assert_eq!(installed.name, "shop");
        assert!(root.join("shop/index.mjs").is_file());
        assert!(root.join("shop/a.txt").is_file());
    }

    #[test]
    fn traversal_entries_refuse_the_archive() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        let tar_path = dir.path().join("evil.tar");
        write_tar(&tar_path, &[("../escape.mjs", "export default () => {}")]);

        assert!(matches!(
            install_archive(&root, &tar_path),
            Err(InstallError::UnsafeEntry(_))
        ));
        assert!(!dir.path().join("escape.mjs").exists());
    }

    #[test]
    fn tgz_extension_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("m.tgz");
        write_tar_gz(&tar_path, &[("m/index.mjs", "export default () => 'm'")]);
        assert_eq!(detect_format(&tar_path).unwrap(), ArchiveFormat::TarGz);
        let installed = install_archive(dir.path(), &tar_path).unwrap();
        assert_eq!(installed.name, "m");
    }
}

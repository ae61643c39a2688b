//! Layer extraction into a driver rootfs.
//!
//! Layers may be gzip-compressed or plain tar. OCI whiteout entries
//! (`.wh.<name>` and `.wh..wh..opq`) delete content from lower layers.

use csi_proxy_core::error::{ProxyError, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};
use tar::Archive;

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Extract one layer blob on top of `target_dir`.
pub fn extract_layer(layer_path: &Path, target_dir: &Path) -> Result<()> {
    let layer_error = |message: String| {
        ProxyError::OciImageError(format!(
            "Failed to extract layer {}: {}",
            layer_path.display(),
            message
        ))
    };

    std::fs::create_dir_all(target_dir).map_err(|e| layer_error(e.to_string()))?;

    let mut reader =
        BufReader::new(File::open(layer_path).map_err(|e| layer_error(e.to_string()))?);
    let mut magic = [0u8; 2];
    let compressed = {
        let buf = std::io::BufRead::fill_buf(&mut reader).map_err(|e| layer_error(e.to_string()))?;
        if buf.len() >= 2 {
            magic.copy_from_slice(&buf[..2]);
        }
        magic == GZIP_MAGIC
    };

    let stream: Box<dyn Read> = if compressed {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    };

    let mut archive = Archive::new(stream);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    for entry in archive.entries().map_err(|e| layer_error(e.to_string()))? {
        let mut entry = entry.map_err(|e| layer_error(e.to_string()))?;
        let path = entry.path().map_err(|e| layer_error(e.to_string()))?.into_owned();

        let Some(relative) = sanitize(&path) else {
            tracing::warn!(entry = %path.display(), "Skipping layer entry outside rootfs");
            continue;
        };

        let file_name = relative
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if file_name.starts_with(WHITEOUT_PREFIX) {
            let relative_parent = relative.parent().unwrap_or(Path::new(""));
            if !is_plain_dir_chain(target_dir, relative_parent) {
                tracing::warn!(
                    entry = %path.display(),
                    "Skipping whiteout below a symlink"
                );
                continue;
            }
            let parent = target_dir.join(relative_parent);

            if file_name == OPAQUE_WHITEOUT {
                clear_dir(&parent).map_err(|e| layer_error(e.to_string()))?;
                continue;
            }
            let hidden = &file_name[WHITEOUT_PREFIX.len()..];
            if hidden.is_empty() || hidden == "." || hidden == ".." {
                tracing::warn!(entry = %path.display(), "Skipping malformed whiteout");
                continue;
            }
            remove_path(&parent.join(hidden)).map_err(|e| layer_error(e.to_string()))?;
            continue;
        }

        entry
            .unpack_in(target_dir)
            .map_err(|e| layer_error(e.to_string()))?;
    }

    tracing::debug!(
        layer = %layer_path.display(),
        target = %target_dir.display(),
        compressed,
        "Extracted layer"
    );
    Ok(())
}

/// Strip leading `/` and `.` components; reject `..`.
fn sanitize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}

/// Whether every component of `relative` under `root` is a real directory
/// (or absent). A symlink anywhere in the chain could point outside `root`.
fn is_plain_dir_chain(root: &Path, relative: &Path) -> bool {
    let mut current = root.to_path_buf();
    for component in relative.components() {
        current.push(component);
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => return false,
            Ok(meta) if !meta.is_dir() => return false,
            Ok(_) => {}
            Err(e) => return e.kind() == std::io::ErrorKind::NotFound,
        }
    }
    true
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn clear_dir(dir: &Path) -> std::io::Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        remove_path(&entry?.path())?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// Build a tar layer, gzip-compressed when `gzip` is set.
    pub(crate) fn layer_bytes(files: &[(&str, &[u8])], gzip: bool) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        let tar = builder.into_inner().unwrap();
        if !gzip {
            return tar;
        }
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar).unwrap();
        encoder.finish().unwrap()
    }

    fn write_layer(dir: &Path, name: &str, files: &[(&str, &[u8])], gzip: bool) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, layer_bytes(files, gzip)).unwrap();
        path
    }

    #[test]
    fn test_extract_gzip_layer() {
        let tmp = TempDir::new().unwrap();
        let layer = write_layer(tmp.path(), "l1", &[("bin/driver", b"#!/bin/sh")], true);
        let rootfs = tmp.path().join("rootfs");

        extract_layer(&layer, &rootfs).unwrap();
        assert_eq!(fs::read(rootfs.join("bin/driver")).unwrap(), b"#!/bin/sh");
    }

    #[test]
    fn test_extract_plain_tar_layer() {
        let tmp = TempDir::new().unwrap();
        let layer = write_layer(tmp.path(), "l1", &[("etc/config", b"x=1")], false);
        let rootfs = tmp.path().join("rootfs");

        extract_layer(&layer, &rootfs).unwrap();
        assert_eq!(fs::read_to_string(rootfs.join("etc/config")).unwrap(), "x=1");
    }

    #[test]
    fn test_upper_layer_overwrites() {
        let tmp = TempDir::new().unwrap();
        let rootfs = tmp.path().join("rootfs");
        let l1 = write_layer(tmp.path(), "l1", &[("f", b"v1")], true);
        let l2 = write_layer(tmp.path(), "l2", &[("f", b"v2")], true);

        extract_layer(&l1, &rootfs).unwrap();
        extract_layer(&l2, &rootfs).unwrap();
        assert_eq!(fs::read_to_string(rootfs.join("f")).unwrap(), "v2");
    }

    #[test]
    fn test_whiteout_removes_lower_file() {
        let tmp = TempDir::new().unwrap();
        let rootfs = tmp.path().join("rootfs");
        let l1 = write_layer(tmp.path(), "l1", &[("etc/a", b"a"), ("etc/b", b"b")], true);
        let l2 = write_layer(tmp.path(), "l2", &[("etc/.wh.a", b"")], true);

        extract_layer(&l1, &rootfs).unwrap();
        extract_layer(&l2, &rootfs).unwrap();
        assert!(!rootfs.join("etc/a").exists());
        assert!(!rootfs.join("etc/.wh.a").exists());
        assert!(rootfs.join("etc/b").exists());
    }

    #[test]
    fn test_opaque_whiteout_clears_directory() {
        let tmp = TempDir::new().unwrap();
        let rootfs = tmp.path().join("rootfs");
        let l1 = write_layer(tmp.path(), "l1", &[("data/x", b"x"), ("data/y", b"y")], true);
        let l2 = write_layer(
            tmp.path(),
            "l2",
            &[("data/.wh..wh..opq", b""), ("data/z", b"z")],
            true,
        );

        extract_layer(&l1, &rootfs).unwrap();
        extract_layer(&l2, &rootfs).unwrap();
        assert!(!rootfs.join("data/x").exists());
        assert!(!rootfs.join("data/y").exists());
        assert!(rootfs.join("data/z").exists());
    }

    fn symlink_layer(dir: &Path, name: &str, link: &str, target: &Path) -> PathBuf {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        header.set_link_name(target).unwrap();
        header.set_cksum();
        builder
            .append_data(&mut header, link, std::io::empty())
            .unwrap();
        let path = dir.join(name);
        fs::write(&path, builder.into_inner().unwrap()).unwrap();
        path
    }

    #[test]
    fn test_whiteouts_do_not_follow_symlinked_dirs() {
        let tmp = TempDir::new().unwrap();
        let rootfs = tmp.path().join("rootfs");
        let host_etc = tmp.path().join("host_etc");
        fs::create_dir_all(&host_etc).unwrap();
        fs::write(host_etc.join("passwd"), b"root").unwrap();
        fs::write(host_etc.join("shadow"), b"secret").unwrap();

        let l1 = symlink_layer(tmp.path(), "l1", "etc", &host_etc);
        let l2 = write_layer(tmp.path(), "l2", &[("etc/.wh.passwd", b"")], false);
        let l3 = write_layer(tmp.path(), "l3", &[("etc/.wh..wh..opq", b"")], false);

        extract_layer(&l1, &rootfs).unwrap();
        assert!(fs::symlink_metadata(rootfs.join("etc"))
            .unwrap()
            .file_type()
            .is_symlink());
        extract_layer(&l2, &rootfs).unwrap();
        extract_layer(&l3, &rootfs).unwrap();

        assert!(host_etc.join("passwd").exists());
        assert!(host_etc.join("shadow").exists());
    }

    #[test]
    fn test_whiteout_of_symlink_removes_link_only() {
        let tmp = TempDir::new().unwrap();
        let rootfs = tmp.path().join("rootfs");
        let outside = tmp.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("keep"), b"k").unwrap();

        let l1 = symlink_layer(tmp.path(), "l1", "data", &outside);
        let l2 = write_layer(tmp.path(), "l2", &[(".wh.data", b"")], false);

        extract_layer(&l1, &rootfs).unwrap();
        extract_layer(&l2, &rootfs).unwrap();

        assert!(fs::symlink_metadata(rootfs.join("data")).is_err());
        assert!(outside.join("keep").exists());
    }

    #[test]
    fn test_dot_dot_whiteout_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let rootfs = tmp.path().join("rootfs");
        let l1 = write_layer(tmp.path(), "l1", &[("a/b/f", b"f")], false);
        let l2 = write_layer(tmp.path(), "l2", &[("a/b/.wh...", b"")], false);

        extract_layer(&l1, &rootfs).unwrap();
        extract_layer(&l2, &rootfs).unwrap();
        assert!(rootfs.join("a/b/f").exists());
    }

    #[test]
    fn test_missing_layer() {
        let tmp = TempDir::new().unwrap();
        let err = extract_layer(&tmp.path().join("nope"), &tmp.path().join("rootfs")).unwrap_err();
        assert!(matches!(err, ProxyError::OciImageError(_)));
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize(Path::new("/usr/bin")), Some(PathBuf::from("usr/bin")));
        assert_eq!(sanitize(Path::new("./a")), Some(PathBuf::from("a")));
        assert_eq!(sanitize(Path::new("../escape")), None);
        assert_eq!(sanitize(Path::new("./")), None);
    }
}

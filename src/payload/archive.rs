//! Compressed tarball payloads.

use std::fs::File;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::debug;

use crate::error::MaterializeError;

/// True for `.tar.gz` and `.tgz` paths.
pub fn is_archive(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    name.ends_with(".tar.gz") || name.ends_with(".tgz")
}

/// Unpacks `archive` into `dest` and returns the effective payload root.
///
/// Blocking. Entries escaping `dest` are refused by the tar crate.
pub fn extract(archive: &Path, dest: &Path) -> Result<PathBuf, MaterializeError> {
    let file = File::open(archive).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => MaterializeError::NotFound(archive.to_path_buf()),
        _ => MaterializeError::Io(e),
    })?;

    let mut tarball = Archive::new(GzDecoder::new(file));
    tarball.set_preserve_permissions(true);
    tarball
        .unpack(dest)
        .map_err(|e| MaterializeError::Extraction {
            path: archive.to_path_buf(),
            reason: e.to_string(),
        })?;

    let root = effective_root(dest)?;
    debug!(
        "Extracted {} to {}",
        archive.display(),
        root.display()
    );
    Ok(root)
}

/// The single top-level directory of `dir` if there is exactly one entry
/// and it is a directory, `dir` itself otherwise.
pub fn effective_root(dir: &Path) -> std::io::Result<PathBuf> {
    let mut entries = std::fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    if entries.len() == 1 && entries[0].file_type()?.is_dir() {
        if let Some(only) = entries.pop() {
            return Ok(only.path());
        }
    }
    Ok(dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn build_archive(path: &Path, files: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_is_archive() {
        assert!(is_archive(Path::new("x/repo.tar.gz")));
        assert!(is_archive(Path::new("repo.TGZ")));
        assert!(!is_archive(Path::new("repo.tar")));
        assert!(!is_archive(Path::new("dir")));
    }

    #[test]
    fn test_single_top_level_directory_becomes_root() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("p.tar.gz");
        build_archive(&archive, &[("project/a.txt", b"a"), ("project/sub/b.txt", b"b")]);

        let dest = tmp.path().join("out");
        std::fs::create_dir(&dest).unwrap();
        let root = extract(&archive, &dest).unwrap();
        assert_eq!(root, dest.join("project"));
        assert_eq!(std::fs::read(root.join("sub/b.txt")).unwrap(), b"b");
    }

    #[test]
    fn test_flat_archive_keeps_extraction_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("flat.tgz");
        build_archive(&archive, &[("a.txt", b"a"), ("b.txt", b"b")]);

        let dest = tmp.path().join("out");
        std::fs::create_dir(&dest).unwrap();
        assert_eq!(extract(&archive, &dest).unwrap(), dest);
    }

    #[test]
    fn test_missing_and_corrupt_archives() {
        let tmp = tempfile::tempdir().unwrap();
        let err = extract(&tmp.path().join("nope.tar.gz"), tmp.path()).unwrap_err();
        assert!(matches!(err, MaterializeError::NotFound(_)));

        let bogus = tmp.path().join("bogus.tar.gz");
        std::fs::write(&bogus, b"definitely not gzip").unwrap();
        let dest = tmp.path().join("out");
        std::fs::create_dir(&dest).unwrap();
        let err = extract(&bogus, &dest).unwrap_err();
        assert!(matches!(err, MaterializeError::Extraction { .. }));
    }
}

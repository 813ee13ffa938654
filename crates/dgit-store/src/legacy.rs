//! Zip full snapshots at `objects/v<N>.zip`.
//!
//! Each staged file is a deflated entry under its repository path, preceded
//! by an index entry so the archive decodes to the same bundle as a tier
//! snapshot.

use crate::bundle::{self, BundleEntry};
use crate::error::{StoreError, StoreResult};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

const INDEX_ENTRY: &str = ".dgit-index.json";

/// File name of a version's archive inside `objects/`.
pub fn archive_name(version: u64) -> String {
    format!("v{}.zip", version)
}

/// Copy exactly `expected` bytes from `src` into `dst`.
pub(crate) fn copy_exact<R: Read, W: io::Write>(
    src: R,
    dst: &mut W,
    expected: u64,
    path: &str,
) -> StoreResult<u64> {
    let copied = io::copy(&mut src.take(expected), dst)?;
    if copied != expected {
        return Err(StoreError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "{} shrank during commit: read {} of {} bytes",
                path, copied, expected
            ),
        )));
    }
    Ok(copied)
}

/// Write a zip snapshot of `files` to `path` atomically. Returns its size.
pub fn write_archive(path: &Path, files: &[(BundleEntry, PathBuf)]) -> StoreResult<u64> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = NamedTempFile::new_in(dir)?;
    let mut zip = zip::ZipWriter::new(BufWriter::new(tmp.reopen()?));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .large_file(true);

    let entries: Vec<BundleEntry> = files.iter().map(|(e, _)| e.clone()).collect();
    zip.start_file(INDEX_ENTRY, options)?;
    serde_json::to_writer(&mut zip, &entries)?;

    for (entry, source) in files {
        zip.start_file(entry.path.as_str(), options)?;
        let reader = BufReader::new(File::open(source)?);
        copy_exact(reader, &mut zip, entry.size, &entry.path)?;
    }

    let buffered = zip.finish()?;
    let file = buffered.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    let size = file.metadata()?.len();
    drop(file);
    tmp.persist(path).map_err(|e| e.error)?;
    debug!(archive = %path.display(), files = files.len(), size, "Wrote legacy archive");
    Ok(size)
}

/// Read a zip snapshot and return it in bundle form.
pub fn read_archive(path: &Path) -> StoreResult<Vec<u8>> {
    let key = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound(format!("objects/{}", key)))
        }
        Err(e) => return Err(e.into()),
    };
    let mut archive =
        zip::ZipArchive::new(BufReader::new(file)).map_err(|e| StoreError::corrupt(&key, e))?;

    let entries: Vec<BundleEntry> = {
        let index = archive
            .by_name(INDEX_ENTRY)
            .map_err(|e| StoreError::corrupt(&key, e))?;
        serde_json::from_reader(index).map_err(|e| StoreError::corrupt(&key, e))?
    };

    let mut out = bundle::encode_header(&entries)?;
    for entry in &entries {
        let member = archive
            .by_name(&entry.path)
            .map_err(|e| StoreError::corrupt(&key, format!("{}: {}", entry.path, e)))?;
        copy_exact(member, &mut out, entry.size, &entry.path)
            .map_err(|e| StoreError::corrupt(&key, e))?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::Bundle;
    use chrono::Utc;

    #[test]
    fn archive_reads_back_as_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("logo.ai");
        let b = dir.path().join("a.fig");
        std::fs::write(&a, b"vector data").unwrap();
        std::fs::write(&b, b"figma").unwrap();

        let files = vec![
            (
                BundleEntry {
                    path: "designs/logo.ai".to_string(),
                    size: 11,
                    modified: Utc::now(),
                },
                a,
            ),
            (
                BundleEntry {
                    path: "icons/a.fig".to_string(),
                    size: 5,
                    modified: Utc::now(),
                },
                b,
            ),
        ];
        let zip_path = dir.path().join(archive_name(1));
        assert!(write_archive(&zip_path, &files).unwrap() > 0);

        let bytes = read_archive(&zip_path).unwrap();
        let bundle = Bundle::parse(&bytes, "v1.zip").unwrap();
        assert_eq!(bundle.find("designs/logo.ai").unwrap().1, b"vector data");
        assert_eq!(bundle.find("icons/a.fig").unwrap().1, b"figma");
    }

    #[test]
    fn missing_archive_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_archive(&dir.path().join("v7.zip")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn garbage_archive_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v2.zip");
        std::fs::write(&path, b"PK but not really").unwrap();
        assert!(matches!(
            read_archive(&path).unwrap_err(),
            StoreError::Corrupt { .. }
        ));
    }

    #[test]
    fn shrunken_source_fails_write() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.ai");
        std::fs::write(&a, b"abc").unwrap();
        let files = vec![(
            BundleEntry {
                path: "a.ai".to_string(),
                size: 10,
                modified: Utc::now(),
            },
            a,
        )];
        let zip_path = dir.path().join(archive_name(1));
        assert!(write_archive(&zip_path, &files).is_err());
        assert!(!zip_path.exists());
    }
}

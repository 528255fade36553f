use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, Write};
use std::path::Path;
use tracing::trace;
use zip::ZipArchive;

use super::{entry_path, ExtractSummary};
use crate::error::{Result, WrapperError};

/// Extract every entry of a zip archive into `destination`, in archive order.
pub fn extract_zip<R: Read + Seek>(reader: R, destination: &Path) -> Result<ExtractSummary> {
    let zip_error = |e: zip::result::ZipError| WrapperError::Extraction {
        path: destination.to_path_buf(),
        reason: format!("failed to read zip archive: {}", e),
    };

    let mut archive = ZipArchive::new(reader).map_err(zip_error)?;
    let mut summary = ExtractSummary::default();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(zip_error)?;
        let path = entry_path(destination, entry.name())?;

        if entry.is_dir() {
            fs::create_dir_all(&path).map_err(|e| WrapperError::path_io(&path, e))?;
            summary.directories += 1;
            continue;
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| WrapperError::path_io(parent, e))?;
        }

        let file = File::create(&path).map_err(|e| WrapperError::path_io(&path, e))?;
        let mut out = BufWriter::new(file);
        let copied = io::copy(&mut entry, &mut out).map_err(|e| WrapperError::Extraction {
            path: path.clone(),
            reason: format!("failed to decompress entry: {}", e),
        })?;
        out.flush().map_err(|e| WrapperError::path_io(&path, e))?;

        trace!("Extracted {} ({} bytes)", entry.name(), copied);
        summary.files += 1;
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;
    use zip::write::FileOptions;
    use zip::ZipWriter;

    fn build_zip(entries: &[(&str, Option<&[u8]>)]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in entries {
            match body {
                None => writer.add_directory(*name, FileOptions::default()).unwrap(),
                Some(bytes) => {
                    writer.start_file(*name, FileOptions::default()).unwrap();
                    writer.write_all(bytes).unwrap();
                }
            }
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_directory_and_file() {
        let temp = TempDir::new().unwrap();
        let body = b"MZ fake windows binary";
        let bytes = build_zip(&[("bin/", None), ("bin/pico_limbo.exe", Some(body))]);

        let summary = extract_zip(Cursor::new(bytes), temp.path()).unwrap();

        assert_eq!(summary.directories, 1);
        assert_eq!(summary.files, 1);
        assert!(temp.path().join("bin").is_dir());
        assert_eq!(
            fs::read(temp.path().join("bin/pico_limbo.exe")).unwrap(),
            body
        );
    }

    #[test]
    fn test_file_without_directory_entry() {
        let temp = TempDir::new().unwrap();
        let bytes = build_zip(&[("nested/deeper/pico_limbo.exe", Some(b"data"))]);

        extract_zip(Cursor::new(bytes), temp.path()).unwrap();

        assert_eq!(
            fs::read(temp.path().join("nested/deeper/pico_limbo.exe")).unwrap(),
            b"data"
        );
    }

    #[test]
    fn test_corrupt_archive() {
        let temp = TempDir::new().unwrap();
        let err = extract_zip(Cursor::new(b"not a zip".to_vec()), temp.path()).unwrap_err();
        assert!(matches!(err, WrapperError::Extraction { .. }));
    }
}

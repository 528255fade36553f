use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;
use tracing::{debug, trace};

use super::{entry_path, ExtractSummary};
use crate::error::{Result, WrapperError};

/// Size of a tar header block and the alignment of entry data.
pub const BLOCK_SIZE: usize = 512;

const NAME_FIELD: std::ops::Range<usize> = 0..100;
const SIZE_FIELD: std::ops::Range<usize> = 124..136;
const TYPE_FLAG: usize = 156;

#[derive(Debug, PartialEq, Eq)]
enum EntryKind {
    Directory,
    File,
    Other(u8),
}

#[derive(Debug)]
struct Header {
    name: String,
    size: u64,
    kind: EntryKind,
}

impl Header {
    fn parse(block: &[u8; BLOCK_SIZE]) -> Self {
        let name = parse_name(&block[NAME_FIELD]);
        let size = parse_octal(&block[SIZE_FIELD]);
        let kind = match block[TYPE_FLAG] {
            _ if name.ends_with('/') => EntryKind::Directory,
            b'5' => EntryKind::Directory,
            b'0' | 0 => EntryKind::File,
            other => EntryKind::Other(other),
        };

        Self { name, size, kind }
    }

    fn padding(&self) -> u64 {
        padding_for(self.size)
    }
}

/// Bytes needed after `size` bytes of data to reach the next block boundary.
fn padding_for(size: u64) -> u64 {
    let block = BLOCK_SIZE as u64;
    (block - size % block) % block
}

fn parse_name(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).trim().to_string()
}

/// Parse a tar numeric field as octal ASCII. Null bytes and surrounding spaces
/// are ignored; an empty or malformed field reads as 0.
pub fn parse_octal(field: &[u8]) -> u64 {
    let text: String = String::from_utf8_lossy(field)
        .chars()
        .filter(|&c| c != '\0')
        .collect();
    let text = text.trim();

    if text.is_empty() {
        return 0;
    }
    u64::from_str_radix(text, 8).unwrap_or(0)
}

/// Fill `block` from the reader. Returns false when the stream ends first.
fn read_block<R: Read>(reader: &mut R, block: &mut [u8; BLOCK_SIZE]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < BLOCK_SIZE {
        match reader.read(&mut block[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

fn skip<R: Read>(reader: &mut R, count: u64) -> io::Result<u64> {
    io::copy(&mut reader.by_ref().take(count), &mut io::sink())
}

/// Extract a ustar stream (files and directories only) into `destination`.
///
/// A truncated stream, an all-zero header block or an empty entry name all
/// end extraction without error.
pub fn extract_tar<R: Read>(mut reader: R, destination: &Path) -> Result<ExtractSummary> {
    let mut summary = ExtractSummary::default();
    let mut block = [0u8; BLOCK_SIZE];

    let read_error = |e: io::Error| WrapperError::Extraction {
        path: destination.to_path_buf(),
        reason: format!("failed to read tar stream: {}", e),
    };

    loop {
        if !read_block(&mut reader, &mut block).map_err(read_error)? {
            debug!("Tar stream ended mid-header, treating as end of archive");
            break;
        }
        if block.iter().all(|&b| b == 0) {
            break;
        }

        let header = Header::parse(&block);
        if header.name.is_empty() {
            break;
        }

        match header.kind {
            EntryKind::Directory => {
                let path = entry_path(destination, &header.name)?;
                fs::create_dir_all(&path).map_err(|e| WrapperError::path_io(&path, e))?;
                summary.directories += 1;
            }
            EntryKind::File => {
                let path = entry_path(destination, &header.name)?;
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(|e| WrapperError::path_io(parent, e))?;
                }

                let file = File::create(&path).map_err(|e| WrapperError::path_io(&path, e))?;
                let mut out = BufWriter::new(file);
                let copied = io::copy(&mut reader.by_ref().take(header.size), &mut out)
                    .map_err(read_error)?;
                out.flush().map_err(|e| WrapperError::path_io(&path, e))?;
                summary.files += 1;

                trace!("Extracted {} ({} bytes)", header.name, copied);
                if copied < header.size {
                    debug!("Tar entry '{}' truncated, stopping", header.name);
                    break;
                }
                skip(&mut reader, header.padding()).map_err(read_error)?;
            }
            EntryKind::Other(flag) => {
                debug!(
                    "Skipping tar entry '{}' with unsupported type '{}'",
                    header.name, flag as char
                );
                skip(&mut reader, header.size + header.padding()).map_err(read_error)?;
                summary.skipped += 1;
            }
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Build a raw header block the way the release pipeline lays it out.
    fn raw_header(name: &str, size: u64, flag: u8) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        block[..name.len()].copy_from_slice(name.as_bytes());
        let size_field = format!("{:011o}\0", size);
        block[SIZE_FIELD].copy_from_slice(size_field.as_bytes());
        block[TYPE_FLAG] = flag;
        block
    }

    fn raw_entry(name: &str, body: &[u8], flag: u8) -> Vec<u8> {
        let mut out = raw_header(name, body.len() as u64, flag).to_vec();
        out.extend_from_slice(body);
        out.resize(out.len() + padding_for(body.len() as u64) as usize, 0);
        out
    }

    #[test]
    fn test_parse_octal() {
        assert_eq!(parse_octal(b"0000000012 "), 10);
        assert_eq!(parse_octal(b"00000001750\0"), 1000);
        assert_eq!(parse_octal(&[0u8; 12]), 0);
        assert_eq!(parse_octal(b"            "), 0);
        assert_eq!(parse_octal(b"not-octal\0\0\0"), 0);
        assert_eq!(parse_octal(b"00000000089\0"), 0);
    }

    #[test]
    fn test_parse_name() {
        let mut field = [0u8; 100];
        field[..10].copy_from_slice(b"pico_limbo");
        assert_eq!(parse_name(&field), "pico_limbo");

        let full = [b'a'; 100];
        assert_eq!(parse_name(&full).len(), 100);
    }

    #[test]
    fn test_padding() {
        assert_eq!(padding_for(0), 0);
        assert_eq!(padding_for(1), 511);
        assert_eq!(padding_for(512), 0);
        assert_eq!(padding_for(513), 511);
    }

    #[test]
    fn test_single_file_archive() {
        let temp = TempDir::new().unwrap();
        let body = b"Listening on: 0.0.0.0:25565\n";

        let mut archive = raw_entry("pico_limbo", body, b'0');
        archive.extend_from_slice(&[0u8; BLOCK_SIZE * 2]);

        let summary = extract_tar(&archive[..], temp.path()).unwrap();

        assert_eq!(summary.files, 1);
        assert_eq!(std::fs::read(temp.path().join("pico_limbo")).unwrap(), body);
    }

    #[test]
    fn test_directories_and_nested_files() {
        let temp = TempDir::new().unwrap();

        let mut archive = raw_entry("release/", b"", b'5');
        archive.extend(raw_entry("release/docs/README", b"readme", 0));
        archive.extend(raw_entry("release/pico_limbo", &[7u8; 1500], b'0'));
        archive.extend_from_slice(&[0u8; BLOCK_SIZE * 2]);

        let summary = extract_tar(&archive[..], temp.path()).unwrap();

        assert_eq!(summary.directories, 1);
        assert_eq!(summary.files, 2);
        assert!(temp.path().join("release").is_dir());
        assert_eq!(
            std::fs::read(temp.path().join("release/docs/README")).unwrap(),
            b"readme"
        );
        assert_eq!(
            std::fs::read(temp.path().join("release/pico_limbo")).unwrap(),
            vec![7u8; 1500]
        );
    }

    #[test]
    fn test_unsupported_entries_are_skipped() {
        let temp = TempDir::new().unwrap();

        let mut archive = raw_entry("link", b"target-data", b'2');
        archive.extend(raw_entry("after", b"kept", b'0'));

        let summary = extract_tar(&archive[..], temp.path()).unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.files, 1);
        assert!(!temp.path().join("link").exists());
        assert_eq!(std::fs::read(temp.path().join("after")).unwrap(), b"kept");
    }

    #[test]
    fn test_truncated_stream_ends_extraction() {
        let temp = TempDir::new().unwrap();

        let mut archive = raw_entry("first", b"complete", b'0');
        archive.extend_from_slice(&raw_header("second", 10, b'0')[..300]);

        let summary = extract_tar(&archive[..], temp.path()).unwrap();

        assert_eq!(summary.files, 1);
        assert!(!temp.path().join("second").exists());
    }

    #[test]
    fn test_traversal_entry_rejected() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("dest");
        std::fs::create_dir_all(&dest).unwrap();

        let archive = raw_entry("../escaped", b"nope", b'0');
        let err = extract_tar(&archive[..], &dest).unwrap_err();

        assert!(matches!(err, WrapperError::Extraction { .. }));
        assert!(!temp.path().join("escaped").exists());
    }

    #[test]
    fn test_archive_from_tar_builder() {
        let temp = TempDir::new().unwrap();

        let mut builder = ::tar::Builder::new(Vec::new());
        let mut dir = ::tar::Header::new_ustar();
        dir.set_entry_type(::tar::EntryType::Directory);
        dir.set_size(0);
        dir.set_mode(0o755);
        builder.append_data(&mut dir, "bin/", std::io::empty()).unwrap();

        let body = vec![0xABu8; 700];
        let mut file = ::tar::Header::new_ustar();
        file.set_entry_type(::tar::EntryType::Regular);
        file.set_size(body.len() as u64);
        file.set_mode(0o755);
        builder
            .append_data(&mut file, "bin/pico_limbo", &body[..])
            .unwrap();
        let bytes = builder.into_inner().unwrap();

        let summary = extract_tar(&bytes[..], temp.path()).unwrap();

        assert_eq!(summary.directories, 1);
        assert_eq!(summary.files, 1);
        assert_eq!(std::fs::read(temp.path().join("bin/pico_limbo")).unwrap(), body);
    }
}

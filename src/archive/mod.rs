//! Release archive extraction.
//!
//! Release artifacts ship either as `.zip` (Windows) or gzip-compressed tar
//! (`.tar.gz` / `.tgz`) everywhere else. Tar decoding is done by a small
//! in-crate header parser that understands regular files and directories only;
//! zip decoding goes through the `zip` crate.

mod tarball;
mod zipfile;

use flate2::read::GzDecoder;
use std::fs::File;
use std::io::BufReader;
use std::path::{Component, Path, PathBuf};
use tracing::info;

use crate::error::{Result, WrapperError};

pub use tarball::{extract_tar, parse_octal, BLOCK_SIZE};
pub use zipfile::extract_zip;

/// Counts of what an extraction produced.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtractSummary {
    pub files: usize,
    pub directories: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        if name.ends_with(".zip") {
            Ok(Self::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Ok(Self::TarGz)
        } else {
            Err(WrapperError::UnsupportedFormat(name))
        }
    }
}

/// Extract `archive` into `destination`, choosing the decoder by file extension.
pub fn extract(archive: &Path, destination: &Path) -> Result<ExtractSummary> {
    let format = ArchiveFormat::from_path(archive)?;
    let file = File::open(archive).map_err(|e| WrapperError::path_io(archive, e))?;

    let summary = match format {
        ArchiveFormat::Zip => {
            info!("Extracting ZIP archive...");
            extract_zip(BufReader::new(file), destination)?
        }
        ArchiveFormat::TarGz => {
            info!("Extracting TAR.GZ archive...");
            extract_tar(GzDecoder::new(BufReader::new(file)), destination)?
        }
    };

    info!(
        "Extraction complete ({} files, {} directories, {} skipped)",
        summary.files, summary.directories, summary.skipped
    );
    Ok(summary)
}

/// Join an archive entry name onto the destination, refusing anything that
/// would land outside of it.
pub(crate) fn entry_path(destination: &Path, name: &str) -> Result<PathBuf> {
    let mut relative = PathBuf::new();

    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(WrapperError::Extraction {
                    path: destination.to_path_buf(),
                    reason: format!("entry '{}' escapes the destination directory", name),
                });
            }
        }
    }

    Ok(destination.join(relative))
}

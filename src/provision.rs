use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::archive;
use crate::error::{Result, WrapperError};
use crate::platform::{self, Platform};
use crate::release::ArchiveSource;

const BACKUP_SUFFIX: &str = ".backup";
const UPDATE_TEMP_DIR: &str = "update_temp";

/// On-disk locations derived from the binaries directory and the platform.
#[derive(Debug, Clone)]
pub struct BinaryLayout {
    dir: PathBuf,
    platform: Platform,
}

impl BinaryLayout {
    pub fn new(dir: impl Into<PathBuf>, platform: Platform) -> Self {
        Self {
            dir: dir.into(),
            platform,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn binary_path(&self) -> PathBuf {
        self.dir.join(&self.platform.binary_file_name)
    }

    pub fn backup_path(&self) -> PathBuf {
        self.dir
            .join(format!("{}{}", self.platform.binary_file_name, BACKUP_SUFFIX))
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.dir.join(UPDATE_TEMP_DIR)
    }

    pub fn archive_path(&self) -> PathBuf {
        self.dir.join(&self.platform.archive_name)
    }
}

/// Makes sure the server binary exists locally, downloading it on first use.
pub struct BinaryProvisioner<'a, S> {
    layout: &'a BinaryLayout,
    source: &'a S,
}

impl<'a, S: ArchiveSource> BinaryProvisioner<'a, S> {
    pub fn new(layout: &'a BinaryLayout, source: &'a S) -> Self {
        Self { layout, source }
    }

    pub async fn ensure_binary(&self) -> Result<PathBuf> {
        let binary = self.layout.binary_path();
        if binary.exists() {
            info!("Found binary: {}", binary.display());
            return Ok(binary);
        }

        info!(
            "Binary not found, downloading {} for {}",
            self.layout.platform().archive_name,
            self.layout.platform()
        );

        let dir = self.layout.dir();
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| WrapperError::path_io(dir, e))?;

        let archive_path = self.layout.archive_path();
        self.source
            .fetch(&self.layout.platform().archive_name, &archive_path)
            .await?;

        let extracted = extract_blocking(archive_path.clone(), dir.to_path_buf()).await;

        if let Err(e) = tokio::fs::remove_file(&archive_path).await {
            warn!("Failed to remove {}: {}", archive_path.display(), e);
        }
        extracted?;

        if !binary.exists() {
            return Err(WrapperError::MissingAfterExtraction(binary));
        }

        if !self.layout.platform().is_windows() {
            platform::set_executable(&binary).map_err(|e| WrapperError::path_io(&binary, e))?;
        }

        info!("Binary ready: {}", binary.display());
        Ok(binary)
    }
}

/// Run archive extraction on the blocking pool.
pub(crate) async fn extract_blocking(archive: PathBuf, destination: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || archive::extract(&archive, &destination))
        .await
        .map_err(|e| WrapperError::Extraction {
            path: PathBuf::new(),
            reason: format!("extraction task failed: {}", e),
        })??;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Build a tar.gz holding `files` as executable entries.
    pub(crate) fn tar_gz(files: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = ::tar::Builder::new(encoder);
        for (name, body) in files {
            let mut header = ::tar::Header::new_ustar();
            header.set_entry_type(::tar::EntryType::Regular);
            header.set_size(body.len() as u64);
            header.set_mode(0o755);
            builder.append_data(&mut header, name, *body).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    /// Archive source that writes canned bytes and counts fetches.
    pub(crate) struct StaticSource {
        pub bytes: Vec<u8>,
        pub fetches: AtomicUsize,
    }

    impl StaticSource {
        pub(crate) fn new(bytes: Vec<u8>) -> Self {
            Self {
                bytes,
                fetches: AtomicUsize::new(0),
            }
        }
    }

    impl ArchiveSource for StaticSource {
        async fn fetch(&self, _archive_name: &str, target: &Path) -> Result<()> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::fs::write(target, &self.bytes)
                .await
                .map_err(|e| WrapperError::path_io(target, e))
        }
    }

    fn linux_layout(dir: &Path) -> BinaryLayout {
        let platform = Platform::for_target("pico_limbo", "linux", "x86_64").unwrap();
        BinaryLayout::new(dir.join("binaries"), platform)
    }

    #[test]
    fn test_layout_paths() {
        let layout = linux_layout(Path::new("/srv"));
        assert_eq!(layout.binary_path(), Path::new("/srv/binaries/pico_limbo"));
        assert_eq!(
            layout.backup_path(),
            Path::new("/srv/binaries/pico_limbo.backup")
        );
        assert_eq!(layout.temp_dir(), Path::new("/srv/binaries/update_temp"));
        assert_eq!(
            layout.archive_path(),
            Path::new("/srv/binaries/pico_limbo_linux-x86_64-musl.tar.gz")
        );
    }

    #[tokio::test]
    async fn test_existing_binary_skips_download() {
        let temp = TempDir::new().unwrap();
        let layout = linux_layout(temp.path());
        std::fs::create_dir_all(layout.dir()).unwrap();
        std::fs::write(layout.binary_path(), b"old").unwrap();

        let source = StaticSource::new(Vec::new());
        let path = BinaryProvisioner::new(&layout, &source)
            .ensure_binary()
            .await
            .unwrap();

        assert_eq!(path, layout.binary_path());
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_downloads_and_extracts() {
        let temp = TempDir::new().unwrap();
        let layout = linux_layout(temp.path());
        let source = StaticSource::new(tar_gz(&[("pico_limbo", b"#!/bin/sh\n")]));

        let path = BinaryProvisioner::new(&layout, &source)
            .ensure_binary()
            .await
            .unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"#!/bin/sh\n");
        assert!(!layout.archive_path().exists());
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[tokio::test]
    async fn test_missing_after_extraction() {
        let temp = TempDir::new().unwrap();
        let layout = linux_layout(temp.path());
        let source = StaticSource::new(tar_gz(&[("README.md", b"no binary here")]));

        let err = BinaryProvisioner::new(&layout, &source)
            .ensure_binary()
            .await
            .unwrap_err();

        assert!(matches!(err, WrapperError::MissingAfterExtraction(_)));
        assert!(!layout.archive_path().exists());
    }
}

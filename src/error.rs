use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WrapperError {
    #[error("Instance '{0}' not found")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unsupported platform: {os} {arch}")]
    PlatformUnsupported { os: String, arch: String },

    #[error("Download failed for {url}: {reason}")]
    Download { url: String, reason: String },

    #[error("Could not find archive '{archive}' in latest release of {repository}")]
    AssetNotFound { archive: String, repository: String },

    #[error("Unsupported archive format: {0}")]
    UnsupportedFormat(String),

    #[error("Extraction failed for {}: {reason}", path.display())]
    Extraction { path: PathBuf, reason: String },

    #[error("Extracted binary not found: {}", .0.display())]
    ExtractedBinaryMissing(PathBuf),

    #[error("Binary not found after extraction: {}", .0.display())]
    MissingAfterExtraction(PathBuf),

    #[error("New binary crashed during verification (exit code: {})", code.map_or_else(|| "unknown".to_string(), |c| c.to_string()))]
    VerificationCrashed { code: Option<i32> },

    #[error("New binary verification failed: did not see '{marker}' within {waited_ms}ms")]
    VerificationTimeout { marker: String, waited_ms: u64 },

    #[error("Failed to launch instance '{name}': {source}")]
    Launch {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("An update is already in progress")]
    UpdateInProgress,

    #[error("I/O error at {}: {source}", path.display())]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WrapperError {
    pub(crate) fn path_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::PathIo {
            path: path.into(),
            source,
        }
    }

    /// Whether the error is scoped to a single update attempt rather than fatal.
    pub fn is_update_scoped(&self) -> bool {
        matches!(
            self,
            Self::Download { .. }
                | Self::AssetNotFound { .. }
                | Self::UnsupportedFormat(_)
                | Self::Extraction { .. }
                | Self::ExtractedBinaryMissing(_)
                | Self::VerificationCrashed { .. }
                | Self::VerificationTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, WrapperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verification_crashed_message() {
        let err = WrapperError::VerificationCrashed { code: Some(3) };
        assert_eq!(
            err.to_string(),
            "New binary crashed during verification (exit code: 3)"
        );

        let err = WrapperError::VerificationCrashed { code: None };
        assert!(err.to_string().contains("exit code: unknown"));
    }

    #[test]
    fn test_update_scoped_classification() {
        assert!(WrapperError::VerificationTimeout {
            marker: "Listening on:".into(),
            waited_ms: 5000
        }
        .is_update_scoped());
        assert!(WrapperError::UnsupportedFormat("x.rar".into()).is_update_scoped());
        assert!(!WrapperError::NotFound("lobby".into()).is_update_scoped());
        assert!(!WrapperError::UpdateInProgress.is_update_scoped());
    }
}

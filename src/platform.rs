use std::fmt;
use std::path::Path;

use crate::error::{Result, WrapperError};

/// Release artifact naming for the host OS/architecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: &'static str,
    pub arch: &'static str,
    /// Name of the release asset, e.g. `pico_limbo_linux-x86_64-musl.tar.gz`.
    pub archive_name: String,
    /// Name of the executable inside the archive, e.g. `pico_limbo.exe`.
    pub binary_file_name: String,
}

impl Platform {
    /// Detect the running platform.
    pub fn detect(binary_name: &str) -> Result<Self> {
        let os = if cfg!(target_os = "windows") {
            "windows"
        } else if cfg!(target_os = "linux") {
            "linux"
        } else if cfg!(target_os = "macos") {
            "macos"
        } else {
            std::env::consts::OS
        };

        let arch = if cfg!(target_arch = "x86_64") {
            "x86_64"
        } else if cfg!(target_arch = "aarch64") {
            "aarch64"
        } else {
            std::env::consts::ARCH
        };

        Self::for_target(binary_name, os, arch)
    }

    pub fn for_target(binary_name: &str, os: &'static str, arch: &'static str) -> Result<Self> {
        let suffix = match (os, arch) {
            ("windows", "x86_64") => "windows-x86_64.zip",
            ("linux", "x86_64") => "linux-x86_64-musl.tar.gz",
            ("linux", "aarch64") => "linux-aarch64-musl.tar.gz",
            ("macos", "aarch64") => "macos-aarch64.tar.gz",
            _ => {
                return Err(WrapperError::PlatformUnsupported {
                    os: os.to_string(),
                    arch: arch.to_string(),
                })
            }
        };

        let binary_file_name = if os == "windows" {
            format!("{}.exe", binary_name)
        } else {
            binary_name.to_string()
        };

        Ok(Self {
            os,
            arch,
            archive_name: format!("{}_{}", binary_name, suffix),
            binary_file_name,
        })
    }

    pub fn is_windows(&self) -> bool {
        self.os == "windows"
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.os, self.arch)
    }
}

/// Mark a file as executable for everyone (0755). No-op off Unix.
pub fn set_executable(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms)?;
    }

    #[cfg(not(unix))]
    let _ = path;

    Ok(())
}

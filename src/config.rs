use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, WrapperError};

pub const DEFAULT_CONFIG_FILE: &str = "wrapper.toml";
pub const DEFAULT_REPOSITORY: &str = "Quozul/PicoLimbo";
pub const DEFAULT_BINARY_NAME: &str = "pico_limbo";
pub const DEFAULT_BINARIES_DIR: &str = "binaries";
/// Name of the synthetic instance used when no instance list is configured.
pub const LEGACY_INSTANCE_NAME: &str = "default";
const DEFAULT_INSTANCE_CONFIG: &str = "server.toml";

const DEFAULT_CONFIG_TEMPLATE: &str = r#"# limbo-wrapper configuration
#
# binaries_dir - where the server binary is downloaded and kept (default: binaries)
# instances    - comma-separated list of instance names (e.g. "lobby, survival").
#                Leave unset for legacy single-instance mode.
#
# [release]
# repository   - GitHub repository in 'owner/repo' format
# download_url - direct archive URL, overrides GitHub releases when non-empty
# binary_name  - executable name inside the release archive
#
# [instance.<name>]
# config       - config file passed to the server as `-c <config>`
# auto_start   - start the instance with the wrapper (default: true)
#
# Example multi-instance configuration:
#
# instances = "lobby, survival"
#
# [instance.lobby]
# config = "configs/lobby.toml"
# auto_start = true
#
# [instance.survival]
# config = "configs/survival.toml"
# auto_start = false

binaries_dir = "binaries"

[release]
repository = "Quozul/PicoLimbo"
download_url = ""
binary_name = "pico_limbo"
"#;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WrapperConfig {
    pub binaries_dir: PathBuf,
    /// Comma-separated instance names; absent or blank means legacy mode.
    pub instances: Option<String>,
    pub release: ReleaseConfig,
    pub instance: BTreeMap<String, InstanceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReleaseConfig {
    pub repository: String,
    pub download_url: Option<String>,
    pub binary_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstanceEntry {
    pub config: Option<String>,
    pub auto_start: Option<bool>,
}

/// Resolved per-instance settings handed to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    pub name: String,
    /// Passed as `-c <path>`; `None` launches the binary without arguments.
    pub config_path: Option<PathBuf>,
    pub auto_start: bool,
}

impl InstanceSpec {
    pub fn new(name: impl Into<String>, config_path: Option<PathBuf>, auto_start: bool) -> Self {
        Self {
            name: name.into(),
            config_path,
            auto_start,
        }
    }
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            binaries_dir: PathBuf::from(DEFAULT_BINARIES_DIR),
            instances: None,
            release: ReleaseConfig::default(),
            instance: BTreeMap::new(),
        }
    }
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            repository: DEFAULT_REPOSITORY.to_string(),
            download_url: None,
            binary_name: DEFAULT_BINARY_NAME.to_string(),
        }
    }
}

impl ReleaseConfig {
    /// The override download URL, if one is set and non-blank.
    pub fn custom_download_url(&self) -> Option<&str> {
        self.download_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    /// Split `owner/repo` (or a full GitHub URL) into its two parts.
    pub fn parse_repository(&self) -> Result<(&str, &str)> {
        let trimmed = self.repository.trim().trim_end_matches('/');
        let parts: Vec<&str> = trimmed.split('/').filter(|p| !p.is_empty()).collect();

        if parts.len() >= 2 {
            Ok((parts[parts.len() - 2], parts[parts.len() - 1]))
        } else {
            Err(WrapperError::Configuration(format!(
                "Invalid repository '{}', expected 'owner/repo'",
                self.repository
            )))
        }
    }
}

impl WrapperConfig {
    /// Load the configuration, writing a commented default file first if none exists.
    pub fn load(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading wrapper config");

        if !path.exists() {
            Self::write_default(path)?;
        }

        let content = fs::read_to_string(path).map_err(|e| {
            WrapperError::Configuration(format!("Could not read {}: {}", path.display(), e))
        })?;

        let config = Self::parse(&content).map_err(|e| match e {
            WrapperError::Configuration(msg) => {
                WrapperError::Configuration(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })?;

        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| WrapperError::Configuration(e.to_string()))
    }

    fn write_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| WrapperError::path_io(parent, e))?;
        }
        fs::write(path, DEFAULT_CONFIG_TEMPLATE).map_err(|e| WrapperError::path_io(path, e))?;
        tracing::info!("Created default configuration file: {}", path.display());
        Ok(())
    }

    pub fn is_legacy_mode(&self) -> bool {
        self.instance_names_raw().is_empty()
    }

    fn instance_names_raw(&self) -> Vec<String> {
        self.instances
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Configured instance names, or the single legacy instance.
    pub fn instance_names(&self) -> Vec<String> {
        let names = self.instance_names_raw();
        if names.is_empty() {
            vec![LEGACY_INSTANCE_NAME.to_string()]
        } else {
            names
        }
    }

    fn instance_config_path(&self, name: &str) -> Option<PathBuf> {
        let configured = self
            .instance
            .get(name)
            .and_then(|entry| entry.config.as_deref())
            .map(str::trim)
            .filter(|path| !path.is_empty());

        match configured {
            Some(path) => Some(PathBuf::from(path)),
            None if self.is_legacy_mode() => None,
            None => {
                tracing::warn!(
                    "No config path defined for instance '{}', using default: {}",
                    name,
                    DEFAULT_INSTANCE_CONFIG
                );
                Some(PathBuf::from(DEFAULT_INSTANCE_CONFIG))
            }
        }
    }

    fn auto_start(&self, name: &str) -> bool {
        self.instance
            .get(name)
            .and_then(|entry| entry.auto_start)
            .unwrap_or(true)
    }

    pub fn instance_specs(&self) -> Vec<InstanceSpec> {
        self.instance_names()
            .into_iter()
            .map(|name| {
                let config_path = self.instance_config_path(&name);
                let auto_start = self.auto_start(&name);
                InstanceSpec::new(name, config_path, auto_start)
            })
            .collect()
    }

    /// Every named instance must point at an existing config file.
    pub fn validate_instances(&self, specs: &[InstanceSpec]) -> Result<()> {
        if self.is_legacy_mode() {
            return Ok(());
        }

        let errors: Vec<String> = specs
            .iter()
            .filter_map(|spec| {
                let path = spec.config_path.as_ref()?;
                (!path.exists()).then(|| {
                    format!(
                        "Instance '{}': Config file not found: {}",
                        spec.name,
                        path.display()
                    )
                })
            })
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(WrapperError::Configuration(format!(
                "Instance configuration errors:\n{}",
                errors.join("\n")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_template_parses() {
        let config = WrapperConfig::parse(DEFAULT_CONFIG_TEMPLATE).unwrap();
        assert_eq!(config.release.repository, DEFAULT_REPOSITORY);
        assert_eq!(config.release.binary_name, DEFAULT_BINARY_NAME);
        assert!(config.release.custom_download_url().is_none());
        assert!(config.is_legacy_mode());
    }

    #[test]
    fn test_load_creates_default_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("wrapper.toml");

        let config = WrapperConfig::load(&path).unwrap();

        assert!(path.exists());
        assert_eq!(config.binaries_dir, PathBuf::from("binaries"));
    }

    #[test]
    fn test_legacy_mode_single_instance() {
        let config = WrapperConfig::parse("").unwrap();
        let specs = config.instance_specs();

        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, LEGACY_INSTANCE_NAME);
        assert_eq!(specs[0].config_path, None);
        assert!(specs[0].auto_start);
        assert!(config.validate_instances(&specs).is_ok());
    }

    #[test]
    fn test_multi_instance() {
        let config = WrapperConfig::parse(
            r#"
instances = " lobby, survival ,, "

[instance.lobby]
config = "configs/lobby.toml"

[instance.survival]
config = "configs/survival.toml"
auto_start = false
"#,
        )
        .unwrap();

        assert!(!config.is_legacy_mode());
        let specs = config.instance_specs();
        assert_eq!(
            specs,
            vec![
                InstanceSpec::new("lobby", Some("configs/lobby.toml".into()), true),
                InstanceSpec::new("survival", Some("configs/survival.toml".into()), false),
            ]
        );
    }

    #[test]
    fn test_missing_instance_config_falls_back() {
        let config = WrapperConfig::parse(r#"instances = "hub""#).unwrap();
        let specs = config.instance_specs();
        assert_eq!(specs[0].config_path, Some(PathBuf::from("server.toml")));
    }

    #[test]
    fn test_validate_reports_every_missing_file() {
        let temp = TempDir::new().unwrap();
        let present = temp.path().join("lobby.toml");
        fs::write(&present, "").unwrap();

        let config = WrapperConfig::parse(r#"instances = "lobby, a, b""#).unwrap();
        let specs = vec![
            InstanceSpec::new("lobby", Some(present), true),
            InstanceSpec::new("a", Some(temp.path().join("a.toml")), true),
            InstanceSpec::new("b", Some(temp.path().join("b.toml")), true),
        ];

        let err = config.validate_instances(&specs).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Instance 'a'"));
        assert!(msg.contains("Instance 'b'"));
        assert!(!msg.contains("Instance 'lobby'"));
    }

    #[test]
    fn test_custom_download_url() {
        let config = WrapperConfig::parse(
            r#"
[release]
download_url = "  https://example.com/pico.tar.gz  "
"#,
        )
        .unwrap();
        assert_eq!(
            config.release.custom_download_url(),
            Some("https://example.com/pico.tar.gz")
        );
        assert_eq!(config.release.repository, DEFAULT_REPOSITORY);
    }

    #[test]
    fn test_parse_repository() {
        let release = ReleaseConfig::default();
        assert_eq!(release.parse_repository().unwrap(), ("Quozul", "PicoLimbo"));

        let release = ReleaseConfig {
            repository: "https://github.com/Quozul/PicoLimbo/".into(),
            ..ReleaseConfig::default()
        };
        assert_eq!(release.parse_repository().unwrap(), ("Quozul", "PicoLimbo"));

        let release = ReleaseConfig {
            repository: "PicoLimbo".into(),
            ..ReleaseConfig::default()
        };
        assert!(release.parse_repository().is_err());
    }

    #[test]
    fn test_invalid_toml_is_configuration_error() {
        let err = WrapperConfig::parse("instances = [").unwrap_err();
        assert!(matches!(err, WrapperError::Configuration(_)));
    }
}

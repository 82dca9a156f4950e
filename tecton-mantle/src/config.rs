//! Facade configuration.
//!
//! ```toml
//! data_dir = "data"
//! markets_file = "markets.toml"
//!
//! [continuous]
//! adjustment = "ratio"
//! max_forward_fill = 3
//! ```
//!
//! Relative paths resolve against the config file's directory.
//! `TECTON_DATA_DIR` overrides `data_dir`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tecton_core::ContinuousConfig;

pub const DATA_DIR_ENV: &str = "TECTON_DATA_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MantleConfig {
    /// Root of the partition store.
    pub data_dir: PathBuf,
    /// Declarative calendars and markets registered at startup.
    #[serde(default)]
    pub markets_file: Option<PathBuf>,
    #[serde(default)]
    pub continuous: ContinuousConfig,
}

impl MantleConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            markets_file: None,
            continuous: ContinuousConfig::default(),
        }
    }

    /// Load from a TOML file, applying the environment override.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut config = Self::from_toml(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        if let Some(base) = path.parent() {
            config.resolve_relative(base);
        }
        config.apply_env(std::env::var_os(DATA_DIR_ENV).map(PathBuf::from));
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("invalid facade config")?;
        anyhow::ensure!(
            !config.data_dir.as_os_str().is_empty(),
            "data_dir must not be empty"
        );
        Ok(config)
    }

    fn resolve_relative(&mut self, base: &Path) {
        if self.data_dir.is_relative() {
            self.data_dir = base.join(&self.data_dir);
        }
        if let Some(markets) = self.markets_file.as_mut().filter(|p| p.is_relative()) {
            *markets = base.join(&*markets);
        }
    }

    fn apply_env(&mut self, data_dir: Option<PathBuf>) {
        if let Some(dir) = data_dir.filter(|d| !d.as_os_str().is_empty()) {
            tracing::debug!(data_dir = %dir.display(), "data_dir overridden from environment");
            self.data_dir = dir;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tecton_core::AdjustmentMode;

    #[test]
    fn parses_continuous_section() {
        let config = MantleConfig::from_toml(
            r#"
data_dir = "/var/tecton"
markets_file = "markets.toml"

[continuous]
adjustment = "ratio"
max_forward_fill = 3
"#,
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/tecton"));
        assert_eq!(config.continuous.adjustment, AdjustmentMode::Ratio);
        assert_eq!(config.continuous.max_forward_fill, 3);
    }

    #[test]
    fn continuous_section_is_optional() {
        let config = MantleConfig::from_toml("data_dir = \"data\"").unwrap();
        assert_eq!(config.continuous, ContinuousConfig::default());
        assert!(config.markets_file.is_none());
    }

    #[test]
    fn relative_paths_follow_the_config_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tecton.toml");
        std::fs::write(&path, "data_dir = \"data\"\nmarkets_file = \"markets.toml\"\n").unwrap();
        let mut config = MantleConfig::from_toml(&std::fs::read_to_string(&path).unwrap()).unwrap();
        config.resolve_relative(dir.path());
        assert_eq!(config.data_dir, dir.path().join("data"));
        assert_eq!(config.markets_file, Some(dir.path().join("markets.toml")));
    }

    #[test]
    fn environment_overrides_data_dir() {
        let mut config = MantleConfig::new("data");
        config.apply_env(Some(PathBuf::from("/mnt/fast")));
        assert_eq!(config.data_dir, PathBuf::from("/mnt/fast"));
        config.apply_env(Some(PathBuf::new()));
        assert_eq!(config.data_dir, PathBuf::from("/mnt/fast"));
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = MantleConfig::from_file(Path::new("/nonexistent/tecton.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/tecton.toml"));
    }
}

//! TOML configuration and data directory resolution.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::logging::DEFAULT_LOG_RETENTION_FILES;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "ATRAIN_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub dataset: DatasetConfig,
    pub loader: LoaderConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DatasetConfig {
    /// Directory holding `instance_info.json`, the split files and
    /// `dataset_generation_info.json`.
    pub root: PathBuf,
    pub split_name: String,
    pub mode: String,
    /// Field preset name, e.g. `default` or `single_band_670`.
    pub fields: String,
    pub angles_to_omit: Vec<usize>,
    pub get_nondir: bool,
    pub get_flags: bool,
    pub cache_recipes: bool,
    /// JSON file with per-raw-channel `means` and `stds`.
    pub normalization_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub workers: usize,
    pub buffer_size: usize,
    pub shuffle: bool,
    pub seed: Option<u64>,
    pub drop_last: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub retention_files: usize,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("atrain"),
            split_name: "split_default".to_string(),
            mode: "train".to_string(),
            fields: "default".to_string(),
            angles_to_omit: Vec::new(),
            get_nondir: false,
            get_flags: false,
            cache_recipes: true,
            normalization_path: None,
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            workers: 4,
            buffer_size: 2,
            shuffle: false,
            seed: None,
            drop_last: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Make the dataset paths absolute with respect to `data_dir`.
    pub fn resolve_paths(mut self, data_dir: &Path) -> Self {
        self.dataset.root = resolve_relative_to(data_dir, &self.dataset.root);
        self.dataset.normalization_path = self
            .dataset
            .normalization_path
            .map(|path| resolve_relative_to(data_dir, &path));
        self
    }
}

/// `--data-dir`, then `ATRAIN_DATA_DIR`, then `./data`.
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    cli_override
        .map(Path::to_path_buf)
        .or_else(|| env::var_os(ENV_DATA_DIR).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("data"))
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and a default config.toml on first run. An
/// existing config file is never overwritten.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    fs::create_dir_all(data_dir)
        .with_context(|| format!("cannot create data directory {}", data_dir.display()))?;

    let cfg_path = config_path(data_dir);
    if cfg_path.exists() {
        return Ok(());
    }
    AppConfig::default().save_to_path(&cfg_path)
}

pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.dataset.root, PathBuf::from("atrain"));
        assert_eq!(cfg.dataset.split_name, "split_default");
        assert_eq!(cfg.dataset.mode, "train");
        assert_eq!(cfg.dataset.fields, "default");
        assert!(cfg.dataset.angles_to_omit.is_empty());
        assert!(cfg.dataset.cache_recipes);
        assert!(!cfg.dataset.get_nondir);

        assert_eq!(cfg.loader.batch_size, 8);
        assert_eq!(cfg.loader.workers, 4);
        assert_eq!(cfg.loader.buffer_size, 2);
        assert!(!cfg.loader.shuffle);

        assert_eq!(cfg.logging.retention_files, DEFAULT_LOG_RETENTION_FILES);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut original = AppConfig::default();
        original.dataset.angles_to_omit = vec![0, 15];
        original.loader.seed = Some(7);
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_keeps_defaults_for_missing_keys() {
        let decoded: AppConfig =
            toml::from_str("[loader]\nbatch_size = 32\n").expect("deserialize config");
        assert_eq!(decoded.loader.batch_size, 32);
        assert_eq!(decoded.loader.workers, 4);
        assert_eq!(decoded.dataset, DatasetConfig::default());
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let loaded = AppConfig::load_from_path(&temp.path().join("missing.toml"))
            .expect("load config from nonexistent path");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn invalid_toml_reports_path() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[loader\nbatch_size = ").expect("write config");
        let err = AppConfig::load_from_path(&path).unwrap_err();
        assert!(format!("{err:#}").contains("config.toml"));
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn resolve_paths_joins_relative_dataset_paths() {
        let mut cfg = AppConfig::default();
        cfg.dataset.normalization_path = Some(PathBuf::from("stats.json"));
        let resolved = cfg.resolve_paths(Path::new("/data"));
        assert_eq!(resolved.dataset.root, PathBuf::from("/data/atrain"));
        assert_eq!(
            resolved.dataset.normalization_path,
            Some(PathBuf::from("/data/stats.json"))
        );
    }

    #[test]
    fn initialize_creates_data_dir_and_config() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let dir = temp.path().join("nested");
        initialize_data_dir(&dir).expect("initialize data dir");

        assert!(dir.exists());
        assert!(dir.join("config.toml").exists());
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let cfg_path = temp.path().join("config.toml");
        let custom_content = "[loader]\nbatch_size = 64\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(temp.path()).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }

    #[test]
    fn resolve_relative_to_absolute_path_unchanged() {
        let result = resolve_relative_to(Path::new("/base"), Path::new("/abs/path"));
        assert_eq!(result, PathBuf::from("/abs/path"));
    }
}

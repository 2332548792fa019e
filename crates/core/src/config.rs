use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::{loader_for, InferenceBackend};
use crate::device::{DeviceInfo, GpuInstance};
use crate::inference::OperatorLoader;
use crate::model::default_models_root;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "TILESCALE_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub inference: InferenceConfig,
    pub devices: Vec<DeviceInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// Models root; `<exe dir>/models` when unset.
    pub models_dir: Option<PathBuf>,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InferenceConfig {
    pub backend: InferenceBackend,
    /// Box filter radius of the reference backend; 0 replicates pixels.
    pub reference_radius: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig {
                models_dir: None,
                trt_cache_dir: PathBuf::from("trt_cache"),
            },
            inference: InferenceConfig::default(),
            devices: vec![DeviceInfo::default()],
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            backend: InferenceBackend::Cuda,
            reference_radius: 1,
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

    /// Models root, with relative paths resolved against `data_dir`.
    pub fn models_root(&self, data_dir: &Path) -> PathBuf {
        match &self.paths.models_dir {
            Some(dir) => resolve_relative_to(data_dir, dir),
            None => default_models_root(),
        }
    }

    pub fn trt_cache_dir(&self, data_dir: &Path) -> PathBuf {
        resolve_relative_to(data_dir, &self.paths.trt_cache_dir)
    }

    /// GPU instance over the configured devices. Nothing is created until
    /// the first lease.
    pub fn gpu_instance(&self) -> Arc<GpuInstance> {
        GpuInstance::new(self.devices.clone())
    }

    pub fn operator_loader(&self, data_dir: &Path) -> Box<dyn OperatorLoader> {
        loader_for(
            &self.inference.backend,
            Some(self.trt_cache_dir(data_dir)),
            self.inference.reference_radius,
        )
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. TILESCALE_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Creates `data_dir` and writes a default config.toml unless one exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns `path` as-is if absolute, otherwise joined to `base`.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

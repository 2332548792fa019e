//! Model file layout.
//!
//! Every network is a `<name>.param` / `<name>.bin` pair under a family
//! directory of the models root. `.bin` holds the serialized ONNX graph and
//! `.param` is a small TOML sidecar describing its interface.

use std::env;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::UpscaleError;
use crate::tensor::NETWORK_RANGE;

pub const MODELS_DIR_NAME: &str = "models";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub name: String,
    pub param: PathBuf,
    pub bin: PathBuf,
}

impl ModelFiles {
    pub fn in_dir(dir: &Path, name: &str) -> Self {
        Self {
            name: name.to_string(),
            param: dir.join(format!("{name}.param")),
            bin: dir.join(format!("{name}.bin")),
        }
    }

    /// Both files must open for reading.
    pub fn ensure_readable(&self) -> Result<()> {
        for path in [&self.param, &self.bin] {
            if File::open(path).is_err() {
                bail!(UpscaleError::ModelUnavailable { path: path.clone() });
            }
        }
        Ok(())
    }
}

/// `<exe dir>/models`, or `models` relative to the working directory when
/// the executable path is unknown.
pub fn default_models_root() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(MODELS_DIR_NAME)))
        .unwrap_or_else(|| PathBuf::from(MODELS_DIR_NAME))
}

/// Interface of a network, read from its `.param` sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    /// Graph input; the first input when unset.
    pub input_name: Option<String>,
    /// Graph output; the first output when unset.
    pub output_name: Option<String>,
    pub scale: usize,
    /// Feed and read f16 tensors. Detected from the graph when unset.
    pub fp16: Option<bool>,
    /// Value the network maps to full intensity: 255 for networks trained
    /// on 8-bit ranges, 1 for normalized ones.
    pub normalization_max: f32,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            input_name: None,
            output_name: None,
            scale: 1,
            fp16: None,
            normalization_max: NETWORK_RANGE,
        }
    }
}

impl ModelParams {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read model params: {}", path.display()))?;
        let params: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse model params: {}", path.display()))?;
        if params.scale == 0 {
            bail!(UpscaleError::config(format!(
                "model params {} declare scale 0",
                path.display()
            )));
        }
        if params.normalization_max.is_nan() || params.normalization_max <= 0.0 {
            bail!(UpscaleError::config(format!(
                "model params {} declare non-positive normalization_max",
                path.display()
            )));
        }
        Ok(params)
    }
}

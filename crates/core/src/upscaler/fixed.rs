//! Fixed 4x upscaler for the RealESRGAN network family.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::device::{GpuDevice, GpuInstance};
use crate::error::UpscaleError;
use crate::inference::OperatorLoader;
use crate::model::ModelFiles;
use crate::orchestrator::RunStats;
use crate::pipeline::KernelFamily;
use crate::tensor::{PlanarFrame, PlanarFrameMut};
use crate::tile::PaddingPolicy;
use crate::upscaler::{
    validate_tile_extent, Engine, Precision, TileSize, Upscaler, UpscalerConfig,
};

pub const FIXED_SCALE: usize = 4;
pub const PREPADDING: usize = 10;
pub const MODEL_DIR: &str = "Real-ESRGAN";
pub const DEFAULT_MODEL: &str = "realesrgan-x4plus";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixedScaleOptions {
    pub device_index: usize,
    pub tta: bool,
    pub scale: usize,
    /// File stem inside `Real-ESRGAN/`.
    pub model: String,
    pub tile_size: TileSize,
    /// 0 picks the device default.
    pub gpu_threads: usize,
    pub precision: Precision,
    pub int8: bool,
}

impl Default for FixedScaleOptions {
    fn default() -> Self {
        Self {
            device_index: 0,
            tta: false,
            scale: FIXED_SCALE,
            model: DEFAULT_MODEL.to_string(),
            tile_size: TileSize::Auto,
            gpu_threads: 0,
            precision: Precision::Fp16,
            int8: false,
        }
    }
}

/// Largest tile that comfortably fits the heap budget (MiB).
pub fn auto_tile_size(heap_budget_mb: usize) -> usize {
    match heap_budget_mb {
        b if b > 1900 => 200,
        b if b > 550 => 100,
        b if b > 190 => 64,
        _ => 32,
    }
}

pub struct FixedScaleUpscaler {
    engine: Engine,
}

impl FixedScaleUpscaler {
    pub fn new(
        instance: &Arc<GpuInstance>,
        models_root: &Path,
        options: &FixedScaleOptions,
        loader: &dyn OperatorLoader,
    ) -> Result<Self> {
        let lease = instance.acquire()?;
        let device = lease.device(options.device_index)?;

        if options.scale != FIXED_SCALE {
            bail!(UpscaleError::config(format!("'scale' must be {FIXED_SCALE}")));
        }
        if options.model.trim().is_empty() {
            bail!(UpscaleError::config("'model' must not be empty"));
        }
        let gpu_threads = device.gpu_threads(options.gpu_threads);
        let tile = match options.tile_size {
            TileSize::Auto => auto_tile_size(device.heap_budget_mb()),
            TileSize::Fixed(n) => n,
        };
        validate_tile_extent("tile_size", tile)?;

        let config = UpscalerConfig {
            device_index: options.device_index,
            scale: FIXED_SCALE,
            tile_w: tile,
            tile_h: tile,
            prepadding: PREPADDING,
            tta: options.tta,
            gpu_threads,
            precision: options.precision,
            int8: options.int8,
            policy: PaddingPolicy::Symmetric,
        };
        let model = ModelFiles::in_dir(&models_root.join(MODEL_DIR), &options.model);
        let engine =
            Engine::build(lease, device, KernelFamily::RealEsrgan, config, &model, loader)?;
        Ok(Self { engine })
    }

    pub fn device(&self) -> &GpuDevice {
        self.engine.device()
    }
}

impl Upscaler for FixedScaleUpscaler {
    fn config(&self) -> &UpscalerConfig {
        self.engine.config()
    }

    fn process_with_stats(
        &self,
        src: &PlanarFrame<'_>,
        dst: &mut PlanarFrameMut<'_>,
    ) -> Result<RunStats> {
        self.engine.process(src, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_tile_size_thresholds() {
        assert_eq!(auto_tile_size(8192), 200);
        assert_eq!(auto_tile_size(1901), 200);
        assert_eq!(auto_tile_size(1900), 100);
        assert_eq!(auto_tile_size(551), 100);
        assert_eq!(auto_tile_size(550), 64);
        assert_eq!(auto_tile_size(191), 64);
        assert_eq!(auto_tile_size(190), 32);
        assert_eq!(auto_tile_size(0), 32);
    }

    #[test]
    fn test_options_defaults_from_empty_toml() {
        let options: FixedScaleOptions = toml::from_str("").unwrap();
        assert_eq!(options, FixedScaleOptions::default());
        assert_eq!(options.model, "realesrgan-x4plus");
        assert_eq!(options.scale, 4);
    }

    #[test]
    fn test_options_toml_fields() {
        let options: FixedScaleOptions =
            toml::from_str("tta = true\ntile_size = 64\nprecision = 32\n").unwrap();
        assert!(options.tta);
        assert_eq!(options.tile_size, TileSize::Fixed(64));
        assert_eq!(options.precision, Precision::Fp32);
    }
}

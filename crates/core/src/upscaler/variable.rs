//! 1x/2x upscaler with noise reduction for the waifu2x network family.

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

pub const MODEL_ROOT_DIR: &str = "Waifu2x";
pub const DEFAULT_SCALE: usize = 2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariableModel {
    #[default]
    #[serde(rename = "upconv_7_anime_style_art_rgb")]
    UpconvAnime,
    #[serde(rename = "upconv_7_photo")]
    UpconvPhoto,
    #[serde(rename = "cunet")]
    Cunet,
}

impl VariableModel {
    pub const ALL: [VariableModel; 3] = [Self::UpconvAnime, Self::UpconvPhoto, Self::Cunet];

    /// Model by its numeric id (0 anime, 1 photo, 2 cunet).
    pub fn from_index(index: i64) -> Option<Self> {
        usize::try_from(index)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::UpconvAnime => "models-upconv_7_anime_style_art_rgb",
            Self::UpconvPhoto => "models-upconv_7_photo",
            Self::Cunet => "models-cunet",
        }
    }

    pub const fn prepadding(self, scale: usize) -> usize {
        match (self, scale) {
            (Self::Cunet, 1) => 28,
            (Self::Cunet, _) => 18,
            _ => 7,
        }
    }
}

/// File stem of the network for `noise` and `scale`.
pub fn model_name(noise: i32, scale: usize) -> String {
    if noise == -1 {
        "scale2.0x_model".to_string()
    } else if scale == 1 {
        format!("noise{noise}_model")
    } else {
        format!("noise{noise}_scale2.0x_model")
    }
}

/// Tile size that fits the heap budget (MiB) once shared between threads.
pub fn auto_tile_size(
    heap_budget_mb: usize,
    precision: Precision,
    model: VariableModel,
    gpu_threads: usize,
) -> usize {
    let mut factor = gpu_threads.max(1) as f64;
    if precision == Precision::Fp32 {
        factor *= 2.0;
    }
    if model == VariableModel::Cunet {
        factor *= 1.5;
    }
    let per_thread = heap_budget_mb as f64 / factor;
    if per_thread > 900.0 {
        360
    } else if per_thread > 450.0 {
        240
    } else {
        180
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VariableScaleOptions {
    pub device_index: usize,
    pub tta: bool,
    /// -1 disables denoising; 0..=3 picks the denoise strength.
    pub noise: i32,
    pub scale: usize,
    pub model: VariableModel,
    pub precision: Precision,
    pub tile_size: TileSize,
    pub tile_size_w: Option<usize>,
    pub tile_size_h: Option<usize>,
    pub gpu_threads: usize,
    pub int8: bool,
}

impl Default for VariableScaleOptions {
    fn default() -> Self {
        Self {
            device_index: 0,
            tta: false,
            noise: 0,
            scale: DEFAULT_SCALE,
            model: VariableModel::default(),
            precision: Precision::Fp16,
            tile_size: TileSize::Auto,
            tile_size_w: None,
            tile_size_h: None,
            gpu_threads: 0,
            int8: false,
        }
    }
}

impl VariableScaleOptions {
    /// Rejects option combinations that do not depend on the device.
    pub fn validate(&self) -> Result<()> {
        if !(-1..=3).contains(&self.noise) {
            bail!(UpscaleError::config("'noise' must be -1, 0, 1, 2, or 3"));
        }
        if self.scale != 1 && self.scale != 2 {
            bail!(UpscaleError::config("'scale' must be 1 or 2"));
        }
        if self.scale == 1 && self.noise == -1 {
            bail!(UpscaleError::config(
                "use 'noise=-1' and 'scale=1' at same time is useless"
            ));
        }
        if self.scale == 1 && self.model != VariableModel::Cunet {
            bail!(UpscaleError::config("only cunet model support 'scale=1'"));
        }
        Ok(())
    }

    /// Model files under `models_root`.
    pub fn model_files(&self, models_root: &Path) -> ModelFiles {
        let dir = models_root.join(MODEL_ROOT_DIR).join(self.model.dir_name());
        ModelFiles::in_dir(&dir, &model_name(self.noise, self.scale))
    }
}

pub struct VariableScaleUpscaler {
    engine: Engine,
}

impl VariableScaleUpscaler {
    pub fn new(
        instance: &Arc<GpuInstance>,
        models_root: &Path,
        options: &VariableScaleOptions,
        loader: &dyn OperatorLoader,
    ) -> Result<Self> {
        let lease = instance.acquire()?;
        let device = lease.device(options.device_index)?;
        options.validate()?;

        let gpu_threads = device.gpu_threads(options.gpu_threads);
        let tile = match options.tile_size {
            TileSize::Auto => auto_tile_size(
                device.heap_budget_mb(),
                options.precision,
                options.model,
                gpu_threads,
            ),
            TileSize::Fixed(n) => n,
        };
        validate_tile_extent("tile_size", tile)?;
        let tile_w = match options.tile_size_w {
            Some(w) => validate_tile_extent("tile_size_w", w)?,
            None => tile,
        };
        let tile_h = match options.tile_size_h {
            Some(h) => validate_tile_extent("tile_size_h", h)?,
            None => tile,
        };

        let config = UpscalerConfig {
            device_index: options.device_index,
            scale: options.scale,
            tile_w,
            tile_h,
            prepadding: options.model.prepadding(options.scale),
            tta: options.tta,
            gpu_threads,
            precision: options.precision,
            int8: options.int8,
            policy: PaddingPolicy::for_variable_scale(options.scale),
        };
        let model = options.model_files(models_root);
        let engine = Engine::build(lease, device, KernelFamily::Waifu2x, config, &model, loader)?;
        Ok(Self { engine })
    }

    pub fn device(&self) -> &GpuDevice {
        self.engine.device()
    }
}

impl Upscaler for VariableScaleUpscaler {
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
    use std::path::PathBuf;

    use super::*;
    use crate::error::classify;

    #[test]
    fn test_model_names() {
        assert_eq!(model_name(-1, 2), "scale2.0x_model");
        assert_eq!(model_name(2, 1), "noise2_model");
        assert_eq!(model_name(0, 2), "noise0_scale2.0x_model");
    }

    #[test]
    fn test_model_files_layout() {
        let options = VariableScaleOptions {
            model: VariableModel::Cunet,
            noise: 3,
            scale: 1,
            ..VariableScaleOptions::default()
        };
        let files = options.model_files(Path::new("/models"));
        assert_eq!(
            files.param,
            PathBuf::from("/models/Waifu2x/models-cunet/noise3_model.param")
        );
    }

    #[test]
    fn test_prepadding_per_model() {
        assert_eq!(VariableModel::Cunet.prepadding(1), 28);
        assert_eq!(VariableModel::Cunet.prepadding(2), 18);
        assert_eq!(VariableModel::UpconvAnime.prepadding(2), 7);
        assert_eq!(VariableModel::UpconvPhoto.prepadding(2), 7);
    }

    #[test]
    fn test_validate_rejects_invalid_combinations() {
        let cases = [
            (VariableScaleOptions { noise: 4, ..Default::default() }, "'noise'"),
            (VariableScaleOptions { scale: 3, ..Default::default() }, "'scale'"),
            (
                VariableScaleOptions {
                    scale: 1,
                    noise: -1,
                    model: VariableModel::Cunet,
                    ..Default::default()
                },
                "useless",
            ),
            (
                VariableScaleOptions { scale: 1, noise: 1, ..Default::default() },
                "only cunet",
            ),
        ];
        for (options, needle) in cases {
            let err = options.validate().unwrap_err();
            assert!(err.to_string().contains(needle), "{err}");
            assert!(matches!(classify(&err), Some(UpscaleError::Config(_))));
        }
        assert!(VariableScaleOptions::default().validate().is_ok());
    }

    #[test]
    fn test_auto_tile_size() {
        assert_eq!(auto_tile_size(4096, Precision::Fp16, VariableModel::UpconvAnime, 1), 360);
        assert_eq!(auto_tile_size(4096, Precision::Fp32, VariableModel::Cunet, 2), 240);
        assert_eq!(auto_tile_size(1800, Precision::Fp32, VariableModel::UpconvPhoto, 1), 240);
        assert_eq!(auto_tile_size(800, Precision::Fp32, VariableModel::UpconvPhoto, 1), 180);
        assert_eq!(auto_tile_size(900, Precision::Fp16, VariableModel::UpconvPhoto, 1), 240);
    }

    #[test]
    fn test_model_from_index() {
        assert_eq!(VariableModel::from_index(2), Some(VariableModel::Cunet));
        assert_eq!(VariableModel::from_index(3), None);
        assert_eq!(VariableModel::from_index(-1), None);
    }

    #[test]
    fn test_options_toml() {
        let options: VariableScaleOptions =
            toml::from_str("model = \"cunet\"\nscale = 1\nnoise = 2\ntile_size_w = 96\n").unwrap();
        assert_eq!(options.model, VariableModel::Cunet);
        assert_eq!(options.tile_size_w, Some(96));
        assert_eq!(options.tile_size, TileSize::Auto);
        assert!(options.validate().is_ok());
    }
}

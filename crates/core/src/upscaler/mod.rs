//! Upscaler facades.
//!
//! A facade validates its options, takes a lease on the GPU instance, locates
//! and loads its network, builds the pre/post pipelines and then exposes a
//! single frame-in, frame-out `process`. Construction either fully succeeds
//! or retains nothing.

use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::device::{GpuDevice, InstanceLease};
use crate::error::UpscaleError;
use crate::inference::{Inference, LoadRequest, OperatorLoader};
use crate::model::ModelFiles;
use crate::orchestrator::{RunStats, TileOrchestrator};
use crate::pipeline::{KernelFamily, KernelKey, KernelOp, Pipeline};
use crate::tensor::{PlanarFrame, PlanarFrameMut, RgbImage};
use crate::tile::{PaddingPolicy, TileGeometry};

pub mod fixed;
pub mod variable;

pub use fixed::{FixedScaleOptions, FixedScaleUpscaler};
pub use variable::{VariableModel, VariableScaleOptions, VariableScaleUpscaler};

pub const MIN_TILE_SIZE: usize = 32;
pub const TILE_SIZE_ALIGN: usize = 4;

/// Tile edge length. Stored as an integer where 0 means automatic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "usize", into = "usize")]
pub enum TileSize {
    /// Derived from the device heap budget.
    #[default]
    Auto,
    Fixed(usize),
}

impl From<usize> for TileSize {
    fn from(value: usize) -> Self {
        match value {
            0 => Self::Auto,
            n => Self::Fixed(n),
        }
    }
}

impl From<TileSize> for usize {
    fn from(value: TileSize) -> Self {
        match value {
            TileSize::Auto => 0,
            TileSize::Fixed(n) => n,
        }
    }
}

pub(crate) fn validate_tile_extent(option: &str, value: usize) -> Result<usize> {
    if value < MIN_TILE_SIZE {
        bail!(UpscaleError::config(format!(
            "'{option}' must be greater than or equal to {MIN_TILE_SIZE}"
        )));
    }
    if value % TILE_SIZE_ALIGN != 0 {
        bail!(UpscaleError::config(format!(
            "'{option}' must be multiple of {TILE_SIZE_ALIGN}"
        )));
    }
    Ok(value)
}

/// Storage precision of tile tensors, written as 16 or 32.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Precision {
    #[default]
    Fp16,
    Fp32,
}

impl TryFrom<u32> for Precision {
    type Error = String;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        match value {
            16 => Ok(Self::Fp16),
            32 => Ok(Self::Fp32),
            other => Err(format!("'precision' must be 16 or 32, got {other}")),
        }
    }
}

impl From<Precision> for u32 {
    fn from(value: Precision) -> Self {
        match value {
            Precision::Fp16 => 16,
            Precision::Fp32 => 32,
        }
    }
}

/// Resolved, immutable upscaler parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpscalerConfig {
    pub device_index: usize,
    pub scale: usize,
    pub tile_w: usize,
    pub tile_h: usize,
    pub prepadding: usize,
    pub tta: bool,
    pub gpu_threads: usize,
    pub precision: Precision,
    pub int8: bool,
    pub policy: PaddingPolicy,
}

impl UpscalerConfig {
    pub fn geometry(&self) -> TileGeometry {
        TileGeometry {
            tile_w: self.tile_w,
            tile_h: self.tile_h,
            prepadding: self.prepadding,
            policy: self.policy,
        }
    }

    pub fn kernel_key(&self) -> KernelKey {
        KernelKey {
            tta: self.tta,
            fp16: self.precision == Precision::Fp16,
            int8: self.int8,
        }
    }
}

pub trait Upscaler: Send + Sync {
    fn config(&self) -> &UpscalerConfig;

    fn process_with_stats(
        &self,
        src: &PlanarFrame<'_>,
        dst: &mut PlanarFrameMut<'_>,
    ) -> Result<RunStats>;

    /// Upscales `src` into `dst`, which must be `scale` times larger.
    ///
    /// On error the frame must be discarded: tile rows finished before the
    /// failing row have already been written to `dst` and the rest have not.
    fn process(&self, src: &PlanarFrame<'_>, dst: &mut PlanarFrameMut<'_>) -> Result<()> {
        self.process_with_stats(src, dst).map(|_| ())
    }

    fn output_size(&self, width: usize, height: usize) -> (usize, usize) {
        let scale = self.config().scale;
        (width * scale, height * scale)
    }

    /// Upscales into a freshly allocated image. Nothing is returned for a
    /// failed frame.
    fn upscale(&self, image: &RgbImage) -> Result<RgbImage> {
        let (w, h) = self.output_size(image.width(), image.height());
        let mut out = RgbImage::new(w, h);
        self.process(&image.as_frame(), &mut out.as_frame_mut())?;
        Ok(out)
    }
}

/// Everything a constructed facade owns. Fields drop in order, so the
/// instance lease goes last.
pub(crate) struct Engine {
    config: UpscalerConfig,
    operator: Arc<dyn Inference>,
    preprocess: Pipeline,
    postprocess: Pipeline,
    device: Arc<GpuDevice>,
    _lease: InstanceLease,
}

impl Engine {
    pub(crate) fn build(
        lease: InstanceLease,
        device: Arc<GpuDevice>,
        family: KernelFamily,
        config: UpscalerConfig,
        model: &ModelFiles,
        loader: &dyn OperatorLoader,
    ) -> Result<Self> {
        model.ensure_readable()?;
        let key = config.kernel_key();
        let operator = loader.load(&LoadRequest {
            model,
            device: &device,
            scale: config.scale,
            fp16: key.fp16,
            threads: config.gpu_threads,
        })?;
        if operator.scale() != config.scale {
            bail!(UpscaleError::config(format!(
                "operator '{}' upscales by {}, configured scale is {}",
                operator.name(),
                operator.scale(),
                config.scale
            )));
        }

        let preprocess = Pipeline::create(&device, family, KernelOp::Preprocess, key);
        let postprocess = Pipeline::create(&device, family, KernelOp::Postprocess, key);
        debug!(
            device = device.index(),
            model = %model.name,
            operator = operator.name(),
            scale = config.scale,
            tile_w = config.tile_w,
            tile_h = config.tile_h,
            prepadding = config.prepadding,
            tta = config.tta,
            gpu_threads = config.gpu_threads,
            "Upscaler ready"
        );
        Ok(Self {
            config,
            operator,
            preprocess,
            postprocess,
            device,
            _lease: lease,
        })
    }

    pub(crate) fn config(&self) -> &UpscalerConfig {
        &self.config
    }

    pub(crate) fn device(&self) -> &GpuDevice {
        &self.device
    }

    pub(crate) fn process(
        &self,
        src: &PlanarFrame<'_>,
        dst: &mut PlanarFrameMut<'_>,
    ) -> Result<RunStats> {
        TileOrchestrator::new(
            &self.device,
            &self.preprocess,
            &self.postprocess,
            &self.operator,
            self.config.geometry(),
        )
        .run(src, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;

    #[test]
    fn test_tile_size_integer_encoding() {
        assert_eq!(TileSize::from(0), TileSize::Auto);
        assert_eq!(TileSize::from(64), TileSize::Fixed(64));
        assert_eq!(usize::from(TileSize::Auto), 0);
    }

    #[test]
    fn test_validate_tile_extent() {
        assert_eq!(validate_tile_extent("tile_size", 32).unwrap(), 32);
        let small = validate_tile_extent("tile_size", 28).unwrap_err();
        assert!(small.to_string().contains("greater than or equal to 32"));
        let odd = validate_tile_extent("tile_size_w", 30).unwrap_err();
        assert!(odd.to_string().contains("greater than or equal"));
        let misaligned = validate_tile_extent("tile_size_h", 34).unwrap_err();
        assert!(misaligned.to_string().contains("'tile_size_h' must be multiple of 4"));
        assert!(matches!(classify(&misaligned), Some(UpscaleError::Config(_))));
    }

    #[test]
    fn test_precision_parsing() {
        assert_eq!(Precision::try_from(16), Ok(Precision::Fp16));
        assert_eq!(Precision::try_from(32), Ok(Precision::Fp32));
        assert!(Precision::try_from(8).is_err());
        assert_eq!(u32::from(Precision::default()), 16);
    }

    #[test]
    fn test_kernel_key_from_config() {
        let config = UpscalerConfig {
            device_index: 0,
            scale: 2,
            tile_w: 64,
            tile_h: 64,
            prepadding: 7,
            tta: true,
            gpu_threads: 1,
            precision: Precision::Fp32,
            int8: true,
            policy: PaddingPolicy::Symmetric,
        };
        let key = config.kernel_key();
        assert!(key.tta && !key.fp16 && key.int8);
        assert_eq!(config.geometry().prepadding, 7);
    }
}

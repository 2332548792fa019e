//! The network behind a single `infer` call.
//!
//! The orchestrator only needs an operator that maps a `w x h` planar RGB
//! tensor in the [0,255] range to a `w*scale x h*scale` tensor of the same
//! element type. The ONNX Runtime implementation lives in `backend`; the
//! reference operators here are deterministic CPU stand-ins used by tests
//! and the `bench` command with `--backend reference`.

use std::sync::Arc;

use anyhow::{bail, Result};

use crate::device::GpuDevice;
use crate::model::ModelFiles;
use crate::tensor::DeviceTensor;

pub trait Inference: Send + Sync {
    fn name(&self) -> &str;

    fn scale(&self) -> usize;

    /// `output` is pre-allocated with `input`'s extent times `scale()`.
    fn infer(&self, input: &DeviceTensor, output: &DeviceTensor) -> Result<()>;
}

/// What a loader gets to build an operator for one upscaler.
pub struct LoadRequest<'a> {
    pub model: &'a ModelFiles,
    pub device: &'a GpuDevice,
    pub scale: usize,
    pub fp16: bool,
    pub threads: usize,
}

pub trait OperatorLoader: Send + Sync {
    fn load(&self, request: &LoadRequest<'_>) -> Result<Arc<dyn Inference>>;
}

pub(crate) fn check_io(
    op: &dyn Inference,
    input: &DeviceTensor,
    output: &DeviceTensor,
) -> Result<()> {
    let (i, o) = (input.shape(), output.shape());
    let scale = op.scale();
    if o.w != i.w * scale || o.h != i.h * scale || o.c != i.c {
        bail!(
            "{}: output {o} does not match input {i} at scale {scale}",
            op.name()
        );
    }
    Ok(())
}

/// Pixel replication.
#[derive(Debug, Clone)]
pub struct NearestUpscale {
    scale: usize,
}

impl NearestUpscale {
    pub fn new(scale: usize) -> Self {
        Self { scale }
    }
}

impl Inference for NearestUpscale {
    fn name(&self) -> &str {
        "nearest"
    }

    fn scale(&self) -> usize {
        self.scale
    }

    fn infer(&self, input: &DeviceTensor, output: &DeviceTensor) -> Result<()> {
        check_io(self, input, output)?;
        let (i, o) = (input.shape(), output.shape());
        let src = input.read();
        let mut dst = output.write();
        for c in 0..o.c {
            for y in 0..o.h {
                for x in 0..o.w {
                    let v = src.get(c * i.cstep() + (y / self.scale) * i.w + x / self.scale);
                    dst.set(c * o.cstep() + y * o.w + x, v);
                }
            }
        }
        Ok(())
    }
}

/// Box blur over a `(2r+1)^2` window with edge clamping, then pixel
/// replication. Depends on `radius` pixels of context, so it exercises
/// tile seams the way a convolutional network does.
#[derive(Debug, Clone)]
pub struct BoxBlurUpscale {
    scale: usize,
    radius: usize,
}

impl BoxBlurUpscale {
    pub fn new(scale: usize, radius: usize) -> Self {
        Self { scale, radius }
    }
}

impl Inference for BoxBlurUpscale {
    fn name(&self) -> &str {
        "box-blur"
    }

    fn scale(&self) -> usize {
        self.scale
    }

    fn infer(&self, input: &DeviceTensor, output: &DeviceTensor) -> Result<()> {
        check_io(self, input, output)?;
        let (i, o) = (input.shape(), output.shape());
        let r = self.radius as isize;
        let window = ((2 * r + 1) * (2 * r + 1)) as f32;
        let clamp = |v: isize, n: usize| v.clamp(0, n as isize - 1) as usize;

        let src = input.read();
        let mut blurred = vec![0.0f32; i.cstep()];
        let mut dst = output.write();
        for c in 0..i.c {
            let plane = c * i.cstep();
            for y in 0..i.h {
                for x in 0..i.w {
                    let mut sum = 0.0f32;
                    for dy in -r..=r {
                        let sy = clamp(y as isize + dy, i.h);
                        for dx in -r..=r {
                            let sx = clamp(x as isize + dx, i.w);
                            sum += src.get(plane + sy * i.w + sx);
                        }
                    }
                    blurred[y * i.w + x] = sum / window;
                }
            }
            for y in 0..o.h {
                for x in 0..o.w {
                    let v = blurred[(y / self.scale) * i.w + x / self.scale];
                    dst.set(c * o.cstep() + y * o.w + x, v);
                }
            }
        }
        Ok(())
    }
}

/// Builds reference operators instead of loading network weights.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceLoader {
    pub radius: usize,
}

impl OperatorLoader for ReferenceLoader {
    fn load(&self, request: &LoadRequest<'_>) -> Result<Arc<dyn Inference>> {
        if self.radius == 0 {
            Ok(Arc::new(NearestUpscale::new(request.scale)))
        } else {
            Ok(Arc::new(BoxBlurUpscale::new(request.scale, self.radius)))
        }
    }
}

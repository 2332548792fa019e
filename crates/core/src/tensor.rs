//! Host frames and device tensors.
//!
//! Host frames are planar RGB32F with an explicit row stride and are always
//! owned by the caller. Device tensors are planar CHW buffers charged against
//! a device allocator; the allocation is returned when the last handle drops.

use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{bail, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;

use crate::device::Allocation;
use crate::error::UpscaleError;

pub const CHANNELS: usize = 3;

/// Networks were trained on [0,255]; frames travel in [0,1].
pub const NETWORK_RANGE: f32 = 255.0;

fn check_plane(len: usize, width: usize, height: usize, stride: usize) -> Result<()> {
    if stride < width {
        bail!(UpscaleError::FrameShape(format!(
            "stride {stride} is smaller than width {width}"
        )));
    }
    let required = if height == 0 {
        0
    } else {
        stride * (height - 1) + width
    };
    if len < required {
        bail!(UpscaleError::FrameShape(format!(
            "plane holds {len} samples, {width}x{height} with stride {stride} needs {required}"
        )));
    }
    Ok(())
}

/// Read-only view of a caller-owned planar RGB frame.
#[derive(Clone, Copy)]
pub struct PlanarFrame<'a> {
    planes: [&'a [f32]; CHANNELS],
    width: usize,
    height: usize,
    stride: usize,
}

impl<'a> PlanarFrame<'a> {
    pub fn new(
        planes: [&'a [f32]; CHANNELS],
        width: usize,
        height: usize,
        stride: usize,
    ) -> Result<Self> {
        for plane in &planes {
            check_plane(plane.len(), width, height, stride)?;
        }
        Ok(Self {
            planes,
            width,
            height,
            stride,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Visible samples of row `y` in channel `c`.
    pub fn row(&self, c: usize, y: usize) -> &'a [f32] {
        let start = y * self.stride;
        &self.planes[c][start..start + self.width]
    }
}

/// Writable view of a caller-owned planar RGB frame.
pub struct PlanarFrameMut<'a> {
    planes: [&'a mut [f32]; CHANNELS],
    width: usize,
    height: usize,
    stride: usize,
}

impl<'a> PlanarFrameMut<'a> {
    pub fn new(
        planes: [&'a mut [f32]; CHANNELS],
        width: usize,
        height: usize,
        stride: usize,
    ) -> Result<Self> {
        for plane in &planes {
            check_plane(plane.len(), width, height, stride)?;
        }
        Ok(Self {
            planes,
            width,
            height,
            stride,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn row_mut(&mut self, c: usize, y: usize) -> &mut [f32] {
        let start = y * self.stride;
        &mut self.planes[c][start..start + self.width]
    }
}

/// Owned planar RGB image, mostly for tooling and tests.
#[derive(Clone, Debug, PartialEq)]
pub struct RgbImage {
    width: usize,
    height: usize,
    stride: usize,
    planes: [Vec<f32>; CHANNELS],
}

impl RgbImage {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            stride: width,
            planes: std::array::from_fn(|_| vec![0.0; width * height]),
        }
    }

    /// Image whose rows are `stride` samples apart; padding samples stay zero.
    pub fn with_stride(width: usize, height: usize, stride: usize) -> Result<Self> {
        check_plane(stride * height, width, height, stride)?;
        Ok(Self {
            width,
            height,
            stride,
            planes: std::array::from_fn(|_| vec![0.0; stride * height]),
        })
    }

    pub fn filled(width: usize, height: usize, rgb: [f32; CHANNELS]) -> Self {
        Self::from_fn(width, height, |c, _, _| rgb[c])
    }

    pub fn from_fn(width: usize, height: usize, f: impl Fn(usize, usize, usize) -> f32) -> Self {
        let mut image = Self::new(width, height);
        for c in 0..CHANNELS {
            for y in 0..height {
                for x in 0..width {
                    image.planes[c][y * width + x] = f(c, x, y);
                }
            }
        }
        image
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn get(&self, c: usize, x: usize, y: usize) -> f32 {
        self.planes[c][y * self.stride + x]
    }

    pub fn set(&mut self, c: usize, x: usize, y: usize, value: f32) {
        self.planes[c][y * self.stride + x] = value;
    }

    pub fn as_frame(&self) -> PlanarFrame<'_> {
        let [r, g, b] = &self.planes;
        PlanarFrame {
            planes: [r.as_slice(), g.as_slice(), b.as_slice()],
            width: self.width,
            height: self.height,
            stride: self.stride,
        }
    }

    pub fn as_frame_mut(&mut self) -> PlanarFrameMut<'_> {
        let [r, g, b] = &mut self.planes;
        PlanarFrameMut {
            planes: [r.as_mut_slice(), g.as_mut_slice(), b.as_mut_slice()],
            width: self.width,
            height: self.height,
            stride: self.stride,
        }
    }

    /// Largest absolute per-sample difference over the visible area.
    pub fn max_abs_diff(&self, other: &RgbImage) -> f32 {
        assert_eq!(
            (self.width, self.height),
            (other.width, other.height),
            "image dimensions differ"
        );
        let mut max = 0.0f32;
        for c in 0..CHANNELS {
            for y in 0..self.height {
                for x in 0..self.width {
                    max = max.max((self.get(c, x, y) - other.get(c, x, y)).abs());
                }
            }
        }
        max
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElemType {
    F32,
    F16,
}

impl ElemType {
    pub const fn size(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 => 2,
        }
    }
}

/// Shape of a device tensor. Channels are stored as contiguous planes of
/// `cstep()` elements; `elempack` is always 1 for the planar layouts used here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TensorShape {
    pub w: usize,
    pub h: usize,
    pub c: usize,
    pub elem: ElemType,
    pub elempack: usize,
}

impl TensorShape {
    pub fn new(w: usize, h: usize, c: usize, elem: ElemType) -> Self {
        Self {
            w,
            h,
            c,
            elem,
            elempack: 1,
        }
    }

    pub fn planar_rgb(w: usize, h: usize, elem: ElemType) -> Self {
        Self::new(w, h, CHANNELS, elem)
    }

    pub fn cstep(&self) -> usize {
        self.w * self.h
    }

    pub fn len(&self) -> usize {
        self.cstep() * self.c * self.elempack
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn elemsize(&self) -> usize {
        self.elem.size() * self.elempack
    }

    pub fn byte_size(&self) -> usize {
        self.cstep() * self.c * self.elemsize()
    }

    pub fn scaled(&self, scale: usize) -> Self {
        Self {
            w: self.w * scale,
            h: self.h * scale,
            ..*self
        }
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{} {:?}", self.w, self.h, self.c, self.elem)
    }
}

/// Backing store of a device tensor.
pub enum Storage {
    F32(Vec<f32>),
    F16(Vec<f16>),
}

impl Storage {
    pub fn zeroed(elem: ElemType, len: usize) -> Self {
        match elem {
            ElemType::F32 => Self::F32(vec![0.0; len]),
            ElemType::F16 => Self::F16(vec![f16::ZERO; len]),
        }
    }

    pub fn elem(&self) -> ElemType {
        match self {
            Self::F32(_) => ElemType::F32,
            Self::F16(_) => ElemType::F16,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::F32(data) => data.len(),
            Self::F16(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn get(&self, index: usize) -> f32 {
        match self {
            Self::F32(data) => data[index],
            Self::F16(data) => data[index].to_f32(),
        }
    }

    #[inline]
    pub fn set(&mut self, index: usize, value: f32) {
        match self {
            Self::F32(data) => data[index] = value,
            Self::F16(data) => data[index] = f16::from_f32(value),
        }
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self {
            Self::F32(data) => data.clone(),
            Self::F16(data) => {
                let mut out = vec![0.0f32; data.len()];
                data.convert_to_f32_slice(&mut out);
                out
            }
        }
    }

    /// Overwrites the whole store; `src` must have exactly `len()` samples.
    pub fn copy_from_f32(&mut self, src: &[f32]) -> Result<()> {
        if src.len() != self.len() {
            bail!(
                "storage length mismatch: expected {}, got {}",
                self.len(),
                src.len()
            );
        }
        match self {
            Self::F32(data) => data.copy_from_slice(src),
            Self::F16(data) => data.convert_from_f32_slice(src),
        }
        Ok(())
    }

    pub fn copy_from(&mut self, other: &Storage) -> Result<()> {
        match (self, other) {
            (Self::F32(dst), Self::F32(src)) if dst.len() == src.len() => {
                dst.copy_from_slice(src);
                Ok(())
            }
            (Self::F16(dst), Self::F16(src)) if dst.len() == src.len() => {
                dst.copy_from_slice(src);
                Ok(())
            }
            (dst, src) => {
                let converted = src.to_f32_vec();
                dst.copy_from_f32(&converted)
            }
        }
    }
}

struct TensorInner {
    storage: RwLock<Storage>,
    _allocation: Allocation,
}

/// Handle to a device-resident tensor. Cloning shares the buffer.
#[derive(Clone)]
pub struct DeviceTensor {
    shape: TensorShape,
    inner: Arc<TensorInner>,
}

impl DeviceTensor {
    pub(crate) fn new(shape: TensorShape, allocation: Allocation) -> Self {
        Self {
            shape,
            inner: Arc::new(TensorInner {
                storage: RwLock::new(Storage::zeroed(shape.elem, shape.len())),
                _allocation: allocation,
            }),
        }
    }

    pub fn shape(&self) -> TensorShape {
        self.shape
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Storage> {
        self.inner
            .storage
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Storage> {
        self.inner
            .storage
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for DeviceTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTensor")
            .field("shape", &self.shape)
            .finish_non_exhaustive()
    }
}

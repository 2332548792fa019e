//! Pre/post-processing kernel selection.
//!
//! Each network family ships eight kernel builds per operation, keyed by
//! `(tta, fp16, int8)`. The table below is the single place that maps a key
//! to the build that runs.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::device::GpuDevice;
use crate::kernels::orientation::Orientation;
use crate::tensor::ElemType;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KernelFamily {
    RealEsrgan,
    Waifu2x,
}

impl KernelFamily {
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::RealEsrgan => "realesrgan",
            Self::Waifu2x => "waifu2x",
        }
    }

    pub const fn local_size(self) -> [u32; 3] {
        match self {
            Self::RealEsrgan => [32, 32, 3],
            Self::Waifu2x => [8, 8, 3],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KernelOp {
    Preprocess,
    Postprocess,
}

impl KernelOp {
    pub const fn stem(self) -> &'static str {
        match self {
            Self::Preprocess => "preproc",
            Self::Postprocess => "postproc",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub tta: bool,
    pub fp16: bool,
    pub int8: bool,
}

impl KernelKey {
    const fn index(self) -> usize {
        (self.tta as usize) << 2 | (self.fp16 as usize) << 1 | self.int8 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelVariant {
    pub key: KernelKey,
    pub suffix: &'static str,
    pub storage: ElemType,
    pub variants: usize,
}

const fn variant(
    tta: bool,
    fp16: bool,
    int8: bool,
    suffix: &'static str,
    storage: ElemType,
) -> KernelVariant {
    KernelVariant {
        key: KernelKey { tta, fp16, int8 },
        suffix,
        storage,
        variants: if tta { Orientation::COUNT } else { 1 },
    }
}

// int8 storage needs fp16 arithmetic; without it the fp32 build runs.
const KERNEL_TABLE: [KernelVariant; 8] = [
    variant(false, false, false, "", ElemType::F32),
    variant(false, false, true, "", ElemType::F32),
    variant(false, true, false, "_fp16s", ElemType::F16),
    variant(false, true, true, "_int8s", ElemType::F16),
    variant(true, false, false, "_tta", ElemType::F32),
    variant(true, false, true, "_tta", ElemType::F32),
    variant(true, true, false, "_tta_fp16s", ElemType::F16),
    variant(true, true, true, "_tta_int8s", ElemType::F16),
];

pub fn lookup(key: KernelKey) -> &'static KernelVariant {
    &KERNEL_TABLE[key.index()]
}

/// A compiled pre- or post-processing kernel bound to one device.
#[derive(Debug, Clone)]
pub struct Pipeline {
    family: KernelFamily,
    op: KernelOp,
    variant: &'static KernelVariant,
}

impl Pipeline {
    pub fn create(device: &GpuDevice, family: KernelFamily, op: KernelOp, key: KernelKey) -> Self {
        let pipeline = Self {
            family,
            op,
            variant: lookup(key),
        };
        debug!(
            device = device.index(),
            kernel = %pipeline.name(),
            local_size = ?family.local_size(),
            "Created pipeline"
        );
        pipeline
    }

    pub fn name(&self) -> String {
        format!("{}_{}{}", self.family.prefix(), self.op.stem(), self.variant.suffix)
    }

    pub fn storage(&self) -> ElemType {
        self.variant.storage
    }

    pub fn tta(&self) -> bool {
        self.variant.key.tta
    }

    /// Orientations this kernel produces or consumes, in canonical order.
    pub fn orientations(&self) -> &'static [Orientation] {
        if self.tta() {
            &Orientation::ALL
        } else {
            &Orientation::ALL[..1]
        }
    }

    /// Workgroup counts for a `w x h x c` dispatch.
    pub fn dispatch_groups(&self, w: usize, h: usize, c: usize) -> [u32; 3] {
        let local = self.family.local_size();
        [
            (w as u32).div_ceil(local[0]),
            (h as u32).div_ceil(local[1]),
            (c as u32).div_ceil(local[2]),
        ]
    }
}

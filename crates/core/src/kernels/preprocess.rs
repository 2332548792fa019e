use anyhow::{bail, Result};

use crate::command::CommandBuffer;
use crate::device::BlobAllocator;
use crate::kernels::orientation::Orientation;
use crate::pipeline::Pipeline;
use crate::tensor::{DeviceTensor, TensorShape};
use crate::tile::TileDescriptor;

/// Allocates the oriented input tensors of `tile` and records the kernel
/// that fills them from `band`, whose first row is frame row `band_y0`.
pub fn record_preprocess(
    cmd: &mut CommandBuffer,
    pipeline: &Pipeline,
    allocator: &BlobAllocator,
    band: &DeviceTensor,
    band_y0: usize,
    tile: &TileDescriptor,
) -> Result<Vec<(Orientation, DeviceTensor)>> {
    let (tw, th) = tile.tensor_extent();
    let mut outputs = Vec::with_capacity(pipeline.orientations().len());
    for &orientation in pipeline.orientations() {
        let (w, h) = orientation.dims(tw, th);
        let tensor = allocator.alloc(TensorShape::planar_rgb(w, h, pipeline.storage()))?;
        outputs.push((orientation, tensor));
    }

    let band = band.clone();
    let tile = *tile;
    let targets = outputs.clone();
    cmd.record("preprocess", move || {
        preprocess_tile(&band, band_y0, &tile, &targets)
    });
    Ok(outputs)
}

/// Writes the context window of `tile` into every oriented tensor.
///
/// Tensor samples beyond the context window (alignment surplus at frame
/// edges) repeat the nearest edge sample.
pub fn preprocess_tile(
    band: &DeviceTensor,
    band_y0: usize,
    tile: &TileDescriptor,
    outputs: &[(Orientation, DeviceTensor)],
) -> Result<()> {
    let bshape = band.shape();
    let padded = tile.input_padded_rect;
    if padded.y < band_y0
        || padded.bottom() > band_y0 + bshape.h
        || padded.right() > bshape.w
        || padded.is_empty()
    {
        bail!(
            "tile {:?} context {:?} outside band at row {band_y0} ({}x{})",
            tile.index(),
            padded,
            bshape.w,
            bshape.h
        );
    }

    let (tw, th) = tile.tensor_extent();
    let src = band.read();
    for (orientation, dst) in outputs {
        let shape = dst.shape();
        if (shape.w, shape.h) != orientation.dims(tw, th) || shape.c != bshape.c {
            bail!(
                "{orientation:?} tensor is {shape}, tile {:?} needs {tw}x{th}",
                tile.index()
            );
        }

        let source_index: Vec<usize> = (0..shape.h)
            .flat_map(|dy| (0..shape.w).map(move |dx| (dx, dy)))
            .map(|(dx, dy)| {
                let (tx, ty) = orientation.inverse(dx, dy, tw, th);
                let sx = padded.x + tx.min(padded.w - 1);
                let sy = padded.y + ty.min(padded.h - 1) - band_y0;
                sy * bshape.w + sx
            })
            .collect();

        let mut out = dst.write();
        for c in 0..shape.c {
            let src_plane = c * bshape.cstep();
            let dst_plane = c * shape.cstep();
            for (i, &s) in source_index.iter().enumerate() {
                out.set(dst_plane + i, src.get(src_plane + s));
            }
        }
    }
    Ok(())
}

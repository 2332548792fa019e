use anyhow::{bail, Result};

use crate::command::CommandBuffer;
use crate::kernels::orientation::Orientation;
use crate::pipeline::Pipeline;
use crate::tensor::DeviceTensor;
use crate::tile::TileDescriptor;

/// Records the kernel that blends the inferred `variants` of `tile` into
/// `row`, whose first row is output row `row_y0`.
pub fn record_postprocess(
    cmd: &mut CommandBuffer,
    pipeline: &Pipeline,
    variants: Vec<(Orientation, DeviceTensor)>,
    tile: &TileDescriptor,
    scale: usize,
    row: &DeviceTensor,
    row_y0: usize,
) -> Result<()> {
    if variants.len() != pipeline.orientations().len() {
        bail!(
            "{} expects {} variants, got {}",
            pipeline.name(),
            pipeline.orientations().len(),
            variants.len()
        );
    }
    let tile = *tile;
    let row = row.clone();
    cmd.record("postprocess", move || {
        postprocess_tile(&variants, &tile, scale, &row, row_y0)
    });
    Ok(())
}

/// Averages the variants in canonical orientation order and writes the
/// nominal output region of `tile`. Padding margins are discarded.
pub fn postprocess_tile(
    variants: &[(Orientation, DeviceTensor)],
    tile: &TileDescriptor,
    scale: usize,
    row: &DeviceTensor,
    row_y0: usize,
) -> Result<()> {
    if variants.is_empty() {
        bail!("no inferred variants for tile {:?}", tile.index());
    }
    let mut ordered: Vec<&(Orientation, DeviceTensor)> = variants.iter().collect();
    ordered.sort_by_key(|(orientation, _)| orientation.index());
    if ordered.windows(2).any(|pair| pair[0].0 == pair[1].0) {
        bail!("duplicate orientation for tile {:?}", tile.index());
    }

    let (tw, th) = tile.tensor_extent();
    let (sw, sh) = (tw * scale, th * scale);
    for (orientation, tensor) in &ordered {
        let shape = tensor.shape();
        if (shape.w, shape.h) != orientation.dims(sw, sh) {
            bail!(
                "{orientation:?} output is {shape}, tile {:?} expects {sw}x{sh}",
                tile.index()
            );
        }
    }

    let out = tile.output_rect;
    let rshape = row.shape();
    if out.y < row_y0 || out.bottom() > row_y0 + rshape.h || out.right() > rshape.w {
        bail!(
            "tile {:?} output {:?} outside row buffer at {row_y0} ({}x{})",
            tile.index(),
            out,
            rshape.w,
            rshape.h
        );
    }

    let (lead_x, lead_y) = tile.leading_padding();
    let (off_x, off_y) = (lead_x * scale, lead_y * scale);
    let n = ordered.len() as f32;
    let sources: Vec<_> = ordered
        .iter()
        .map(|(orientation, tensor)| (*orientation, tensor.shape(), tensor.read()))
        .collect();

    let mut dst = row.write();
    for c in 0..rshape.c {
        for oy in 0..out.h {
            let dst_row = c * rshape.cstep() + (out.y + oy - row_y0) * rshape.w + out.x;
            for ox in 0..out.w {
                let (cx, cy) = (off_x + ox, off_y + oy);
                let mut sum = 0.0f32;
                for (orientation, shape, data) in &sources {
                    let (vx, vy) = orientation.forward(cx, cy, sw, sh);
                    sum += data.get(c * shape.cstep() + vy * shape.w + vx);
                }
                dst.set(dst_row + ox, sum / n);
            }
        }
    }
    Ok(())
}

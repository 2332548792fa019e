//! Tile planning.
//!
//! A frame is cut into a row-major grid of nominal tiles of `tile_w x tile_h`
//! (edge tiles are smaller). Every tile reads a context window of
//! `prepadding` pixels around its nominal rectangle, clamped to the frame, and
//! writes exactly its nominal rectangle multiplied by the model scale. Output
//! rectangles never overlap and together cover the whole output frame.

use anyhow::{bail, Result};

use crate::error::UpscaleError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: usize,
    pub y: usize,
    pub w: usize,
    pub h: usize,
}

impl Rect {
    pub const fn new(x: usize, y: usize, w: usize, h: usize) -> Self {
        Self { x, y, w, h }
    }

    pub const fn right(&self) -> usize {
        self.x + self.w
    }

    pub const fn bottom(&self) -> usize {
        self.y + self.h
    }

    pub const fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    pub const fn scaled(&self, scale: usize) -> Self {
        Self::new(self.x * scale, self.y * scale, self.w * scale, self.h * scale)
    }

    pub const fn contains(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }
}

/// Where a tile's context window extends beyond its nominal rectangle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PaddingPolicy {
    /// `prepadding` on every side.
    Symmetric,
    /// `prepadding` on every side, plus enough extra on the right and bottom
    /// to round the nominal extent up to `align`. The extra never moves the
    /// leading edge, so tiles keep their nominal output coordinates.
    AlignTrailing { align: usize },
}

impl PaddingPolicy {
    /// Policy for the variable-scale network family.
    pub fn for_variable_scale(scale: usize) -> Self {
        match scale {
            1 => Self::AlignTrailing { align: 4 },
            2 => Self::AlignTrailing { align: 2 },
            _ => Self::Symmetric,
        }
    }

    pub fn alignment(&self) -> usize {
        match self {
            Self::Symmetric => 1,
            Self::AlignTrailing { align } => (*align).max(1),
        }
    }

    fn trailing_extra(&self, nominal: usize) -> usize {
        round_up(nominal, self.alignment()) - nominal
    }
}

pub(crate) fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileGeometry {
    pub tile_w: usize,
    pub tile_h: usize,
    pub prepadding: usize,
    pub policy: PaddingPolicy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileDescriptor {
    pub row: usize,
    pub col: usize,
    /// Nominal input region.
    pub input_rect: Rect,
    /// Context window actually read, clamped to the frame.
    pub input_padded_rect: Rect,
    /// Region of the output frame this tile writes.
    pub output_rect: Rect,
    /// Extent of the network input tensor. Equals the padded rect, except
    /// for alignment surplus at frame edges which is filled by edge clamping.
    pub tensor_w: usize,
    pub tensor_h: usize,
}

impl TileDescriptor {
    pub fn index(&self) -> (usize, usize) {
        (self.row, self.col)
    }

    /// Offset of the nominal rectangle inside the context window.
    pub fn leading_padding(&self) -> (usize, usize) {
        (
            self.input_rect.x - self.input_padded_rect.x,
            self.input_rect.y - self.input_padded_rect.y,
        )
    }

    pub fn tensor_extent(&self) -> (usize, usize) {
        (self.tensor_w, self.tensor_h)
    }
}

struct AxisSpan {
    start: usize,
    end: usize,
    padded_start: usize,
    padded_end: usize,
    tensor: usize,
}

fn plan_axis(
    extent: usize,
    tile: usize,
    index: usize,
    prepadding: usize,
    policy: PaddingPolicy,
) -> AxisSpan {
    let start = index * tile;
    let end = (start + tile).min(extent);
    let nominal = end - start;
    let lead = prepadding.min(start);
    let trail = (prepadding + policy.trailing_extra(nominal)).min(extent - end);
    let padded = lead + nominal + trail;
    AxisSpan {
        start,
        end,
        padded_start: start - lead,
        padded_end: end + trail,
        tensor: round_up(padded, policy.alignment()),
    }
}

/// Row-major tile grid for one frame.
#[derive(Clone, Debug)]
pub struct TilePlan {
    width: usize,
    height: usize,
    scale: usize,
    columns: usize,
    rows: usize,
    tiles: Vec<TileDescriptor>,
}

impl TilePlan {
    pub fn new(width: usize, height: usize, scale: usize, geometry: TileGeometry) -> Result<Self> {
        if width == 0 || height == 0 {
            bail!(UpscaleError::FrameShape(format!(
                "cannot tile an empty {width}x{height} frame"
            )));
        }
        if geometry.tile_w == 0 || geometry.tile_h == 0 || scale == 0 {
            bail!(UpscaleError::config(format!(
                "degenerate tile geometry {}x{} at scale {scale}",
                geometry.tile_w, geometry.tile_h
            )));
        }

        let columns = width.div_ceil(geometry.tile_w);
        let rows = height.div_ceil(geometry.tile_h);
        let mut tiles = Vec::with_capacity(columns * rows);
        for row in 0..rows {
            let ys = plan_axis(
                height,
                geometry.tile_h,
                row,
                geometry.prepadding,
                geometry.policy,
            );
            for col in 0..columns {
                let xs = plan_axis(
                    width,
                    geometry.tile_w,
                    col,
                    geometry.prepadding,
                    geometry.policy,
                );
                let input_rect =
                    Rect::new(xs.start, ys.start, xs.end - xs.start, ys.end - ys.start);
                tiles.push(TileDescriptor {
                    row,
                    col,
                    input_rect,
                    input_padded_rect: Rect::new(
                        xs.padded_start,
                        ys.padded_start,
                        xs.padded_end - xs.padded_start,
                        ys.padded_end - ys.padded_start,
                    ),
                    output_rect: input_rect.scaled(scale),
                    tensor_w: xs.tensor,
                    tensor_h: ys.tensor,
                });
            }
        }

        Ok(Self {
            width,
            height,
            scale,
            columns,
            rows,
            tiles,
        })
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn scale(&self) -> usize {
        self.scale
    }

    pub fn tiles(&self) -> &[TileDescriptor] {
        &self.tiles
    }

    pub fn row(&self, row: usize) -> &[TileDescriptor] {
        &self.tiles[row * self.columns..(row + 1) * self.columns]
    }

    pub fn output_size(&self) -> (usize, usize) {
        (self.width * self.scale, self.height * self.scale)
    }

    /// Full-width input band read by tile row `row`.
    pub fn band(&self, row: usize) -> Rect {
        let padded = self.row(row)[0].input_padded_rect;
        Rect::new(0, padded.y, self.width, padded.h)
    }

    /// Full-width output band written by tile row `row`.
    pub fn output_band(&self, row: usize) -> Rect {
        let out = self.row(row)[0].output_rect;
        Rect::new(0, out.y, self.width * self.scale, out.h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(tile: usize, prepadding: usize, policy: PaddingPolicy) -> TileGeometry {
        TileGeometry {
            tile_w: tile,
            tile_h: tile,
            prepadding,
            policy,
        }
    }

    #[test]
    fn test_grid_dimensions_round_up() {
        let plan = TilePlan::new(100, 50, 4, geometry(32, 10, PaddingPolicy::Symmetric)).unwrap();
        assert_eq!(plan.columns(), 4);
        assert_eq!(plan.rows(), 2);
        assert_eq!(plan.tiles().len(), 8);
        assert_eq!(plan.output_size(), (400, 200));
    }

    #[test]
    fn test_output_rects_cover_frame_exactly_once() {
        for &(w, h, tile, scale) in &[
            (64, 64, 32, 2),
            (100, 37, 32, 4),
            (33, 97, 32, 1),
            (5, 5, 200, 4),
            (257, 129, 64, 2),
        ] {
            for policy in [
                PaddingPolicy::Symmetric,
                PaddingPolicy::for_variable_scale(scale),
            ] {
                let plan = TilePlan::new(w, h, scale, geometry(tile, 7, policy)).unwrap();
                let (ow, oh) = plan.output_size();
                let mut hits = vec![0u8; ow * oh];
                for tile in plan.tiles() {
                    let r = tile.output_rect;
                    for y in r.y..r.bottom() {
                        for x in r.x..r.right() {
                            hits[y * ow + x] += 1;
                        }
                    }
                }
                assert!(
                    hits.iter().all(|&n| n == 1),
                    "{w}x{h} tile {tile} scale {scale} {policy:?}"
                );
            }
        }
    }

    #[test]
    fn test_padded_rect_contains_input_and_stays_in_frame() {
        let frame = Rect::new(0, 0, 150, 90);
        let policy = PaddingPolicy::for_variable_scale(2);
        let plan = TilePlan::new(150, 90, 2, geometry(64, 18, policy)).unwrap();
        for tile in plan.tiles() {
            assert!(tile.input_padded_rect.contains(&tile.input_rect));
            assert!(frame.contains(&tile.input_padded_rect));
        }
    }

    #[test]
    fn test_single_tile_when_frame_smaller_than_tile() {
        let plan = TilePlan::new(20, 12, 4, geometry(200, 10, PaddingPolicy::Symmetric)).unwrap();
        assert_eq!(plan.tiles().len(), 1);
        let tile = plan.tiles()[0];
        assert_eq!(tile.input_rect, Rect::new(0, 0, 20, 12));
        assert_eq!(tile.input_padded_rect, tile.input_rect);
        assert_eq!(tile.tensor_extent(), (20, 12));
    }

    #[test]
    fn test_interior_tile_gets_full_context() {
        let plan = TilePlan::new(300, 300, 4, geometry(100, 10, PaddingPolicy::Symmetric)).unwrap();
        let center = plan.row(1)[1];
        assert_eq!(center.input_rect, Rect::new(100, 100, 100, 100));
        assert_eq!(center.input_padded_rect, Rect::new(90, 90, 120, 120));
        assert_eq!(center.leading_padding(), (10, 10));
        assert_eq!(center.output_rect, Rect::new(400, 400, 400, 400));
    }

    #[test]
    fn test_trailing_alignment_keeps_nominal_origin() {
        // A 6 wide nominal tile needs 2 extra samples to reach a multiple of 4,
        // added on the right only.
        let policy = PaddingPolicy::AlignTrailing { align: 4 };
        let plan = TilePlan::new(30, 30, 1, geometry(6, 3, policy)).unwrap();
        let first = plan.row(0)[0];
        assert_eq!(first.input_rect.x, 0);
        assert_eq!(first.input_padded_rect.x, 0);
        assert_eq!(first.input_padded_rect.right(), 6 + 3 + 2);
        let second = plan.row(0)[1];
        assert_eq!(second.input_rect.x, 6);
        assert_eq!(second.input_padded_rect.x, 3);
        assert_eq!(second.leading_padding(), (3, 0));
        let below = plan.row(1)[1];
        assert_eq!(below.input_rect.y, 6);
        assert_eq!(below.input_padded_rect.y, 3);
        assert_eq!(below.leading_padding(), (3, 3));
    }

    #[test]
    fn test_tensor_extent_is_aligned() {
        for &(w, align, pad) in &[(101, 4, 28), (77, 2, 7), (93, 2, 18), (13, 4, 28)] {
            let policy = PaddingPolicy::AlignTrailing { align };
            let plan = TilePlan::new(w, w, align, geometry(32, pad, policy)).unwrap();
            for tile in plan.tiles() {
                assert_eq!(tile.tensor_w % align, 0, "{tile:?}");
                assert_eq!(tile.tensor_h % align, 0, "{tile:?}");
                assert!(tile.tensor_w >= tile.input_padded_rect.w);
                assert!(tile.tensor_w - tile.input_padded_rect.w < align);
            }
        }
    }

    #[test]
    fn test_bands_span_full_width() {
        let plan = TilePlan::new(90, 70, 2, geometry(32, 7, PaddingPolicy::Symmetric)).unwrap();
        assert_eq!(plan.band(0), Rect::new(0, 0, 90, 39));
        assert_eq!(plan.band(1), Rect::new(0, 25, 90, 45));
        assert_eq!(plan.band(2), Rect::new(0, 57, 90, 13));
        assert_eq!(plan.output_band(2), Rect::new(0, 128, 180, 12));
    }

    #[test]
    fn test_rejects_empty_frame() {
        assert!(TilePlan::new(0, 10, 2, geometry(32, 7, PaddingPolicy::Symmetric)).is_err());
    }
}

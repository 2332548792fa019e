//! Drives one frame through the tile pipeline, one tile row at a time.
//!
//! Per row: stage the row's input band on the host in network range, upload
//! it, then for each tile preprocess, infer every orientation and blend into
//! a row-sized output buffer, and finally download that buffer into the
//! destination frame. With more than one tile column the device is drained
//! after the upload and after every tile so only one tile's intermediates
//! are alive at a time.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tracing::{debug, trace};

use crate::command::CommandBuffer;
use crate::device::{BlobAllocator, GpuDevice};
use crate::error::UpscaleError;
use crate::inference::Inference;
use crate::kernels::{record_postprocess, record_preprocess};
use crate::pipeline::Pipeline;
use crate::tensor::{
    DeviceTensor, ElemType, PlanarFrame, PlanarFrameMut, TensorShape, CHANNELS, NETWORK_RANGE,
};
use crate::tile::{Rect, TileGeometry, TilePlan};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    pub rows: usize,
    pub tiles: usize,
    pub inferences: usize,
    /// Device synchronizations, including the final one of every row.
    pub submissions: usize,
}

pub struct TileOrchestrator<'a> {
    device: &'a GpuDevice,
    preprocess: &'a Pipeline,
    postprocess: &'a Pipeline,
    operator: &'a Arc<dyn Inference>,
    geometry: TileGeometry,
}

impl<'a> TileOrchestrator<'a> {
    pub fn new(
        device: &'a GpuDevice,
        preprocess: &'a Pipeline,
        postprocess: &'a Pipeline,
        operator: &'a Arc<dyn Inference>,
        geometry: TileGeometry,
    ) -> Self {
        Self {
            device,
            preprocess,
            postprocess,
            operator,
            geometry,
        }
    }

    /// Upscales `src` into `dst`, which must be exactly `scale` times larger.
    ///
    /// Any failure after planning is reported as [`UpscaleError::Inference`]
    /// for the failing row. Rows before it have already been written.
    pub fn run(&self, src: &PlanarFrame<'_>, dst: &mut PlanarFrameMut<'_>) -> Result<RunStats> {
        let scale = self.operator.scale();
        let plan = TilePlan::new(src.width(), src.height(), scale, self.geometry)?;
        let (out_w, out_h) = plan.output_size();
        if (dst.width(), dst.height()) != (out_w, out_h) {
            bail!(UpscaleError::FrameShape(format!(
                "destination is {}x{}, {}x{} at scale {scale} needs {out_w}x{out_h}",
                dst.width(),
                dst.height(),
                src.width(),
                src.height()
            )));
        }

        let started = Instant::now();
        let blob = self.device.acquire_blob_allocator();
        let staging = self.device.acquire_staging_allocator();
        debug!(
            width = src.width(),
            height = src.height(),
            scale,
            columns = plan.columns(),
            rows = plan.rows(),
            preprocess = %self.preprocess.name(),
            postprocess = %self.postprocess.name(),
            "Processing frame"
        );

        let mut stats = RunStats::default();
        for row in 0..plan.rows() {
            self.run_row(&plan, row, src, dst, &blob, &staging, &mut stats)
                .context(UpscaleError::Inference { row })?;
            stats.rows += 1;
        }

        debug!(
            tiles = stats.tiles,
            submissions = stats.submissions,
            elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
            "Frame done"
        );
        Ok(stats)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_row(
        &self,
        plan: &TilePlan,
        row: usize,
        src: &PlanarFrame<'_>,
        dst: &mut PlanarFrameMut<'_>,
        blob: &BlobAllocator,
        staging: &BlobAllocator,
        stats: &mut RunStats,
    ) -> Result<()> {
        let scale = plan.scale();
        let band_rect = plan.band(row);
        let out_band = plan.output_band(row);
        let drain_per_tile = plan.columns() > 1;

        let host_band = stage_band(staging, src, band_rect)?;
        let mut cmd = CommandBuffer::new(self.device);
        let band = cmd.record_clone(&host_band, blob)?;
        if drain_per_tile {
            cmd.submit_and_wait()?;
        }

        let row_out = blob.alloc(TensorShape::planar_rgb(out_band.w, out_band.h, ElemType::F32))?;
        for tile in plan.row(row) {
            trace!(
                row = tile.row,
                col = tile.col,
                padded = ?tile.input_padded_rect,
                tensor_w = tile.tensor_w,
                tensor_h = tile.tensor_h,
                "Recording tile"
            );
            let inputs =
                record_preprocess(&mut cmd, self.preprocess, blob, &band, band_rect.y, tile)?;
            let mut outputs = Vec::with_capacity(inputs.len());
            for (orientation, input) in inputs {
                let output = blob.alloc(input.shape().scaled(scale))?;
                let operator = Arc::clone(self.operator);
                let target = output.clone();
                cmd.record("inference", move || operator.infer(&input, &target));
                outputs.push((orientation, output));
                stats.inferences += 1;
            }
            record_postprocess(
                &mut cmd,
                self.postprocess,
                outputs,
                tile,
                scale,
                &row_out,
                out_band.y,
            )?;
            stats.tiles += 1;
            if drain_per_tile {
                cmd.submit_and_wait()?;
            }
        }

        cmd.submit_and_wait()?;
        stats.submissions += cmd.submissions();
        download_row(&row_out, dst, out_band.y);
        Ok(())
    }
}

/// Copies the band rows of `src` into a staging tensor, scaled to network range.
fn stage_band(staging: &BlobAllocator, src: &PlanarFrame<'_>, band: Rect) -> Result<DeviceTensor> {
    let tensor = staging.alloc(TensorShape::planar_rgb(band.w, band.h, ElemType::F32))?;
    {
        let mut data = tensor.write();
        let cstep = band.w * band.h;
        for c in 0..CHANNELS {
            for y in 0..band.h {
                let line = src.row(c, band.y + y);
                let base = c * cstep + y * band.w;
                for (x, &v) in line[band.x..band.right()].iter().enumerate() {
                    data.set(base + x, v * NETWORK_RANGE);
                }
            }
        }
    }
    Ok(tensor)
}

/// Writes the row buffer back to frame range. NaN maps to 0.
fn download_row(row: &DeviceTensor, dst: &mut PlanarFrameMut<'_>, y0: usize) {
    let shape = row.shape();
    let data = row.read();
    for c in 0..CHANNELS {
        for y in 0..shape.h {
            let line = dst.row_mut(c, y0 + y);
            let base = c * shape.cstep() + y * shape.w;
            for (x, out) in line.iter_mut().enumerate().take(shape.w) {
                *out = (data.get(base + x) / NETWORK_RANGE).max(0.0).min(1.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceInfo, GpuInstance};
    use crate::error::classify;
    use crate::inference::{BoxBlurUpscale, NearestUpscale};
    use crate::pipeline::{KernelFamily, KernelKey, KernelOp};
    use crate::tensor::RgbImage;
    use crate::tile::PaddingPolicy;

    struct Fixture {
        _lease: crate::device::InstanceLease,
        device: Arc<GpuDevice>,
        pre: Pipeline,
        post: Pipeline,
    }

    fn fixture(key: KernelKey) -> Fixture {
        let instance = GpuInstance::new(vec![DeviceInfo::default()]);
        let lease = instance.acquire().unwrap();
        let device = lease.device(0).unwrap();
        let pre = Pipeline::create(&device, KernelFamily::RealEsrgan, KernelOp::Preprocess, key);
        let post = Pipeline::create(&device, KernelFamily::RealEsrgan, KernelOp::Postprocess, key);
        Fixture {
            _lease: lease,
            device,
            pre,
            post,
        }
    }

    fn geometry(tile: usize, prepadding: usize) -> TileGeometry {
        TileGeometry {
            tile_w: tile,
            tile_h: tile,
            prepadding,
            policy: PaddingPolicy::Symmetric,
        }
    }

    fn gradient(w: usize, h: usize) -> RgbImage {
        RgbImage::from_fn(w, h, |c, x, y| {
            ((x * 7 + y * 13 + c * 29) % 97) as f32 / 96.0
        })
    }

    fn run(
        f: &Fixture,
        op: Arc<dyn Inference>,
        g: TileGeometry,
        src: &RgbImage,
    ) -> (RgbImage, RunStats) {
        let s = op.scale();
        let mut out = RgbImage::new(src.width() * s, src.height() * s);
        let orchestrator = TileOrchestrator::new(&f.device, &f.pre, &f.post, &op, g);
        let stats = orchestrator
            .run(&src.as_frame(), &mut out.as_frame_mut())
            .unwrap();
        (out, stats)
    }

    #[test]
    fn test_nearest_matches_pixel_replication() {
        let f = fixture(KernelKey::default());
        let src = gradient(37, 21);
        let op: Arc<dyn Inference> = Arc::new(NearestUpscale::new(2));
        let (out, _) = run(&f, op, geometry(16, 3), &src);
        for c in 0..3 {
            for y in 0..42 {
                for x in 0..74 {
                    let expected = src.get(c, x / 2, y / 2);
                    assert!((out.get(c, x, y) - expected).abs() < 1e-6);
                }
            }
        }
    }

    #[test]
    fn test_tiling_is_seamless_with_enough_context() {
        let f = fixture(KernelKey::default());
        let src = gradient(70, 45);
        let op: Arc<dyn Inference> = Arc::new(BoxBlurUpscale::new(2, 2));
        let (tiled, stats) = run(&f, Arc::clone(&op), geometry(16, 4), &src);
        let (whole, whole_stats) = run(&f, op, geometry(128, 4), &src);
        assert_eq!(stats.tiles, 5 * 3);
        assert_eq!(whole_stats.tiles, 1);
        assert!(tiled.max_abs_diff(&whole) < 1e-5);
    }

    #[test]
    fn test_synchronization_policy() {
        let f = fixture(KernelKey::default());
        let op: Arc<dyn Inference> = Arc::new(NearestUpscale::new(2));

        // Single column: one submit per row.
        let (_, stats) = run(&f, Arc::clone(&op), geometry(32, 2), &gradient(20, 70));
        assert_eq!((stats.rows, stats.submissions), (3, 3));

        // Three columns: upload + one per tile + final, per row.
        let (_, stats) = run(&f, op, geometry(32, 2), &gradient(70, 40));
        assert_eq!(stats.rows, 2);
        assert_eq!(stats.submissions, 2 * (1 + 3 + 1));
    }

    #[test]
    fn test_tta_runs_eight_inferences_per_tile() {
        let key = KernelKey {
            tta: true,
            ..KernelKey::default()
        };
        let f = fixture(key);
        let src = gradient(40, 24);
        let op: Arc<dyn Inference> = Arc::new(BoxBlurUpscale::new(2, 1));
        let (tta, stats) = run(&f, Arc::clone(&op), geometry(16, 2), &src);
        assert_eq!(stats.inferences, stats.tiles * 8);

        let plain = fixture(KernelKey::default());
        let (single, _) = run(&plain, op, geometry(16, 2), &src);
        // A symmetric filter commutes with every orientation.
        assert!(tta.max_abs_diff(&single) < 1e-5);
    }

    #[test]
    fn test_output_is_clamped_to_unit_range() {
        struct Overdrive;
        impl Inference for Overdrive {
            fn name(&self) -> &str {
                "overdrive"
            }
            fn scale(&self) -> usize {
                1
            }
            fn infer(&self, input: &DeviceTensor, output: &DeviceTensor) -> Result<()> {
                let src = input.read();
                let mut dst = output.write();
                for i in 0..src.len() {
                    dst.set(i, src.get(i) * 4.0 - 300.0);
                }
                Ok(())
            }
        }
        let f = fixture(KernelKey::default());
        let src = RgbImage::from_fn(8, 8, |_, x, _| if x < 4 { 0.1 } else { 0.9 });
        let (out, _) = run(&f, Arc::new(Overdrive), geometry(32, 0), &src);
        assert_eq!(out.get(0, 0, 0), 0.0);
        assert_eq!(out.get(0, 7, 0), 1.0);
    }

    #[test]
    fn test_failure_reports_row_and_releases_memory() {
        struct FailOnSecondRow;
        impl Inference for FailOnSecondRow {
            fn name(&self) -> &str {
                "fail"
            }
            fn scale(&self) -> usize {
                2
            }
            fn infer(&self, input: &DeviceTensor, _output: &DeviceTensor) -> Result<()> {
                if input.read().get(0) > 100.0 {
                    bail!("simulated device fault");
                }
                Ok(())
            }
        }
        let f = fixture(KernelKey::default());
        // Top rows are dark, bottom rows bright.
        let src = RgbImage::from_fn(40, 40, |_, _, y| if y < 20 { 0.0 } else { 1.0 });
        let mut out = RgbImage::new(80, 80);
        let op: Arc<dyn Inference> = Arc::new(FailOnSecondRow);
        let orchestrator = TileOrchestrator::new(&f.device, &f.pre, &f.post, &op, geometry(20, 0));
        let err = orchestrator
            .run(&src.as_frame(), &mut out.as_frame_mut())
            .unwrap_err();
        assert!(matches!(classify(&err), Some(UpscaleError::Inference { row: 1 })));
        assert!(format!("{err:#}").contains("simulated device fault"));
        assert_eq!(f.device.bytes_in_use(), 0);
        assert_eq!(f.device.blob_pool().idle_count(), 1);
    }

    #[test]
    fn test_rejects_wrong_destination_size() {
        let f = fixture(KernelKey::default());
        let src = gradient(10, 10);
        let mut out = RgbImage::new(19, 20);
        let op: Arc<dyn Inference> = Arc::new(NearestUpscale::new(2));
        let orchestrator = TileOrchestrator::new(&f.device, &f.pre, &f.post, &op, geometry(32, 0));
        let err = orchestrator
            .run(&src.as_frame(), &mut out.as_frame_mut())
            .unwrap_err();
        assert!(matches!(classify(&err), Some(UpscaleError::FrameShape(_))));
    }
}

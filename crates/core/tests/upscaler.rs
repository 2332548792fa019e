use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Result};
use tempfile::{tempdir, TempDir};
use tilescale_core::device::{DeviceInfo, GpuInstance};
use tilescale_core::error::classify;
use tilescale_core::inference::{Inference, LoadRequest, OperatorLoader, ReferenceLoader};
use tilescale_core::tensor::DeviceTensor;
use tilescale_core::upscaler::fixed::{FIXED_SCALE, MODEL_DIR};
use tilescale_core::upscaler::variable::MODEL_ROOT_DIR;
use tilescale_core::upscaler::{Precision, TileSize, VariableModel};
use tilescale_core::{
    FixedScaleOptions, FixedScaleUpscaler, RgbImage, UpscaleError, Upscaler, VariableScaleOptions,
    VariableScaleUpscaler,
};

fn write_model(dir: &Path, name: &str, scale: usize) {
    fs::create_dir_all(dir).expect("create model dir");
    fs::write(dir.join(format!("{name}.param")), format!("scale = {scale}\n")).expect("param");
    fs::write(dir.join(format!("{name}.bin")), b"weights").expect("bin");
}

/// Models root holding the default networks of both facades.
fn models_root() -> TempDir {
    let root = tempdir().expect("tempdir");
    write_model(&root.path().join(MODEL_DIR), "realesrgan-x4plus", 4);
    let anime = root
        .path()
        .join(MODEL_ROOT_DIR)
        .join(VariableModel::UpconvAnime.dir_name());
    write_model(&anime, "noise0_scale2.0x_model", 2);
    write_model(&anime, "scale2.0x_model", 2);
    let cunet = root
        .path()
        .join(MODEL_ROOT_DIR)
        .join(VariableModel::Cunet.dir_name());
    write_model(&cunet, "noise1_model", 1);
    root
}

fn single_device() -> Arc<GpuInstance> {
    GpuInstance::new(vec![DeviceInfo::default()])
}

fn gradient(width: usize, height: usize) -> RgbImage {
    RgbImage::from_fn(width, height, |c, x, y| {
        ((x * 7 + y * 13 + c * 29) % 97) as f32 / 96.0
    })
}

fn variable_options(tile: usize) -> VariableScaleOptions {
    VariableScaleOptions {
        tile_size: TileSize::Fixed(tile),
        precision: Precision::Fp32,
        ..VariableScaleOptions::default()
    }
}

struct FailingLoader;

impl OperatorLoader for FailingLoader {
    fn load(&self, request: &LoadRequest<'_>) -> Result<Arc<dyn Inference>> {
        bail!("cannot load {}", request.model.name)
    }
}

/// Loads an operator that fails from the `fail_from`th inference on.
struct FlakyLoader {
    fail_from: usize,
}

struct FlakyOperator {
    scale: usize,
    calls: AtomicUsize,
    fail_from: usize,
}

impl Inference for FlakyOperator {
    fn name(&self) -> &str {
        "flaky"
    }

    fn scale(&self) -> usize {
        self.scale
    }

    fn infer(&self, _input: &DeviceTensor, _output: &DeviceTensor) -> Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) >= self.fail_from {
            bail!("simulated device fault");
        }
        Ok(())
    }
}

impl OperatorLoader for FlakyLoader {
    fn load(&self, request: &LoadRequest<'_>) -> Result<Arc<dyn Inference>> {
        Ok(Arc::new(FlakyOperator {
            scale: request.scale,
            calls: AtomicUsize::new(0),
            fail_from: self.fail_from,
        }))
    }
}

#[test]
fn test_tile_size_below_minimum_fails_without_retaining_instance() {
    let root = models_root();
    let instance = single_device();
    let options = variable_options(30);

    let loader = ReferenceLoader::default();
    let err = VariableScaleUpscaler::new(&instance, root.path(), &options, &loader)
        .err()
        .expect("tile size 30 must be rejected");
    assert!(matches!(classify(&err), Some(UpscaleError::Config(_))));
    assert!(err.to_string().contains("greater than or equal to 32"));
    assert_eq!(instance.live_leases(), 0);
    assert!(!instance.is_created());
}

#[test]
fn test_unaligned_tile_size_is_rejected() {
    let root = models_root();
    let instance = single_device();
    let options = FixedScaleOptions {
        tile_size: TileSize::Fixed(66),
        ..FixedScaleOptions::default()
    };
    let err = FixedScaleUpscaler::new(&instance, root.path(), &options, &ReferenceLoader::default())
        .err()
        .expect("tile size 66 must be rejected");
    assert!(err.to_string().contains("multiple of 4"));
    assert_eq!(instance.live_leases(), 0);
}

#[test]
fn test_missing_model_reports_path() {
    let root = tempdir().expect("tempdir");
    let instance = single_device();
    let err = FixedScaleUpscaler::new(
        &instance,
        root.path(),
        &FixedScaleOptions::default(),
        &ReferenceLoader::default(),
    )
    .err()
    .expect("missing model must fail");
    match classify(&err) {
        Some(UpscaleError::ModelUnavailable { path }) => {
            assert!(path.ends_with("Real-ESRGAN/realesrgan-x4plus.param"));
        }
        other => panic!("unexpected error {other:?}: {err:#}"),
    }
    assert_eq!(instance.live_leases(), 0);
}

#[test]
fn test_invalid_device_index() {
    let root = models_root();
    let instance = single_device();
    let options = VariableScaleOptions {
        device_index: 3,
        ..variable_options(64)
    };
    let loader = ReferenceLoader::default();
    let err = VariableScaleUpscaler::new(&instance, root.path(), &options, &loader)
        .err()
        .expect("device 3 does not exist");
    assert!(matches!(classify(&err), Some(UpscaleError::DeviceUnavailable(_))));
    assert_eq!(instance.live_leases(), 0);
}

#[test]
fn test_failing_loader_releases_lease() {
    let root = models_root();
    let instance = single_device();
    let result = FixedScaleUpscaler::new(
        &instance,
        root.path(),
        &FixedScaleOptions::default(),
        &FailingLoader,
    );
    assert!(result.is_err());
    assert_eq!(instance.live_leases(), 0);
    assert!(!instance.is_created());
}

#[test]
fn test_uniform_image_stays_uniform() {
    let root = models_root();
    let instance = single_device();
    let loader = ReferenceLoader { radius: 2 };
    let options = variable_options(32);
    let upscaler = VariableScaleUpscaler::new(&instance, root.path(), &options, &loader)
        .expect("build upscaler");

    let input = RgbImage::filled(64, 48, [0.5, 0.25, 1.0]);
    let output = upscaler.upscale(&input).expect("upscale");
    assert_eq!((output.width(), output.height()), (128, 96));
    let expected = RgbImage::filled(128, 96, [0.5, 0.25, 1.0]);
    assert!(output.max_abs_diff(&expected) < 1e-6);
}

#[test]
fn test_mid_gray_tiled_matches_single_tile() {
    let root = models_root();
    let instance = single_device();
    let loader = ReferenceLoader { radius: 1 };
    let input = RgbImage::filled(64, 64, [0.5; 3]);

    let tiled = VariableScaleUpscaler::new(&instance, root.path(), &variable_options(32), &loader)
        .expect("32px tiles")
        .upscale(&input)
        .expect("tiled upscale");
    let whole = VariableScaleUpscaler::new(&instance, root.path(), &variable_options(64), &loader)
        .expect("64px tiles")
        .upscale(&input)
        .expect("single tile upscale");

    assert_eq!((tiled.width(), tiled.height()), (128, 128));
    assert!(tiled.max_abs_diff(&whole) < 1e-6);
}

#[test]
fn test_tile_size_does_not_change_output() {
    let root = models_root();
    let instance = single_device();
    let loader = ReferenceLoader { radius: 3 };
    let input = gradient(64, 64);

    let small = VariableScaleUpscaler::new(&instance, root.path(), &variable_options(32), &loader)
        .expect("32px tiles");
    let large = VariableScaleUpscaler::new(&instance, root.path(), &variable_options(64), &loader)
        .expect("64px tiles");

    let tiled = small.upscale(&input).expect("tiled upscale");
    let whole = large.upscale(&input).expect("single tile upscale");
    assert!(tiled.max_abs_diff(&whole) < 1e-5);
    assert_eq!(instance.live_leases(), 2);

    drop(small);
    drop(large);
    assert_eq!(instance.live_leases(), 0);
    assert!(!instance.is_created());
}

#[test]
fn test_fixed_scale_output_size_and_stats() {
    let root = models_root();
    let instance = single_device();
    let options = FixedScaleOptions {
        tile_size: TileSize::Fixed(32),
        ..FixedScaleOptions::default()
    };
    let loader = ReferenceLoader::default();
    let upscaler = FixedScaleUpscaler::new(&instance, root.path(), &options, &loader)
        .expect("build upscaler");
    assert_eq!(upscaler.config().scale, FIXED_SCALE);

    let input = gradient(70, 40);
    let (w, h) = upscaler.output_size(70, 40);
    let mut output = RgbImage::new(w, h);
    let stats = upscaler
        .process_with_stats(&input.as_frame(), &mut output.as_frame_mut())
        .expect("process");
    assert_eq!((w, h), (280, 160));
    assert_eq!(stats.rows, 2);
    assert_eq!(stats.tiles, 6);
    assert_eq!(stats.inferences, 6);
    // fp16 tile storage
    assert!((output.get(1, 4 * 69 + 3, 4 * 39 + 3) - input.get(1, 69, 39)).abs() < 1e-3);
    assert_eq!(upscaler.device().bytes_in_use(), 0);
}

#[test]
fn test_strided_frames_are_respected() {
    let root = models_root();
    let instance = single_device();
    let upscaler = VariableScaleUpscaler::new(
        &instance,
        root.path(),
        &variable_options(32),
        &ReferenceLoader::default(),
    )
    .expect("build upscaler");

    let mut input = RgbImage::with_stride(40, 20, 48).expect("strided input");
    for y in 0..20 {
        for x in 0..40 {
            for c in 0..3 {
                input.set(c, x, y, ((x + y + c) % 5) as f32 / 4.0);
            }
        }
    }
    let mut output = RgbImage::with_stride(80, 40, 96).expect("strided output");
    upscaler
        .process(&input.as_frame(), &mut output.as_frame_mut())
        .expect("process");
    for y in 0..40 {
        for x in 0..80 {
            assert_eq!(output.get(2, x, y), input.get(2, x / 2, y / 2));
        }
    }
}

#[test]
fn test_wrong_destination_size_is_frame_shape_error() {
    let root = models_root();
    let instance = single_device();
    let upscaler = VariableScaleUpscaler::new(
        &instance,
        root.path(),
        &variable_options(32),
        &ReferenceLoader::default(),
    )
    .expect("build upscaler");
    let input = gradient(16, 16);
    let mut output = RgbImage::new(16, 16);
    let err = upscaler
        .process(&input.as_frame(), &mut output.as_frame_mut())
        .unwrap_err();
    assert!(matches!(classify(&err), Some(UpscaleError::FrameShape(_))));
}

#[test]
fn test_scale_one_cunet_with_tta() {
    let root = models_root();
    let instance = single_device();
    let options = VariableScaleOptions {
        model: VariableModel::Cunet,
        scale: 1,
        noise: 1,
        tta: true,
        ..variable_options(32)
    };
    let loader = ReferenceLoader { radius: 1 };
    let upscaler = VariableScaleUpscaler::new(&instance, root.path(), &options, &loader)
        .expect("build upscaler");
    assert_eq!(upscaler.config().prepadding, 28);

    let input = gradient(50, 36);
    let mut output = RgbImage::new(50, 36);
    let stats = upscaler
        .process_with_stats(&input.as_frame(), &mut output.as_frame_mut())
        .expect("process");
    assert_eq!(stats.inferences, stats.tiles * 8);
    for c in 0..3 {
        for y in 0..36 {
            for x in 0..50 {
                let v = output.get(c, x, y);
                assert!((0.0..=1.0).contains(&v), "{v} out of range");
            }
        }
    }
}

#[test]
fn test_concurrent_upscalers_share_instance() {
    let root = models_root();
    let instance = single_device();
    let root_path = root.path().to_path_buf();
    let reference = {
        let upscaler = VariableScaleUpscaler::new(
            &instance,
            &root_path,
            &variable_options(32),
            &ReferenceLoader { radius: 1 },
        )
        .expect("build upscaler");
        upscaler.upscale(&gradient(48, 40)).expect("reference upscale")
    };
    assert!(!instance.is_created());

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let instance = Arc::clone(&instance);
            let root_path = root_path.clone();
            thread::spawn(move || {
                let upscaler = VariableScaleUpscaler::new(
                    &instance,
                    &root_path,
                    &variable_options(32),
                    &ReferenceLoader { radius: 1 },
                )
                .expect("build upscaler");
                upscaler.upscale(&gradient(48, 40)).expect("upscale")
            })
        })
        .collect();
    for handle in handles {
        let output = handle.join().expect("worker thread");
        assert_eq!(output.max_abs_diff(&reference), 0.0);
    }
    assert_eq!(instance.live_leases(), 0);
    assert!(!instance.is_created());
}

#[test]
fn test_one_upscaler_many_threads() {
    let root = models_root();
    let instance = single_device();
    let upscaler = Arc::new(
        FixedScaleUpscaler::new(
            &instance,
            root.path(),
            &FixedScaleOptions {
                tile_size: TileSize::Fixed(32),
                ..FixedScaleOptions::default()
            },
            &ReferenceLoader { radius: 2 },
        )
        .expect("build upscaler"),
    );
    let input = Arc::new(gradient(40, 40));
    let expected = upscaler.upscale(&input).expect("upscale");

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let upscaler = Arc::clone(&upscaler);
            let input = Arc::clone(&input);
            thread::spawn(move || upscaler.upscale(&input).expect("upscale"))
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().expect("worker").max_abs_diff(&expected), 0.0);
    }
    assert_eq!(upscaler.device().bytes_in_use(), 0);
}

#[test]
fn test_mid_frame_failure_names_row_and_returns_no_image() {
    let root = models_root();
    let instance = single_device();
    // 64x64 in 32x32 tiles is two rows of two tiles; the third inference
    // is the first tile of row 1.
    let loader = FlakyLoader { fail_from: 2 };
    let options = variable_options(32);
    let upscaler = VariableScaleUpscaler::new(&instance, root.path(), &options, &loader)
        .expect("build upscaler");

    let src = gradient(64, 64);
    let mut dst = RgbImage::new(128, 128);
    let err = upscaler
        .process(&src.as_frame(), &mut dst.as_frame_mut())
        .unwrap_err();
    assert!(matches!(classify(&err), Some(UpscaleError::Inference { row: 1 })));
    assert!(format!("{err:#}").contains("simulated device fault"));
    assert_eq!(upscaler.device().bytes_in_use(), 0);

    // The operator keeps failing, so the whole frame is refused.
    assert!(upscaler.upscale(&src).is_err());
}

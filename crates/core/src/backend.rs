//! ONNX Runtime inference operator.
//!
//! Provides [`InferenceBackend`], [`build_session`] to create an
//! `ort::Session` on a given device with CUDA or TensorRT execution
//! providers, and [`OrtLoader`] which turns located model files into an
//! [`Inference`] operator.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::Array4;
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::UpscaleError;
use crate::inference::{check_io, Inference, LoadRequest, OperatorLoader, ReferenceLoader};
use crate::model::{ModelFiles, ModelParams};
use crate::tensor::{DeviceTensor, NETWORK_RANGE};

/// Operator backend selection.
///
/// `Tensorrt` needs the TensorRT runtime libraries; without them the
/// session falls back to the CUDA execution provider. `Reference` runs the
/// deterministic CPU operators and never touches model weights.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Cuda,
    #[serde(alias = "trt")]
    Tensorrt,
    Reference,
}

impl InferenceBackend {
    /// Parse from string (case-insensitive). Returns `Cuda` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "tensorrt" | "trt" => Self::Tensorrt,
            "reference" | "ref" => Self::Reference,
            _ => Self::Cuda,
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
            Self::Reference => write!(f, "reference"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: &'a InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
    pub device_id: usize,
    /// Intra-op threads; 0 leaves the runtime default.
    pub intra_threads: usize,
}

/// Build an `ort::Session` for one device.
///
/// TensorRT registers the TRT provider with engine caching and CUDA as the
/// fallback. CUDA registers only the CUDA provider; if it is unavailable
/// the runtime falls back to CPU.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    // Creating a builder loads the runtime library.
    let tensorrt = match config.backend {
        InferenceBackend::Tensorrt => true,
        InferenceBackend::Cuda => false,
        InferenceBackend::Reference => {
            bail!(UpscaleError::config(
                "the reference backend does not load ONNX sessions"
            ));
        }
    };
    let mut builder =
        Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    if config.intra_threads > 0 {
        builder = builder.with_intra_threads(config.intra_threads)?;
    }
    let device_id = i32::try_from(config.device_id).map_err(|_| {
        UpscaleError::DeviceUnavailable(format!("device id {}", config.device_id))
    })?;

    let session = if tensorrt {
        let cache_dir = config
            .trt_cache_dir
            .unwrap_or_else(|| Path::new("trt_cache"));
        if let Err(e) = std::fs::create_dir_all(cache_dir) {
            warn!(
                dir = %cache_dir.display(),
                error = %e,
                "Failed to create TRT cache directory"
            );
        }
        let cache_path = cache_dir.to_string_lossy().to_string();
        let started = Instant::now();
        info!(
            device = config.device_id,
            cache_dir = %cache_dir.display(),
            "Initializing TensorRT session (first run may take several minutes)"
        );

        let session = builder
            .with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_engine_cache(true)
                    .with_engine_cache_path(&cache_path)
                    .with_fp16(true)
                    .with_device_id(device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
            ])?
            .commit_from_file(config.model_path)
            .with_context(|| {
                format!("Failed to load ONNX model: {}", config.model_path.display())
            })?;
        info!(
            elapsed_secs = started.elapsed().as_secs_f64(),
            "TensorRT session ready"
        );
        session
    } else {
        let cuda = CUDAExecutionProvider::default();
        if !cuda.is_available().unwrap_or(false) {
            warn!("CUDA EP is not available, inference will fall back to CPU");
        }
        debug!(
            backend = "cuda",
            device = config.device_id,
            "Building session with CUDA EP"
        );

        builder
            .with_execution_providers([CUDAExecutionProvider::default()
                .with_device_id(device_id)
                .build()
                .error_on_failure()])?
            .commit_from_file(config.model_path)
            .with_context(|| {
                format!("Failed to load ONNX model: {}", config.model_path.display())
            })?
    };

    Ok(session)
}

/// Network operator backed by an `ort::Session`.
pub struct OrtInference {
    name: String,
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    fp16: bool,
    scale: usize,
    normalization_max: f32,
}

impl OrtInference {
    pub fn new(name: String, session: Session, params: &ModelParams) -> Result<Self> {
        let input = session
            .inputs()
            .first()
            .context("model has no inputs")?;
        let input_name = match &params.input_name {
            Some(configured) => configured.clone(),
            None => input.name().to_string(),
        };
        let output_name = match &params.output_name {
            Some(configured) => configured.clone(),
            None => session
                .outputs()
                .first()
                .context("model has no outputs")?
                .name()
                .to_string(),
        };
        let detected_fp16 = match input.dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };
        let fp16 = params.fp16.unwrap_or(detected_fp16);

        debug!(
            model = %name, %input_name, %output_name, fp16, scale = params.scale,
            "Detected model IO"
        );

        Ok(Self {
            name,
            session: Mutex::new(session),
            input_name,
            output_name,
            fp16,
            scale: params.scale,
            normalization_max: params.normalization_max,
        })
    }
}

impl Inference for OrtInference {
    fn name(&self) -> &str {
        &self.name
    }

    fn scale(&self) -> usize {
        self.scale
    }

    fn infer(&self, input: &DeviceTensor, output: &DeviceTensor) -> Result<()> {
        check_io(self, input, output)?;
        let shape = input.shape();
        let gain = self.normalization_max / NETWORK_RANGE;
        let mut data = input.read().to_f32_vec();
        if gain != 1.0 {
            data.iter_mut().for_each(|v| *v *= gain);
        }

        let dims = (1, shape.c, shape.h, shape.w);
        let (out_shape, mut result) = {
            let mut session = self.session.lock().unwrap_or_else(|p| p.into_inner());
            if self.fp16 {
                run_fp16(&mut session, &self.input_name, &self.output_name, dims, &data)?
            } else {
                run_f32(&mut session, &self.input_name, &self.output_name, dims, data)?
            }
        };

        let expected = output.shape();
        if out_shape != [1, expected.c, expected.h, expected.w] {
            bail!(
                "{}: network produced {:?}, expected {}",
                self.name,
                out_shape,
                expected
            );
        }
        if gain != 1.0 {
            result.iter_mut().for_each(|v| *v /= gain);
        }
        output.write().copy_from_f32(&result)
    }
}

fn run_f32(
    session: &mut Session,
    input_name: &str,
    output_name: &str,
    dims: (usize, usize, usize, usize),
    data: Vec<f32>,
) -> Result<(Vec<usize>, Vec<f32>)> {
    let array = Array4::from_shape_vec(dims, data)?;
    let input_tensor = Tensor::from_array(array)?;
    let outputs = session.run(ort::inputs![input_name => &input_tensor])?;
    let output_view = outputs[output_name].try_extract_array::<f32>()?;
    Ok((output_view.shape().to_vec(), output_view.iter().copied().collect()))
}

fn run_fp16(
    session: &mut Session,
    input_name: &str,
    output_name: &str,
    dims: (usize, usize, usize, usize),
    data: &[f32],
) -> Result<(Vec<usize>, Vec<f32>)> {
    let mut fp16_data = vec![f16::ZERO; data.len()];
    fp16_data.convert_from_f32_slice(data);
    let array = Array4::from_shape_vec(dims, fp16_data)?;
    let input_tensor = Tensor::from_array(array)?;
    let outputs = session.run(ort::inputs![input_name => &input_tensor])?;
    let output_view = outputs[output_name].try_extract_array::<f16>()?;

    let halves: Vec<f16> = output_view.iter().copied().collect();
    let mut f32_data = vec![0.0f32; halves.len()];
    halves.convert_to_f32_slice(&mut f32_data);
    Ok((output_view.shape().to_vec(), f32_data))
}

/// Loads `.param` / `.bin` pairs into ONNX Runtime sessions.
#[derive(Debug, Clone, Default)]
pub struct OrtLoader {
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<PathBuf>,
}

impl OrtLoader {
    fn session_for(&self, model: &ModelFiles, request: &LoadRequest<'_>) -> Result<Session> {
        build_session(&SessionConfig {
            model_path: &model.bin,
            backend: &self.backend,
            trt_cache_dir: self.trt_cache_dir.as_deref(),
            device_id: request.device.index(),
            intra_threads: request.threads,
        })
    }
}

impl OperatorLoader for OrtLoader {
    fn load(&self, request: &LoadRequest<'_>) -> Result<Arc<dyn Inference>> {
        let params = ModelParams::load(&request.model.param)?;
        if params.scale != request.scale {
            bail!(UpscaleError::config(format!(
                "model '{}' upscales by {}, configured scale is {}",
                request.model.name, params.scale, request.scale
            )));
        }
        if let Some(fp16) = params.fp16 {
            if fp16 != request.fp16 {
                debug!(
                    model = %request.model.name,
                    model_fp16 = fp16,
                    "Model precision differs from kernel storage precision"
                );
            }
        }

        debug!(
            model = %request.model.bin.display(),
            backend = %self.backend,
            device = request.device.index(),
            threads = request.threads,
            "Loading ONNX upscaling model"
        );
        let session = self.session_for(request.model, request)?;
        let operator = OrtInference::new(request.model.name.clone(), session, &params)?;
        Ok(Arc::new(operator))
    }
}

/// Operator loader for `backend`. `reference_radius` configures the box
/// filter used by the reference backend.
pub fn loader_for(
    backend: &InferenceBackend,
    trt_cache_dir: Option<PathBuf>,
    reference_radius: usize,
) -> Box<dyn OperatorLoader> {
    match backend {
        InferenceBackend::Reference => Box::new(ReferenceLoader {
            radius: reference_radius,
        }),
        other => Box::new(OrtLoader {
            backend: other.clone(),
            trt_cache_dir,
        }),
    }
}

//! Tiled GPU super-resolution engine.

pub mod backend;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod inference;
pub mod kernels;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod tensor;
pub mod tile;
pub mod upscaler;

pub use error::UpscaleError;
pub use tensor::{PlanarFrame, PlanarFrameMut, RgbImage};
pub use upscaler::{
    FixedScaleOptions, FixedScaleUpscaler, Upscaler, VariableScaleOptions, VariableScaleUpscaler,
};

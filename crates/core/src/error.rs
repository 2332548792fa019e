//! Error categories surfaced by the upscaling engine.
//!
//! Fallible functions return `anyhow::Result`; the variants below are attached
//! either as the root error or as context so callers can classify a failure
//! with `err.downcast_ref::<UpscaleError>()` without parsing messages.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpscaleError {
    /// Rejected option at construction time. No device resources are retained.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("can't open model file: {}", path.display())]
    ModelUnavailable { path: PathBuf },

    #[error("compute device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("device allocation of {requested} bytes failed ({available} bytes available)")]
    OutOfMemory { requested: usize, available: usize },

    /// Any failure inside `process()`. The frame is abandoned; the device and
    /// its allocator pools remain usable for the next frame.
    #[error("inference failed while processing tile row {row}")]
    Inference { row: usize },

    #[error("frame shape mismatch: {0}")]
    FrameShape(String),
}

impl UpscaleError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::ModelUnavailable { .. } | Self::DeviceUnavailable(_)
        )
    }
}

/// Returns the outermost engine error category carried by `err`, if any.
pub fn classify(err: &anyhow::Error) -> Option<&UpscaleError> {
    err.downcast_ref::<UpscaleError>()
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn test_classify_root_error() {
        let err = anyhow::Error::new(UpscaleError::config("tile_size must be multiple of 4"));
        assert!(matches!(classify(&err), Some(UpscaleError::Config(_))));
        assert!(err.to_string().contains("multiple of 4"));
    }

    #[test]
    fn test_classify_context_error() {
        let result: anyhow::Result<()> = Err(anyhow::anyhow!("dispatch failed"))
            .context(UpscaleError::Inference { row: 3 });
        let err = result.unwrap_err();
        assert!(matches!(
            classify(&err),
            Some(UpscaleError::Inference { row: 3 })
        ));
        assert!(format!("{err:#}").contains("dispatch failed"));
    }

    #[test]
    fn test_config_category() {
        assert!(UpscaleError::config("x").is_config());
        assert!(UpscaleError::ModelUnavailable {
            path: PathBuf::from("a.param")
        }
        .is_config());
        assert!(!UpscaleError::Inference { row: 0 }.is_config());
        assert!(!UpscaleError::OutOfMemory {
            requested: 1,
            available: 0
        }
        .is_config());
    }
}

//! Per-tile pre- and post-processing kernels.
//!
//! Preprocessing cuts a tile's context window out of the uploaded band and
//! writes one network input tensor per orientation. Postprocessing maps every
//! orientation's output back to canonical coordinates, averages them and
//! writes the tile's nominal output region into the row buffer.

pub mod orientation;
pub mod postprocess;
pub mod preprocess;

pub use orientation::Orientation;
pub use postprocess::{postprocess_tile, record_postprocess};
pub use preprocess::{preprocess_tile, record_preprocess};

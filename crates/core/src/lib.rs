//! Tiled ONNX super-resolution: model selection, tiled inference,
//! preview and full-batch pipelines, and the coordinator that runs them.

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod format;
pub mod full;
pub mod geometry;
pub mod inference;
pub mod logging;
pub mod model_registry;
pub mod plan;
pub mod preview;
pub mod progress;
pub mod runtime;
pub mod tiling;
pub mod types;
pub mod workspace;

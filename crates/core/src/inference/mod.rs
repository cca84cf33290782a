//! Model execution service: the seam between the pipeline and whatever
//! actually runs a neural network over a tile.

mod onnx;
pub mod testing;

pub use onnx::{OnnxInferenceService, ValueRange};

use crate::plan::ModelRef;
use crate::types::ImageBuffer;

/// Runs one model over one image.
///
/// Implementations must be safe to call repeatedly with different models:
/// state kept for one model (sessions, buffers) never leaks into another.
pub trait InferenceService: Send + Sync {
    /// Upscales `tile` with `model`. The input is RGB; the output is RGB
    /// with both dimensions multiplied by [`Self::scale_factor`].
    fn run_model(&self, tile: &ImageBuffer, model: &ModelRef) -> anyhow::Result<ImageBuffer>;

    /// The model's intrinsic upscale ratio.
    fn scale_factor(&self, model: &ModelRef) -> anyhow::Result<u32>;

    /// How many `run_model` calls may be in flight at once.
    fn max_concurrency(&self) -> usize {
        1
    }
}

impl<T: InferenceService + ?Sized> InferenceService for std::sync::Arc<T> {
    fn run_model(&self, tile: &ImageBuffer, model: &ModelRef) -> anyhow::Result<ImageBuffer> {
        (**self).run_model(tile, model)
    }

    fn scale_factor(&self, model: &ModelRef) -> anyhow::Result<u32> {
        (**self).scale_factor(model)
    }

    fn max_concurrency(&self) -> usize {
        (**self).max_concurrency()
    }
}

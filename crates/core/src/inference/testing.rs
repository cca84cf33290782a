//! Deterministic [`InferenceService`] for tests and dry runs.
//!
//! Upscales by pixel replication and applies an optional per-model pixel
//! operation, so pipeline tests can tell which model produced an output.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;

use super::InferenceService;
use crate::plan::ModelRef;
use crate::types::{ColorModel, ImageBuffer};

/// What a fake model does to each channel value after upscaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelOp {
    Identity,
    /// Saturating add.
    Add(u8),
    Invert,
    Constant(u8),
}

impl PixelOp {
    fn apply(self, value: u8) -> u8 {
        match self {
            Self::Identity => value,
            Self::Add(n) => value.saturating_add(n),
            Self::Invert => 255 - value,
            Self::Constant(n) => n,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FakeModel {
    scale: u32,
    op: PixelOp,
}

pub struct FakeInferenceService {
    default_scale: u32,
    models: HashMap<String, FakeModel>,
    concurrency: usize,
    delay: Option<Duration>,
    fail_on_call: Option<usize>,
    cancel_after: Option<(usize, CancellationToken)>,
    calls: AtomicUsize,
    calls_by_model: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FakeInferenceService {
    pub fn new(default_scale: u32) -> Self {
        Self {
            default_scale,
            models: HashMap::new(),
            concurrency: 1,
            delay: None,
            fail_on_call: None,
            cancel_after: None,
            calls: AtomicUsize::new(0),
            calls_by_model: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Registers behaviour for the model named `name`.
    pub fn with_model(mut self, name: &str, scale: u32, op: PixelOp) -> Self {
        self.models.insert(name.to_string(), FakeModel { scale, op });
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Makes the `n`-th call (1-based) fail.
    pub fn failing_on_call(mut self, n: usize) -> Self {
        self.fail_on_call = Some(n);
        self
    }

    /// Cancels `token` once `n` calls have completed.
    pub fn cancelling_after(mut self, n: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((n, token));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, name: &str) -> usize {
        self.calls_by_model
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn model(&self, model: &ModelRef) -> FakeModel {
        self.models.get(&model.name).copied().unwrap_or(FakeModel {
            scale: self.default_scale,
            op: PixelOp::Identity,
        })
    }
}

impl InferenceService for FakeInferenceService {
    fn run_model(&self, tile: &ImageBuffer, model: &ModelRef) -> Result<ImageBuffer> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self
            .calls_by_model
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(model.name.clone())
            .or_default() += 1;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_on_call == Some(call) {
            bail!("injected failure on call {call}");
        }
        if tile.color() != ColorModel::Rgb {
            bail!("fake model expects RGB tiles, got {:?}", tile.color());
        }

        let fake = self.model(model);
        let scaled = tile.scaled_nearest(fake.scale)?;
        let (w, h) = scaled.dimensions();
        let data = scaled.into_data().into_iter().map(|v| fake.op.apply(v)).collect();
        let out = ImageBuffer::new(w, h, ColorModel::Rgb, data)?;

        if let Some((n, token)) = &self.cancel_after {
            if call >= *n {
                token.cancel();
            }
        }
        Ok(out)
    }

    fn scale_factor(&self, model: &ModelRef) -> Result<u32> {
        Ok(self.model(model).scale)
    }

    fn max_concurrency(&self) -> usize {
        self.concurrency
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ModelSlot;

    #[test]
    fn fake_upscales_and_counts() {
        let service = FakeInferenceService::new(2).with_model("inv", 3, PixelOp::Invert);
        let tile = ImageBuffer::filled(2, 2, ColorModel::Rgb, &[10, 20, 30]).expect("tile");

        let plain = ModelRef::new("plain.onnx", ModelSlot::Primary);
        let out = service.run_model(&tile, &plain).expect("run");
        assert_eq!(out.dimensions(), (4, 4));
        assert_eq!(out.pixel(3, 3), &[10, 20, 30]);

        let inv = ModelRef::new("inv.onnx", ModelSlot::Secondary);
        let out = service.run_model(&tile, &inv).expect("run");
        assert_eq!(out.dimensions(), (6, 6));
        assert_eq!(out.pixel(0, 0), &[245, 235, 225]);

        assert_eq!(service.calls(), 2);
        assert_eq!(service.calls_for("inv"), 1);
        assert_eq!(service.scale_factor(&inv).expect("scale"), 3);
    }

    #[test]
    fn fake_fails_on_requested_call() {
        let service = FakeInferenceService::new(1).failing_on_call(2);
        let tile = ImageBuffer::filled(1, 1, ColorModel::Rgb, &[0, 0, 0]).expect("tile");
        let model = ModelRef::new("m.onnx", ModelSlot::Primary);
        assert!(service.run_model(&tile, &model).is_ok());
        assert!(service.run_model(&tile, &model).is_err());
        assert!(service.run_model(&tile, &model).is_ok());
    }
}

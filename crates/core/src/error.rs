//! Error taxonomy shared by every pipeline stage.
//!
//! Per-item errors (`Io`, `Decode`, `UnsupportedFormat`) are collected by
//! batch stages into a [`BatchReport`]; everything else aborts the run that
//! raised it.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::plan::ModelSlot;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode {}: {message}", .path.display())]
    Decode { path: PathBuf, message: String },

    #[error("unsupported image {}: {message}", .path.display())]
    UnsupportedFormat { path: PathBuf, message: String },

    #[error("invalid image buffer: {message}")]
    InvalidImage { message: String },

    #[error("{slot} model is missing ({})", describe_model_path(.path.as_deref()))]
    ModelMissing {
        slot: ModelSlot,
        path: Option<PathBuf>,
    },

    #[error("invalid blend value {}: expected 0..=100", describe_blend(.blend))]
    InvalidBlend { blend: Option<f64> },

    #[error("models have different scale factors ({first}x vs {second}x) and cannot be interpolated")]
    IncompatibleScales { first: u32, second: u32 },

    #[error("inference failed for model '{model}': {message}")]
    Inference { model: String, message: String },

    #[error("configuration key '{key}': {message}")]
    Config { key: String, message: String },

    #[error("invalid viewport: {message}")]
    InvalidViewport { message: String },

    #[error("another pipeline run is already active")]
    Busy,

    #[error("pipeline task failed: {message}")]
    Internal { message: String },

    #[error("cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn invalid_image(message: impl Into<String>) -> Self {
        Self::InvalidImage {
            message: message.into(),
        }
    }

    /// Errors a batch stage records and moves past instead of aborting.
    pub fn is_per_item(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Decode { .. } | Self::UnsupportedFormat { .. }
        )
    }

    /// Plan errors are raised before any inference runs.
    pub fn is_plan_error(&self) -> bool {
        matches!(
            self,
            Self::ModelMissing { .. } | Self::InvalidBlend { .. } | Self::IncompatibleScales { .. }
        )
    }

    /// Short reason shown to the user after a run is aborted.
    pub fn user_reason(&self) -> String {
        match self {
            Self::Io { .. } => "I/O Error".to_string(),
            Self::Decode { .. } | Self::UnsupportedFormat { .. } | Self::InvalidImage { .. } => {
                "Invalid image".to_string()
            }
            Self::ModelMissing { .. } | Self::InvalidBlend { .. } | Self::IncompatibleScales { .. } => {
                "Invalid model selection".to_string()
            }
            Self::Inference { .. } => "Upscaling failed".to_string(),
            Self::Config { key, .. } => format!("Invalid setting '{key}'"),
            Self::InvalidViewport { .. } => "Invalid preview region".to_string(),
            Self::Busy => "Busy".to_string(),
            Self::Internal { .. } => "Internal error".to_string(),
            Self::Cancelled => String::new(),
        }
    }
}

fn describe_model_path(path: Option<&Path>) -> String {
    match path {
        Some(path) => format!("file not found: {}", path.display()),
        None => "not selected".to_string(),
    }
}

fn describe_blend(blend: &Option<f64>) -> String {
    match blend {
        Some(value) => value.to_string(),
        None => "<missing>".to_string(),
    }
}

/// A single item that a batch stage could not process.
#[derive(Debug)]
pub struct ItemFailure {
    pub path: PathBuf,
    pub error: PipelineError,
}

impl fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.error)
    }
}

/// Outcome of a stage that keeps going past per-item failures.
#[derive(Debug)]
pub struct BatchReport<T> {
    pub succeeded: Vec<T>,
    pub failures: Vec<ItemFailure>,
}

impl<T> Default for BatchReport<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failures: Vec::new(),
        }
    }
}

impl<T> BatchReport<T> {
    pub fn push_ok(&mut self, item: T) {
        self.succeeded.push(item);
    }

    pub fn push_failure(&mut self, path: impl Into<PathBuf>, error: PipelineError) {
        self.failures.push(ItemFailure {
            path: path.into(),
            error,
        });
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failures.len()
    }

    /// Moves this report's failures into `other`, returning the successes.
    pub fn drain_failures_into<U>(self, other: &mut BatchReport<U>) -> Vec<T> {
        other.failures.extend(self.failures);
        self.succeeded
    }
}

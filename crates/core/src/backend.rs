//! Inference backend configuration: CPU, CUDA EP and TensorRT EP.
//!
//! Provides [`InferenceBackend`] and [`build_session`] to create an
//! `ort::Session` with the matching execution providers and optional TRT
//! engine caching.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use ort::{
    execution_providers::{
        CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider,
    },
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Inference backend selection.
///
/// Default is `Cuda`. `Tensorrt` requires the TensorRT runtime libraries;
/// if they are unavailable the session falls back to the CUDA EP. If CUDA
/// is unavailable as well, ORT runs on the CPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    Cpu,
    #[default]
    Cuda,
    Tensorrt,
}

impl InferenceBackend {
    /// Parse from string (case-insensitive). Returns `Cuda` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Self::Cpu,
            "tensorrt" | "trt" => Self::Tensorrt,
            _ => Self::Cuda,
        }
    }

    /// The legacy `useCpu` switch wins over the configured backend.
    pub fn with_cpu_override(self, use_cpu: bool) -> Self {
        if use_cpu {
            Self::Cpu
        } else {
            self
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
}

fn cache_file_count(root: &Path) -> usize {
    std::fs::read_dir(root)
        .map(|entries| entries.flatten().filter(|e| e.path().is_file()).count())
        .unwrap_or(0)
}

/// Build an `ort::Session` for `config.backend`.
///
/// For `Tensorrt`, TRT EP with engine caching is registered first and the
/// CUDA EP second. For `Cuda`, only the CUDA EP. For `Cpu`, only the CPU EP.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let load_context = || format!("Failed to load ONNX model: {}", config.model_path.display());

    let session = match config.backend {
        InferenceBackend::Tensorrt => {
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
            let before = cache_file_count(cache_dir);
            let started = Instant::now();

            info!(
                cache_dir = %cache_dir.display(),
                cache_files = before,
                "Initializing TensorRT session (first run may take several minutes)"
            );

            let session_result = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_fp16(true)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_file(config.model_path)
                .with_context(load_context);

            let elapsed = started.elapsed().as_secs_f64();
            match session_result {
                Ok(session) => {
                    let after = cache_file_count(cache_dir);
                    info!(
                        elapsed_secs = elapsed,
                        cache_updated = after > before,
                        "TensorRT session ready"
                    );
                    session
                }
                Err(error_value) => {
                    error!(
                        elapsed_secs = elapsed,
                        cache_dir = %cache_dir.display(),
                        error = %error_value,
                        "TensorRT session initialization failed"
                    );
                    return Err(error_value);
                }
            }
        }
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available, inference will fall back to CPU");
            }

            debug!(backend = "cuda", "Building session with CUDA EP");

            builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .commit_from_file(config.model_path)
                .with_context(load_context)?
        }
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building session with CPU EP");

            builder
                .with_execution_providers([CPUExecutionProvider::default().build()])?
                .commit_from_file(config.model_path)
                .with_context(load_context)?
        }
    };

    Ok(session)
}

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::plan::{ModelRef, ModelSlot};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelEntry {
    pub name: String,
    /// Path relative to the models directory.
    pub filename: String,
    /// Upscale factor guessed from the file name (`4x_…`, `…_x2`). The
    /// inference service measures the real factor; this is for display.
    pub scale_hint: Option<u32>,
    /// Whether the file name marks the model as half precision.
    pub is_fp16: bool,
}

/// Models available in the models directory.
pub struct ModelRegistry {
    models_dir: PathBuf,
    entries: Vec<ModelEntry>,
}

impl ModelRegistry {
    pub fn new(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            entries: Vec::new(),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Scans the models directory (including subdirectories) for `.onnx`
    /// files. A missing directory yields an empty registry.
    pub fn discover(&mut self) -> Result<()> {
        if !self.models_dir.exists() {
            debug!(dir = %self.models_dir.display(), "Models directory does not exist");
            return Ok(());
        }

        let mut stack = vec![self.models_dir.clone()];
        while let Some(dir) = stack.pop() {
            let read_dir = fs::read_dir(&dir)
                .with_context(|| format!("Failed to read models directory: {}", dir.display()))?;

            for entry in read_dir {
                let path = entry?.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }

                let is_onnx = path
                    .extension()
                    .map(|ext| ext.eq_ignore_ascii_case("onnx"))
                    .unwrap_or(false);
                if !is_onnx {
                    continue;
                }

                let Ok(relative) = path.strip_prefix(&self.models_dir) else {
                    continue;
                };
                let filename = relative.to_string_lossy().replace('\\', "/");
                if self.entries.iter().any(|e| e.filename == filename) {
                    continue;
                }

                let name = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or(&filename)
                    .to_string();

                let entry = ModelEntry {
                    scale_hint: parse_scale_hint(&name),
                    is_fp16: name.to_lowercase().contains("fp16"),
                    name,
                    filename,
                };
                info!(
                    model = %entry.name,
                    scale_hint = ?entry.scale_hint,
                    "Discovered ONNX model"
                );
                self.entries.push(entry);
            }
        }

        self.entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ModelEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn list(&self) -> &[ModelEntry] {
        &self.entries
    }

    pub fn model_path(&self, name: &str) -> Option<PathBuf> {
        self.get(name).map(|e| self.models_dir.join(&e.filename))
    }

    /// Turns a user-supplied model name or path into a [`ModelRef`].
    ///
    /// Existing paths are taken as-is, known names are looked up, anything
    /// else is assumed to live in the models directory. Existence is checked
    /// later, when the plan is resolved.
    pub fn resolve_ref(&self, name_or_path: &str, slot: ModelSlot) -> ModelRef {
        let as_path = Path::new(name_or_path);
        if as_path.is_file() {
            return ModelRef::new(as_path, slot);
        }
        if let Some(path) = self.model_path(name_or_path) {
            return ModelRef::new(path, slot);
        }

        let mut guess = self.models_dir.join(name_or_path);
        if guess.extension().is_none() {
            guess.set_extension("onnx");
        }
        ModelRef::new(guess, slot)
    }
}

/// Extracts a scale factor from names like `4x_RealSR`, `4x-UltraSharp` or
/// `RealESRGAN_x4plus`.
pub fn parse_scale_hint(name: &str) -> Option<u32> {
    let lower = name.to_ascii_lowercase();
    let bytes = lower.as_bytes();

    let leading: String = lower.chars().take_while(|c| c.is_ascii_digit()).collect();
    if !leading.is_empty() && bytes.get(leading.len()) == Some(&b'x') {
        return leading.parse().ok().filter(|s| (1..=16).contains(s));
    }

    for (i, _) in lower.match_indices('x') {
        let at_boundary = i == 0 || matches!(bytes[i - 1], b'_' | b'-' | b' ' | b'.');
        if !at_boundary {
            continue;
        }
        let digits: String = lower[i + 1..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        if let Ok(scale) = digits.parse::<u32>() {
            if (1..=16).contains(&scale) {
                return Some(scale);
            }
        }
    }
    None
}

use std::collections::HashMap;
use std::env;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::InferenceBackend;
use crate::error::PipelineError;
use crate::format::{JpegExtension, NormalizeOptions, OutputFormat, OutputSettings, WorkingFormat};
use crate::full::OverwritePolicy;
use crate::inference::ValueRange;
use crate::plan::ModelMode;
use crate::tiling::{PreviewMode, TilingOptions, DEFAULT_TILE_OVERLAP};
use crate::types::Rgba8;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "UPSCALER_DATA_DIR";
/// Tile size written into a freshly created config file.
pub const RECOMMENDED_TILESIZE: u32 = 512;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub upscale: UpscaleConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub work_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpscaleConfig {
    /// Required; never defaulted silently.
    pub tilesize: Option<u32>,
    pub alpha: bool,
    /// `RRGGBBAA` hex used when flattening transparency.
    pub alpha_bg_color: String,
    pub tile_overlap: u32,
    pub backend: String,
    pub use_cpu: bool,
    pub model_mode: String,
    pub interp_value: f64,
    pub max_concurrent_tiles: usize,
    pub value_range: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutputConfig {
    pub format: String,
    pub jpeg_quality: u8,
    pub webp_quality: u8,
    pub jpeg_extension: String,
    pub overwrite: String,
    pub suffix: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            work_dir: PathBuf::from("work"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for UpscaleConfig {
    fn default() -> Self {
        Self {
            tilesize: None,
            alpha: false,
            alpha_bg_color: Rgba8::BLACK.to_hex(),
            tile_overlap: DEFAULT_TILE_OVERLAP,
            backend: InferenceBackend::default().to_string(),
            use_cpu: false,
            model_mode: ModelMode::Single.to_string(),
            interp_value: 50.0,
            max_concurrent_tiles: 1,
            value_range: "auto".to_string(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Png.to_string(),
            jpeg_quality: 95,
            webp_quality: 95,
            jpeg_extension: "jpg".to_string(),
            overwrite: OverwritePolicy::Keep.to_string(),
            suffix: String::new(),
        }
    }
}

impl AppConfig {
    /// Defaults plus a tile size, as written on first run.
    pub fn first_run() -> Self {
        let mut config = Self::default();
        config.upscale.tilesize = Some(RECOMMENDED_TILESIZE);
        config
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn inference_backend(&self) -> InferenceBackend {
        InferenceBackend::from_str_lossy(&self.upscale.backend).with_cpu_override(self.upscale.use_cpu)
    }

    pub fn value_range(&self) -> ValueRange {
        ValueRange::from_str_lossy(&self.upscale.value_range)
    }
}

/// Typed view over a flat key-value configuration.
pub trait ConfigStore {
    fn get_raw(&self, key: &str) -> Option<String>;

    /// Fails when `key` is absent or does not parse as `T`.
    fn require<T>(&self, key: &str) -> Result<T, PipelineError>
    where
        T: FromStr,
        T::Err: Display,
    {
        let raw = self
            .get_raw(key)
            .ok_or_else(|| PipelineError::config(key, "required setting is missing"))?;
        parse_value(key, &raw)
    }

    /// Falls back to `default` only when `key` is absent; a present but
    /// malformed value is still an error.
    fn get_or<T>(&self, key: &str, default: T) -> Result<T, PipelineError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get_raw(key) {
            Some(raw) => parse_value(key, &raw),
            None => Ok(default),
        }
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, PipelineError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse()
        .map_err(|e| PipelineError::config(key, format!("cannot parse '{raw}': {e}")))
}

impl ConfigStore for AppConfig {
    fn get_raw(&self, key: &str) -> Option<String> {
        let up = &self.upscale;
        let out = &self.output;
        let value = match key {
            "tilesize" => return up.tilesize.map(|v| v.to_string()),
            "alpha" => up.alpha.to_string(),
            "alphaBgColor" => up.alpha_bg_color.clone(),
            "tileOverlap" => up.tile_overlap.to_string(),
            "backend" => up.backend.clone(),
            "useCpu" => up.use_cpu.to_string(),
            "modelMode" => up.model_mode.clone(),
            "interpValue" => up.interp_value.to_string(),
            "maxConcurrentTiles" => up.max_concurrent_tiles.to_string(),
            "valueRange" => up.value_range.clone(),
            "outputFormat" => out.format.clone(),
            "jpegQ" => out.jpeg_quality.to_string(),
            "webpQ" => out.webp_quality.to_string(),
            "jpegExtension" => out.jpeg_extension.clone(),
            "overwrite" => out.overwrite.clone(),
            "suffix" => out.suffix.clone(),
            "modelsDir" => self.paths.models_dir.to_string_lossy().into_owned(),
            "workDir" => self.paths.work_dir.to_string_lossy().into_owned(),
            "trtCacheDir" => self.paths.trt_cache_dir.to_string_lossy().into_owned(),
            _ => return None,
        };
        Some(value)
    }
}

impl ConfigStore for HashMap<String, String> {
    fn get_raw(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Everything a pipeline run reads from configuration, parsed once.
#[derive(Debug, Clone, PartialEq)]
pub struct UpscaleSettings {
    pub tile_limit: u32,
    pub tile_overlap: u32,
    pub alpha: bool,
    pub alpha_background: Rgba8,
    pub model_mode: ModelMode,
    pub blend: f64,
    pub max_concurrent_tiles: usize,
    pub output: OutputSettings,
    pub overwrite: OverwritePolicy,
    pub suffix: String,
}

impl UpscaleSettings {
    pub fn from_store(store: &impl ConfigStore) -> Result<Self, PipelineError> {
        let tile_limit: u32 = store.require("tilesize")?;
        if tile_limit == 0 {
            return Err(PipelineError::config("tilesize", "must be at least 1"));
        }

        let jpeg_quality: u8 = store.get_or("jpegQ", 95)?;
        if !(1..=100).contains(&jpeg_quality) {
            return Err(PipelineError::config("jpegQ", "must be between 1 and 100"));
        }

        Ok(Self {
            tile_limit,
            tile_overlap: store.get_or("tileOverlap", DEFAULT_TILE_OVERLAP)?,
            alpha: store.get_or("alpha", false)?,
            alpha_background: store.get_or("alphaBgColor", Rgba8::BLACK)?,
            model_mode: store.get_or("modelMode", ModelMode::Single)?,
            blend: store.get_or("interpValue", 50.0)?,
            max_concurrent_tiles: store.get_or::<usize>("maxConcurrentTiles", 1)?.max(1),
            output: OutputSettings {
                format: store.get_or("outputFormat", OutputFormat::Png)?,
                jpeg_quality,
                webp_quality: store.get_or("webpQ", 95)?,
                jpeg_extension: store.get_or("jpegExtension", JpegExtension::Jpg)?,
            },
            overwrite: store.get_or("overwrite", OverwritePolicy::Keep)?,
            suffix: store.get_or("suffix", String::new())?,
        })
    }

    /// Format Stage options: alpha is kept as a mask only when enabled.
    pub fn normalize_options(&self) -> NormalizeOptions {
        NormalizeOptions {
            working: WorkingFormat::PngFast,
            strip_alpha: !self.alpha,
            background: self.alpha_background,
            delete_source: true,
        }
    }

    pub fn tiling_options(&self, mode: PreviewMode) -> TilingOptions {
        TilingOptions {
            tile_limit: self.tile_limit,
            overlap: self.tile_overlap,
            alpha_aware: self.alpha,
            mode,
        }
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. UPSCALER_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Initialize the data directory structure on first run:
/// - Creates data_dir if missing
/// - Writes a default config.toml (with a tile size) only if none exists
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::first_run().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Resolve a path relative to a base directory.
/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.paths.models_dir, PathBuf::from("models"));
        assert_eq!(cfg.paths.work_dir, PathBuf::from("work"));
        assert_eq!(cfg.upscale.tilesize, None);
        assert_eq!(cfg.upscale.alpha_bg_color, "000000FF");
        assert_eq!(cfg.upscale.backend, "cuda");
        assert_eq!(cfg.output.format, "png");
        assert_eq!(cfg.output.overwrite, "keep");
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let original = AppConfig::first_run();
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: AppConfig = toml::from_str("[upscale]\ntilesize = 256\n").expect("parse");
        assert_eq!(cfg.upscale.tilesize, Some(256));
        assert_eq!(cfg.upscale.tile_overlap, DEFAULT_TILE_OVERLAP);
        assert_eq!(cfg.output, OutputConfig::default());
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loaded = AppConfig::load_from_path(&dir.path().join("none.toml")).expect("load");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn load_reports_malformed_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[upscale\n").expect("write");
        assert!(AppConfig::load_from_path(&path).is_err());
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn data_dir_uses_env_var_when_no_cli() {
        env::set_var(ENV_DATA_DIR, "/env/path");
        let result = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        assert_eq!(result, PathBuf::from("/env/path"));
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        let result = config_path(Path::new("/data"));
        assert_eq!(result, PathBuf::from("/data/config.toml"));
    }

    #[test]
    fn initialize_writes_first_run_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = dir.path().join("data");
        initialize_data_dir(&data).expect("initialize data dir");

        let loaded = AppConfig::load_from_path(&config_path(&data)).expect("load");
        assert_eq!(loaded.upscale.tilesize, Some(RECOMMENDED_TILESIZE));
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg_path = dir.path().join("config.toml");
        let custom_content = "[upscale]\ntilesize = 128\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(dir.path()).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }

    #[test]
    fn resolve_relative_to_handles_both_kinds() {
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("/abs/path")),
            PathBuf::from("/abs/path")
        );
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("sub")),
            PathBuf::from("/base/sub")
        );
    }

    #[test]
    fn missing_tilesize_is_a_config_error() {
        let err = UpscaleSettings::from_store(&AppConfig::default()).expect_err("no tilesize");
        assert!(matches!(err, PipelineError::Config { ref key, .. } if key == "tilesize"));

        let err = UpscaleSettings::from_store(&store(&[("tilesize", "big")])).expect_err("bad tilesize");
        assert!(matches!(err, PipelineError::Config { ref key, .. } if key == "tilesize"));

        let err = UpscaleSettings::from_store(&store(&[("tilesize", "0")])).expect_err("zero");
        assert!(matches!(err, PipelineError::Config { .. }));
    }

    #[test]
    fn settings_parse_original_key_names() {
        let settings = UpscaleSettings::from_store(&store(&[
            ("tilesize", "384"),
            ("alpha", "true"),
            ("alphaBgColor", "FFFFFF80"),
            ("modelMode", "interp"),
            ("interpValue", "30"),
            ("outputFormat", "jpg"),
            ("jpegQ", "80"),
            ("jpegExtension", "jpeg"),
            ("overwrite", "in_place"),
            ("suffix", "_up"),
        ]))
        .expect("settings");

        assert_eq!(settings.tile_limit, 384);
        assert!(settings.alpha);
        assert_eq!(settings.alpha_background, Rgba8 { r: 255, g: 255, b: 255, a: 128 });
        assert_eq!(settings.model_mode, ModelMode::Interpolate);
        assert_eq!(settings.blend, 30.0);
        assert_eq!(settings.output.format, OutputFormat::Jpeg);
        assert_eq!(settings.output.jpeg_quality, 80);
        assert_eq!(settings.output.jpeg_extension, JpegExtension::Jpeg);
        assert_eq!(settings.overwrite, OverwritePolicy::InPlace);
        assert_eq!(settings.suffix, "_up");
        assert!(!settings.normalize_options().strip_alpha);
    }

    #[test]
    fn malformed_optional_value_is_not_defaulted() {
        let err = UpscaleSettings::from_store(&store(&[("tilesize", "512"), ("alpha", "maybe")]))
            .expect_err("bad alpha");
        assert!(matches!(err, PipelineError::Config { ref key, .. } if key == "alpha"));
    }

    #[test]
    fn app_config_store_round_trips_through_settings() {
        let settings = UpscaleSettings::from_store(&AppConfig::first_run()).expect("settings");
        assert_eq!(settings.tile_limit, RECOMMENDED_TILESIZE);
        assert_eq!(settings.output, OutputSettings::default());
        assert_eq!(settings.overwrite, OverwritePolicy::Keep);
        assert_eq!(
            settings.tiling_options(PreviewMode::Cutout).overlap,
            DEFAULT_TILE_OVERLAP
        );
    }

    #[test]
    fn backend_respects_use_cpu() {
        let mut cfg = AppConfig::default();
        cfg.upscale.backend = "tensorrt".to_string();
        assert_eq!(cfg.inference_backend(), InferenceBackend::Tensorrt);
        cfg.upscale.use_cpu = true;
        assert_eq!(cfg.inference_backend(), InferenceBackend::Cpu);
    }
}

//! ONNX Runtime implementation of [`InferenceService`].
//!
//! Supports both FP32 models (e.g. Real-ESRGAN, value range 0–255) and
//! FP16 models (value range 0–1). Sessions are loaded lazily and cached per
//! model file.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{s, Array4, ArrayD, ArrayView4, Ix4};
use ort::{session::Session, value::Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::InferenceService;
use crate::backend::{build_session, InferenceBackend, SessionConfig};
use crate::plan::ModelRef;
use crate::types::{ColorModel, ImageBuffer};

/// Model requires spatial dimensions to be multiples of this.
const PAD_ALIGN: usize = 4;

/// Edge of the gray square used to measure a model's scale factor.
const SCALE_SAMPLE_SIZE: u32 = 16;

/// Pixel value range a model consumes and produces.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueRange {
    /// 0–1 for FP16 models, 0–255 for FP32 models.
    #[default]
    Auto,
    Unit,
    Byte,
}

impl ValueRange {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "unit" | "0-1" => Self::Unit,
            "byte" | "0-255" => Self::Byte,
            _ => Self::Auto,
        }
    }

    fn max_value(self, is_fp16: bool) -> f32 {
        match self {
            Self::Auto if is_fp16 => 1.0,
            Self::Auto => 255.0,
            Self::Unit => 1.0,
            Self::Byte => 255.0,
        }
    }
}

struct LoadedModel {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    is_fp16: bool,
}

pub struct OnnxInferenceService {
    backend: InferenceBackend,
    trt_cache_dir: Option<PathBuf>,
    value_range: ValueRange,
    max_concurrency: usize,
    sessions: DashMap<PathBuf, Arc<LoadedModel>>,
    scales: DashMap<PathBuf, u32>,
}

impl OnnxInferenceService {
    pub fn new(backend: InferenceBackend) -> Self {
        Self {
            backend,
            trt_cache_dir: None,
            value_range: ValueRange::Auto,
            max_concurrency: 1,
            sessions: DashMap::new(),
            scales: DashMap::new(),
        }
    }

    pub fn with_trt_cache_dir(mut self, dir: PathBuf) -> Self {
        self.trt_cache_dir = Some(dir);
        self
    }

    pub fn with_value_range(mut self, value_range: ValueRange) -> Self {
        self.value_range = value_range;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn backend(&self) -> InferenceBackend {
        self.backend
    }

    pub fn loaded_models(&self) -> usize {
        self.sessions.len()
    }

    /// Drops every cached session, releasing device memory.
    pub fn unload_all(&self) {
        self.sessions.clear();
    }

    fn load(&self, model: &ModelRef) -> Result<Arc<LoadedModel>> {
        if let Some(loaded) = self.sessions.get(&model.path) {
            return Ok(Arc::clone(loaded.value()));
        }

        info!(
            model = %model.name,
            path = %model.path.display(),
            backend = %self.backend,
            "Loading ONNX super-resolution model"
        );

        let session = build_session(&SessionConfig {
            model_path: &model.path,
            backend: self.backend,
            trt_cache_dir: self.trt_cache_dir.as_deref(),
        })?;

        let input_name = session
            .inputs()
            .first()
            .map(|input| input.name().to_string())
            .context("model declares no inputs")?;
        let output_name = session
            .outputs()
            .first()
            .map(|output| output.name().to_string())
            .context("model declares no outputs")?;
        let is_fp16 = match session.inputs()[0].dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };

        debug!(%input_name, %output_name, is_fp16, "Detected model IO");

        let loaded = Arc::new(LoadedModel {
            session: Mutex::new(session),
            input_name,
            output_name,
            is_fp16,
        });
        let entry = self.sessions.entry(model.path.clone()).or_insert(loaded);
        Ok(Arc::clone(entry.value()))
    }

    /// Runs `tile` through `loaded`, returning the output and the measured
    /// scale factor.
    fn infer(&self, loaded: &LoadedModel, tile: &ImageBuffer) -> Result<(ImageBuffer, u32)> {
        let rgb = tile.clone().into_color_image();
        if rgb.color() != ColorModel::Rgb {
            bail!("expected an RGB tile, got {:?}", rgb.color());
        }
        let h = rgb.height() as usize;
        let w = rgb.width() as usize;
        let max_value = self.value_range.max_value(loaded.is_fp16);

        let padded = pad_nchw(&image_to_nchw(&rgb, max_value)?, h, w);
        let padded_h = padded.shape()[2];
        let padded_w = padded.shape()[3];

        let output = {
            let mut session = loaded.session.lock().unwrap_or_else(|e| e.into_inner());
            if loaded.is_fp16 {
                run_fp16_inference(&mut session, padded, &loaded.input_name, &loaded.output_name)?
            } else {
                run_fp32_inference(&mut session, padded, &loaded.input_name, &loaded.output_name)?
            }
        };

        let shape = output.shape().to_vec();
        if shape.len() != 4 || shape[1] < 3 {
            bail!("unexpected model output shape {shape:?}");
        }
        if shape[2] % padded_h != 0 || shape[2] / padded_h == 0 {
            bail!("output height {} is not a multiple of input height {padded_h}", shape[2]);
        }
        let scale = shape[2] / padded_h;
        if shape[3] != padded_w * scale {
            bail!(
                "output width {} does not match {scale}x input width {padded_w}",
                shape[3]
            );
        }

        let out_h = h * scale;
        let out_w = w * scale;
        let cropped = output
            .slice(s![.., ..3, ..out_h, ..out_w])
            .into_dimensionality::<Ix4>()?;
        let data = nchw_to_rgb(cropped, max_value);
        let image = ImageBuffer::new(out_w as u32, out_h as u32, ColorModel::Rgb, data)?;
        Ok((image, scale as u32))
    }
}

impl InferenceService for OnnxInferenceService {
    fn run_model(&self, tile: &ImageBuffer, model: &ModelRef) -> Result<ImageBuffer> {
        let loaded = self.load(model)?;
        let (output, scale) = self
            .infer(&loaded, tile)
            .with_context(|| format!("inference with {} failed", model.name))?;
        self.scales.insert(model.path.clone(), scale);
        Ok(output)
    }

    fn scale_factor(&self, model: &ModelRef) -> Result<u32> {
        if let Some(scale) = self.scales.get(&model.path) {
            return Ok(*scale);
        }

        let loaded = self.load(model)?;
        let sample = ImageBuffer::filled(
            SCALE_SAMPLE_SIZE,
            SCALE_SAMPLE_SIZE,
            ColorModel::Rgb,
            &[128, 128, 128],
        )?;
        let (_, scale) = self
            .infer(&loaded, &sample)
            .with_context(|| format!("measuring scale of {} failed", model.name))?;
        debug!(model = %model.name, scale, "Measured model scale factor");
        self.scales.insert(model.path.clone(), scale);
        Ok(scale)
    }

    fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }
}

/// Interleaved RGB bytes → NCHW `[1,3,H,W]` float32 in `0..=max_value`.
fn image_to_nchw(image: &ImageBuffer, max_value: f32) -> Result<Array4<f32>> {
    let h = image.height() as usize;
    let w = image.width() as usize;
    let data = image.data();
    if data.len() != h * w * 3 {
        bail!(
            "Data length mismatch: expected {} ({}x{}x3), got {}",
            h * w * 3,
            h,
            w,
            data.len()
        );
    }

    let factor = max_value / 255.0;
    let mut nchw = Array4::<f32>::zeros((1, 3, h, w));
    for y in 0..h {
        for x in 0..w {
            let src = (y * w + x) * 3;
            for c in 0..3 {
                nchw[[0, c, y, x]] = data[src + c] as f32 * factor;
            }
        }
    }
    Ok(nchw)
}

/// Reflection-pad NCHW array so H and W are multiples of [`PAD_ALIGN`].
fn pad_nchw(arr: &Array4<f32>, h: usize, w: usize) -> Array4<f32> {
    let pad_h = (PAD_ALIGN - (h % PAD_ALIGN)) % PAD_ALIGN;
    let pad_w = (PAD_ALIGN - (w % PAD_ALIGN)) % PAD_ALIGN;

    if pad_h == 0 && pad_w == 0 {
        return arr.clone();
    }

    let new_h = h + pad_h;
    let new_w = w + pad_w;
    let mut padded = Array4::<f32>::zeros((1, 3, new_h, new_w));

    padded
        .slice_mut(s![.., .., ..h, ..w])
        .assign(&arr.slice(s![.., .., ..h, ..w]));

    for y in 0..pad_h {
        let src_y = h - 1 - y.min(h - 1);
        for c in 0..3 {
            for x in 0..w {
                padded[[0, c, h + y, x]] = arr[[0, c, src_y, x]];
            }
        }
    }

    for x in 0..pad_w {
        let src_x = w - 1 - x.min(w - 1);
        for c in 0..3 {
            for y in 0..new_h {
                let src_y = if y < h { y } else { h - 1 - (y - h).min(h - 1) };
                padded[[0, c, y, w + x]] = arr[[0, c, src_y, src_x]];
            }
        }
    }

    padded
}

/// NCHW float32 in `0..=max_value` → interleaved RGB u8, clamped.
fn nchw_to_rgb(arr: ArrayView4<'_, f32>, max_value: f32) -> Vec<u8> {
    let (_, _, h, w) = arr.dim();
    let factor = 255.0 / max_value;
    let mut rgb = vec![0u8; h * w * 3];
    for y in 0..h {
        for x in 0..w {
            let dst = (y * w + x) * 3;
            for c in 0..3 {
                rgb[dst + c] = (arr[[0, c, y, x]] * factor).round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    rgb
}

fn run_fp32_inference(
    session: &mut Session,
    input: Array4<f32>,
    input_name: &str,
    output_name: &str,
) -> Result<ArrayD<f32>> {
    let input_tensor = Tensor::from_array(input)?;
    let outputs = session.run(ort::inputs![input_name => &input_tensor])?;
    let output_view = outputs[output_name].try_extract_array::<f32>()?;
    Ok(output_view.to_owned())
}

fn run_fp16_inference(
    session: &mut Session,
    input: Array4<f32>,
    input_name: &str,
    output_name: &str,
) -> Result<ArrayD<f32>> {
    let shape: Vec<usize> = input.shape().to_vec();
    let f32_slice = input
        .as_slice()
        .context("input must be contiguous for f16 conversion")?;
    let mut fp16_data = vec![f16::ZERO; f32_slice.len()];
    fp16_data.convert_from_f32_slice(f32_slice);

    let fp16_array = ArrayD::from_shape_vec(shape, fp16_data)?;
    let input_tensor = Tensor::from_array(fp16_array)?;
    let outputs = session.run(ort::inputs![input_name => &input_tensor])?;
    let output_view = outputs[output_name].try_extract_array::<f16>()?;

    let fp16_owned = output_view.as_standard_layout().into_owned();
    let fp16_slice = fp16_owned
        .as_slice()
        .context("output must be contiguous after standard layout")?;
    let mut f32_data = vec![0.0f32; fp16_slice.len()];
    fp16_slice.convert_to_f32_slice(&mut f32_data);

    Ok(ArrayD::from_shape_vec(output_view.shape().to_vec(), f32_data)?)
}

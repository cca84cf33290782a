//! Format Stage: decodes arbitrary inputs into the 8-bit working format,
//! flattens or splits alpha, and encodes final outputs.
//!
//! Working files are PNGs named `<original name>.png`, so `photo.jpg`
//! becomes `photo.jpg.png` and the original extension can be recovered
//! after upscaling.

use std::fmt;
use std::fs;
use std::io::{BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use image::codecs::bmp::BmpEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::codecs::tga::TgaEncoder;
use image::codecs::webp::WebPEncoder;
use image::{ExtendedColorType, ImageEncoder, ImageError, ImageReader};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{BatchReport, PipelineError};
use crate::types::{AlphaMask, ColorModel, ImageBuffer, Rgba8};

/// Largest edge accepted for interactive previews.
pub const MAX_PREVIEW_DIMENSION: u32 = 4096;

pub const WORKING_EXTENSION: &str = "png";

/// Encoding used for intermediate files in the scratch directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkingFormat {
    /// PNG with fast compression, used between stages.
    #[default]
    PngFast,
    /// PNG with default compression.
    Png,
}

impl WorkingFormat {
    fn compression(self) -> CompressionType {
        match self {
            Self::PngFast => CompressionType::Fast,
            Self::Png => CompressionType::Default,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Png,
    Jpeg,
    Webp,
    Bmp,
    Tga,
    /// Re-encode to the source file's format when it is writable, PNG otherwise.
    SameAsSource,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Webp => "webp",
            Self::Bmp => "bmp",
            Self::Tga => "tga",
            Self::SameAsSource => "same",
        })
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(Self::Png),
            "jpg" | "jpeg" => Ok(Self::Jpeg),
            "webp" => Ok(Self::Webp),
            "bmp" => Ok(Self::Bmp),
            "tga" => Ok(Self::Tga),
            "same" | "same_as_source" | "source" => Ok(Self::SameAsSource),
            other => Err(format!("unknown output format '{other}'")),
        }
    }
}

impl OutputFormat {
    fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "webp" => Some(Self::Webp),
            "bmp" => Some(Self::Bmp),
            "tga" => Some(Self::Tga),
            _ => None,
        }
    }

    /// Concrete format for a file whose original extension was `source_ext`.
    pub fn resolve(self, source_ext: Option<&str>) -> Self {
        match self {
            Self::SameAsSource => source_ext
                .and_then(Self::from_extension)
                .unwrap_or(Self::Png),
            other => other,
        }
    }

    pub fn supports_alpha(self) -> bool {
        !matches!(self, Self::Jpeg | Self::Bmp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JpegExtension {
    #[default]
    Jpg,
    Jpeg,
}

impl FromStr for JpegExtension {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "jpg" => Ok(Self::Jpg),
            "jpeg" => Ok(Self::Jpeg),
            other => Err(format!("unknown jpeg extension '{other}'")),
        }
    }
}

/// How final results are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSettings {
    pub format: OutputFormat,
    pub jpeg_quality: u8,
    /// Stored for completeness; the WebP encoder is lossless.
    pub webp_quality: u8,
    pub jpeg_extension: JpegExtension,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            format: OutputFormat::Png,
            jpeg_quality: 95,
            webp_quality: 95,
            jpeg_extension: JpegExtension::Jpg,
        }
    }
}

impl OutputSettings {
    pub fn extension_for(&self, format: OutputFormat) -> &'static str {
        match format {
            OutputFormat::Png | OutputFormat::SameAsSource => "png",
            OutputFormat::Jpeg => match self.jpeg_extension {
                JpegExtension::Jpg => "jpg",
                JpegExtension::Jpeg => "jpeg",
            },
            OutputFormat::Webp => "webp",
            OutputFormat::Bmp => "bmp",
            OutputFormat::Tga => "tga",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizeOptions {
    pub working: WorkingFormat,
    /// Flatten transparency onto `background` instead of keeping a mask.
    pub strip_alpha: bool,
    pub background: Rgba8,
    /// Batch only: remove each source file once its working copy exists.
    pub delete_source: bool,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            working: WorkingFormat::PngFast,
            strip_alpha: true,
            background: Rgba8::BLACK,
            delete_source: true,
        }
    }
}

/// An image in working form: color data plus the alpha mask kept aside.
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub rgb: ImageBuffer,
    pub alpha: Option<AlphaMask>,
    pub original_extension: Option<String>,
}

impl NormalizedImage {
    pub fn dimensions(&self) -> (u32, u32) {
        self.rgb.dimensions()
    }

    /// Re-attaches the alpha mask, if any.
    pub fn into_composited(self) -> Result<ImageBuffer, PipelineError> {
        match self.alpha {
            Some(mask) => recomposite_alpha(&self.rgb, &mask),
            None => Ok(self.rgb),
        }
    }
}

/// Normalizes an already decoded buffer.
pub fn normalize_buffer(
    image: ImageBuffer,
    options: &NormalizeOptions,
    original_extension: Option<String>,
) -> Result<NormalizedImage, PipelineError> {
    let image = image.into_color_image();
    let (rgb, alpha) = if image.color().has_alpha() {
        if options.strip_alpha {
            (flatten_onto(&image, options.background)?, None)
        } else {
            let (rgb, mask) = split_alpha(&image)?;
            (rgb, Some(mask))
        }
    } else {
        (image, None)
    };

    Ok(NormalizedImage {
        rgb,
        alpha,
        original_extension,
    })
}

/// Decodes `bytes` (any supported encoding) and normalizes them. `path` is
/// used for error reporting and to remember the original extension.
pub fn normalize_bytes(
    bytes: &[u8],
    path: &Path,
    options: &NormalizeOptions,
) -> Result<NormalizedImage, PipelineError> {
    let decoded = decode_bytes(bytes, path)?;
    normalize_buffer(decoded, options, extension_of(path))
}

pub fn normalize_file(path: &Path, options: &NormalizeOptions) -> Result<NormalizedImage, PipelineError> {
    let bytes = fs::read(path)
        .map_err(|e| PipelineError::io(format!("reading {}", path.display()), e))?;
    normalize_bytes(&bytes, path, options)
}

pub fn decode_file(path: &Path) -> Result<ImageBuffer, PipelineError> {
    let bytes = fs::read(path)
        .map_err(|e| PipelineError::io(format!("reading {}", path.display()), e))?;
    decode_bytes(&bytes, path)
}

pub fn decode_bytes(bytes: &[u8], path: &Path) -> Result<ImageBuffer, PipelineError> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| PipelineError::io(format!("probing {}", path.display()), e))?;
    if reader.format().is_none() {
        return Err(PipelineError::UnsupportedFormat {
            path: path.to_path_buf(),
            message: "unrecognized image encoding".to_string(),
        });
    }
    let image = reader.decode().map_err(|e| map_image_error(path, e))?;
    ImageBuffer::from_dynamic(image)
}

/// Converts every file in `dir` into a working PNG next to it.
///
/// Files that fail to decode are recorded and skipped; the rest of the
/// batch continues. Returns the paths of the working files written.
pub fn normalize_dir(dir: &Path, options: &NormalizeOptions) -> Result<BatchReport<PathBuf>, PipelineError> {
    let mut report = BatchReport::default();
    for path in list_files(dir)? {
        match normalize_one_in_place(&path, options) {
            Ok(working) => {
                debug!(source = %path.display(), working = %working.display(), "normalized");
                report.push_ok(working);
            }
            Err(err) if err.is_per_item() => {
                warn!(path = %path.display(), error = %err, "skipping file that could not be normalized");
                report.push_failure(path, err);
            }
            Err(err) => return Err(err),
        }
    }
    Ok(report)
}

fn normalize_one_in_place(path: &Path, options: &NormalizeOptions) -> Result<PathBuf, PipelineError> {
    let normalized = normalize_file(path, options)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let target = path.with_file_name(working_file_name(&file_name));

    write_working(&normalized, &target, options.working)?;
    if options.delete_source && target != path {
        fs::remove_file(path)
            .map_err(|e| PipelineError::io(format!("removing {}", path.display()), e))?;
    }
    Ok(target)
}

/// Sorted list of regular files directly inside `dir`.
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let entries = fs::read_dir(dir)
        .map_err(|e| PipelineError::io(format!("listing {}", dir.display()), e))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| PipelineError::io(format!("listing {}", dir.display()), e))?;
        let path = entry.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Reads a working PNG back, splitting alpha into a mask.
pub fn load_working(path: &Path) -> Result<NormalizedImage, PipelineError> {
    let image = decode_file(path)?.into_color_image();
    let original_extension = path
        .file_name()
        .and_then(|n| original_name_from_working(&n.to_string_lossy()))
        .and_then(|name| extension_of(Path::new(&name)));

    let (rgb, alpha) = if image.color().has_alpha() {
        let (rgb, mask) = split_alpha(&image)?;
        (rgb, Some(mask))
    } else {
        (image, None)
    };
    Ok(NormalizedImage {
        rgb,
        alpha,
        original_extension,
    })
}

pub fn write_working(image: &NormalizedImage, path: &Path, format: WorkingFormat) -> Result<(), PipelineError> {
    let composited = image.clone().into_composited()?;
    write_png(&composited, path, format.compression())
}

/// Encodes `image` into `path` according to `settings`. Returns the
/// concrete format that was written.
pub fn encode_to_file(
    image: &ImageBuffer,
    path: &Path,
    format: OutputFormat,
    settings: &OutputSettings,
) -> Result<OutputFormat, PipelineError> {
    let format = format.resolve(extension_of(path).as_deref());
    let image = if format.supports_alpha() || !image.color().has_alpha() {
        image.clone()
    } else {
        flatten_onto(image, Rgba8::BLACK)?
    };

    let file = fs::File::create(path)
        .map_err(|e| PipelineError::io(format!("creating {}", path.display()), e))?;
    let mut writer = BufWriter::new(file);
    let (w, h) = image.dimensions();
    let result = match format {
        OutputFormat::Png | OutputFormat::SameAsSource => PngEncoder::new(&mut writer)
            .write_image(image.data(), w, h, color_type(&image)),
        OutputFormat::Jpeg => {
            let rgb = image.into_color_image();
            JpegEncoder::new_with_quality(&mut writer, settings.jpeg_quality.clamp(1, 100))
                .write_image(rgb.data(), w, h, color_type(&rgb))
        }
        OutputFormat::Webp => {
            let color = image.into_color_image();
            WebPEncoder::new_lossless(&mut writer).write_image(color.data(), w, h, color_type(&color))
        }
        OutputFormat::Bmp => BmpEncoder::new(&mut writer).write_image(image.data(), w, h, color_type(&image)),
        OutputFormat::Tga => TgaEncoder::new(&mut writer).write_image(image.data(), w, h, color_type(&image)),
    };
    result.map_err(|e| map_image_error(path, e))?;
    writer
        .flush()
        .map_err(|e| PipelineError::io(format!("writing {}", path.display()), e))?;
    Ok(format)
}

fn write_png(image: &ImageBuffer, path: &Path, compression: CompressionType) -> Result<(), PipelineError> {
    let file = fs::File::create(path)
        .map_err(|e| PipelineError::io(format!("creating {}", path.display()), e))?;
    let mut writer = BufWriter::new(file);
    let (w, h) = image.dimensions();
    PngEncoder::new_with_quality(&mut writer, compression, FilterType::Adaptive)
        .write_image(image.data(), w, h, color_type(image))
        .map_err(|e| map_image_error(path, e))?;
    writer
        .flush()
        .map_err(|e| PipelineError::io(format!("writing {}", path.display()), e))
}

fn color_type(image: &ImageBuffer) -> ExtendedColorType {
    match image.color() {
        ColorModel::Gray => ExtendedColorType::L8,
        ColorModel::Rgb => ExtendedColorType::Rgb8,
        ColorModel::Rgba => ExtendedColorType::Rgba8,
    }
}

fn map_image_error(path: &Path, err: ImageError) -> PipelineError {
    match err {
        ImageError::IoError(source) => PipelineError::io(format!("accessing {}", path.display()), source),
        ImageError::Unsupported(e) => PipelineError::UnsupportedFormat {
            path: path.to_path_buf(),
            message: e.to_string(),
        },
        other => PipelineError::Decode {
            path: path.to_path_buf(),
            message: other.to_string(),
        },
    }
}

/// Composites an RGBA buffer onto an opaque background color.
pub fn flatten_onto(image: &ImageBuffer, background: Rgba8) -> Result<ImageBuffer, PipelineError> {
    if image.color() != ColorModel::Rgba {
        return Ok(image.clone().into_color_image());
    }
    let bg = [background.r as u32, background.g as u32, background.b as u32];
    let mut out = Vec::with_capacity(image.data().len() / 4 * 3);
    for px in image.data().chunks_exact(4) {
        let a = px[3] as u32;
        for c in 0..3 {
            out.push(((px[c] as u32 * a + bg[c] * (255 - a) + 127) / 255) as u8);
        }
    }
    ImageBuffer::new(image.width(), image.height(), ColorModel::Rgb, out)
}

/// Splits an RGBA buffer into RGB and a single-channel alpha mask.
pub fn split_alpha(image: &ImageBuffer) -> Result<(ImageBuffer, ImageBuffer), PipelineError> {
    if image.color() != ColorModel::Rgba {
        return Err(PipelineError::invalid_image("split_alpha expects an RGBA buffer"));
    }
    let pixels = image.data().len() / 4;
    let mut rgb = Vec::with_capacity(pixels * 3);
    let mut alpha = Vec::with_capacity(pixels);
    for px in image.data().chunks_exact(4) {
        rgb.extend_from_slice(&px[..3]);
        alpha.push(px[3]);
    }
    let (w, h) = image.dimensions();
    Ok((
        ImageBuffer::new(w, h, ColorModel::Rgb, rgb)?,
        ImageBuffer::new(w, h, ColorModel::Gray, alpha)?,
    ))
}

pub fn recomposite_alpha(rgb: &ImageBuffer, mask: &ImageBuffer) -> Result<ImageBuffer, PipelineError> {
    if rgb.dimensions() != mask.dimensions() {
        return Err(PipelineError::invalid_image(format!(
            "alpha mask is {}x{} but color data is {}x{}",
            mask.width(),
            mask.height(),
            rgb.width(),
            rgb.height()
        )));
    }
    if rgb.color() != ColorModel::Rgb || mask.color() != ColorModel::Gray {
        return Err(PipelineError::invalid_image(
            "recomposite expects RGB color data and a gray mask",
        ));
    }
    let mut out = Vec::with_capacity(mask.data().len() * 4);
    for (px, &a) in rgb.data().chunks_exact(3).zip(mask.data()) {
        out.extend_from_slice(px);
        out.push(a);
    }
    ImageBuffer::new(rgb.width(), rgb.height(), ColorModel::Rgba, out)
}

/// Resizes a mask with a triangle filter. Used for alpha, which does not go
/// through the model.
pub fn resize_mask(mask: &ImageBuffer, width: u32, height: u32) -> Result<ImageBuffer, PipelineError> {
    let gray = image::GrayImage::from_raw(mask.width(), mask.height(), mask.data().to_vec())
        .ok_or_else(|| PipelineError::invalid_image("alpha mask is not a gray buffer"))?;
    let resized = image::imageops::resize(&gray, width, height, image::imageops::FilterType::Triangle);
    ImageBuffer::new(width, height, ColorModel::Gray, resized.into_raw())
}

pub fn working_file_name(original: &str) -> String {
    format!("{original}.{WORKING_EXTENSION}")
}

/// Inverse of [`working_file_name`]. `None` when the name carries no
/// original extension underneath the working one.
pub fn original_name_from_working(name: &str) -> Option<String> {
    let stem = name.strip_suffix(&format!(".{WORKING_EXTENSION}"))?;
    Path::new(stem).extension()?;
    Some(stem.to_string())
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_ascii_lowercase())
}

/// Rejects images too large for an interactive preview.
pub fn validate_preview_source(path: &Path, width: u32, height: u32) -> Result<(), PipelineError> {
    if width > MAX_PREVIEW_DIMENSION || height > MAX_PREVIEW_DIMENSION {
        return Err(PipelineError::UnsupportedFormat {
            path: path.to_path_buf(),
            message: format!(
                "{width}x{height} exceeds the {MAX_PREVIEW_DIMENSION}px preview limit"
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgba(width: u32, height: u32, alpha: u8) -> ImageBuffer {
        ImageBuffer::filled(width, height, ColorModel::Rgba, &[200, 100, 50, alpha])
            .expect("buffer")
    }

    #[test]
    fn flatten_blends_with_background() {
        let bg: Rgba8 = "0000FFFF".parse().expect("color");
        let half = flatten_onto(&rgba(1, 1, 128), bg).expect("flatten");
        assert_eq!(half.color(), ColorModel::Rgb);
        assert_eq!(half.pixel(0, 0), &[100, 50, 152]);

        let opaque = flatten_onto(&rgba(1, 1, 255), bg).expect("flatten");
        assert_eq!(opaque.pixel(0, 0), &[200, 100, 50]);
    }

    #[test]
    fn split_and_recomposite_restore_the_pixels() {
        let src = rgba(3, 2, 77);
        let (rgb, mask) = split_alpha(&src).expect("split");
        assert_eq!(mask.color(), ColorModel::Gray);
        assert_eq!(mask.pixel(2, 1), &[77]);
        let back = recomposite_alpha(&rgb, &mask).expect("recomposite");
        assert_eq!(back, src);
    }

    #[test]
    fn recomposite_rejects_mismatched_mask() {
        let rgb = ImageBuffer::filled(4, 4, ColorModel::Rgb, &[0, 0, 0]).expect("rgb");
        let mask = ImageBuffer::filled(2, 2, ColorModel::Gray, &[255]).expect("mask");
        assert!(recomposite_alpha(&rgb, &mask).is_err());
    }

    #[test]
    fn normalize_keeps_mask_when_alpha_is_wanted() {
        let options = NormalizeOptions {
            strip_alpha: false,
            ..NormalizeOptions::default()
        };
        let normalized = normalize_buffer(rgba(2, 2, 10), &options, None).expect("normalize");
        assert_eq!(normalized.rgb.color(), ColorModel::Rgb);
        assert_eq!(normalized.alpha.as_ref().map(|m| m.pixel(0, 0)[0]), Some(10));
    }

    #[test]
    fn gray_input_becomes_rgb() {
        let gray = ImageBuffer::filled(2, 2, ColorModel::Gray, &[9]).expect("gray");
        let normalized = normalize_buffer(gray, &NormalizeOptions::default(), None).expect("normalize");
        assert_eq!(normalized.rgb.pixel(1, 1), &[9, 9, 9]);
        assert!(normalized.alpha.is_none());
    }

    #[test]
    fn working_names_are_reversible() {
        assert_eq!(working_file_name("photo.jpg"), "photo.jpg.png");
        assert_eq!(
            original_name_from_working("photo.jpg.png").as_deref(),
            Some("photo.jpg")
        );
        assert_eq!(original_name_from_working("photo.png"), None);
        assert_eq!(original_name_from_working("photo.jpg"), None);
    }

    #[test]
    fn normalize_dir_collects_per_file_failures() {
        let dir = tempfile::tempdir().expect("tempdir");
        let good = ImageBuffer::filled(4, 3, ColorModel::Rgb, &[1, 2, 3]).expect("good");
        encode_to_file(&good, &dir.path().join("a.bmp"), OutputFormat::Bmp, &OutputSettings::default())
            .expect("write bmp");
        fs::write(dir.path().join("b.png"), b"definitely not a png").expect("write junk");

        let report = normalize_dir(dir.path(), &NormalizeOptions::default()).expect("batch");
        assert_eq!(report.succeeded, vec![dir.path().join("a.bmp.png")]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, dir.path().join("b.png"));
        assert!(!dir.path().join("a.bmp").exists(), "source removed");

        let loaded = load_working(&dir.path().join("a.bmp.png")).expect("load");
        assert_eq!(loaded.dimensions(), (4, 3));
        assert_eq!(loaded.original_extension.as_deref(), Some("bmp"));
        assert_eq!(loaded.rgb.pixel(3, 2), &[1, 2, 3]);
    }

    #[test]
    fn working_png_carries_alpha_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("x.tga.png");
        let options = NormalizeOptions {
            strip_alpha: false,
            ..NormalizeOptions::default()
        };
        let image = normalize_buffer(rgba(2, 2, 33), &options, Some("tga".into())).expect("norm");
        write_working(&image, &path, WorkingFormat::PngFast).expect("write");

        let loaded = load_working(&path).expect("load");
        assert_eq!(loaded.alpha.expect("mask").pixel(1, 1), &[33]);
        assert_eq!(loaded.original_extension.as_deref(), Some("tga"));
    }

    #[test]
    fn jpeg_output_drops_alpha() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.jpg");
        let written = encode_to_file(&rgba(8, 8, 255), &path, OutputFormat::Jpeg, &OutputSettings::default())
            .expect("encode");
        assert_eq!(written, OutputFormat::Jpeg);
        let decoded = decode_file(&path).expect("decode");
        assert_eq!(decoded.color(), ColorModel::Rgb);
    }

    #[test]
    fn same_as_source_falls_back_to_png() {
        assert_eq!(OutputFormat::SameAsSource.resolve(Some("jpeg")), OutputFormat::Jpeg);
        assert_eq!(OutputFormat::SameAsSource.resolve(Some("dds")), OutputFormat::Png);
        assert_eq!(OutputFormat::SameAsSource.resolve(None), OutputFormat::Png);
    }

    #[test]
    fn garbage_bytes_are_unsupported() {
        let err = normalize_bytes(b"hello", Path::new("x.bin"), &NormalizeOptions::default())
            .expect_err("garbage");
        assert!(err.is_per_item());
    }

    #[test]
    fn oversized_preview_is_rejected() {
        assert!(validate_preview_source(Path::new("a.png"), 4096, 4096).is_ok());
        assert!(matches!(
            validate_preview_source(Path::new("a.png"), 4097, 10),
            Err(PipelineError::UnsupportedFormat { .. })
        ));
    }
}

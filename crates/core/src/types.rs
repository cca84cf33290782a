use std::fmt;
use std::str::FromStr;

use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::geometry::Region;

/// Channel layout of an [`ImageBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorModel {
    Gray,
    Rgb,
    Rgba,
}

impl ColorModel {
    pub fn channels(self) -> usize {
        match self {
            Self::Gray => 1,
            Self::Rgb => 3,
            Self::Rgba => 4,
        }
    }

    pub fn from_channels(channels: usize) -> Option<Self> {
        match channels {
            1 => Some(Self::Gray),
            3 => Some(Self::Rgb),
            4 => Some(Self::Rgba),
            _ => None,
        }
    }

    pub fn has_alpha(self) -> bool {
        self == Self::Rgba
    }
}

/// Owned, interleaved 8-bit pixel data.
///
/// Stages never mutate a buffer they received; they produce a new one.
/// Sources with a higher bit depth are quantized to 8 bits by the format
/// stage.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageBuffer {
    data: Vec<u8>,
    width: u32,
    height: u32,
    color: ColorModel,
}

impl fmt::Debug for ImageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("color", &self.color)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl ImageBuffer {
    pub const BIT_DEPTH: u8 = 8;

    pub fn new(
        width: u32,
        height: u32,
        color: ColorModel,
        data: Vec<u8>,
    ) -> Result<Self, PipelineError> {
        if width == 0 || height == 0 {
            return Err(PipelineError::invalid_image(format!(
                "dimensions must be non-zero, got {width}x{height}"
            )));
        }

        let expected = width as usize * height as usize * color.channels();
        if data.len() != expected {
            return Err(PipelineError::invalid_image(format!(
                "data length mismatch: expected {expected} ({width}x{height}x{}), got {}",
                color.channels(),
                data.len()
            )));
        }

        Ok(Self {
            data,
            width,
            height,
            color,
        })
    }

    /// Buffer with every pixel set to `pixel`, one value per channel.
    pub fn filled(
        width: u32,
        height: u32,
        color: ColorModel,
        pixel: &[u8],
    ) -> Result<Self, PipelineError> {
        if pixel.len() != color.channels() {
            return Err(PipelineError::invalid_image(format!(
                "fill pixel has {} channels, {color:?} needs {}",
                pixel.len(),
                color.channels()
            )));
        }
        let count = width as usize * height as usize;
        Self::new(width, height, color, pixel.repeat(count))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn color(&self) -> ColorModel {
        self.color
    }

    pub fn channels(&self) -> usize {
        self.color.channels()
    }

    pub fn bit_depth(&self) -> u8 {
        Self::BIT_DEPTH
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn full_region(&self) -> Region {
        Region {
            x: 0,
            y: 0,
            width: self.width,
            height: self.height,
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let c = self.channels();
        let start = (y as usize * self.width as usize + x as usize) * c;
        &self.data[start..start + c]
    }

    fn row_bytes(&self) -> usize {
        self.width as usize * self.channels()
    }

    /// Copies `region` out into a new buffer. The region is clamped to the
    /// image; an empty intersection is an error.
    pub fn crop(&self, region: Region) -> Result<Self, PipelineError> {
        let region = region.clamp_to(self.width, self.height);
        if region.is_empty() {
            return Err(PipelineError::invalid_image(format!(
                "crop region {region} does not intersect {}x{} image",
                self.width, self.height
            )));
        }

        let c = self.channels();
        let src_stride = self.row_bytes();
        let dst_stride = region.width as usize * c;
        let mut out = Vec::with_capacity(dst_stride * region.height as usize);
        for row in region.y..region.bottom() {
            let start = row as usize * src_stride + region.x as usize * c;
            out.extend_from_slice(&self.data[start..start + dst_stride]);
        }

        Self::new(region.width, region.height, self.color, out)
    }

    /// Returns a copy of `self` with `src` drawn at (`x`, `y`). Pixels of
    /// `src` falling outside `self` are dropped.
    pub fn with_pasted(&self, src: &ImageBuffer, x: u32, y: u32) -> Result<Self, PipelineError> {
        let mut out = self.clone();
        out.paste_in_place(src, x, y)?;
        Ok(out)
    }

    pub(crate) fn paste_in_place(
        &mut self,
        src: &ImageBuffer,
        x: u32,
        y: u32,
    ) -> Result<(), PipelineError> {
        if src.color != self.color {
            return Err(PipelineError::invalid_image(format!(
                "cannot paste {:?} pixels into {:?} buffer",
                src.color, self.color
            )));
        }
        if x >= self.width || y >= self.height {
            return Ok(());
        }

        let c = self.channels();
        let copy_w = src.width.min(self.width - x) as usize;
        let copy_h = src.height.min(self.height - y);
        let dst_stride = self.row_bytes();
        let src_stride = src.row_bytes();

        for row in 0..copy_h {
            let src_start = row as usize * src_stride;
            let dst_start = (y + row) as usize * dst_stride + x as usize * c;
            self.data[dst_start..dst_start + copy_w * c]
                .copy_from_slice(&src.data[src_start..src_start + copy_w * c]);
        }
        Ok(())
    }

    /// Nearest-neighbour upscale by an integer factor.
    pub fn scaled_nearest(&self, factor: u32) -> Result<Self, PipelineError> {
        if factor == 0 {
            return Err(PipelineError::invalid_image("scale factor must be at least 1"));
        }
        if factor == 1 {
            return Ok(self.clone());
        }

        let c = self.channels();
        let out_w = scale_dimension(self.width, factor)?;
        let out_h = scale_dimension(self.height, factor)?;
        let mut out = Vec::with_capacity(out_w as usize * out_h as usize * c);
        for oy in 0..out_h {
            let sy = oy / factor;
            for ox in 0..out_w {
                out.extend_from_slice(self.pixel(ox / factor, sy));
            }
        }
        Self::new(out_w, out_h, self.color, out)
    }

    pub fn from_dynamic(image: DynamicImage) -> Result<Self, PipelineError> {
        let (color, width, height, data) = match image {
            DynamicImage::ImageLuma8(img) => {
                let (w, h) = img.dimensions();
                (ColorModel::Gray, w, h, img.into_raw())
            }
            DynamicImage::ImageRgb8(img) => {
                let (w, h) = img.dimensions();
                (ColorModel::Rgb, w, h, img.into_raw())
            }
            DynamicImage::ImageRgba8(img) => {
                let (w, h) = img.dimensions();
                (ColorModel::Rgba, w, h, img.into_raw())
            }
            other if other.color().has_alpha() => {
                let img = other.to_rgba8();
                let (w, h) = img.dimensions();
                (ColorModel::Rgba, w, h, img.into_raw())
            }
            other if other.color().channel_count() <= 2 => {
                let img = other.to_luma8();
                let (w, h) = img.dimensions();
                (ColorModel::Gray, w, h, img.into_raw())
            }
            other => {
                let img = other.to_rgb8();
                let (w, h) = img.dimensions();
                (ColorModel::Rgb, w, h, img.into_raw())
            }
        };
        Self::new(width, height, color, data)
    }

    pub fn to_dynamic(&self) -> Result<DynamicImage, PipelineError> {
        let (w, h, data) = (self.width, self.height, self.data.clone());
        let dynamic = match self.color {
            ColorModel::Gray => GrayImage::from_raw(w, h, data).map(DynamicImage::ImageLuma8),
            ColorModel::Rgb => RgbImage::from_raw(w, h, data).map(DynamicImage::ImageRgb8),
            ColorModel::Rgba => RgbaImage::from_raw(w, h, data).map(DynamicImage::ImageRgba8),
        };
        dynamic.ok_or_else(|| PipelineError::invalid_image("buffer size does not match dimensions"))
    }

    /// Expands gray to RGB and leaves RGB/RGBA untouched.
    pub fn into_color_image(self) -> Self {
        if self.color != ColorModel::Gray {
            return self;
        }
        let data = self.data.iter().flat_map(|&v| [v, v, v]).collect();
        Self {
            data,
            width: self.width,
            height: self.height,
            color: ColorModel::Rgb,
        }
    }
}

/// 8-bit RGBA color, written as `RRGGBBAA` (or `RRGGBB`) hex in settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rgba8 {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba8 {
    pub const BLACK: Self = Self {
        r: 0,
        g: 0,
        b: 0,
        a: 255,
    };

    pub fn to_hex(self) -> String {
        format!("{:02X}{:02X}{:02X}{:02X}", self.r, self.g, self.b, self.a)
    }
}

impl Default for Rgba8 {
    fn default() -> Self {
        Self::BLACK
    }
}

impl fmt::Display for Rgba8 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Rgba8 {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.trim().trim_start_matches('#');
        if !(hex.len() == 6 || hex.len() == 8) || !hex.is_ascii() {
            return Err(format!("expected RRGGBB or RRGGBBAA hex, got '{s}'"));
        }
        let byte = |i: usize| {
            u8::from_str_radix(&hex[i..i + 2], 16).map_err(|e| format!("invalid hex '{s}': {e}"))
        };
        Ok(Self {
            r: byte(0)?,
            g: byte(2)?,
            b: byte(4)?,
            a: if hex.len() == 8 { byte(6)? } else { 255 },
        })
    }
}

/// Single-channel coverage mask kept aside while the color data is upscaled.
pub type AlphaMask = ImageBuffer;

/// `value * factor`, failing instead of wrapping on overflow.
pub fn scale_dimension(value: u32, factor: u32) -> Result<u32, PipelineError> {
    value.checked_mul(factor).ok_or_else(|| {
        PipelineError::invalid_image(format!("{value} scaled by {factor} overflows the pixel range"))
    })
}

/// Position of a tile inside its grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileIndex {
    pub ordinal: usize,
    pub column: u32,
    pub row: u32,
}

/// A slice of the working image handed to the inference service.
///
/// `input` is `interior` grown by the overlap margin (clamped to the image).
/// Only the `interior` part of the processed tile reaches the output.
#[derive(Debug, Clone)]
pub struct Tile {
    pub index: TileIndex,
    pub interior: Region,
    pub input: Region,
    pub buffer: ImageBuffer,
}

impl Tile {
    /// Offset of the interior inside the tile input, in source pixels.
    pub fn margin_offset(&self) -> (u32, u32) {
        (
            self.interior.x - self.input.x,
            self.interior.y - self.input.y,
        )
    }
}

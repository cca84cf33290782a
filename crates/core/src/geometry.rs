//! Viewport math: which source pixels are visible in a zoomed, scrolled
//! preview, and where an upscaled cutout lands when merged back.
//!
//! Everything here is pure and deterministic.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::types::scale_dimension;

/// Default scrollbar thickness in screen pixels.
pub const DEFAULT_SCROLLBAR_THICKNESS: u32 = 17;

/// Axis-aligned rectangle in source-image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Builds a region from possibly out-of-range values, clamping it into
    /// `source_width` x `source_height`. Extents are clamped first, then the
    /// origin is pulled back so the region stays inside the source.
    pub fn clamped(x: i64, y: i64, width: i64, height: i64, source_width: u32, source_height: u32) -> Self {
        let (x, width) = clamp_axis(x, width, source_width);
        let (y, height) = clamp_axis(y, height, source_height);
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Intersection with `[0, width) x [0, height)`.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let x = self.x.min(width);
        let y = self.y.min(height);
        Self {
            x,
            y,
            width: self.width.min(width - x),
            height: self.height.min(height - y),
        }
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn contains(&self, other: &Region) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    pub fn scaled(&self, factor: u32) -> Result<Self, PipelineError> {
        Ok(Self {
            x: scale_dimension(self.x, factor)?,
            y: scale_dimension(self.y, factor)?,
            width: scale_dimension(self.width, factor)?,
            height: scale_dimension(self.height, factor)?,
        })
    }

    /// Grows the region by `margin` on every side, clamped to the bounds.
    pub fn expanded(&self, margin: u32, bound_width: u32, bound_height: u32) -> Self {
        let x = self.x.saturating_sub(margin);
        let y = self.y.saturating_sub(margin);
        let right = self.right().saturating_add(margin).min(bound_width);
        let bottom = self.bottom().saturating_add(margin).min(bound_height);
        Self {
            x,
            y,
            width: right.saturating_sub(x),
            height: bottom.saturating_sub(y),
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

fn clamp_axis(origin: i64, extent: i64, bound: u32) -> (u32, u32) {
    let bound = bound as i64;
    let extent = extent.clamp(0, bound);
    let origin = origin.clamp(0, bound - extent);
    (origin as u32, extent as u32)
}

/// Zoom/scroll state of the interactive viewer. Owned by the UI; the
/// geometry code only reads it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewportState {
    /// 1.0 = 100%.
    pub zoom: f64,
    /// Scroll offset in screen pixels.
    pub scroll_x: f64,
    pub scroll_y: f64,
    /// Visible client area in screen pixels, scrollbars excluded.
    pub width: u32,
    pub height: u32,
}

impl ViewportState {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !self.zoom.is_finite() || self.zoom <= 0.0 {
            return Err(PipelineError::InvalidViewport {
                message: format!("zoom factor must be positive, got {}", self.zoom),
            });
        }
        if !self.scroll_x.is_finite() || !self.scroll_y.is_finite() {
            return Err(PipelineError::InvalidViewport {
                message: "scroll offset must be finite".to_string(),
            });
        }
        if self.width == 0 || self.height == 0 {
            return Err(PipelineError::InvalidViewport {
                message: format!("viewport is empty ({}x{})", self.width, self.height),
            });
        }
        Ok(())
    }

    /// Zoom as an integer percentage, the way the viewer labels it.
    pub fn zoom_percent(&self) -> u32 {
        (self.zoom * 100.0).round().max(0.0) as u32
    }
}

/// Scrollbar chrome thickness in screen pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrollbarMetrics {
    /// Width of the vertical scrollbar; eats into the horizontal extent.
    pub vertical_width: u32,
    /// Height of the horizontal scrollbar; eats into the vertical extent.
    pub horizontal_height: u32,
}

impl Default for ScrollbarMetrics {
    fn default() -> Self {
        Self {
            vertical_width: DEFAULT_SCROLLBAR_THICKNESS,
            horizontal_height: DEFAULT_SCROLLBAR_THICKNESS,
        }
    }
}

/// Output of [`compute_source_region`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CutoutGeometry {
    /// Source pixels to extract.
    pub region: Region,
    /// Scroll offset in source pixels, snapped to the region origin so the
    /// merged cutout covers exactly the pixels it was cropped from.
    pub offset_x: f64,
    pub offset_y: f64,
}

impl CutoutGeometry {
    /// Merge position of the cutout in an image upscaled by `scale`.
    pub fn scaled_offset(&self, scale: u32) -> Result<(u32, u32), PipelineError> {
        Ok((
            scale_dimension(self.region.x, scale)?,
            scale_dimension(self.region.y, scale)?,
        ))
    }
}

/// Converts the visible viewport into a source-pixel region.
///
/// Screen extents are divided by the zoom factor. On each axis where the
/// zoomed content is larger than the viewport, the scrollbar thickness (in
/// source pixels) is added to that axis' extent. The result is clamped to
/// the source bounds.
pub fn compute_source_region(
    viewport: &ViewportState,
    source_width: u32,
    source_height: u32,
    scrollbars: ScrollbarMetrics,
) -> Result<CutoutGeometry, PipelineError> {
    viewport.validate()?;
    if source_width == 0 || source_height == 0 {
        return Err(PipelineError::InvalidViewport {
            message: format!("source image is empty ({source_width}x{source_height})"),
        });
    }

    let zoom = viewport.zoom;
    let scroll_x = viewport.scroll_x.max(0.0);
    let scroll_y = viewport.scroll_y.max(0.0);

    let mut width = (viewport.width as f64 / zoom).round() as i64;
    let mut height = (viewport.height as f64 / zoom).round() as i64;

    if source_width as f64 * zoom > viewport.width as f64 {
        width += (scrollbars.vertical_width as f64 / zoom).round() as i64;
    }
    if source_height as f64 * zoom > viewport.height as f64 {
        height += (scrollbars.horizontal_height as f64 / zoom).round() as i64;
    }

    let region = Region::clamped(
        (scroll_x / zoom).round() as i64,
        (scroll_y / zoom).round() as i64,
        width.max(1),
        height.max(1),
        source_width,
        source_height,
    );

    Ok(CutoutGeometry {
        region,
        offset_x: f64::from(region.x),
        offset_y: f64::from(region.y),
    })
}

//! Preview Pipeline: upscales either the visible cutout of the viewer or a
//! snapshot of the whole image, and merges the result back into the view.
//!
//! Stages run `Idle -> Preparing -> Extracting -> Upscaling -> Merging ->
//! Done`; any failure or cancellation moves the run to `Aborted`, which
//! clears the preview scratch directories.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::UpscaleSettings;
use crate::error::PipelineError;
use crate::format::{
    decode_file, encode_to_file, normalize_buffer, validate_preview_source, working_file_name,
    write_working, NormalizedImage, OutputFormat, OutputSettings,
};
use crate::geometry::{compute_source_region, CutoutGeometry, Region, ScrollbarMetrics, ViewportState};
use crate::inference::InferenceService;
use crate::plan::ModelPlan;
use crate::progress::{RunControl, Stage};
use crate::tiling::{plan_scale, PreviewMode, TilingUpscaler};
use crate::types::ImageBuffer;
use crate::workspace::{copy_into, Workspace};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PreviewKind {
    /// Upscale only what the viewport shows.
    Cutout {
        viewport: ViewportState,
        scrollbars: ScrollbarMetrics,
    },
    FullImage,
}

impl PreviewKind {
    pub fn viewport(&self) -> Option<ViewportState> {
        match self {
            Self::Cutout { viewport, .. } => Some(*viewport),
            Self::FullImage => None,
        }
    }

    fn tiling_mode(&self) -> PreviewMode {
        match self {
            Self::Cutout { .. } => PreviewMode::Cutout,
            Self::FullImage => PreviewMode::FullImage,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreviewRequest {
    pub source: PathBuf,
    pub kind: PreviewKind,
    /// What the viewer shows right now; kept as the restore point.
    pub current_view: Option<Arc<ImageBuffer>>,
}

impl PreviewRequest {
    pub fn cutout(source: impl Into<PathBuf>, viewport: ViewportState) -> Self {
        Self {
            source: source.into(),
            kind: PreviewKind::Cutout {
                viewport,
                scrollbars: ScrollbarMetrics::default(),
            },
            current_view: None,
        }
    }

    pub fn full_image(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            kind: PreviewKind::FullImage,
            current_view: None,
        }
    }
}

/// Viewer state captured before a preview starts, handed back on abort.
#[derive(Debug, Clone, Default)]
pub struct PreviewRestorePoint {
    pub image: Option<Arc<ImageBuffer>>,
    pub viewport: Option<ViewportState>,
}

/// Status texts shown next to the preview. "Original" values are the
/// displayed ones divided by the current scale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewLabels {
    pub zoom: String,
    pub image_size: String,
    pub cutout_size: String,
}

impl PreviewLabels {
    pub fn compute(zoom: f64, image_size: (u32, u32), cutout_size: (u32, u32), scale: u32) -> Self {
        let scale = scale.max(1);
        let describe = |label: &str, (w, h): (u32, u32)| {
            if scale > 1 {
                format!("{label}: {w}x{h} (Original: {}x{})", w / scale, h / scale)
            } else {
                format!("{label}: {w}x{h}")
            }
        };
        Self {
            zoom: format!("Zoom: {}%", (zoom * 100.0).round().max(0.0) as u32),
            image_size: describe("Image", image_size),
            cutout_size: describe("Cutout", cutout_size),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreviewResult {
    /// The image the viewer should display.
    pub merged: ImageBuffer,
    /// The upscaled cutout (or whole image) on its own.
    pub upscaled: ImageBuffer,
    /// Source pixels that were upscaled.
    pub region: Region,
    /// Where `upscaled` sits inside `merged`.
    pub offset: (u32, u32),
    pub scale: u32,
    pub labels: PreviewLabels,
    /// Encoded copy of `upscaled` in the preview output directory.
    pub output_path: PathBuf,
}

/// Places an upscaled cutout over the source image scaled to match.
pub struct PreviewMerger;

impl PreviewMerger {
    pub fn merge(
        source: &ImageBuffer,
        upscaled: &ImageBuffer,
        offset: (u32, u32),
        scale: u32,
    ) -> Result<ImageBuffer, PipelineError> {
        let base = source.scaled_nearest(scale)?;
        base.with_pasted(upscaled, offset.0, offset.1)
    }
}

pub struct PreviewPipeline<'a> {
    service: &'a dyn InferenceService,
    workspace: &'a Workspace,
    settings: &'a UpscaleSettings,
    stage: Stage,
    restore_point: Option<PreviewRestorePoint>,
}

struct Extracted {
    /// Normalized full source, the merge background.
    base: ImageBuffer,
    cutout: NormalizedImage,
    geometry: Option<CutoutGeometry>,
}

impl<'a> PreviewPipeline<'a> {
    pub fn new(service: &'a dyn InferenceService, workspace: &'a Workspace, settings: &'a UpscaleSettings) -> Self {
        Self {
            service,
            workspace,
            settings,
            stage: Stage::Idle,
            restore_point: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn take_restore_point(&mut self) -> Option<PreviewRestorePoint> {
        self.restore_point.take()
    }

    /// Runs every stage. On error the run is left `Aborted` with the
    /// preview scratch directories cleared.
    pub fn run(
        &mut self,
        request: &PreviewRequest,
        plan: &ModelPlan,
        control: &RunControl,
    ) -> Result<PreviewResult, PipelineError> {
        match self.run_stages(request, plan, control) {
            Ok(result) => {
                self.enter(Stage::Done, control);
                Ok(result)
            }
            Err(err) => {
                self.abort(&err, control);
                Err(err)
            }
        }
    }

    fn run_stages(
        &mut self,
        request: &PreviewRequest,
        plan: &ModelPlan,
        control: &RunControl,
    ) -> Result<PreviewResult, PipelineError> {
        self.enter(Stage::Preparing, control);
        self.workspace.ensure_dirs()?;
        self.workspace.clear_preview()?;
        self.restore_point = Some(PreviewRestorePoint {
            image: request.current_view.clone(),
            viewport: request.kind.viewport(),
        });
        control.reporter.progress(5.0, "Preparing preview");
        control.check_cancelled()?;

        self.enter(Stage::Extracting, control);
        let extracted = self.extract(request)?;
        control.reporter.progress(10.0, "Cutout extracted");
        control.check_cancelled()?;

        self.enter(Stage::Upscaling, control);
        let scale = plan_scale(self.service, plan)?;
        let control_band = control.with_reporter(control.reporter.band(10.0, 90.0));
        let upscaler = TilingUpscaler::new(self.service, self.settings.tiling_options(request.kind.tiling_mode()));
        let upscaled = upscaler.upscale_normalized(extracted.cutout, plan, &control_band)?;
        let output_path = self.write_output(&request.source, &upscaled)?;
        control.check_cancelled()?;

        self.enter(Stage::Merging, control);
        let (merged, offset, region) = match extracted.geometry {
            Some(geometry) => {
                let offset = geometry.scaled_offset(scale)?;
                let merged = PreviewMerger::merge(&extracted.base, &upscaled, offset, scale)?;
                (merged, offset, geometry.region)
            }
            None => (upscaled.clone(), (0, 0), extracted.base.full_region()),
        };

        let zoom = request.kind.viewport().map_or(1.0, |v| v.zoom);
        let labels = PreviewLabels::compute(zoom, merged.dimensions(), upscaled.dimensions(), scale);
        control.reporter.progress(100.0, "Preview ready");
        info!(region = %region, scale, "Preview merged");

        Ok(PreviewResult {
            merged,
            upscaled,
            region,
            offset,
            scale,
            labels,
            output_path,
        })
    }

    fn extract(&self, request: &PreviewRequest) -> Result<Extracted, PipelineError> {
        let source_path = match request.kind {
            PreviewKind::FullImage => copy_into(&request.source, &self.workspace.temp())?,
            PreviewKind::Cutout { .. } => request.source.clone(),
        };

        let decoded = decode_file(&source_path)?;
        let (width, height) = decoded.dimensions();
        validate_preview_source(&request.source, width, height)?;

        let extension = request
            .source
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase());
        let options = self.settings.normalize_options();
        let base = normalize_buffer(decoded, &options, extension.clone())?;

        let geometry = match request.kind {
            PreviewKind::Cutout { viewport, scrollbars } => {
                Some(compute_source_region(&viewport, width, height, scrollbars)?)
            }
            PreviewKind::FullImage => None,
        };

        let cutout = match &geometry {
            Some(g) => NormalizedImage {
                rgb: base.rgb.crop(g.region)?,
                alpha: base.alpha.as_ref().map(|mask| mask.crop(g.region)).transpose()?,
                original_extension: extension,
            },
            None => base.clone(),
        };
        debug!(
            source = %request.source.display(),
            region = %geometry.map_or(Region::new(0, 0, width, height), |g| g.region),
            "Extracted preview input"
        );

        let staged = self.workspace.preview().join(working_file_name(&file_name(&request.source)));
        write_working(&cutout, &staged, options.working)?;

        Ok(Extracted {
            base: base.into_composited()?,
            cutout,
            geometry,
        })
    }

    fn write_output(&self, source: &Path, upscaled: &ImageBuffer) -> Result<PathBuf, PipelineError> {
        let path = self
            .workspace
            .preview_out()
            .join(working_file_name(&file_name(source)));
        encode_to_file(upscaled, &path, OutputFormat::Png, &OutputSettings::default())?;
        Ok(path)
    }

    fn enter(&mut self, next: Stage, control: &RunControl) {
        if !self.stage.can_transition_to(next) {
            warn!(from = %self.stage, to = %next, "Unexpected preview stage transition");
        }
        debug!(stage = %next, "Preview stage");
        self.stage = next;
        control.reporter.stage(next);
    }

    fn abort(&mut self, err: &PipelineError, control: &RunControl) {
        match err {
            PipelineError::Cancelled => info!(stage = %self.stage, "Preview cancelled"),
            other => error!(stage = %self.stage, error = %other, "Preview aborted"),
        }
        self.enter(Stage::Aborted, control);
        if let Err(cleanup) = self.workspace.clear_preview() {
            warn!(error = %cleanup, "Failed to clear preview scratch directories");
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "preview".to_string())
}

//! Tiling Upscaler: splits an image into overlapping tiles, runs the model
//! plan on each tile and stitches the trimmed interiors back together.
//!
//! The tile limit bounds a tile's interior. Each tile is fed to the model
//! with up to `overlap` extra pixels of context on every inner edge; that
//! context is cropped away again before placement, so every output pixel
//! comes from exactly one tile interior.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::format::{recomposite_alpha, resize_mask, split_alpha, NormalizedImage};
use crate::geometry::Region;
use crate::inference::InferenceService;
use crate::plan::{ModelMode, ModelPlan, ModelRef};
use crate::progress::RunControl;
use crate::types::{scale_dimension, ColorModel, ImageBuffer, Tile, TileIndex};

/// Context pixels per side fed to the model around each tile interior.
pub const DEFAULT_TILE_OVERLAP: u32 = 16;

/// Who the upscale is for. Only changes progress granularity and whether
/// per-tile previews are published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewMode {
    /// Batch run: per-tile progress.
    #[default]
    None,
    /// Interactive cutout: start and end only.
    Cutout,
    /// Whole-image preview: per-tile progress plus tile previews.
    FullImage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilingOptions {
    pub tile_limit: u32,
    pub overlap: u32,
    pub alpha_aware: bool,
    pub mode: PreviewMode,
}

impl TilingOptions {
    pub fn new(tile_limit: u32) -> Self {
        Self {
            tile_limit,
            overlap: DEFAULT_TILE_OVERLAP,
            alpha_aware: false,
            mode: PreviewMode::None,
        }
    }
}

/// One cell of a [`TileGrid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSpec {
    pub index: TileIndex,
    /// Pixels this tile owns in the output.
    pub interior: Region,
    /// Pixels fed to the model: the interior plus overlap, clamped.
    pub input: Region,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileGrid {
    width: u32,
    height: u32,
    columns: u32,
    rows: u32,
    tiles: Vec<TileSpec>,
}

impl TileGrid {
    pub fn plan(width: u32, height: u32, tile_limit: u32, overlap: u32) -> Result<Self, PipelineError> {
        if tile_limit == 0 {
            return Err(PipelineError::config("tilesize", "tile size must be at least 1"));
        }
        if width == 0 || height == 0 {
            return Err(PipelineError::invalid_image(format!(
                "cannot tile an empty {width}x{height} image"
            )));
        }

        let xs = split_axis(width, tile_limit);
        let ys = split_axis(height, tile_limit);
        let mut tiles = Vec::with_capacity(xs.len() * ys.len());
        for (row, &(y, h)) in ys.iter().enumerate() {
            for (column, &(x, w)) in xs.iter().enumerate() {
                let interior = Region::new(x, y, w, h);
                tiles.push(TileSpec {
                    index: TileIndex {
                        ordinal: tiles.len(),
                        column: column as u32,
                        row: row as u32,
                    },
                    interior,
                    input: interior.expanded(overlap, width, height),
                });
            }
        }

        Ok(Self {
            width,
            height,
            columns: xs.len() as u32,
            rows: ys.len() as u32,
            tiles,
        })
    }

    pub fn tiles(&self) -> &[TileSpec] {
        &self.tiles
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn is_single(&self) -> bool {
        self.tiles.len() == 1
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.columns, self.rows)
    }

    pub fn extract(&self, image: &ImageBuffer, spec: &TileSpec) -> Result<Tile, PipelineError> {
        if image.dimensions() != (self.width, self.height) {
            return Err(PipelineError::invalid_image(format!(
                "grid planned for {}x{} but image is {}x{}",
                self.width,
                self.height,
                image.width(),
                image.height()
            )));
        }
        Ok(Tile {
            index: spec.index,
            interior: spec.interior,
            input: spec.input,
            buffer: image.crop(spec.input)?,
        })
    }
}

/// Splits `len` into the fewest segments no longer than `limit`, with sizes
/// differing by at most one.
fn split_axis(len: u32, limit: u32) -> Vec<(u32, u32)> {
    let count = len.div_ceil(limit);
    let base = len / count;
    let remainder = len % count;
    let mut start = 0;
    (0..count)
        .map(|i| {
            let size = base + u32::from(i < remainder);
            let segment = (start, size);
            start += size;
            segment
        })
        .collect()
}

/// Overall scale factor of `plan`, queried from the inference service.
pub fn plan_scale(service: &dyn InferenceService, plan: &ModelPlan) -> Result<u32, PipelineError> {
    let scales = plan
        .models()
        .map(|model| {
            service
                .scale_factor(model)
                .map_err(|err| inference_error(model, &err))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let scale = match plan.strategy() {
        ModelMode::Single => scales[0],
        ModelMode::Interpolate => {
            if scales[0] != scales[1] {
                return Err(PipelineError::IncompatibleScales {
                    first: scales[0],
                    second: scales[1],
                });
            }
            scales[0]
        }
        ModelMode::Chain => scale_dimension(scales[0], scales[1])?,
    };
    if scale == 0 {
        return Err(PipelineError::Inference {
            model: plan.describe(),
            message: "model reports a scale factor of 0".to_string(),
        });
    }
    Ok(scale)
}

fn inference_error(model: &ModelRef, err: &anyhow::Error) -> PipelineError {
    PipelineError::Inference {
        model: model.name.clone(),
        message: format!("{err:#}"),
    }
}

pub struct TilingUpscaler<'a> {
    service: &'a dyn InferenceService,
    options: TilingOptions,
}

impl<'a> TilingUpscaler<'a> {
    pub fn new(service: &'a dyn InferenceService, options: TilingOptions) -> Self {
        Self { service, options }
    }

    pub fn options(&self) -> &TilingOptions {
        &self.options
    }

    /// Upscales `image` with `plan`. RGBA input has its alpha upscaled
    /// separately when `alpha_aware` is set, and dropped otherwise.
    pub fn upscale(
        &self,
        image: ImageBuffer,
        plan: &ModelPlan,
        control: &RunControl,
    ) -> Result<ImageBuffer, PipelineError> {
        let normalized = if image.color() == ColorModel::Rgba {
            let (rgb, mask) = split_alpha(&image)?;
            NormalizedImage {
                rgb,
                alpha: Some(mask),
                original_extension: None,
            }
        } else {
            NormalizedImage {
                rgb: image.into_color_image(),
                alpha: None,
                original_extension: None,
            }
        };
        self.upscale_normalized(normalized, plan, control)
    }

    pub fn upscale_normalized(
        &self,
        image: NormalizedImage,
        plan: &ModelPlan,
        control: &RunControl,
    ) -> Result<ImageBuffer, PipelineError> {
        control.check_cancelled()?;
        let NormalizedImage { rgb, alpha, .. } = image;
        let rgb = rgb.into_color_image();
        let (width, height) = rgb.dimensions();

        let grid = TileGrid::plan(width, height, self.options.tile_limit, self.options.overlap)?;
        let scale = plan_scale(self.service, plan)?;
        scale_dimension(width, scale)?;
        scale_dimension(height, scale)?;
        let total = grid.len();

        info!(
            width,
            height,
            scale,
            tiles = total,
            plan = %plan.describe(),
            "Upscaling image"
        );
        control
            .reporter
            .progress(0.0, format!("Upscaling ({total} tile{})", if total == 1 { "" } else { "s" }));

        let merged = if grid.is_single() {
            let out = self.run_plan(&rgb, plan, scale)?;
            self.report_tile(control, 1, total, Region::new(0, 0, out.width(), out.height()), &out);
            out
        } else {
            self.run_tiles(&rgb, &grid, plan, scale, control)?
        };
        control.check_cancelled()?;

        let result = match (self.options.alpha_aware, alpha) {
            (true, Some(mask)) => {
                let mask = resize_mask(&mask, merged.width(), merged.height())?;
                recomposite_alpha(&merged, &mask)?
            }
            _ => merged,
        };

        control.reporter.progress(100.0, "Upscaling done");
        Ok(result)
    }

    fn run_tiles(
        &self,
        image: &ImageBuffer,
        grid: &TileGrid,
        plan: &ModelPlan,
        scale: u32,
        control: &RunControl,
    ) -> Result<ImageBuffer, PipelineError> {
        let total = grid.len();
        let (width, height) = image.dimensions();
        let mut output = ImageBuffer::filled(
            scale_dimension(width, scale)?,
            scale_dimension(height, scale)?,
            ColorModel::Rgb,
            &[0, 0, 0],
        )?;
        let workers = self.service.max_concurrency().clamp(1, total);

        if workers == 1 {
            for (done, spec) in grid.tiles().iter().enumerate() {
                let trimmed = self.process_tile(image, grid, spec, plan, scale, control)?;
                let placed = spec.interior.scaled(scale)?;
                self.report_tile(control, done + 1, total, placed, &trimmed);
                output.paste_in_place(&trimmed, placed.x, placed.y)?;
            }
            return Ok(output);
        }

        debug!(workers, tiles = total, "Processing tiles concurrently");
        let next = AtomicUsize::new(0);
        let done = AtomicUsize::new(0);
        let failed = AtomicBool::new(false);
        let results: Mutex<Vec<Option<ImageBuffer>>> = Mutex::new(vec![None; total]);
        let first_error: Mutex<Option<PipelineError>> = Mutex::new(None);

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    if failed.load(Ordering::SeqCst) {
                        break;
                    }
                    let i = next.fetch_add(1, Ordering::SeqCst);
                    let Some(spec) = grid.tiles().get(i) else {
                        break;
                    };
                    let processed = self
                        .process_tile(image, grid, spec, plan, scale, control)
                        .and_then(|trimmed| Ok((spec.interior.scaled(scale)?, trimmed)));
                    match processed {
                        Ok((placed, trimmed)) => {
                            let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                            self.report_tile(control, finished, total, placed, &trimmed);
                            results.lock().unwrap_or_else(|e| e.into_inner())[i] = Some(trimmed);
                        }
                        Err(err) => {
                            failed.store(true, Ordering::SeqCst);
                            first_error
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .get_or_insert(err);
                            break;
                        }
                    }
                });
            }
        });

        if let Some(err) = first_error.into_inner().unwrap_or_else(|e| e.into_inner()) {
            return Err(err);
        }
        control.check_cancelled()?;

        let results = results.into_inner().unwrap_or_else(|e| e.into_inner());
        for (spec, trimmed) in grid.tiles().iter().zip(results) {
            let trimmed = trimmed.ok_or_else(|| {
                PipelineError::invalid_image(format!("tile {} produced no output", spec.index.ordinal))
            })?;
            let placed = spec.interior.scaled(scale)?;
            output.paste_in_place(&trimmed, placed.x, placed.y)?;
        }
        Ok(output)
    }

    /// Runs the plan over one tile and trims it to its interior.
    fn process_tile(
        &self,
        image: &ImageBuffer,
        grid: &TileGrid,
        spec: &TileSpec,
        plan: &ModelPlan,
        scale: u32,
        control: &RunControl,
    ) -> Result<ImageBuffer, PipelineError> {
        control.check_cancelled()?;
        let tile = grid.extract(image, spec)?;
        debug!(
            tile = tile.index.ordinal,
            column = tile.index.column,
            row = tile.index.row,
            input = %tile.input,
            interior = %tile.interior,
            "Processing tile"
        );
        let upscaled = self.run_plan(&tile.buffer, plan, scale)?;
        let (margin_x, margin_y) = tile.margin_offset();
        upscaled.crop(Region::new(
            scale_dimension(margin_x, scale)?,
            scale_dimension(margin_y, scale)?,
            scale_dimension(tile.interior.width, scale)?,
            scale_dimension(tile.interior.height, scale)?,
        ))
    }

    /// Executes every plan step for one buffer and combines the results.
    fn run_plan(&self, input: &ImageBuffer, plan: &ModelPlan, scale: u32) -> Result<ImageBuffer, PipelineError> {
        let steps = plan.steps();
        let output = match plan.strategy() {
            ModelMode::Single => self.run_step(input, &steps[0].model)?,
            ModelMode::Interpolate => {
                let first = self.run_step(input, &steps[0].model)?;
                let second = self.run_step(input, &steps[1].model)?;
                blend(&first, steps[0].weight, &second, steps[1].weight)?
            }
            ModelMode::Chain => {
                let first = self.run_step(input, &steps[0].model)?;
                self.run_step(&first, &steps[1].model)?
            }
        };

        let expected = (
            scale_dimension(input.width(), scale)?,
            scale_dimension(input.height(), scale)?,
        );
        if output.dimensions() != expected {
            return Err(PipelineError::Inference {
                model: plan.describe(),
                message: format!(
                    "produced {}x{}, expected {}x{}",
                    output.width(),
                    output.height(),
                    expected.0,
                    expected.1
                ),
            });
        }
        Ok(output)
    }

    fn run_step(&self, input: &ImageBuffer, model: &ModelRef) -> Result<ImageBuffer, PipelineError> {
        let output = self
            .service
            .run_model(input, model)
            .map_err(|err| inference_error(model, &err))?;
        if output.color() != ColorModel::Rgb {
            return Ok(output.into_color_image());
        }
        Ok(output)
    }

    fn report_tile(&self, control: &RunControl, done: usize, total: usize, placed: Region, tile: &ImageBuffer) {
        match self.options.mode {
            PreviewMode::Cutout => {}
            PreviewMode::None => {
                control
                    .reporter
                    .progress(done as f32 / total as f32 * 100.0, format!("Upscaling tile {done}/{total}"));
            }
            PreviewMode::FullImage => {
                control
                    .reporter
                    .progress(done as f32 / total as f32 * 100.0, format!("Upscaling tile {done}/{total}"));
                if control.reporter.wants_tile_previews() {
                    control.reporter.tile_preview(done - 1, total, placed, tile.clone());
                }
            }
        }
    }
}

/// Per-pixel weighted sum `a * wa + b * wb`, rounded.
pub fn blend(a: &ImageBuffer, wa: f32, b: &ImageBuffer, wb: f32) -> Result<ImageBuffer, PipelineError> {
    if a.dimensions() != b.dimensions() || a.color() != b.color() {
        return Err(PipelineError::invalid_image(format!(
            "cannot blend {}x{} {:?} with {}x{} {:?}",
            a.width(),
            a.height(),
            a.color(),
            b.width(),
            b.height(),
            b.color()
        )));
    }
    let data = a
        .data()
        .iter()
        .zip(b.data())
        .map(|(&x, &y)| (x as f32 * wa + y as f32 * wb).round().clamp(0.0, 255.0) as u8)
        .collect();
    ImageBuffer::new(a.width(), a.height(), a.color(), data)
}

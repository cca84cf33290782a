//! Full Pipeline: upscales whole images from a file or directory and writes
//! the results to disk, continuing past files that fail.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::UpscaleSettings;
use crate::error::{BatchReport, PipelineError};
use crate::format::{
    decode_file, encode_to_file, list_files, load_working, normalize_dir, original_name_from_working,
    OutputFormat, OutputSettings,
};
use crate::inference::InferenceService;
use crate::plan::ModelPlan;
use crate::progress::{RunControl, Stage};
use crate::tiling::{PreviewMode, TilingUpscaler};
use crate::workspace::{copy_into, move_into, MovedFile, Workspace};

/// What happens to the source file of a full run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwritePolicy {
    /// Sources are copied; results go to the output directory.
    #[default]
    Keep,
    /// Sources are moved into the workspace and replaced by their result.
    InPlace,
}

impl fmt::Display for OverwritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Keep => "keep",
            Self::InPlace => "in_place",
        })
    }
}

impl FromStr for OverwritePolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "keep" | "false" => Ok(Self::Keep),
            "in_place" | "inplace" | "overwrite" | "true" => Ok(Self::InPlace),
            other => Err(format!("unknown overwrite policy '{other}' (expected keep or in_place)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullRequest {
    /// A single image or a directory of images (not recursive).
    pub input: PathBuf,
    /// Ignored with [`OverwritePolicy::InPlace`].
    pub output_dir: PathBuf,
}

/// Written output paths plus per-file failures.
pub type FullReport = BatchReport<PathBuf>;

/// Name of the final file for a source called `original_name`, and the
/// format it is encoded in.
pub fn output_file_name(
    original_name: &str,
    suffix: &str,
    format: OutputFormat,
    settings: &OutputSettings,
) -> (String, OutputFormat) {
    let original = Path::new(original_name);
    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| original_name.to_string());
    let source_ext = original.extension().map(|e| e.to_string_lossy().into_owned());
    let resolved = format.resolve(source_ext.as_deref());
    (
        format!("{stem}{suffix}.{}", settings.extension_for(resolved)),
        resolved,
    )
}

pub struct FullPipeline<'a> {
    service: &'a dyn InferenceService,
    workspace: &'a Workspace,
    settings: &'a UpscaleSettings,
    stage: Stage,
    /// Sources moved in under the in-place policy, keyed by staged file name.
    moved: HashMap<String, MovedFile>,
    /// Sources copied in under the keep policy; never written to.
    kept_sources: HashSet<PathBuf>,
    /// Targets written by this run.
    written: HashSet<PathBuf>,
}

impl<'a> FullPipeline<'a> {
    pub fn new(service: &'a dyn InferenceService, workspace: &'a Workspace, settings: &'a UpscaleSettings) -> Self {
        Self {
            service,
            workspace,
            settings,
            stage: Stage::Idle,
            moved: HashMap::new(),
            kept_sources: HashSet::new(),
            written: HashSet::new(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Runs every stage. Per-file problems end up in the report; anything
    /// else aborts the run, restores moved sources and clears the scratch
    /// directories.
    pub fn run(
        &mut self,
        request: &FullRequest,
        plan: &ModelPlan,
        control: &RunControl,
    ) -> Result<FullReport, PipelineError> {
        match self.run_stages(request, plan, control) {
            Ok(report) => {
                self.enter(Stage::Done, control);
                if let Err(err) = self.workspace.clear_full() {
                    warn!(error = %err, "Failed to clear scratch directories after run");
                }
                Ok(report)
            }
            Err(err) => {
                self.abort(&err, control);
                Err(err)
            }
        }
    }

    fn run_stages(
        &mut self,
        request: &FullRequest,
        plan: &ModelPlan,
        control: &RunControl,
    ) -> Result<FullReport, PipelineError> {
        let mut report = FullReport::default();
        self.kept_sources.clear();
        self.written.clear();

        self.enter(Stage::Preparing, control);
        self.workspace.ensure_dirs()?;
        self.workspace.clear_full()?;
        let sources = collect_sources(&request.input)?;
        info!(files = sources.len(), input = %request.input.display(), "Starting full run");
        self.stage_sources(&sources, &mut report);
        control.reporter.progress(5.0, format!("Staged {} file(s)", sources.len()));
        control.check_cancelled()?;

        self.enter(Stage::Extracting, control);
        let mut options = self.settings.normalize_options();
        options.delete_source = false;
        let working = normalize_dir(&self.workspace.img_in(), &options)?;
        let working_files = working.drain_failures_into(&mut report);
        control.reporter.progress(10.0, "Converted to working format");
        control.check_cancelled()?;

        self.enter(Stage::Upscaling, control);
        let upscaled = self.upscale_all(&working_files, plan, control, &mut report)?;
        control.check_cancelled()?;

        self.enter(Stage::Postprocessing, control);
        for path in &upscaled {
            control.check_cancelled()?;
            match self.postprocess(path, request) {
                Ok(target) => {
                    info!(output = %target.display(), "Wrote result");
                    report.push_ok(target);
                }
                Err(err) if err.is_per_item() => {
                    warn!(path = %path.display(), error = %err, "Postprocessing failed");
                    report.push_failure(path.clone(), err);
                }
                Err(err) => return Err(err),
            }
        }
        self.restore_unprocessed();

        control.reporter.progress(
            100.0,
            format!("{} written, {} failed", report.succeeded.len(), report.failures.len()),
        );
        Ok(report)
    }

    fn stage_sources(&mut self, sources: &[PathBuf], report: &mut FullReport) {
        let img_in = self.workspace.img_in();
        for source in sources {
            let staged = match self.settings.overwrite {
                OverwritePolicy::Keep => copy_into(source, &img_in).map(|_| {
                    self.kept_sources.insert(path_identity(source));
                }),
                OverwritePolicy::InPlace => move_into(source, &img_in).map(|moved| {
                    let key = file_name(&moved.staged);
                    self.moved.insert(key, moved);
                }),
            };
            if let Err(err) = staged {
                warn!(path = %source.display(), error = %err, "Could not stage source");
                report.push_failure(source.clone(), err);
            }
        }
    }

    fn upscale_all(
        &self,
        working_files: &[PathBuf],
        plan: &ModelPlan,
        control: &RunControl,
        report: &mut FullReport,
    ) -> Result<Vec<PathBuf>, PipelineError> {
        let upscaler = TilingUpscaler::new(self.service, self.settings.tiling_options(PreviewMode::None));
        let total = working_files.len().max(1) as f32;
        let mut written = Vec::with_capacity(working_files.len());

        for (i, path) in working_files.iter().enumerate() {
            control.check_cancelled()?;
            let start = 10.0 + 80.0 * i as f32 / total;
            let end = 10.0 + 80.0 * (i + 1) as f32 / total;
            let file_control = control.with_reporter(control.reporter.band(start, end));

            let result = load_working(path).and_then(|image| {
                let output = upscaler.upscale_normalized(image, plan, &file_control)?;
                let target = self.workspace.img_out().join(file_name(path));
                encode_to_file(&output, &target, OutputFormat::Png, &OutputSettings::default())?;
                Ok(target)
            });

            match result {
                Ok(target) => {
                    debug!(working = %path.display(), output = %target.display(), "Upscaled file");
                    written.push(target);
                }
                Err(err) if err.is_per_item() => {
                    warn!(path = %path.display(), error = %err, "Skipping file that failed to upscale");
                    report.push_failure(path.clone(), err);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(written)
    }

    /// Encodes one upscaled working file into its final name and format.
    fn postprocess(&mut self, upscaled: &Path, request: &FullRequest) -> Result<PathBuf, PipelineError> {
        let working_name = file_name(upscaled);
        let original_name = original_name_from_working(&working_name).unwrap_or_else(|| working_name.clone());
        let (name, format) = output_file_name(
            &original_name,
            &self.settings.suffix,
            self.settings.output.format,
            &self.settings.output,
        );

        let target_dir = match self.moved.get(&original_name) {
            Some(moved) => moved
                .original
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
            None => request.output_dir.clone(),
        };
        std::fs::create_dir_all(&target_dir)
            .map_err(|e| PipelineError::io(format!("creating {}", target_dir.display()), e))?;

        let target = target_dir.join(name);
        let identity = path_identity(&target);
        if self.kept_sources.contains(&identity) || self.written.contains(&identity) {
            return Err(PipelineError::io(
                format!("writing {}", target.display()),
                std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "target is a source file or an earlier result of this run",
                ),
            ));
        }
        let image = decode_file(upscaled)?;
        encode_to_file(&image, &target, format, &self.settings.output)?;
        self.written.insert(identity);

        // The result replaces the moved source; nothing to restore any more.
        self.moved.remove(&original_name);
        Ok(target)
    }

    /// Puts back moved sources whose files failed somewhere along the way.
    fn restore_unprocessed(&mut self) {
        for (_, moved) in self.moved.drain() {
            match moved.restore() {
                Ok(true) => info!(path = %moved.original.display(), "Restored source file"),
                Ok(false) => {}
                Err(err) => error!(path = %moved.original.display(), error = %err, "Failed to restore source file"),
            }
        }
    }

    fn enter(&mut self, next: Stage, control: &RunControl) {
        if !self.stage.can_transition_to(next) {
            warn!(from = %self.stage, to = %next, "Unexpected full-run stage transition");
        }
        debug!(stage = %next, "Full run stage");
        self.stage = next;
        control.reporter.stage(next);
    }

    fn abort(&mut self, err: &PipelineError, control: &RunControl) {
        match err {
            PipelineError::Cancelled => info!(stage = %self.stage, "Full run cancelled"),
            other => error!(stage = %self.stage, error = %other, "Full run aborted"),
        }
        self.enter(Stage::Aborted, control);
        self.restore_unprocessed();
        if let Err(cleanup) = self.workspace.clear_full() {
            warn!(error = %cleanup, "Failed to clear scratch directories");
        }
    }
}

fn collect_sources(input: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    if input.is_dir() {
        return list_files(input);
    }
    if input.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }
    Err(PipelineError::io(
        format!("reading {}", input.display()),
        std::io::Error::new(std::io::ErrorKind::NotFound, "input does not exist"),
    ))
}

/// Absolute form of `path` for collision checks; works for files that do
/// not exist yet as long as their directory does.
fn path_identity(path: &Path) -> PathBuf {
    if let Ok(resolved) = path.canonicalize() {
        return resolved;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|dir| dir.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

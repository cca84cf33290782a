//! Pipeline Coordinator: owns the session state, enforces the single
//! active run and hands out [`RunHandle`]s for preview and full runs.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::UpscaleSettings;
use crate::error::PipelineError;
use crate::full::{FullPipeline, FullReport, FullRequest};
use crate::inference::InferenceService;
use crate::plan::{ModelMode, ModelPlan, ModelRef, SelectionState};
use crate::preview::{PreviewKind, PreviewLabels, PreviewPipeline, PreviewRequest, PreviewRestorePoint, PreviewResult};
use crate::progress::{PipelineEvent, ProgressReporter, RunControl, Stage, EVENT_CHANNEL_CAPACITY};
use crate::types::ImageBuffer;
use crate::workspace::Workspace;

/// Session state that used to live in UI controls and module globals.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub selection: SelectionState,
    pub mode: ModelMode,
    /// Interpolation percentage, 0..=100.
    pub blend: f64,
    pub current_scale: Option<u32>,
    pub cached_original: Option<Arc<ImageBuffer>>,
    pub cached_output: Option<Arc<ImageBuffer>>,
    pub restore_point: Option<PreviewRestorePoint>,
    pub labels: Option<PreviewLabels>,
}

impl PipelineContext {
    pub fn new(settings: &UpscaleSettings) -> Self {
        Self {
            selection: SelectionState::default(),
            mode: settings.model_mode,
            blend: settings.blend,
            current_scale: None,
            cached_original: None,
            cached_output: None,
            restore_point: None,
            labels: None,
        }
    }

    pub fn reset_cached_images(&mut self) {
        self.cached_original = None;
        self.cached_output = None;
    }

    pub fn resolve_plan(&self) -> Result<ModelPlan, PipelineError> {
        self.selection.resolve(self.mode, Some(self.blend))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Preview,
    Full,
}

#[derive(Debug)]
pub enum RunOutcome {
    Preview(PreviewResult),
    Full(FullReport),
    Cancelled {
        restore: Option<PreviewRestorePoint>,
    },
    Failed {
        error: PipelineError,
        restore: Option<PreviewRestorePoint>,
    },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Preview(_) | Self::Full(_))
    }
}

/// Caller-visible handle of a spawned run.
pub struct RunHandle {
    id: Uuid,
    kind: RunKind,
    cancel: CancellationToken,
    join: JoinHandle<RunOutcome>,
}

impl RunHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> RunKind {
        self.kind
    }

    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    /// Takes effect at the next tile or stage boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> RunOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(err) => RunOutcome::Failed {
                error: PipelineError::Internal {
                    message: err.to_string(),
                },
                restore: None,
            },
        }
    }
}

/// Marks the coordinator busy for as long as it lives. Dropping it returns
/// the coordinator to `Idle`.
struct ActiveRun {
    active: Arc<AtomicBool>,
    current_cancel: Arc<Mutex<Option<CancellationToken>>>,
    reporter: ProgressReporter,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        lock(&self.current_cancel).take();
        self.active.store(false, Ordering::SeqCst);
        self.reporter.stage(Stage::Idle);
    }
}

pub struct PipelineCoordinator {
    service: Arc<dyn InferenceService>,
    workspace: Workspace,
    settings: Mutex<UpscaleSettings>,
    context: Arc<Mutex<PipelineContext>>,
    active: Arc<AtomicBool>,
    current_cancel: Arc<Mutex<Option<CancellationToken>>>,
    events: broadcast::Sender<PipelineEvent>,
}

impl PipelineCoordinator {
    pub fn new(service: Arc<dyn InferenceService>, workspace: Workspace, settings: UpscaleSettings) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            service,
            workspace,
            context: Arc::new(Mutex::new(PipelineContext::new(&settings))),
            settings: Mutex::new(settings),
            active: Arc::new(AtomicBool::new(false)),
            current_cancel: Arc::new(Mutex::new(None)),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn set_model1(&self, model: Option<ModelRef>) {
        lock(&self.context).selection.set_model1(model);
    }

    pub fn set_model2(&self, model: Option<ModelRef>) {
        lock(&self.context).selection.set_model2(model);
    }

    pub fn set_mode(&self, mode: ModelMode) {
        lock(&self.context).mode = mode;
    }

    /// Validated when the next run resolves its plan.
    pub fn set_blend(&self, blend: f64) {
        lock(&self.context).blend = blend;
    }

    pub fn update_settings(&self, settings: UpscaleSettings) {
        *lock(&self.settings) = settings;
    }

    /// Snapshot of the session state.
    pub fn context(&self) -> PipelineContext {
        lock(&self.context).clone()
    }

    pub fn has_valid_selection(&self) -> bool {
        let context = lock(&self.context);
        context.selection.has_valid_selection(context.mode)
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Requests cancellation of the active run. Returns whether one was
    /// running.
    pub fn cancel(&self) -> bool {
        match lock(&self.current_cancel).as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn reporter(&self) -> ProgressReporter {
        ProgressReporter::new(self.events.clone())
    }

    fn try_begin(&self, cancel: &CancellationToken) -> Result<ActiveRun, PipelineError> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Rejected run start while another run is active");
            return Err(PipelineError::Busy);
        }
        *lock(&self.current_cancel) = Some(cancel.clone());
        Ok(ActiveRun {
            active: self.active.clone(),
            current_cancel: self.current_cancel.clone(),
            reporter: self.reporter(),
        })
    }

    /// Starts a preview run. Fails fast with `Busy` or a plan error
    /// without spawning anything.
    pub fn start_preview(&self, source: impl Into<PathBuf>, kind: PreviewKind) -> Result<RunHandle, PipelineError> {
        let cancel = CancellationToken::new();
        let guard = self.try_begin(&cancel)?;
        let reporter = self.reporter();

        let (plan, request) = {
            let mut context = lock(&self.context);
            let plan = context.resolve_plan().inspect_err(|err| {
                reporter.finished(false, err.user_reason());
            })?;
            let request = PreviewRequest {
                source: source.into(),
                kind,
                current_view: context.cached_output.clone(),
            };
            context.reset_cached_images();
            context.restore_point = None;
            (plan, request)
        };

        let id = Uuid::new_v4();
        info!(run_id = %id, source = %request.source.display(), plan = %plan.describe(), "Starting preview");

        let service = self.service.clone();
        let workspace = self.workspace.clone();
        let settings = lock(&self.settings).clone();
        let context = self.context.clone();
        let control = RunControl::new(cancel.clone(), reporter.clone());

        let join = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let mut pipeline = PreviewPipeline::new(service.as_ref(), &workspace, &settings);
            let result = pipeline.run(&request, &plan, &control);
            let restore = pipeline.take_restore_point();

            let mut context = lock(&context);
            match result {
                Ok(result) => {
                    context.current_scale = Some(result.scale);
                    context.cached_original = Some(Arc::new(result.upscaled.clone()));
                    context.cached_output = Some(Arc::new(result.merged.clone()));
                    context.labels = Some(result.labels.clone());
                    reporter.finished(true, "Preview ready");
                    info!(run_id = %id, "Preview finished");
                    RunOutcome::Preview(result)
                }
                Err(error) => {
                    if let Some(point) = &restore {
                        context.cached_output = point.image.clone();
                    }
                    context.restore_point = restore.clone();
                    finish_failed(&reporter, id, error, restore)
                }
            }
        });

        Ok(RunHandle {
            id,
            kind: RunKind::Preview,
            cancel,
            join,
        })
    }

    /// Starts a full run over a file or directory.
    pub fn start_full(&self, request: FullRequest) -> Result<RunHandle, PipelineError> {
        let cancel = CancellationToken::new();
        let guard = self.try_begin(&cancel)?;
        let reporter = self.reporter();

        let plan = lock(&self.context).resolve_plan().inspect_err(|err| {
            reporter.finished(false, err.user_reason());
        })?;

        let id = Uuid::new_v4();
        info!(run_id = %id, input = %request.input.display(), plan = %plan.describe(), "Starting full run");

        let service = self.service.clone();
        let workspace = self.workspace.clone();
        let settings = lock(&self.settings).clone();
        let control = RunControl::new(cancel.clone(), reporter.clone());

        let join = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let mut pipeline = FullPipeline::new(service.as_ref(), &workspace, &settings);
            match pipeline.run(&request, &plan, &control) {
                Ok(report) => {
                    let message = format!(
                        "Done: {} written, {} failed",
                        report.succeeded.len(),
                        report.failures.len()
                    );
                    reporter.finished(report.is_clean(), message);
                    info!(run_id = %id, written = report.succeeded.len(), failed = report.failures.len(), "Full run finished");
                    RunOutcome::Full(report)
                }
                Err(error) => finish_failed(&reporter, id, error, None),
            }
        });

        Ok(RunHandle {
            id,
            kind: RunKind::Full,
            cancel,
            join,
        })
    }
}

fn finish_failed(
    reporter: &ProgressReporter,
    id: Uuid,
    error: PipelineError,
    restore: Option<PreviewRestorePoint>,
) -> RunOutcome {
    match error {
        PipelineError::Cancelled => {
            reporter.finished(false, "Cancelled");
            info!(run_id = %id, "Run cancelled");
            RunOutcome::Cancelled { restore }
        }
        error => {
            reporter.finished(false, error.user_reason());
            warn!(run_id = %id, error = %error, "Run failed");
            RunOutcome::Failed { error, restore }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

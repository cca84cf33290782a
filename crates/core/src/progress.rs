//! Status sink: progress events for whoever is driving a run.
//!
//! Events go out on a `tokio::sync::broadcast` channel. Sending never
//! blocks the pipeline and a run with no subscribers is fine.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::geometry::Region;
use crate::types::ImageBuffer;

pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Stage of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Preparing,
    Extracting,
    Upscaling,
    Merging,
    Postprocessing,
    Done,
    Aborted,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }

    /// Forward-only transitions; `Aborted` is reachable from any
    /// non-terminal stage.
    pub fn can_transition_to(self, next: Stage) -> bool {
        use Stage::*;
        match (self, next) {
            (from, Aborted) => !from.is_terminal(),
            (Idle, Preparing)
            | (Preparing, Extracting)
            | (Extracting, Upscaling)
            | (Upscaling, Merging)
            | (Upscaling, Postprocessing)
            | (Merging, Done)
            | (Postprocessing, Done) => true,
            (Done | Aborted, Idle) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::Extracting => "extracting",
            Self::Upscaling => "upscaling",
            Self::Merging => "merging",
            Self::Postprocessing => "postprocessing",
            Self::Done => "done",
            Self::Aborted => "aborted",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    Progress {
        percent: f32,
        message: String,
    },
    StageChanged {
        stage: Stage,
    },
    /// A processed tile, surfaced for live previews.
    TilePreview {
        ordinal: usize,
        total: usize,
        /// Placement in output pixels.
        region: Region,
        #[serde(skip)]
        image: Arc<ImageBuffer>,
    },
    Finished {
        success: bool,
        message: String,
    },
}

/// Cheap cloneable handle for emitting [`PipelineEvent`]s.
///
/// Percentages reported through a reporter are mapped into its band, so a
/// stage can report 0..=100 while the run as a whole shows e.g. 20..=90.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    sender: Option<broadcast::Sender<PipelineEvent>>,
    band_start: f32,
    band_end: f32,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::disabled()
    }
}

impl ProgressReporter {
    pub fn new(sender: broadcast::Sender<PipelineEvent>) -> Self {
        Self {
            sender: Some(sender),
            band_start: 0.0,
            band_end: 100.0,
        }
    }

    pub fn disabled() -> Self {
        Self {
            sender: None,
            band_start: 0.0,
            band_end: 100.0,
        }
    }

    /// Sub-reporter covering `start..=end` of this reporter's range.
    pub fn band(&self, start: f32, end: f32) -> Self {
        let span = self.band_end - self.band_start;
        Self {
            sender: self.sender.clone(),
            band_start: self.band_start + span * start.clamp(0.0, 100.0) / 100.0,
            band_end: self.band_start + span * end.clamp(0.0, 100.0) / 100.0,
        }
    }

    pub fn progress(&self, percent: f32, message: impl Into<String>) {
        let percent = percent.clamp(0.0, 100.0);
        let mapped = self.band_start + (self.band_end - self.band_start) * percent / 100.0;
        self.send(PipelineEvent::Progress {
            percent: mapped,
            message: message.into(),
        });
    }

    pub fn stage(&self, stage: Stage) {
        self.send(PipelineEvent::StageChanged { stage });
    }

    pub fn tile_preview(&self, ordinal: usize, total: usize, region: Region, image: ImageBuffer) {
        if self.sender.is_none() {
            return;
        }
        self.send(PipelineEvent::TilePreview {
            ordinal,
            total,
            region,
            image: Arc::new(image),
        });
    }

    pub fn finished(&self, success: bool, message: impl Into<String>) {
        self.send(PipelineEvent::Finished {
            success,
            message: message.into(),
        });
    }

    pub fn wants_tile_previews(&self) -> bool {
        self.sender
            .as_ref()
            .is_some_and(|sender| sender.receiver_count() > 0)
    }

    fn send(&self, event: PipelineEvent) {
        if let Some(sender) = &self.sender {
            // No subscribers is not an error.
            let _ = sender.send(event);
        }
    }
}

/// Cancellation flag and status sink handed down through a run.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    pub cancel: CancellationToken,
    pub reporter: ProgressReporter,
}

impl RunControl {
    pub fn new(cancel: CancellationToken, reporter: ProgressReporter) -> Self {
        Self { cancel, reporter }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cooperative cancellation point.
    pub fn check_cancelled(&self) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn with_reporter(&self, reporter: ProgressReporter) -> Self {
        Self {
            cancel: self.cancel.clone(),
            reporter,
        }
    }
}

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::{tempdir, TempDir};
use tokio::sync::broadcast;
use upscaler_core::config::UpscaleSettings;
use upscaler_core::coordinator::{PipelineCoordinator, RunKind, RunOutcome};
use upscaler_core::error::PipelineError;
use upscaler_core::format::{decode_file, encode_to_file, OutputFormat, OutputSettings};
use upscaler_core::full::FullRequest;
use upscaler_core::geometry::{ScrollbarMetrics, ViewportState};
use upscaler_core::inference::testing::{FakeInferenceService, PixelOp};
use upscaler_core::plan::{ModelMode, ModelRef, ModelSlot};
use upscaler_core::preview::PreviewKind;
use upscaler_core::progress::{PipelineEvent, Stage};
use upscaler_core::types::{ColorModel, ImageBuffer};
use upscaler_core::workspace::Workspace;

struct Harness {
    dir: TempDir,
    coordinator: PipelineCoordinator,
}

impl Harness {
    fn new(service: FakeInferenceService, config: &[(&str, &str)]) -> Self {
        let dir = tempdir().expect("tempdir");
        let store: HashMap<String, String> = config
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let settings = UpscaleSettings::from_store(&store).expect("settings");
        let coordinator = PipelineCoordinator::new(
            Arc::new(service),
            Workspace::new(dir.path().join("work")),
            settings,
        );
        Self { dir, coordinator }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn select(&self, model: &str) {
        let path = self.path(&format!("{model}.onnx"));
        fs::write(&path, b"stub").expect("write model");
        self.coordinator
            .set_model1(Some(ModelRef::new(path, ModelSlot::Primary)));
    }

    fn select_second(&self, model: &str) {
        let path = self.path(&format!("{model}.onnx"));
        fs::write(&path, b"stub").expect("write model");
        self.coordinator
            .set_model2(Some(ModelRef::new(path, ModelSlot::Secondary)));
    }
}

fn write_image(path: &Path, width: u32, height: u32, rgb: [u8; 3]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent");
    }
    let image = ImageBuffer::filled(width, height, ColorModel::Rgb, &rgb).expect("image");
    encode_to_file(&image, path, OutputFormat::SameAsSource, &OutputSettings::default())
        .expect("write image");
}

fn drain(events: &mut broadcast::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut seen = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => seen.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    seen
}

fn stages(events: &[PipelineEvent]) -> Vec<Stage> {
    events
        .iter()
        .filter_map(|event| match event {
            PipelineEvent::StageChanged { stage } => Some(*stage),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn full_run_writes_outputs_and_reports_bad_files() {
    let harness = Harness::new(
        FakeInferenceService::new(2).with_model("2x_brighten", 2, PixelOp::Add(10)),
        &[("tilesize", "16"), ("suffix", "_up")],
    );
    harness.select("2x_brighten");

    let input = harness.path("in");
    write_image(&input.join("a.png"), 20, 12, [100, 100, 100]);
    write_image(&input.join("b.jpg"), 8, 8, [0, 0, 0]);
    fs::write(input.join("notes.txt"), b"not an image").expect("write text");
    let output = harness.path("out");

    let mut events = harness.coordinator.subscribe();
    let handle = harness
        .coordinator
        .start_full(FullRequest {
            input: input.clone(),
            output_dir: output.clone(),
        })
        .expect("start");
    assert_eq!(handle.kind(), RunKind::Full);

    let RunOutcome::Full(report) = handle.wait().await else {
        panic!("expected a full report");
    };
    assert_eq!(report.succeeded.len(), 2);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].path.ends_with("notes.txt"));

    let a = decode_file(&output.join("a_up.png")).expect("a output");
    assert_eq!(a.dimensions(), (40, 24));
    assert_eq!(a.pixel(39, 23), &[110, 110, 110]);
    assert!(output.join("b_up.png").exists());

    // Originals are untouched under the default policy.
    assert!(input.join("a.png").exists());
    assert!(input.join("notes.txt").exists());

    assert!(harness
        .coordinator
        .workspace()
        .is_full_scratch_empty()
        .expect("scratch"));
    assert!(!harness.coordinator.is_running());

    let seen = drain(&mut events);
    let stages = stages(&seen);
    assert_eq!(
        stages,
        vec![
            Stage::Preparing,
            Stage::Extracting,
            Stage::Upscaling,
            Stage::Postprocessing,
            Stage::Done,
            Stage::Idle,
        ]
    );
    assert!(seen.iter().any(|e| matches!(
        e,
        PipelineEvent::Finished { success: false, message } if message.contains("2 written, 1 failed")
    )));
}

#[tokio::test]
async fn in_place_run_replaces_sources_and_restores_failures() {
    let harness = Harness::new(
        FakeInferenceService::new(2).with_model("2x_dark", 2, PixelOp::Constant(0)),
        &[("tilesize", "64"), ("overwrite", "in_place")],
    );
    harness.select("2x_dark");

    let input = harness.path("album");
    write_image(&input.join("cover.png"), 10, 10, [200, 200, 200]);
    fs::write(input.join("readme.txt"), b"keep me").expect("write text");

    let handle = harness
        .coordinator
        .start_full(FullRequest {
            input: input.clone(),
            output_dir: harness.path("unused"),
        })
        .expect("start");
    let RunOutcome::Full(report) = handle.wait().await else {
        panic!("expected a full report");
    };

    assert_eq!(report.succeeded, vec![input.join("cover.png")]);
    let cover = decode_file(&input.join("cover.png")).expect("replaced cover");
    assert_eq!(cover.dimensions(), (20, 20));
    assert_eq!(cover.pixel(0, 0), &[0, 0, 0]);

    assert_eq!(
        fs::read(input.join("readme.txt")).expect("restored text"),
        b"keep me"
    );
    assert!(!harness.path("unused").exists());
}

#[tokio::test]
async fn missing_input_aborts_without_outputs() {
    let harness = Harness::new(FakeInferenceService::new(2), &[("tilesize", "64")]);
    harness.select("2x");

    let handle = harness
        .coordinator
        .start_full(FullRequest {
            input: harness.path("nowhere"),
            output_dir: harness.path("out"),
        })
        .expect("start");
    match handle.wait().await {
        RunOutcome::Failed { error, .. } => assert!(matches!(error, PipelineError::Io { .. })),
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(!harness.coordinator.is_running());
}

#[tokio::test]
async fn inference_failure_aborts_full_run_and_restores_sources() {
    let harness = Harness::new(
        FakeInferenceService::new(2).failing_on_call(1),
        &[("tilesize", "64"), ("overwrite", "in_place")],
    );
    harness.select("2x");

    let input = harness.path("batch");
    write_image(&input.join("one.png"), 10, 10, [7, 7, 7]);
    write_image(&input.join("two.png"), 12, 6, [9, 9, 9]);

    let handle = harness
        .coordinator
        .start_full(FullRequest {
            input: input.clone(),
            output_dir: harness.path("unused"),
        })
        .expect("start");
    match handle.wait().await {
        RunOutcome::Failed { error, .. } => {
            assert!(matches!(error, PipelineError::Inference { .. }), "{error}")
        }
        other => panic!("expected an aborted run, got {other:?}"),
    }

    assert_eq!(decode_file(&input.join("one.png")).expect("one").dimensions(), (10, 10));
    assert_eq!(decode_file(&input.join("two.png")).expect("two").dimensions(), (12, 6));
    assert!(harness
        .coordinator
        .workspace()
        .is_full_scratch_empty()
        .expect("scratch"));
    assert!(!harness.coordinator.is_running());
}

#[tokio::test]
async fn keep_policy_never_overwrites_sources() {
    let harness = Harness::new(FakeInferenceService::new(2), &[("tilesize", "64")]);
    harness.select("2x");

    let input = harness.path("photos");
    write_image(&input.join("cover.png"), 10, 10, [50, 50, 50]);

    let handle = harness
        .coordinator
        .start_full(FullRequest {
            input: input.clone(),
            output_dir: input.clone(),
        })
        .expect("start");
    let RunOutcome::Full(report) = handle.wait().await else {
        panic!("expected a full report");
    };

    assert!(report.succeeded.is_empty());
    assert_eq!(report.failures.len(), 1);
    assert!(matches!(report.failures[0].error, PipelineError::Io { .. }));
    let cover = decode_file(&input.join("cover.png")).expect("source");
    assert_eq!(cover.dimensions(), (10, 10));
}

#[tokio::test]
async fn results_with_the_same_name_do_not_overwrite_each_other() {
    let harness = Harness::new(FakeInferenceService::new(2), &[("tilesize", "64")]);
    harness.select("2x");

    let input = harness.path("mixed");
    write_image(&input.join("a.jpg"), 8, 8, [0, 0, 0]);
    write_image(&input.join("a.png"), 6, 6, [255, 255, 255]);
    let output = harness.path("out");

    let handle = harness
        .coordinator
        .start_full(FullRequest {
            input,
            output_dir: output.clone(),
        })
        .expect("start");
    let RunOutcome::Full(report) = handle.wait().await else {
        panic!("expected a full report");
    };

    assert_eq!(report.succeeded, vec![output.join("a.png")]);
    assert_eq!(report.failures.len(), 1);
    assert!(matches!(report.failures[0].error, PipelineError::Io { .. }));
    // The first result in name order is kept.
    let written = decode_file(&output.join("a.png")).expect("output");
    assert_eq!(written.dimensions(), (16, 16));
}

#[tokio::test]
async fn chained_models_apply_in_order() {
    let harness = Harness::new(
        FakeInferenceService::new(2)
            .with_model("2x_plus", 2, PixelOp::Add(50))
            .with_model("1x_flip", 1, PixelOp::Invert),
        &[("tilesize", "64")],
    );
    harness.select("2x_plus");
    harness.select_second("1x_flip");
    harness.coordinator.set_mode(ModelMode::Chain);

    let input = harness.path("single.png");
    write_image(&input, 6, 6, [10, 20, 30]);
    let handle = harness
        .coordinator
        .start_full(FullRequest {
            input,
            output_dir: harness.path("out"),
        })
        .expect("start");
    let RunOutcome::Full(report) = handle.wait().await else {
        panic!("expected a full report");
    };
    assert!(report.is_clean());

    let out = decode_file(&harness.path("out").join("single.png")).expect("output");
    assert_eq!(out.dimensions(), (12, 12));
    assert_eq!(out.pixel(5, 5), &[255 - 60, 255 - 70, 255 - 80]);
}

#[tokio::test]
async fn preview_updates_session_context() {
    let harness = Harness::new(
        FakeInferenceService::new(2).with_model("2x_invert", 2, PixelOp::Invert),
        &[("tilesize", "32")],
    );
    harness.select("2x_invert");
    let source = harness.path("shot.png");
    write_image(&source, 120, 80, [40, 40, 40]);

    let viewport = ViewportState {
        zoom: 1.0,
        scroll_x: 20.0,
        scroll_y: 10.0,
        width: 50,
        height: 40,
    };
    let handle = harness
        .coordinator
        .start_preview(
            &source,
            PreviewKind::Cutout {
                viewport,
                scrollbars: ScrollbarMetrics {
                    vertical_width: 0,
                    horizontal_height: 0,
                },
            },
        )
        .expect("start");
    let RunOutcome::Preview(result) = handle.wait().await else {
        panic!("expected a preview");
    };

    assert_eq!(result.scale, 2);
    assert_eq!(result.merged.dimensions(), (240, 160));
    assert_eq!(result.offset, (40, 20));
    assert_eq!(result.merged.pixel(40, 20), &[215, 215, 215]);
    assert_eq!(result.merged.pixel(0, 0), &[40, 40, 40]);

    let context = harness.coordinator.context();
    assert_eq!(context.current_scale, Some(2));
    assert_eq!(
        context.cached_output.as_deref().map(ImageBuffer::dimensions),
        Some((240, 160))
    );
    let labels = context.labels.expect("labels");
    assert_eq!(labels.zoom, "Zoom: 100%");
    assert_eq!(labels.image_size, "Image: 240x160 (Original: 120x80)");
    assert!(harness.coordinator.workspace().preview_out().join("shot.png.png").exists());
}

#[tokio::test]
async fn second_run_is_rejected_while_busy_and_cancel_cleans_up() {
    let harness = Harness::new(
        FakeInferenceService::new(2).with_delay(Duration::from_millis(25)),
        &[("tilesize", "16")],
    );
    harness.select("2x");
    let source = harness.path("big.png");
    write_image(&source, 128, 128, [1, 2, 3]);

    let mut events = harness.coordinator.subscribe();
    let handle = harness
        .coordinator
        .start_preview(&source, PreviewKind::FullImage)
        .expect("start");
    assert!(harness.coordinator.is_running());

    let busy = harness
        .coordinator
        .start_full(FullRequest {
            input: source.clone(),
            output_dir: harness.path("out"),
        })
        .err()
        .expect("second run rejected");
    assert!(matches!(busy, PipelineError::Busy));

    assert!(harness.coordinator.cancel());
    match handle.wait().await {
        RunOutcome::Cancelled { restore } => assert!(restore.is_some()),
        other => panic!("expected cancellation, got {other:?}"),
    }

    assert!(!harness.coordinator.is_running());
    assert!(harness
        .coordinator
        .workspace()
        .is_preview_scratch_empty()
        .expect("scratch"));

    let stages = stages(&drain(&mut events));
    assert_eq!(stages.last(), Some(&Stage::Idle));
    assert!(stages.contains(&Stage::Aborted));
    assert!(!stages.contains(&Stage::Done));
}

#[tokio::test]
async fn cancelled_preview_restores_previous_view() {
    let harness = Harness::new(
        FakeInferenceService::new(2).with_delay(Duration::from_millis(20)),
        &[("tilesize", "32")],
    );
    harness.select("2x");

    let small = harness.path("small.png");
    write_image(&small, 16, 16, [9, 9, 9]);
    let first = harness
        .coordinator
        .start_preview(&small, PreviewKind::FullImage)
        .expect("first preview");
    let RunOutcome::Preview(first) = first.wait().await else {
        panic!("expected first preview to succeed");
    };

    let large = harness.path("large.png");
    write_image(&large, 256, 256, [0, 0, 0]);
    let second = harness
        .coordinator
        .start_preview(&large, PreviewKind::FullImage)
        .expect("second preview");
    second.cancel();
    assert!(matches!(second.wait().await, RunOutcome::Cancelled { .. }));

    let context = harness.coordinator.context();
    assert_eq!(context.cached_output.as_deref(), Some(&first.merged));
    let restore = context.restore_point.expect("restore point");
    assert_eq!(restore.image.as_deref(), Some(&first.merged));
}

#[tokio::test]
async fn interpolation_needs_matching_scales() {
    let harness = Harness::new(
        FakeInferenceService::new(2)
            .with_model("2x_a", 2, PixelOp::Identity)
            .with_model("4x_b", 4, PixelOp::Identity),
        &[("tilesize", "64")],
    );
    harness.select("2x_a");
    harness.select_second("4x_b");
    harness.coordinator.set_mode(ModelMode::Interpolate);
    harness.coordinator.set_blend(30.0);

    let source = harness.path("pic.png");
    write_image(&source, 8, 8, [5, 5, 5]);
    let handle = harness
        .coordinator
        .start_preview(&source, PreviewKind::FullImage)
        .expect("start");
    match handle.wait().await {
        RunOutcome::Failed { error, .. } => {
            assert!(matches!(error, PipelineError::IncompatibleScales { .. }))
        }
        other => panic!("expected scale mismatch, got {other:?}"),
    }
}

#[tokio::test]
async fn fractional_scroll_merges_cutout_at_its_source_pixels() {
    let harness = Harness::new(
        FakeInferenceService::new(4).with_model("4x_invert", 4, PixelOp::Invert),
        &[("tilesize", "64")],
    );
    harness.select("4x_invert");
    let source = harness.path("strip.png");
    write_image(&source, 200, 100, [2, 0, 0]);

    let viewport = ViewportState {
        zoom: 3.0,
        scroll_x: 7.0,
        scroll_y: 0.0,
        width: 78,
        height: 78,
    };
    let handle = harness
        .coordinator
        .start_preview(
            &source,
            PreviewKind::Cutout {
                viewport,
                scrollbars: ScrollbarMetrics {
                    vertical_width: 0,
                    horizontal_height: 0,
                },
            },
        )
        .expect("start");
    let RunOutcome::Preview(result) = handle.wait().await else {
        panic!("expected a preview");
    };

    assert_eq!(result.region.x, 2);
    assert_eq!(result.offset, (8, 0));
    assert_eq!(result.merged.pixel(7, 0), &[2, 0, 0]);
    assert_eq!(result.merged.pixel(8, 0), &[253, 255, 255]);
    let right_edge = 8 + result.upscaled.width() - 1;
    assert_eq!(result.merged.pixel(right_edge, 0), &[253, 255, 255]);
}

#[tokio::test]
async fn inference_failure_aborts_preview_and_clears_scratch() {
    let harness = Harness::new(
        FakeInferenceService::new(2).failing_on_call(2),
        &[("tilesize", "16")],
    );
    harness.select("2x");
    let source = harness.path("tiles.png");
    write_image(&source, 48, 48, [3, 3, 3]);

    let mut events = harness.coordinator.subscribe();
    let handle = harness
        .coordinator
        .start_preview(&source, PreviewKind::FullImage)
        .expect("start");
    match handle.wait().await {
        RunOutcome::Failed { error, restore } => {
            assert!(matches!(error, PipelineError::Inference { .. }), "{error}");
            assert!(restore.is_some());
        }
        other => panic!("expected an aborted preview, got {other:?}"),
    }

    assert!(!harness.coordinator.is_running());
    assert!(harness
        .coordinator
        .workspace()
        .is_preview_scratch_empty()
        .expect("scratch"));

    let seen = drain(&mut events);
    let stages = stages(&seen);
    assert_eq!(stages[stages.len() - 2..], [Stage::Aborted, Stage::Idle]);
    assert!(!stages.contains(&Stage::Done));
    assert!(seen.iter().any(|e| matches!(
        e,
        PipelineEvent::Finished { success: false, message } if message == "Upscaling failed"
    )));
}

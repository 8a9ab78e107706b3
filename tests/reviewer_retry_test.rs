mod common;

use std::collections::HashSet;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use capsule::pipeline::{run_pipeline, PipelineConfig, PipelineOutcome, StatusObserver};
use capsule::retry::RetryDefaults;
use capsule::types::{PipelineInput, StatusUpdate, TransitionStatus};

struct Recorder(Mutex<Vec<StatusUpdate>>);

impl StatusObserver for Recorder {
    fn on_update(&self, update: &StatusUpdate) {
        self.0.lock().unwrap().push(update.clone());
    }
}

/// Scenario 2: `test-review` returns NEEDS_WORK on attempt 1 with a specific
/// feedback string, PASS on attempt 2. `test-writer` must run twice, and its
/// second prompt must carry that exact feedback string.
#[tokio::test]
async fn reviewer_needs_work_then_pass_retries_the_worker() {
    let phases = common::six_phase_pipeline();
    let registry = common::fake_registry();
    let retry_defaults = RetryDefaults::default();
    let cfg = PipelineConfig {
        phases: &phases,
        registry: &registry,
        default_provider: "fake",
        retry_defaults: &retry_defaults,
        checkpoint_store: None,
        gate: None,
        prompt_loader: None,
    };

    let input = PipelineInput {
        bead_id: "demo-1.1.1".to_string(),
        title: "Demo task".to_string(),
        description: "A task with edge cases.".to_string(),
        bead_context: "Reject empty input.".to_string(),
        sibling_context: None,
        skip_phases: HashSet::new(),
    };

    let recorder = Recorder(Mutex::new(Vec::new()));
    let work_dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();

    let outcome = run_pipeline(&cfg, &input, work_dir.path(), &recorder, &cancel)
        .await
        .unwrap();
    let output = match outcome {
        PipelineOutcome::Completed(output) => output,
        PipelineOutcome::Paused => panic!("expected completion, got paused"),
    };
    assert!(output.completed);

    let test_writer_runs = output
        .phase_results
        .iter()
        .filter(|r| r.phase == "test-writer")
        .count();
    assert_eq!(test_writer_runs, 2, "test-writer should have run twice");

    let events = recorder.0.lock().unwrap();
    events
        .iter()
        .find(|e| e.phase == "test-writer" && e.attempt == 2 && e.status == TransitionStatus::Running)
        .expect("expected a `(attempt 2/...)` status event for test-writer");

    let needs_work_event = events
        .iter()
        .find(|e| e.phase == "test-review" && e.status == TransitionStatus::Failed)
        .expect("expected a failed/needs-work event for test-review's first attempt");
    assert_eq!(
        needs_work_event.signal.as_ref().unwrap().feedback,
        "Tests do not cover empty input rejection"
    );
}

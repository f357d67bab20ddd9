//! End-to-end acquisition runs against the mock gateway.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

use laser_snap::gateway::{GatewayCall, MockGateway};
use laser_snap::ledger::{self, Ledger, StepStatus};
use laser_snap::resume::ResumeEngine;
use laser_snap::sequencer::{AlwaysContinue, AlwaysStop, HaltReason, OperatorPrompt, ScriptedPrompt};
use laser_snap::watcher::WatcherConfig;
use laser_snap::{spawn_run, AcquisitionPlan, ProgressEvent, RunContext, RunRequest, Sequencer};

struct Bench {
    output: TempDir,
    raw: TempDir,
}

impl Bench {
    fn new() -> Self {
        Self {
            output: TempDir::new().unwrap(),
            raw: TempDir::new().unwrap(),
        }
    }

    fn sequencer(&self, gateway: &MockGateway, prompt: Arc<dyn OperatorPrompt>) -> Sequencer {
        let context = RunContext::new(
            "sample",
            self.output.path(),
            self.raw.path(),
            Duration::from_millis(300),
        )
        .unwrap();
        Sequencer::new(context, Arc::new(gateway.clone()), prompt)
            .with_settling_delay(Duration::from_millis(5))
            .with_watcher(WatcherConfig {
                poll_interval: Duration::from_millis(20),
                stability_window: Duration::from_millis(30),
                ..WatcherConfig::default()
            })
    }

    fn camera(&self) -> MockGateway {
        MockGateway::new().with_camera(self.raw.path())
    }
}

fn plan() -> AcquisitionPlan {
    AcquisitionPlan::from_pairs([("500", 2), ("600", 1)]).unwrap()
}

fn statuses(path: &Path) -> Vec<StepStatus> {
    Ledger::open(path).unwrap().steps().map(|s| s.status).collect()
}

#[tokio::test]
async fn test_timeout_then_continue() {
    let bench = Bench::new();
    let gateway = bench.camera();
    gateway.drop_frame(2);
    let prompt = Arc::new(ScriptedPrompt::new([true], false));

    let report = bench
        .sequencer(&gateway, prompt.clone())
        .run_plan(&plan())
        .await
        .unwrap();

    assert_eq!(
        statuses(&report.ledger_path),
        vec![StepStatus::Completed, StepStatus::Timeout, StepStatus::Completed]
    );
    assert_eq!(prompt.asked(), vec![1]);
    assert_eq!(report.outcome.completed, 2);
    assert_eq!(report.outcome.timed_out, 1);
    assert!(report.outcome.halted.is_none());

    let incomplete = ledger::load_incomplete(&report.ledger_path).unwrap();
    assert_eq!(incomplete.groups(), &[("500".to_string(), 1)]);

    let ledger = Ledger::open(&report.ledger_path).unwrap();
    let first = ledger.get(0).unwrap();
    assert_eq!(first.raw_filename, "frame_0001.bin");
    assert_eq!(first.file_size_bytes, 1024);
    assert_eq!(first.expected_name, "sample_500_1");
    assert!(!first.timestamp.is_empty());
}

#[tokio::test]
async fn test_timeout_then_stop() {
    let bench = Bench::new();
    let gateway = bench.camera();
    gateway.drop_frame(2);

    let report = bench
        .sequencer(&gateway, Arc::new(AlwaysStop))
        .run_plan(&plan())
        .await
        .unwrap();

    assert_eq!(
        statuses(&report.ledger_path),
        vec![StepStatus::Completed, StepStatus::Timeout, StepStatus::Cancelled]
    );
    assert_eq!(report.outcome.halted, Some(HaltReason::OperatorDeclined));
    // No command is issued for the cancelled step
    assert_eq!(
        gateway.call_log(),
        vec![
            GatewayCall::SetWavelength("500".into()),
            GatewayCall::Trigger,
            GatewayCall::SetWavelength("500".into()),
            GatewayCall::Trigger,
        ]
    );

    let summary = ledger::summarize(&report.ledger_path).unwrap();
    assert_eq!((summary.total, summary.completed, summary.incomplete), (3, 1, 2));
}

#[tokio::test]
async fn test_resume_reacquires_incomplete_steps() {
    let bench = Bench::new();
    let first = bench.camera();
    first.drop_frame(2);
    bench
        .sequencer(&first, Arc::new(AlwaysStop))
        .run_plan(&plan())
        .await
        .unwrap();

    let report = ResumeEngine::inspect(bench.output.path()).unwrap();
    assert!(!report.nothing_to_resume());
    assert_eq!(report.project_name.as_deref(), Some("sample"));
    assert_eq!(report.incomplete.count_for("500"), 1);
    assert_eq!(report.incomplete.count_for("600"), 1);

    let second = bench.camera();
    let resumed = bench
        .sequencer(&second, Arc::new(AlwaysContinue))
        .resume(&report.ledger_path)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(resumed.ledger_path, report.ledger_path);
    assert_eq!(resumed.outcome.completed, 2);
    assert_eq!(statuses(&report.ledger_path), vec![StepStatus::Completed; 3]);
    assert_eq!(
        second.call_log(),
        vec![
            GatewayCall::SetWavelength("500".into()),
            GatewayCall::Trigger,
            GatewayCall::SetWavelength("600".into()),
            GatewayCall::Trigger,
        ]
    );

    // A second resume finds nothing left
    let again = ResumeEngine::inspect(bench.output.path()).unwrap();
    assert!(again.nothing_to_resume());
    let none = bench
        .sequencer(&bench.camera(), Arc::new(AlwaysContinue))
        .resume(&again.ledger_path)
        .await
        .unwrap();
    assert!(none.is_none());
}

#[tokio::test]
async fn test_spawned_run_reports_progress() {
    let bench = Bench::new();
    let gateway = bench.camera();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sequencer = bench
        .sequencer(&gateway, Arc::new(AlwaysContinue))
        .with_progress(tx);

    let handle = spawn_run(sequencer, RunRequest::Fresh(plan()));
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    let report = handle.join().await.unwrap();

    assert_eq!(report.outcome.completed, 3);
    let started: Vec<(String, u32, usize)> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::StepStarted {
                wavelength,
                picture_number,
                position,
                ..
            } => Some((wavelength.clone(), *picture_number, *position)),
            _ => None,
        })
        .collect();
    assert_eq!(
        started,
        vec![
            ("500".to_string(), 1, 1),
            ("500".to_string(), 2, 2),
            ("600".to_string(), 1, 3),
        ]
    );
    assert!(matches!(events.last(), Some(ProgressEvent::RunFinished(_))));
}

#[tokio::test]
async fn test_preexisting_files_are_ignored() {
    let bench = Bench::new();
    std::fs::write(bench.raw.path().join("old_capture.bin"), [1u8; 64]).unwrap();
    let gateway = MockGateway::new();

    let report = bench
        .sequencer(&gateway, Arc::new(AlwaysContinue))
        .run_plan(&AcquisitionPlan::from_pairs([("500", 1)]).unwrap())
        .await
        .unwrap();

    assert_eq!(statuses(&report.ledger_path), vec![StepStatus::Timeout]);
}

//! End-to-end tests for the job controller.
//!
//! A shell script stands in for the compressor; the tests drive the
//! controller through start, cancel and every terminal state while checking
//! the event stream the consumer sees.

use dualcomp::core::{
    ConfigError, JobConfig, JobController, JobEvent, LifecycleTransition, LogTag,
    NotRunningError, RunState, SpawnError, StartError, TargetSize, ToolSettings,
};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::{TempDir, tempdir};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::timeout;

/// Helper to write an executable shell script
fn create_script(path: &Path, body: &str) {
    std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).unwrap();
}

/// Scratch layout: an input directory, an output path and a compressor path.
struct Workspace {
    temp: TempDir,
    tool: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let temp = tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("input")).unwrap();
        let tool = temp.path().join("dual_output_image_compressor.sh");
        Self { temp, tool }
    }

    fn with_tool(body: &str) -> Self {
        let ws = Self::new();
        create_script(&ws.tool, body);
        ws
    }

    fn job(&self) -> JobConfig {
        JobConfig::new(self.temp.path().join("input"), self.temp.path().join("output"))
    }

    fn controller(&self) -> (JobController, UnboundedReceiver<JobEvent>) {
        JobController::new(ToolSettings::new(&self.tool))
    }
}

async fn next_event(rx: &mut UnboundedReceiver<JobEvent>) -> JobEvent {
    timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timeout waiting for event")
        .expect("event channel closed")
}

/// Collect events until a terminal lifecycle transition arrives.
async fn until_terminal(rx: &mut UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
    let mut events = Vec::new();
    loop {
        let event = next_event(rx).await;
        let done = matches!(&event, JobEvent::Lifecycle(t) if t.to.is_terminal());
        events.push(event);
        if done {
            return events;
        }
    }
}

fn transitions(events: &[JobEvent]) -> Vec<(RunState, RunState)> {
    events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Lifecycle(t) => Some((t.from, t.to)),
            _ => None,
        })
        .collect()
}

fn last_transition(events: &[JobEvent]) -> &LifecycleTransition {
    match events.last() {
        Some(JobEvent::Lifecycle(t)) => t,
        other => panic!("expected lifecycle event last, got {other:?}"),
    }
}

fn progress_values(events: &[JobEvent]) -> Vec<f64> {
    events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Progress(p) => Some(p.value),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_successful_run() {
    let ws = Workspace::with_tool("echo 'Komprimiere bild1.jpg'\necho '✓ Fertig'\nexit 0");
    let (controller, mut rx) = ws.controller();
    assert_eq!(controller.state().await, RunState::Idle);

    let run = controller.start(ws.job()).await.unwrap();
    let events = until_terminal(&mut rx).await;

    assert_eq!(
        transitions(&events),
        vec![
            (RunState::Idle, RunState::Starting),
            (RunState::Starting, RunState::Running),
            (RunState::Running, RunState::Succeeded),
        ]
    );
    assert_eq!(last_transition(&events).exit_code, Some(0));

    // Log, then the progress it caused, then the next log.
    match &events[2..5] {
        [
            JobEvent::Log { event: first, .. },
            JobEvent::Progress(p),
            JobEvent::Log { event: second, .. },
        ] => {
            assert_eq!(first.seq, 1);
            assert_eq!(first.tag, LogTag::Progress);
            assert_eq!(first.text, "Komprimiere bild1.jpg");
            assert!((p.value - 0.05).abs() < 1e-9);
            assert_eq!(second.seq, 2);
            assert_eq!(second.tag, LogTag::Success);
        }
        other => panic!("unexpected event order: {other:?}"),
    }
    assert_eq!(progress_values(&events).last(), Some(&1.0));

    assert_eq!(controller.state().await, RunState::Succeeded);
    assert_eq!(controller.progress().await, 1.0);

    let snapshot = controller.snapshot().await.unwrap();
    assert_eq!(snapshot.id, run.id());
    assert_eq!(snapshot.state, RunState::Succeeded);
    assert_eq!(snapshot.progress, 1.0);
    assert_eq!(snapshot.exit_code, Some(0));
    assert!(snapshot.finished_at.is_some());
    let texts: Vec<_> = snapshot.logs.iter().map(|l| l.text.as_str()).collect();
    assert_eq!(texts, vec!["Komprimiere bild1.jpg", "✓ Fertig"]);
}

#[tokio::test]
async fn test_cancelled_run_is_not_failed() {
    let ws = Workspace::with_tool(
        "trap 'exit 137' TERM\necho 'Compressing a.jpg'\nwhile true; do sleep 0.1; done",
    );
    let (controller, mut rx) = ws.controller();
    let run = controller.start(ws.job()).await.unwrap();

    // Wait until the script is past its trap and printing.
    loop {
        if let JobEvent::Log { event, .. } = next_event(&mut rx).await {
            assert_eq!(event.tag, LogTag::Progress);
            break;
        }
    }

    controller.cancel(&run).await.unwrap();
    let second = controller.cancel(&run).await;
    assert!(
        matches!(second, Ok(()) | Err(NotRunningError(_))),
        "second cancel must be harmless: {second:?}"
    );

    let events = until_terminal(&mut rx).await;
    let last = last_transition(&events);
    assert_eq!(last.from, RunState::Running);
    assert_eq!(last.to, RunState::Cancelled);
    assert_eq!(last.exit_code, Some(137));

    assert_eq!(controller.state().await, RunState::Cancelled);
    // Frozen where it was, not forced to 1.0.
    assert!((controller.progress().await - 0.05).abs() < 1e-9);

    assert_eq!(
        controller.cancel(&run).await,
        Err(NotRunningError(run.id().to_string()))
    );
}

#[tokio::test]
async fn test_cancel_after_tool_closes_output() {
    let ws = Workspace::with_tool("echo 'Compressing a.jpg'\nexec >/dev/null 2>&1\nsleep 20");
    let (controller, mut rx) = ws.controller();
    let run = controller.start(ws.job()).await.unwrap();

    loop {
        if let JobEvent::Log { event, .. } = next_event(&mut rx).await {
            assert_eq!(event.tag, LogTag::Progress);
            break;
        }
    }
    // Let the drain reach EOF before cancelling.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(controller.state().await, RunState::Running);

    controller.cancel(&run).await.unwrap();

    let events = timeout(Duration::from_secs(5), until_terminal(&mut rx))
        .await
        .expect("cancel did not stop a tool with closed output");
    let last = last_transition(&events);
    assert_eq!(last.to, RunState::Cancelled);
    assert_eq!(last.exit_code, Some(143));
    assert_eq!(controller.state().await, RunState::Cancelled);
}

#[tokio::test]
async fn test_spawn_failure_leaves_controller_usable() {
    let ws = Workspace::new();
    let (controller, mut rx) = ws.controller();

    match controller.start(ws.job()).await {
        Err(StartError::Spawn(SpawnError::NotFound(path))) => assert_eq!(path, ws.tool),
        other => panic!("expected spawn failure, got {other:?}"),
    }

    assert_eq!(controller.state().await, RunState::Failed);
    assert!(controller.snapshot().await.is_none(), "no partial run recorded");

    let first = next_event(&mut rx).await;
    let second = next_event(&mut rx).await;
    assert_eq!(
        transitions(&[first, second]),
        vec![
            (RunState::Idle, RunState::Starting),
            (RunState::Starting, RunState::Failed),
        ]
    );
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)), "no log events");

    // Install the compressor and try again.
    create_script(&ws.tool, "echo 'Done'");
    controller.start(ws.job()).await.unwrap();
    let events = until_terminal(&mut rx).await;
    assert_eq!(transitions(&events)[0], (RunState::Failed, RunState::Starting));
    assert_eq!(last_transition(&events).to, RunState::Succeeded);
}

#[tokio::test]
async fn test_invalid_config_is_rejected_before_spawn() {
    let ws = Workspace::with_tool("touch \"$0.ran\"\necho 'Done'");
    let (controller, mut rx) = ws.controller();

    let missing = ws.temp.path().join("does-not-exist");
    let job = JobConfig::new(&missing, ws.temp.path().join("output"));

    match controller.start(job).await {
        Err(StartError::Config(ConfigError::InputNotFound(path))) => assert_eq!(path, missing),
        other => panic!("expected config error, got {other:?}"),
    }

    let bad_jobs = ws.job().with_parallelism(0);
    assert!(matches!(
        controller.start(bad_jobs).await,
        Err(StartError::Config(ConfigError::ParallelismOutOfRange { .. }))
    ));

    assert_eq!(controller.state().await, RunState::Idle);
    assert!(controller.snapshot().await.is_none());
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    assert!(!ws.tool.with_extension("sh.ran").exists(), "compressor must not run");
}

#[tokio::test]
async fn test_concurrent_start_is_rejected() {
    let ws = Workspace::with_tool("echo 'Compressing a.jpg'\nwhile true; do sleep 0.1; done");
    let (controller, mut rx) = ws.controller();

    let run = controller.start(ws.job()).await.unwrap();
    let before = controller.snapshot().await.unwrap();

    match controller.start(ws.job()).await {
        Err(StartError::ConcurrentRun(active)) => assert_eq!(active, run.id().to_string()),
        other => panic!("expected concurrent run error, got {other:?}"),
    }

    assert_eq!(controller.state().await, RunState::Running);
    let after = controller.snapshot().await.unwrap();
    assert_eq!(after.id, before.id);
    assert_eq!(after.state, RunState::Running);

    controller.cancel(&run).await.unwrap();
    let events = until_terminal(&mut rx).await;
    assert_eq!(last_transition(&events).to, RunState::Cancelled);
}

#[tokio::test]
async fn test_non_zero_exit_fails_with_code() {
    let ws = Workspace::with_tool(
        "echo 'Komprimiere kaputt.jpg'\necho '✗ Fehler: kaputt.jpg' >&2\necho 'Warnung: 1 Datei übersprungen'\nexit 2",
    );
    let (controller, mut rx) = ws.controller();
    controller.start(ws.job()).await.unwrap();

    let events = until_terminal(&mut rx).await;
    let last = last_transition(&events);
    assert_eq!(last.to, RunState::Failed);
    assert_eq!(last.exit_code, Some(2));
    assert!(last.reason.as_deref().unwrap().contains("code 2"));

    let snapshot = controller.snapshot().await.unwrap();
    let tags: Vec<_> = snapshot.logs.iter().map(|l| l.tag).collect();
    assert_eq!(tags, vec![LogTag::Progress, LogTag::Error, LogTag::Warning]);
    assert_eq!(snapshot.exit_code, Some(2));
    assert!((snapshot.progress - 0.05).abs() < 1e-9);
}

#[tokio::test]
async fn test_progress_is_monotonic_and_saturates() {
    let ws = Workspace::with_tool(
        "i=0\nwhile [ $i -lt 25 ]; do echo \"Compressing img_$i.jpg\"; i=$((i+1)); done\necho Done",
    );
    let (controller, mut rx) = ws.controller();
    controller.start(ws.job()).await.unwrap();

    let events = until_terminal(&mut rx).await;
    let values = progress_values(&events);
    assert!(values.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {values:?}");

    // 18 ticks reach the ceiling, then only the success bump to 1.0.
    assert_eq!(values.len(), 19);
    assert!((values[17] - 0.9).abs() < 1e-9);
    assert!(values[..18].iter().all(|v| *v <= 0.9));
    assert_eq!(values[18], 1.0);

    let seqs: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Log { event, .. } => Some(event.seq),
            _ => None,
        })
        .collect();
    assert_eq!(seqs, (1..=26).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_tool_receives_arguments_and_job_count() {
    let ws = Workspace::with_tool(r#"echo "$1|$2|$3|$COMPRESS_JOBS""#);
    let tool = ToolSettings {
        program: ws.tool.clone(),
        jobs_env_var: "COMPRESS_JOBS".to_string(),
    };
    let (controller, mut rx) = JobController::new(tool);

    let job = ws
        .job()
        .with_target_size(TargetSize::kilobytes(300))
        .with_parallelism(12);
    let expected = format!(
        "{}|{}|-k300|12",
        ws.temp.path().join("input").display(),
        ws.temp.path().join("output").display()
    );

    controller.start(job).await.unwrap();
    until_terminal(&mut rx).await;

    let snapshot = controller.snapshot().await.unwrap();
    assert_eq!(snapshot.logs.len(), 1);
    assert_eq!(snapshot.logs[0].text, expected);
    assert_eq!(snapshot.logs[0].tag, LogTag::Plain);
}

#[tokio::test]
async fn test_new_run_supersedes_previous() {
    let ws = Workspace::with_tool("echo 'Compressing x.jpg'\necho done");
    let (controller, mut rx) = ws.controller();

    let first = controller.start(ws.job()).await.unwrap();
    until_terminal(&mut rx).await;

    let second = controller.start(ws.job()).await.unwrap();
    let events = until_terminal(&mut rx).await;
    assert_ne!(first.id(), second.id());
    assert_eq!(
        transitions(&events)[0],
        (RunState::Succeeded, RunState::Starting)
    );

    // Fresh run: its own log history and sequence numbers.
    let snapshot = controller.snapshot().await.unwrap();
    assert_eq!(snapshot.id, second.id());
    assert_eq!(snapshot.logs.len(), 2);
    assert_eq!(snapshot.logs[0].seq, 1);

    assert!(controller.cancel(&first).await.is_err());
}

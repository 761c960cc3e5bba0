//! Run lifecycle controller.
//!
//! Accepts start/cancel commands from a consumer, drives one compressor run
//! at a time on a background task, and reports everything that happens as
//! `JobEvent`s on a channel the consumer drains at its own pace. The
//! background task never touches consumer state directly.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::classifier::classify;
use super::error::{NotRunningError, StartError};
use super::models::{
    JobConfig, JobEvent, JobRun, LifecycleTransition, LogEvent, LogTag, ProgressUpdate, RunId,
    RunState, format_elapsed,
};
use super::progress::ProgressEstimator;
use super::supervisor::{self, ExitOutcome, LineSource, ProcessHandle};

/// How the compressor is invoked.
#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub program: PathBuf,
    /// Environment variable carrying the parallel job count.
    pub jobs_env_var: String,
}

impl ToolSettings {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            jobs_env_var: "DUAL_COMPRESSOR_JOBS".to_string(),
        }
    }
}

/// Identifies a run accepted by `JobController::start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    id: RunId,
}

impl RunHandle {
    pub fn id(&self) -> RunId {
        self.id
    }
}

struct ActiveRun {
    record: JobRun,
    progress: Arc<ProgressEstimator>,
    cancel: CancellationToken,
}

struct Shared {
    state: RunState,
    run: Option<ActiveRun>,
}

/// Owns the current run and the lifecycle state machine.
#[derive(Clone)]
pub struct JobController {
    tool: Arc<ToolSettings>,
    shared: Arc<RwLock<Shared>>,
    events: UnboundedSender<JobEvent>,
}

impl JobController {
    /// Create a controller in the `Idle` state and the receiving end of its
    /// event channel.
    pub fn new(tool: ToolSettings) -> (Self, UnboundedReceiver<JobEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let controller = Self {
            tool: Arc::new(tool),
            shared: Arc::new(RwLock::new(Shared {
                state: RunState::Idle,
                run: None,
            })),
            events,
        };
        (controller, rx)
    }

    /// Validate `config`, spawn the compressor and start draining its output.
    ///
    /// A rejected config or a concurrent run leaves the controller untouched.
    /// A spawn failure moves it to `Failed` without recording a run; a new
    /// `start` is accepted right away.
    pub async fn start(&self, config: JobConfig) -> Result<RunHandle, StartError> {
        let mut shared = self.shared.write().await;

        if shared.state.is_active() {
            let active = shared
                .run
                .as_ref()
                .map(|r| r.record.id.to_string())
                .unwrap_or_default();
            warn!(active_run = %active, "Rejected start while a run is active");
            return Err(StartError::ConcurrentRun(active));
        }

        config.validate()?;

        let run_id = RunId::new();
        let previous = shared.state;
        shared.state = RunState::Starting;
        self.transition(run_id, previous, RunState::Starting, None, None);

        info!(
            run_id = %run_id,
            input = %config.input_dir.display(),
            output = %config.output_dir.display(),
            target_size = %config.target_size,
            jobs = config.parallelism,
            "Starting compression"
        );

        let env = [(self.tool.jobs_env_var.clone(), config.parallelism.to_string())];
        let mut process = match supervisor::start(&self.tool.program, config.tool_args(), &env) {
            Ok(process) => process,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Failed to launch compressor");
                shared.state = RunState::Failed;
                shared.run = None;
                self.transition(
                    run_id,
                    RunState::Starting,
                    RunState::Failed,
                    None,
                    Some(e.to_string()),
                );
                return Err(StartError::Spawn(e));
            }
        };

        let progress = Arc::new(ProgressEstimator::new());
        let cancel = CancellationToken::new();
        let output = process.take_output();

        shared.state = RunState::Running;
        shared.run = Some(ActiveRun {
            record: JobRun {
                id: run_id,
                config,
                state: RunState::Running,
                progress: 0.0,
                logs: Vec::new(),
                exit_code: None,
                started_at: Utc::now(),
                finished_at: None,
            },
            progress: progress.clone(),
            cancel: cancel.clone(),
        });
        self.transition(run_id, RunState::Starting, RunState::Running, None, None);

        let drain = RunDrain {
            run_id,
            shared: self.shared.clone(),
            events: self.events.clone(),
            progress,
            cancel,
            next_seq: 1,
        };
        let span = info_span!("compression_run", run_id = %run_id, pid = process.pid());
        tokio::spawn(drain.run(process, output).instrument(span));

        Ok(RunHandle { id: run_id })
    }

    /// Request cancellation of `run`.
    ///
    /// The run keeps draining output and settles in `Cancelled` once the
    /// compressor exits. Repeated calls while it drains are no-ops; calls
    /// after it settled return `NotRunningError`.
    pub async fn cancel(&self, run: &RunHandle) -> Result<(), NotRunningError> {
        let shared = self.shared.read().await;
        match &shared.run {
            Some(active) if active.record.id == run.id && shared.state == RunState::Running => {
                if !active.cancel.is_cancelled() {
                    info!(run_id = %run.id, "Cancellation requested");
                    active.cancel.cancel();
                }
                Ok(())
            }
            _ => Err(NotRunningError(run.id.to_string())),
        }
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> RunState {
        self.shared.read().await.state
    }

    /// Progress of the current (or last) run, 0.0 when none exists.
    pub async fn progress(&self) -> f64 {
        self.shared
            .read()
            .await
            .run
            .as_ref()
            .map(|r| r.progress.value())
            .unwrap_or(0.0)
    }

    /// Copy of the current (or last) run record.
    pub async fn snapshot(&self) -> Option<JobRun> {
        let shared = self.shared.read().await;
        shared.run.as_ref().map(|active| {
            let mut record = active.record.clone();
            record.progress = active.progress.value();
            record
        })
    }

    fn transition(
        &self,
        run_id: RunId,
        from: RunState,
        to: RunState,
        exit_code: Option<i32>,
        reason: Option<String>,
    ) {
        let _ = self.events.send(JobEvent::Lifecycle(LifecycleTransition {
            run_id,
            from,
            to,
            exit_code,
            reason,
        }));
    }
}

/// Background half of a run: reads output until EOF, then settles the state.
struct RunDrain {
    run_id: RunId,
    shared: Arc<RwLock<Shared>>,
    events: UnboundedSender<JobEvent>,
    progress: Arc<ProgressEstimator>,
    cancel: CancellationToken,
    next_seq: u64,
}

enum Ending {
    Eof,
    ReadFault(String),
}

impl RunDrain {
    async fn run<L: LineSource>(mut self, mut process: ProcessHandle, output: Option<L>) {
        let ending = match output {
            Some(lines) => self.drain(&mut process, lines).await,
            None => Ending::ReadFault("compressor output was not captured".to_string()),
        };

        if let Ending::ReadFault(fault) = &ending {
            error!(error = %fault, "Failed reading compressor output");
            self.record_line(LogTag::Error, format!("Failed reading compressor output: {fault}"))
                .await;
            // Nothing more will be read; make sure the group goes away.
            process.cancel();
        }

        let outcome = self.reap(&mut process).await;
        self.settle(ending, outcome).await;
    }

    async fn drain<L: LineSource>(
        &mut self,
        process: &mut ProcessHandle,
        mut lines: L,
    ) -> Ending {
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled(), if !process.cancel_requested() => {
                    warn!("Cancelling compressor");
                    process.cancel();
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.handle_line(line).await,
                    Ok(None) => return Ending::Eof,
                    Err(e) => return Ending::ReadFault(e.to_string()),
                },
            }
        }
    }

    /// Wait for the compressor to exit. A tool can close its output and keep
    /// working, so cancellation is still honoured here.
    async fn reap(&self, process: &mut ProcessHandle) -> std::io::Result<ExitOutcome> {
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled(), if !process.cancel_requested() => {
                    warn!("Cancelling compressor after its output closed");
                    process.cancel();
                }
                outcome = process.wait() => return outcome,
            }
        }
    }

    async fn handle_line(&mut self, line: String) {
        let tag = classify(&line);
        debug!(tag = ?tag, line = %line, "Compressor output");
        self.record_line(tag, line).await;

        if tag != LogTag::Progress {
            return;
        }
        if let Some(value) = self.progress.advance() {
            let _ = self.events.send(JobEvent::Progress(ProgressUpdate {
                run_id: self.run_id,
                value,
            }));
        }
    }

    async fn record_line(&mut self, tag: LogTag, text: String) {
        let event = LogEvent {
            seq: self.next_seq,
            tag,
            text,
            at: Utc::now(),
        };
        self.next_seq += 1;

        {
            let mut shared = self.shared.write().await;
            if let Some(active) = shared.run.as_mut() {
                active.record.logs.push(event.clone());
            }
        }

        let _ = self.events.send(JobEvent::Log {
            run_id: self.run_id,
            event,
        });
    }

    async fn settle(&self, ending: Ending, outcome: std::io::Result<ExitOutcome>) {
        // Decided under the write lock so a concurrent `cancel` is either
        // seen here or rejected as not running.
        let mut shared = self.shared.write().await;
        let cancelled = self.cancel.is_cancelled();

        let (to, exit_code, reason) = match (ending, outcome) {
            (Ending::ReadFault(fault), outcome) => {
                (RunState::Failed, outcome.ok().map(|o| o.code), Some(fault))
            }
            (Ending::Eof, Err(e)) => (
                RunState::Failed,
                None,
                Some(format!("Failed waiting for compressor: {e}")),
            ),
            (Ending::Eof, Ok(o)) if cancelled => (RunState::Cancelled, Some(o.code), None),
            (Ending::Eof, Ok(o)) if o.success() => (RunState::Succeeded, Some(0), None),
            (Ending::Eof, Ok(o)) => (
                RunState::Failed,
                Some(o.code),
                Some(format!("Compressor exited with code {}", o.code)),
            ),
        };

        if to == RunState::Succeeded {
            self.progress.complete();
        } else {
            self.progress.freeze();
        }

        shared.state = to;
        let elapsed = match shared.run.as_mut() {
            Some(active) if active.record.id == self.run_id => {
                active.record.state = to;
                active.record.exit_code = exit_code;
                active.record.finished_at = Some(Utc::now());
                active.record.progress = self.progress.value();
                Some(active.record.elapsed())
            }
            _ => None,
        };
        drop(shared);
        let elapsed = elapsed.map(format_elapsed).unwrap_or_default();

        match to {
            RunState::Succeeded => {
                info!(elapsed = %elapsed, "Compression finished successfully");
                let _ = self.events.send(JobEvent::Progress(ProgressUpdate {
                    run_id: self.run_id,
                    value: 1.0,
                }));
            }
            RunState::Cancelled => {
                warn!(elapsed = %elapsed, exit_code = ?exit_code, "Compression cancelled")
            }
            _ => {
                error!(elapsed = %elapsed, exit_code = ?exit_code, reason = ?reason, "Compression failed")
            }
        }

        let _ = self.events.send(JobEvent::Lifecycle(LifecycleTransition {
            run_id: self.run_id,
            from: RunState::Running,
            to,
            exit_code,
            reason,
        }));
    }
}

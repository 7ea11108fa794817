//! Bounded execution guard
//!
//! Runs a potentially slow or unstable forecasting call under a wall-clock
//! deadline and reports the result as an [`AttemptOutcome`]. Timeouts and
//! crashes are values, never panics or errors crossing the boundary.
//!
//! Two modes are available, picked by configuration:
//! - [`ExecutionMode::Cooperative`] runs the call on the calling thread. The
//!   callee observes the deadline at [`AttemptContext::checkpoint`].
//! - [`ExecutionMode::WorkerRace`] runs the call on a supervised worker thread
//!   raced against the deadline. A losing worker is abandoned and its result
//!   discarded.
//!
//! Every attempt owns a lazily created scratch directory and at most one child
//! process. Both are torn down before [`ExecutionGuard::run`] returns, on every
//! path.

use crate::config::{ExecutionMode, GuardConfig};
use crate::error::{ForecastError, Result};
use crossbeam::channel::{self, RecvTimeoutError};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, warn};

/// How an attempt ended
#[derive(Debug)]
pub enum AttemptOutcome<T> {
    Completed(T),
    TimedOut { elapsed: Duration },
    Crashed(CrashReason),
}

impl<T> AttemptOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, AttemptOutcome::Completed(_))
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, AttemptOutcome::TimedOut { .. })
    }

    pub fn is_crashed(&self) -> bool {
        matches!(self, AttemptOutcome::Crashed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashReason {
    /// The call panicked
    Panicked(String),
    /// A child process exited with a non-zero status or was killed by a signal
    AbnormalExit(String),
    /// The call returned a modelling or I/O error
    Failed(String),
}

impl fmt::Display for CrashReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrashReason::Panicked(msg) => write!(f, "panicked: {}", msg),
            CrashReason::AbnormalExit(msg) => write!(f, "abnormal exit: {}", msg),
            CrashReason::Failed(msg) => write!(f, "failed: {}", msg),
        }
    }
}

/// Deadline plus a shared cancellation flag
#[derive(Debug, Clone)]
pub struct CancelToken {
    started: Instant,
    deadline: Instant,
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    fn new(started: Instant, budget: Duration) -> Self {
        Self {
            started,
            deadline: started + budget,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn deadline_passed(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || Instant::now() >= self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn checkpoint(&self) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(ForecastError::Cancelled("attempt abandoned".to_string()));
        }
        if Instant::now() >= self.deadline {
            return Err(ForecastError::Cancelled("deadline exceeded".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct AttemptResources {
    label: String,
    scratch_root: Option<PathBuf>,
    scratch: Mutex<Option<TempDir>>,
    child: Mutex<Option<Child>>,
    torn_down: AtomicBool,
}

impl AttemptResources {
    fn new(label: &str, scratch_root: Option<PathBuf>) -> Self {
        Self {
            label: label.to_string(),
            scratch_root,
            scratch: Mutex::new(None),
            child: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        }
    }

    fn kill_child(&self) {
        let child = self.child.lock().take();
        if let Some(mut child) = child {
            reap(&self.label, &mut child);
        }
    }

    fn teardown(&self) {
        {
            let mut child = self.child.lock();
            self.torn_down.store(true, Ordering::SeqCst);
            if let Some(mut child) = child.take() {
                reap(&self.label, &mut child);
            }
        }

        let scratch = self.scratch.lock().take();
        if let Some(dir) = scratch {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(
                    attempt = %self.label,
                    path = %path.display(),
                    error = %e,
                    "scratch cleanup failed"
                );
            } else {
                debug!(attempt = %self.label, path = %path.display(), "scratch removed");
            }
        }
    }
}

fn reap(label: &str, child: &mut Child) {
    match child.try_wait() {
        Ok(Some(_)) => {}
        _ => {
            let pid = child.id();
            if let Err(e) = child.kill() {
                warn!(attempt = %label, pid, error = %e, "kill failed");
            }
            let _ = child.wait();
            debug!(attempt = %label, pid, "child process killed and reaped");
        }
    }
}

/// What a guarded call gets to work with
#[derive(Debug, Clone)]
pub struct AttemptContext {
    token: CancelToken,
    resources: Arc<AttemptResources>,
}

impl AttemptContext {
    /// `Err(Cancelled)` once the deadline has passed or the attempt was abandoned
    pub fn checkpoint(&self) -> Result<()> {
        self.token.checkpoint()
    }

    pub fn remaining(&self) -> Duration {
        self.token.remaining()
    }

    pub fn label(&self) -> &str {
        &self.resources.label
    }

    /// Scratch directory private to this attempt, created on first use
    pub fn scratch_dir(&self) -> Result<PathBuf> {
        let mut scratch = self.resources.scratch.lock();
        if self.resources.torn_down.load(Ordering::SeqCst) {
            return Err(ForecastError::Cancelled(
                "attempt already torn down".to_string(),
            ));
        }

        if let Some(dir) = scratch.as_ref() {
            return Ok(dir.path().to_path_buf());
        }

        let prefix = format!("attempt-{}-", sanitize(&self.resources.label));
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match &self.resources.scratch_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };

        let path = dir.path().to_path_buf();
        *scratch = Some(dir);
        Ok(path)
    }

    /// Spawn the attempt's child process; at most one may be alive
    pub fn spawn(&self, command: &mut Command) -> Result<u32> {
        let mut slot = self.resources.child.lock();
        if self.resources.torn_down.load(Ordering::SeqCst) {
            return Err(ForecastError::Cancelled(
                "attempt already torn down".to_string(),
            ));
        }
        if slot.is_some() {
            return Err(ForecastError::InvalidParameter(
                "attempt already owns a child process".to_string(),
            ));
        }
        self.token.checkpoint()?;

        let child = command.spawn()?;
        let pid = child.id();
        *slot = Some(child);
        debug!(attempt = %self.resources.label, pid, "child process spawned");
        Ok(pid)
    }

    /// Poll the child until it exits; kill it once the attempt is cancelled.
    ///
    /// A child killed at the deadline gives `Err(EngineTimeout)`, one killed
    /// because the attempt was abandoned gives `Err(Cancelled)`.
    pub fn wait_child(&self, poll_interval: Duration) -> Result<ExitStatus> {
        loop {
            {
                let mut slot = self.resources.child.lock();
                let child = slot.as_mut().ok_or_else(|| {
                    ForecastError::Cancelled("no child process to wait for".to_string())
                })?;
                if let Some(status) = child.try_wait()? {
                    slot.take();
                    return Ok(status);
                }
            }

            if let Err(e) = self.token.checkpoint() {
                self.resources.kill_child();
                if self.token.deadline_passed() {
                    return Err(ForecastError::EngineTimeout(self.token.elapsed()));
                }
                return Err(e);
            }

            thread::sleep(poll_interval.min(self.token.remaining()));
        }
    }
}

fn sanitize(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(48)
        .collect()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn classify<T>(result: thread::Result<Result<T>>, elapsed: Duration) -> AttemptOutcome<T> {
    match result {
        Ok(Ok(value)) => AttemptOutcome::Completed(value),
        Ok(Err(ForecastError::Cancelled(_))) | Ok(Err(ForecastError::EngineTimeout(_))) => {
            AttemptOutcome::TimedOut { elapsed }
        }
        Ok(Err(ForecastError::EngineCrash(msg))) => {
            AttemptOutcome::Crashed(CrashReason::AbnormalExit(msg))
        }
        Ok(Err(e)) => AttemptOutcome::Crashed(CrashReason::Failed(e.to_string())),
        Err(payload) => AttemptOutcome::Crashed(CrashReason::Panicked(panic_message(&*payload))),
    }
}

/// Runs calls under a deadline
#[derive(Debug, Clone)]
pub struct ExecutionGuard {
    deadline: Duration,
    mode: ExecutionMode,
    scratch_root: Option<PathBuf>,
}

impl ExecutionGuard {
    pub fn new(config: &GuardConfig) -> Self {
        Self {
            deadline: config.deadline(),
            mode: config.mode,
            scratch_root: config.scratch_root.clone(),
        }
    }

    pub fn with_deadline(deadline: Duration, mode: ExecutionMode) -> Self {
        Self {
            deadline,
            mode,
            scratch_root: None,
        }
    }

    pub fn with_scratch_root(mut self, root: PathBuf) -> Self {
        self.scratch_root = Some(root);
        self
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Run `f` under the deadline.
    ///
    /// A zero deadline times out without running `f`.
    pub fn run<T, F>(&self, label: &str, f: F) -> AttemptOutcome<T>
    where
        T: Send + 'static,
        F: FnOnce(&AttemptContext) -> Result<T> + Send + 'static,
    {
        if self.deadline.is_zero() {
            debug!(attempt = %label, "zero deadline, attempt skipped");
            return AttemptOutcome::TimedOut {
                elapsed: Duration::ZERO,
            };
        }

        let started = Instant::now();
        let ctx = AttemptContext {
            token: CancelToken::new(started, self.deadline),
            resources: Arc::new(AttemptResources::new(label, self.scratch_root.clone())),
        };

        let outcome = match self.mode {
            ExecutionMode::Cooperative => self.run_cooperative(&ctx, started, f),
            ExecutionMode::WorkerRace => self.run_worker_race(&ctx, started, f),
        };

        ctx.resources.teardown();

        match &outcome {
            AttemptOutcome::Completed(_) => debug!(
                attempt = %label,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "attempt completed"
            ),
            AttemptOutcome::TimedOut { elapsed } => warn!(
                attempt = %label,
                elapsed_ms = elapsed.as_millis() as u64,
                mode = ?self.mode,
                "attempt timed out"
            ),
            AttemptOutcome::Crashed(reason) => warn!(attempt = %label, %reason, "attempt crashed"),
        }

        outcome
    }

    fn run_cooperative<T, F>(
        &self,
        ctx: &AttemptContext,
        started: Instant,
        f: F,
    ) -> AttemptOutcome<T>
    where
        F: FnOnce(&AttemptContext) -> Result<T>,
    {
        let result = panic::catch_unwind(AssertUnwindSafe(|| f(ctx)));
        let elapsed = started.elapsed();

        // A result that arrives after the deadline is discarded
        if elapsed > self.deadline && matches!(result, Ok(Ok(_))) {
            return AttemptOutcome::TimedOut { elapsed };
        }
        classify(result, elapsed)
    }

    fn run_worker_race<T, F>(
        &self,
        ctx: &AttemptContext,
        started: Instant,
        f: F,
    ) -> AttemptOutcome<T>
    where
        T: Send + 'static,
        F: FnOnce(&AttemptContext) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = channel::bounded(1);
        let worker_ctx = ctx.clone();

        let spawned = thread::Builder::new()
            .name(format!("attempt-{}", sanitize(ctx.label())))
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| f(&worker_ctx)));
                // The receiver is gone when the race was lost
                let _ = tx.send(result);
            });

        if let Err(e) = spawned {
            return AttemptOutcome::Crashed(CrashReason::Failed(format!(
                "could not start worker: {}",
                e
            )));
        }

        match rx.recv_timeout(self.deadline) {
            Ok(result) => classify(result, started.elapsed()),
            Err(RecvTimeoutError::Timeout) => {
                ctx.token.cancel();
                AttemptOutcome::TimedOut {
                    elapsed: started.elapsed(),
                }
            }
            Err(RecvTimeoutError::Disconnected) => AttemptOutcome::Crashed(
                CrashReason::Panicked("worker exited without reporting".to_string()),
            ),
        }
    }
}

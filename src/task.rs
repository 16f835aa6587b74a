//! Shared task lifecycle: timing, transform bookkeeping, roundoff-check mode,
//! commit cadence, cooperative abort, and the restart policy.
//!
//! Every exponentiation task embeds an [`ExpCore`]. `execute` methods return
//! [`ExpError`]; a transient failure surfaces as `ExpError::Restart`, and the
//! task's `run` driver rolls back to the last good state and re-enters
//! `execute`, rebuilding the arithmetic context every few consecutive
//! restarts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info};

use crate::gw::{GwError, GwState};
use crate::input::InputNum;
use crate::progress::Progress;

/// Default commit cadence, in multiplications.
pub const MULS_PER_STATE_UPDATE: u64 = 30_000;

/// Rebuild the arithmetic context after this many consecutive restarts.
pub const RESTARTS_PER_REINIT: u32 = 3;

/// Give up after this many consecutive restarts.
pub const MAX_RESTARTS: u32 = 16;

/// Outcome of a task execution step.
#[derive(Debug)]
pub enum ExpError {
    /// Transient failure; roll back to the last good state and re-execute.
    Restart { reason: String },
    /// Cooperative cancellation observed at a commit point.
    Aborted,
    /// Unrecoverable failure: configuration, checkpoint I/O, or a restart
    /// budget exhausted.
    Fatal(anyhow::Error),
}

impl std::fmt::Display for ExpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpError::Restart { reason } => write!(f, "restart: {}", reason),
            ExpError::Aborted => write!(f, "aborted"),
            ExpError::Fatal(e) => write!(f, "fatal: {}", e),
        }
    }
}

impl std::error::Error for ExpError {}

impl From<GwError> for ExpError {
    fn from(e: GwError) -> Self {
        match e {
            // A roundoff excursion is transient: re-run from the last state.
            GwError::Roundoff => ExpError::Restart {
                reason: "roundoff error".into(),
            },
            other => ExpError::Fatal(anyhow::Error::new(other)),
        }
    }
}

impl From<anyhow::Error> for ExpError {
    fn from(e: anyhow::Error) -> Self {
        ExpError::Fatal(e)
    }
}

/// Lifecycle state shared by every exponentiation task.
pub struct ExpCore {
    iterations: u64,
    state_update_period: u64,
    timer: Instant,
    transforms: i64,
    error_check_forced: bool,
    error_check_near: bool,
    error_check: bool,
    abort: Arc<AtomicBool>,
    restart_count: u32,
    prefix: String,
    progress: Option<Arc<Progress>>,
    last_write: Instant,
}

impl ExpCore {
    pub fn new(abort: Arc<AtomicBool>) -> Self {
        ExpCore {
            iterations: 0,
            state_update_period: MULS_PER_STATE_UPDATE,
            timer: Instant::now(),
            transforms: 0,
            error_check_forced: false,
            error_check_near: true,
            error_check: false,
            abort,
            restart_count: 0,
            prefix: String::new(),
            progress: None,
            last_write: Instant::now(),
        }
    }

    /// Configure the per-multiplication roundoff check policy: `forced`
    /// always enables it; otherwise `near` enables it when the backend
    /// reports the FFT size near its reliability limit.
    pub fn set_error_check(&mut self, forced: bool, near: bool) {
        self.error_check_forced = forced;
        self.error_check_near = near;
    }

    pub fn attach_progress(&mut self, progress: Arc<Progress>) {
        self.progress = Some(progress);
    }

    /// Begin a task: stamp the timer, snapshot the transform counter and
    /// decide the roundoff-check mode.
    pub fn init(&mut self, gw: &GwState, iterations: u64, state_update_period: u64) {
        self.iterations = iterations;
        self.state_update_period = state_update_period.max(1);
        self.timer = Instant::now();
        self.transforms = -(gw.fft_count() as i64);
        self.decide_error_check(gw);
        if let Some(p) = &self.progress {
            p.set_total(iterations);
        }
    }

    /// Finish a task: report elapsed time and the transform delta.
    pub fn done(&mut self, gw: &GwState) {
        self.transforms += gw.fft_count() as i64;
        let elapsed = self.timer.elapsed().as_secs_f64();
        if let Some(p) = &self.progress {
            p.update(self.iterations, gw.fft_count() / 2);
        }
        info!(
            elapsed = format_args!("{:.3}s", elapsed),
            transforms = self.transforms,
            "{}done",
            self.prefix
        );
        self.prefix.clear();
    }

    /// Rebuild the arithmetic context from the input, preserving the
    /// transform counter. Used when restarts suggest the current transform
    /// is unreliable.
    pub fn reinit_gwstate(&mut self, input: &InputNum, gw: &mut GwState) -> Result<(), ExpError> {
        let fft_count = gw.fft_count();
        gw.done();
        input
            .setup(gw)
            .map_err(|e| ExpError::Fatal(anyhow::Error::new(e)))?;
        gw.set_fft_count(fft_count);
        error!("Restarting using {}", gw.fft_description());
        info!(
            fft_desc = gw.fft_description(),
            fft_len = gw.fft_length(),
            "arithmetic context rebuilt"
        );
        self.decide_error_check(gw);
        Ok(())
    }

    fn decide_error_check(&mut self, gw: &GwState) {
        self.error_check = if self.error_check_forced {
            true
        } else if self.error_check_near {
            gw.near_fft_limit()
        } else {
            false
        };
    }

    pub fn error_check(&self) -> bool {
        self.error_check
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn set_state_update_period(&mut self, period: u64) {
        self.state_update_period = period.max(1);
    }

    pub fn set_prefix(&mut self, prefix: String) {
        self.prefix = prefix;
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn is_last(&self, i: u64) -> bool {
        i + 1 >= self.iterations
    }

    pub fn should_commit(&self, i: u64) -> bool {
        i % self.state_update_period == 0 || i >= self.iterations
    }

    pub fn percent(&self, i: u64) -> f64 {
        if self.iterations == 0 {
            100.0
        } else {
            100.0 * i as f64 / self.iterations as f64
        }
    }

    pub fn check_abort(&self) -> Result<(), ExpError> {
        if self.abort.load(Ordering::Relaxed) {
            return Err(ExpError::Aborted);
        }
        Ok(())
    }

    pub fn update_progress(&self, i: u64, gw: &GwState) {
        if let Some(p) = &self.progress {
            p.update(i, gw.fft_count() / 2);
        }
    }

    pub fn stamp_write(&mut self) {
        self.last_write = Instant::now();
    }

    /// Time since the last point write, for callers pacing external
    /// reporting off the point schedule.
    pub fn since_last_write(&self) -> std::time::Duration {
        self.last_write.elapsed()
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub fn clear_restarts(&mut self) {
        self.restart_count = 0;
    }

    /// Restart bookkeeping shared by every task's `run` driver: count the
    /// restart, log it with the percentage it occurred at, and rebuild the
    /// context every `RESTARTS_PER_REINIT` consecutive failures.
    pub fn on_restart(
        &mut self,
        input: &InputNum,
        gw: &mut GwState,
        iteration: u64,
        reason: &str,
    ) -> Result<(), ExpError> {
        self.restart_count += 1;
        error!(
            restart = self.restart_count,
            "{}restarting at {:.1}%: {}",
            self.prefix,
            self.percent(iteration),
            reason
        );
        if self.restart_count >= MAX_RESTARTS {
            return Err(ExpError::Fatal(anyhow::anyhow!(
                "{} consecutive restarts, giving up",
                self.restart_count
            )));
        }
        if self.restart_count % RESTARTS_PER_REINIT == 0 {
            self.reinit_gwstate(input, gw)?;
        }
        Ok(())
    }
}

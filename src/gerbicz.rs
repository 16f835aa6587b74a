//! Multipoint exponentiation hardened with the Gerbicz–Li error check.
//!
//! The task runs the usual point schedule, but every `L2` iterations it
//! reconciles an independently accumulated check residue against a fresh
//! careful-arithmetic computation derived from the recovery residue. A
//! mismatch rolls the task back to the last verified state instead of
//! letting a transient hardware error poison days of work.
//!
//! Two state streams persist across crashes: the recovery file holds the
//! last *verified* residue, the working file the provisional one (plus the
//! check accumulator). Only a passed verification promotes working state to
//! recovery state.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use rug::ops::Pow;
use rug::Integer;
use tracing::{debug, error, info};

use crate::checkpoint::{GerbiczCheckState, State, StateFile};
use crate::gw::{GwNum, GwState, MulHints};
use crate::input::InputNum;
use crate::multipoint::{select_window, sliding_window, PointCallback};
use crate::task::{ExpCore, ExpError, MULS_PER_STATE_UPDATE};

/// Scheduled verifications per point when building point schedules.
pub const CHECKS_PER_POINT: u32 = 1;

/// Pick the Gerbicz block shape for `iters` total iterations: `l` is the
/// snapshot stride, `l2` the block length, with `l2` a multiple of `l` and
/// as close to `iters` as the stride allows. The base's bit length is
/// deliberately normalized to 1 so every base gets the same stride.
pub fn gerbicz_params(iters: u64) -> (u64, u64) {
    assert!(iters >= 1);
    let mut l = (iters as f64).sqrt() as u64;
    if l == 0 {
        l = 1;
    }
    let mut l2 = iters - iters % l;
    let mut i = l + 1;
    while i * i < 2 * iters {
        if l2 < iters - iters % i {
            l = i;
            l2 = iters - iters % i;
        }
        i += 1;
    }
    (l, l2)
}

enum WorkState {
    /// Iterations up to here are covered by the recovery stream.
    Cursor(u64),
    /// Provisional residue and check accumulator inside a block.
    Full(GerbiczCheckState),
}

impl WorkState {
    fn iteration(&self) -> u64 {
        match self {
            WorkState::Cursor(i) => *i,
            WorkState::Full(cs) => cs.iteration,
        }
    }
}

/// Gerbicz-checked variant of the multipoint task.
pub struct GerbiczCheckMultipointExp {
    input: InputNum,
    b: u32,
    points: Vec<u64>,
    l: u64,
    l2: u64,
    starting: Integer,
    file: StateFile,
    file_recovery: StateFile,
    state_recovery: Option<State>,
    recovery_dirty: bool,
    work: WorkState,
    on_point: Option<PointCallback>,
    w_cap: Option<u32>,
    max_size: Option<u64>,
    state_update_period: u64,
    core: ExpCore,
    x: Option<GwNum>,
    d: Option<GwNum>,
    r: Option<GwNum>,
    u: Vec<GwNum>,
    recovery_op: u64,
}

impl GerbiczCheckMultipointExp {
    pub fn new(
        input: InputNum,
        b: u32,
        points: Vec<u64>,
        starting: Integer,
        file: StateFile,
        file_recovery: StateFile,
        abort: Arc<AtomicBool>,
    ) -> Self {
        assert!(b >= 2);
        assert!(!points.is_empty());
        assert!(
            points.windows(2).all(|p| p[0] < p[1]),
            "points must be strictly increasing"
        );
        let (l, l2) = gerbicz_params(*points.last().unwrap());
        let state_update_period =
            (MULS_PER_STATE_UPDATE as f64 / (b as f64).log2()).max(1.0) as u64;
        GerbiczCheckMultipointExp {
            input,
            b,
            points,
            l,
            l2,
            starting,
            file,
            file_recovery,
            state_recovery: None,
            recovery_dirty: false,
            work: WorkState::Cursor(0),
            on_point: None,
            w_cap: None,
            max_size: None,
            state_update_period,
            core: ExpCore::new(abort),
            x: None,
            d: None,
            r: None,
            u: Vec::new(),
            recovery_op: 0,
        }
    }

    pub fn l(&self) -> u64 {
        self.l
    }

    pub fn l2(&self) -> u64 {
        self.l2
    }

    pub fn iterations(&self) -> u64 {
        *self.points.last().unwrap()
    }

    /// The last verified state; the final residue lives here once the task
    /// completes.
    pub fn state(&self) -> Option<&State> {
        self.state_recovery.as_ref()
    }

    pub fn set_on_point(&mut self, cb: PointCallback) {
        self.on_point = Some(cb);
    }

    pub fn set_window_cap(&mut self, w: u32) {
        self.w_cap = Some(w);
    }

    pub fn set_max_table_size(&mut self, size: u64) {
        self.max_size = Some(size);
    }

    pub fn set_state_update_period(&mut self, period: u64) {
        self.state_update_period = period.max(1);
    }

    pub fn core_mut(&mut self) -> &mut ExpCore {
        &mut self.core
    }

    /// Expected multiplication count for the whole task, including snapshot
    /// folds and verification work.
    pub fn cost(&self) -> f64 {
        let n = self.iterations() as f64;
        let l = self.l as f64;
        let l2 = self.l2 as f64;
        if self.b == 2 {
            n + n / l + n / l2 * l
        } else {
            let log2b = (self.b as f64).log2();
            let w = select_window(log2b * l, self.w_cap, self.max_size);
            n / l
                + (n / l + n / l2)
                    * ((1u64 << (w - 1)) as f64 + log2b * l * (1.0 + 1.0 / (w as f64 + 1.0)))
        }
    }

    pub fn init(&mut self, gw: &GwState) {
        self.core
            .init(gw, self.iterations(), self.state_update_period);
        self.core
            .set_prefix(format!("{} ", self.input.display_text()));

        if self.state_recovery.is_none() {
            info!(
                "{}Gerbicz check enabled, L2 = {}*{}",
                self.core.prefix(),
                self.l,
                self.l2 / self.l
            );
            if self.core.error_check() {
                info!("{}max roundoff check enabled", self.core.prefix());
            }
        }

        let loaded = self.file_recovery.read_state();
        self.recovery_dirty = loaded.is_none();
        let recovery = loaded.unwrap_or_else(|| State {
            iteration: 0,
            x: self.starting.clone(),
        });
        let rec_iter = recovery.iteration;
        self.state_recovery = Some(recovery);

        // A working state outside the current block is stale; fall back to
        // the recovery stream.
        self.work = match self.file.read_check_state() {
            Some(cs) if cs.iteration >= rec_iter && cs.iteration < rec_iter + self.l2 => {
                WorkState::Full(cs)
            }
            _ => WorkState::Cursor(rec_iter),
        };
        if self.work.iteration() > 0 {
            info!(
                "{}restarting at {:.1}%",
                self.core.prefix(),
                self.core.percent(self.work.iteration())
            );
        }
    }

    pub fn execute(&mut self, gw: &mut GwState) -> Result<(), ExpError> {
        let recovery = self.state_recovery.as_ref().expect("recovery state");
        let r = gw.from_integer(&recovery.x);
        let (mut i, x, d) = match &self.work {
            WorkState::Cursor(it) => (*it, r.clone(), r.clone()),
            WorkState::Full(cs) => (
                cs.iteration,
                gw.from_integer(&cs.x),
                gw.from_integer(&cs.d),
            ),
        };
        self.r = Some(r);
        self.x = Some(x);
        self.d = Some(d);
        self.recovery_op = gw.fft_count();

        let mut next_point = self.points.partition_point(|&p| i >= p);
        if i < 30 {
            gw.set_carefully_count((30 - i) as u32);
        }

        let mut last_power: Option<u64> = None;
        let mut exp = Integer::new();
        while next_point < self.points.len() {
            let rec_iter = self.state_recovery.as_ref().expect("recovery state").iteration;

            // Shrink the block when the next point is closer than a full one.
            let mut l = self.l;
            let mut l2 = self.l2;
            while self.points[next_point] - rec_iter < l2 && l > 1 {
                l /= 2;
                l2 = l * l;
                last_power = None;
            }
            debug_assert!(i - rec_iter <= l2);

            let mut j = i - rec_iter;
            if self.b == 2 {
                while j < l2 {
                    let chain = !self.core.is_last(i)
                        && i + 1 != self.points[next_point]
                        && j + 1 != l2;
                    gw.square(self.x.as_mut().expect("residue live"), MulHints::chain_if(chain))?;
                    i += 1;
                    j += 1;
                    if j != l2 && i == self.points[next_point] {
                        self.core.check_abort()?;
                        self.store_work(i, gw)?;
                        self.notify_point(i, gw);
                        next_point += 1;
                    }
                    if j != l2 && j % l == 0 {
                        gw.mul_into(
                            self.d.as_mut().expect("check accumulator live"),
                            self.x.as_ref().expect("residue live"),
                            MulHints::chain_if(j + l != l2).with_sources_transformed(true, false),
                        )?;
                    }
                    self.commit(i, gw)?;
                }
            } else {
                debug_assert!((i - rec_iter) % l == 0);
                while j < l2 {
                    if last_power != Some(l) {
                        last_power = Some(l);
                        exp = Integer::from(self.b).pow(crate::checked_u32(l));
                    }
                    sliding_window(
                        gw,
                        self.x.as_mut().expect("residue live"),
                        &mut self.u,
                        &exp,
                        self.w_cap,
                        self.max_size,
                        false,
                    )?;
                    i += l;
                    j += l;
                    if j != l2 && i == self.points[next_point] {
                        self.core.check_abort()?;
                        self.store_work(i, gw)?;
                        self.notify_point(i, gw);
                        next_point += 1;
                    }
                    if j != l2 {
                        gw.mul_into(
                            self.d.as_mut().expect("check accumulator live"),
                            self.x.as_ref().expect("residue live"),
                            MulHints::chain_if(j + l != l2).with_sources_transformed(true, false),
                        )?;
                    }
                    self.commit(i, gw)?;
                }
            }
            self.core.check_abort()?;

            debug!("{}performing Gerbicz check at {}", self.core.prefix(), i);
            if !self.verify_block(gw, l, &exp)? {
                error!(
                    "{}Gerbicz check failed at {:.1}%",
                    self.core.prefix(),
                    self.core.percent(i)
                );
                let rec_iter = self.state_recovery.as_ref().expect("recovery state").iteration;
                self.work = WorkState::Cursor(rec_iter);
                gw.set_fft_count(self.recovery_op);
                return Err(ExpError::Restart {
                    reason: "Gerbicz check failed".into(),
                });
            }

            // Verified: the working residue becomes the new recovery point.
            let verified = State {
                iteration: i,
                x: gw.to_integer(self.x.as_ref().expect("residue live")),
            };
            gw.copy(self.x.as_ref().expect("residue live"), self.d.as_mut().expect("check accumulator live"));
            gw.copy(self.x.as_ref().expect("residue live"), self.r.as_mut().expect("recovery residue live"));
            self.state_recovery = Some(verified);
            self.recovery_dirty = true;
            self.work = WorkState::Cursor(i);
            self.write_state()?;
            self.recovery_op = gw.fft_count();
            self.core.clear_restarts();
            self.core.update_progress(i, gw);

            if i == self.points[next_point] {
                self.notify_point(i, gw);
                next_point += 1;
            }
            // Otherwise keep accumulating blocks toward the same point.
        }

        self.core.done(gw);
        self.release();
        Ok(())
    }

    /// Execute with the restart policy applied.
    pub fn run(&mut self, gw: &mut GwState) -> Result<(), ExpError> {
        self.init(gw);
        loop {
            match self.execute(gw) {
                Err(ExpError::Restart { reason }) => {
                    let at = self.work.iteration();
                    self.core.on_restart(&self.input, gw, at, &reason)?;
                }
                other => return other,
            }
        }
    }

    pub fn release(&mut self) {
        self.recovery_op = 0;
        self.x = None;
        self.d = None;
        self.r = None;
        self.u.clear();
    }

    /// Recompute the block endpoint from the recovery residue in careful
    /// arithmetic and compare. Returns whether the block is consistent.
    fn verify_block(&mut self, gw: &mut GwState, l: u64, exp: &Integer) -> Result<bool, ExpError> {
        // d_new = X_end * D, the fully folded accumulator.
        let mut d_new = self.d.as_ref().expect("check accumulator live").clone();
        gw.carefully().mul_into(&mut d_new, self.x.as_ref().expect("residue live"))?;

        // Advance the pre-fold accumulator one snapshot stride and fold in
        // the recovery residue: equal to d_new iff the block was clean.
        let mut t = self.d.as_ref().expect("check accumulator live").clone();
        if self.b == 2 {
            for _ in 0..l {
                gw.carefully().square(&mut t)?;
            }
        } else {
            sliding_window(gw, &mut t, &mut self.u, exp, self.w_cap, self.max_size, true)?;
        }
        gw.carefully().mul_into(&mut t, self.r.as_ref().expect("recovery residue live"))?;

        let mut diff = gw.alloc();
        gw.carefully().sub(&t, &d_new, &mut diff);
        Ok(diff.is_zero() && !d_new.is_zero())
    }

    fn notify_point(&mut self, i: u64, gw: &GwState) {
        if self.on_point.is_some() {
            let snapshot = State {
                iteration: i,
                x: gw.to_integer(self.x.as_ref().expect("residue live")),
            };
            if let Some(cb) = self.on_point.as_mut() {
                cb(i, &snapshot);
            }
            self.core.stamp_write();
        }
    }

    fn commit(&mut self, i: u64, gw: &GwState) -> Result<(), ExpError> {
        self.core.check_abort()?;
        if self.core.should_commit(i) {
            self.store_work(i, gw)?;
            self.core.update_progress(i, gw);
        }
        Ok(())
    }

    fn store_work(&mut self, i: u64, gw: &GwState) -> Result<(), ExpError> {
        let cs = GerbiczCheckState {
            iteration: i,
            x: gw.to_integer(self.x.as_ref().expect("residue live")),
            d: gw.to_integer(self.d.as_ref().expect("check accumulator live")),
        };
        self.work = WorkState::Full(cs);
        self.write_state()
    }

    /// Flush both streams: the recovery file only when dirty, the working
    /// file always.
    fn write_state(&mut self) -> Result<(), ExpError> {
        if self.recovery_dirty {
            self.file_recovery
                .write_state(self.state_recovery.as_ref().expect("recovery state"))?;
            self.recovery_dirty = false;
        }
        match &self.work {
            WorkState::Full(cs) => self.file.write_check_state(cs)?,
            WorkState::Cursor(it) => self.file.write_cursor(*it)?,
        }
        Ok(())
    }
}

//! Iterated exponentiation over a schedule of checkpoints ("points").
//!
//! Between consecutive points the residue advances by `b^(gap)`: pure
//! squarings when `b = 2`, sliding-window exponentiation otherwise. At each
//! point the task flushes pending work, commits the residue, and invokes the
//! per-point callback — the hook used for residue reporting and proof-stream
//! emission.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use rug::ops::Pow;
use rug::Integer;
use tracing::info;

use crate::checkpoint::{State, StateFile};
use crate::gw::{GwError, GwNum, GwState, MulHints};
use crate::input::InputNum;
use crate::task::{ExpCore, ExpError, MULS_PER_STATE_UPDATE};

/// Invoked at each committed point with the committed state.
pub type PointCallback = Box<dyn FnMut(u64, &State)>;

/// Pick the sliding-window width for an exponent of `len` bits: the smallest
/// `W >= 2` where widening stops paying for the larger odd-power table,
/// subject to the optional width cap and table-size cap.
pub(crate) fn select_window(len: f64, w_cap: Option<u32>, max_size: Option<u64>) -> u32 {
    let mut w = 2u32;
    loop {
        let widen_allowed = w_cap.map_or(true, |c| w < c)
            && max_size.map_or(true, |m| 1u64 << (w + 1) <= m);
        let cur = (1u64 << (w - 1)) as f64 + len * (1.0 + 1.0 / (w as f64 + 1.0));
        let next = (1u64 << w) as f64 + len * (1.0 + 1.0 / (w as f64 + 2.0));
        if widen_allowed && cur > next {
            w += 1;
        } else {
            return w;
        }
    }
}

/// Sliding-window exponentiation: `x <- x^exp`.
///
/// The odd-power table `u` is rebuilt from the current `x` on every call;
/// allocations persist across calls. `u[k]` holds `x^(2k+1)`, with the
/// incoming `x` moved into `u[0]` and the scratch square built in its place.
pub(crate) fn sliding_window(
    gw: &mut GwState,
    x: &mut GwNum,
    u: &mut Vec<GwNum>,
    exp: &Integer,
    w_cap: Option<u32>,
    max_size: Option<u64>,
    careful: bool,
) -> Result<(), GwError> {
    let len = exp.significant_bits() as i64 - 1;
    let w = select_window(len as f64, w_cap, max_size);
    let table = 1usize << (w - 1);

    if u.is_empty() {
        u.push(gw.alloc());
    }
    std::mem::swap(&mut u[0], x);
    if careful {
        gw.carefully().square_from(&u[0], x)?;
    } else {
        gw.square_from(&u[0], x, MulHints::chain_if(true))?;
    }
    for idx in 1..table {
        if u.len() <= idx {
            u.push(gw.alloc());
        }
        let (head, tail) = u.split_at_mut(idx);
        if careful {
            gw.carefully().mul(&head[idx - 1], x, &mut tail[0])?;
        } else {
            gw.mul(
                &head[idx - 1],
                x,
                &mut tail[0],
                MulHints::chain_if(true).with_sources_transformed(true, true),
            )?;
        }
    }

    let mut i = len;
    while i >= 0 {
        if !exp.get_bit(i as u32) {
            if careful {
                gw.carefully().square(x)?;
            } else {
                gw.square(x, MulHints::chain_if(i > 0))?;
            }
            i -= 1;
            continue;
        }

        // Window of up to w bits ending at the next set bit from below.
        let mut j = (i - w as i64 + 1).max(0);
        while !exp.get_bit(j as u32) {
            j += 1;
        }
        let mut ui = 0usize;
        if i == len {
            // Top of the exponent: no squarings have happened yet, so the
            // window value replaces x outright.
            while i >= j {
                ui = (ui << 1) | usize::from(exp.get_bit(i as u32));
                i -= 1;
            }
            gw.copy(&u[ui / 2], x);
            continue;
        }
        while i >= j {
            if careful {
                gw.carefully().square(x)?;
            } else {
                gw.square(x, MulHints::chain_if(true))?;
            }
            ui = (ui << 1) | usize::from(exp.get_bit(i as u32));
            i -= 1;
        }
        if careful {
            gw.carefully().mul_into(x, &u[ui / 2])?;
        } else {
            gw.mul_into(
                x,
                &u[ui / 2],
                MulHints::chain_if(i > 0).with_sources_transformed(true, false),
            )?;
        }
    }
    Ok(())
}

/// Advances a residue to `x^(b^points.last())`, stopping at every scheduled
/// point to checkpoint and report.
pub struct MultipointExp {
    input: InputNum,
    b: u32,
    points: Vec<u64>,
    starting: Integer,
    file: StateFile,
    state: Option<State>,
    on_point: Option<PointCallback>,
    w_cap: Option<u32>,
    max_size: Option<u64>,
    state_update_period: u64,
    core: ExpCore,
    x: Option<GwNum>,
    u: Vec<GwNum>,
}

impl MultipointExp {
    pub fn new(
        input: InputNum,
        b: u32,
        points: Vec<u64>,
        starting: Integer,
        file: StateFile,
        abort: Arc<AtomicBool>,
    ) -> Self {
        assert!(b >= 2);
        assert!(!points.is_empty());
        assert!(
            points.windows(2).all(|p| p[0] < p[1]),
            "points must be strictly increasing"
        );
        MultipointExp {
            input,
            b,
            points,
            starting,
            file,
            state: None,
            on_point: None,
            w_cap: None,
            max_size: None,
            state_update_period: MULS_PER_STATE_UPDATE,
            core: ExpCore::new(abort),
            x: None,
            u: Vec::new(),
        }
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

    pub fn state(&self) -> Option<&State> {
        self.state.as_ref()
    }

    pub fn points(&self) -> &[u64] {
        &self.points
    }

    pub fn core_mut(&mut self) -> &mut ExpCore {
        &mut self.core
    }

    pub fn iterations(&self) -> u64 {
        *self.points.last().unwrap()
    }

    pub fn init(&mut self, gw: &GwState) {
        self.core.init(gw, self.iterations(), self.state_update_period);
        let state = self.file.read_state().unwrap_or_else(|| State {
            iteration: 0,
            x: self.starting.clone(),
        });
        self.init_state(state);
    }

    fn init_state(&mut self, state: State) {
        self.core
            .set_prefix(format!("{} ", self.input.display_text()));
        if state.iteration > 0 {
            info!(
                "{}restarting at {:.1}%",
                self.core.prefix(),
                self.core.percent(state.iteration)
            );
        }
        if self.core.error_check() {
            info!("{}max roundoff check enabled", self.core.prefix());
        }
        self.state = Some(state);
    }

    pub fn execute(&mut self, gw: &mut GwState) -> Result<(), ExpError> {
        let state = self.state.as_ref().expect("state initialized");
        let mut i = state.iteration;
        self.x = Some(gw.from_integer(&state.x));
        let mut next_point = self.points.partition_point(|&p| i >= p);
        if i < 30 {
            gw.set_carefully_count((30 - i) as u32);
        }

        let mut last_power: Option<u64> = None;
        let mut exp = Integer::new();
        while next_point < self.points.len() {
            let target = self.points[next_point];
            if self.b == 2 {
                while i < target {
                    gw.square(
                        self.x.as_mut().unwrap(),
                        MulHints::chain_if(!self.core.is_last(i) && i + 1 != target),
                    )?;
                    i += 1;
                    self.commit(i, gw)?;
                }
            } else {
                if last_power != Some(target - i) {
                    last_power = Some(target - i);
                    exp = Integer::from(self.b).pow(crate::checked_u32(target - i));
                }
                sliding_window(
                    gw,
                    self.x.as_mut().unwrap(),
                    &mut self.u,
                    &exp,
                    self.w_cap,
                    self.max_size,
                    false,
                )?;
                i = target;
            }

            if self.state.as_ref().map_or(true, |s| s.iteration != i) {
                self.core.check_abort()?;
                self.write_point_state(i, gw)?;
            }
            if let Some(cb) = self.on_point.as_mut() {
                cb(i, self.state.as_ref().unwrap());
                self.core.stamp_write();
            }
            next_point += 1;
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
                    let at = self.state.as_ref().map_or(0, |s| s.iteration);
                    self.core.on_restart(&self.input, gw, at, &reason)?;
                }
                other => return other,
            }
        }
    }

    pub fn release(&mut self) {
        self.x = None;
        self.u.clear();
    }

    fn commit(&mut self, i: u64, gw: &GwState) -> Result<(), ExpError> {
        self.core.check_abort()?;
        if self.core.should_commit(i) {
            self.write_point_state(i, gw)?;
        }
        Ok(())
    }

    fn write_point_state(&mut self, i: u64, gw: &GwState) -> Result<(), ExpError> {
        let x = self.x.as_ref().expect("residue live");
        let s = State {
            iteration: i,
            x: gw.to_integer(x),
        };
        self.file.write_state(&s)?;
        self.state = Some(s);
        self.core.update_progress(i, gw);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn ctx(input: &InputNum) -> GwState {
        let mut gw = GwState::new();
        input.setup(&mut gw).unwrap();
        gw
    }

    fn reference(x: u32, b: u32, e: u64, modulus: &Integer) -> Integer {
        let exp = Integer::from(b).pow(crate::checked_u32(e));
        Integer::from(x).pow_mod(&exp, modulus).unwrap()
    }

    #[test]
    fn select_window_starts_at_two() {
        // Tiny exponents never pay for a wider table.
        assert_eq!(select_window(4.0, None, None), 2);
    }

    #[test]
    fn select_window_grows_with_length() {
        let small = select_window(100.0, None, None);
        let large = select_window(1_000_000.0, None, None);
        assert!(large > small);
        assert!(small >= 2);
    }

    #[test]
    fn select_window_respects_caps() {
        assert!(select_window(1_000_000.0, Some(3), None) <= 3);
        // 2^(W+1) <= 16 bounds W at 3.
        assert!(select_window(1_000_000.0, None, Some(16)) <= 3);
    }

    #[test]
    fn sliding_window_matches_pow_mod() {
        let input = InputNum::new(1, 2, 10, -15); // N = 1009
        let modulus = input.value();
        let mut gw = ctx(&input);
        for e in [1u64, 2, 3, 59049, 0xDEADBE, 0x1_0000_0001] {
            let mut x = gw.from_integer(&Integer::from(7u32));
            let mut u = Vec::new();
            let exp = Integer::from(e);
            sliding_window(&mut gw, &mut x, &mut u, &exp, None, None, false).unwrap();
            let expected = Integer::from(7u32).pow_mod(&exp, &modulus).unwrap();
            assert_eq!(gw.to_integer(&x), expected, "exponent {}", e);
        }
    }

    #[test]
    fn sliding_window_careful_matches_pow_mod() {
        let input = InputNum::new(1, 2, 10, -15);
        let modulus = input.value();
        let mut gw = ctx(&input);
        let mut x = gw.from_integer(&Integer::from(5u32));
        let mut u = Vec::new();
        let exp = Integer::from(59049u32); // 3^10
        sliding_window(&mut gw, &mut x, &mut u, &exp, None, None, true).unwrap();
        let expected = Integer::from(5u32).pow_mod(&exp, &modulus).unwrap();
        assert_eq!(gw.to_integer(&x), expected);
    }

    #[test]
    fn squaring_points_commit_correct_residues() {
        let dir = tempfile::tempdir().unwrap();
        let input = InputNum::new(1, 2, 10, -15);
        let modulus = input.value();
        let mut gw = ctx(&input);
        let mut task = MultipointExp::new(
            input,
            2,
            vec![10, 25, 40],
            Integer::from(3u32),
            StateFile::new(dir.path().join("mp.json")),
            Arc::new(AtomicBool::new(false)),
        );
        let seen: Rc<RefCell<Vec<(u64, Integer)>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        task.set_on_point(Box::new(move |i, s| {
            sink.borrow_mut().push((i, s.x.clone()));
        }));
        task.run(&mut gw).unwrap();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 3);
        for (point, x) in seen.iter() {
            assert_eq!(*x, reference(3, 2, *point, &modulus), "point {}", point);
        }
    }

    #[test]
    fn base_three_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let input = InputNum::new(1, 2, 10, -15);
        let modulus = input.value();
        let mut gw = ctx(&input);
        let mut task = MultipointExp::new(
            input,
            3,
            vec![5, 15],
            Integer::from(2u32),
            StateFile::new(dir.path().join("mp.json")),
            Arc::new(AtomicBool::new(false)),
        );
        let seen: Rc<RefCell<Vec<(u64, Integer)>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        task.set_on_point(Box::new(move |i, s| {
            sink.borrow_mut().push((i, s.x.clone()));
        }));
        task.run(&mut gw).unwrap();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1, reference(2, 3, 5, &modulus));
        assert_eq!(seen[1].1, reference(2, 3, 15, &modulus));
    }

    #[test]
    fn final_residue_independent_of_schedule() {
        let input = InputNum::new(3, 2, 20, 1);
        let modulus = input.value();
        let mut finals = Vec::new();
        for points in [vec![40], vec![10, 25, 40], vec![1, 2, 3, 40]] {
            let dir = tempfile::tempdir().unwrap();
            let mut gw = ctx(&input);
            let mut task = MultipointExp::new(
                input.clone(),
                2,
                points,
                Integer::from(3u32),
                StateFile::new(dir.path().join("mp.json")),
                Arc::new(AtomicBool::new(false)),
            );
            task.run(&mut gw).unwrap();
            finals.push(task.state().unwrap().x.clone());
        }
        assert_eq!(finals[0], reference(3, 2, 40, &modulus));
        assert!(finals.iter().all(|f| *f == finals[0]));
    }

    #[test]
    fn resumes_mid_schedule_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = InputNum::new(1, 2, 10, -15);
        let modulus = input.value();
        let file = StateFile::new(dir.path().join("mp.json"));
        // A previous run committed point 25.
        file.write_state(&State {
            iteration: 25,
            x: reference(3, 2, 25, &modulus),
        })
        .unwrap();

        let mut gw = ctx(&input);
        let mut task = MultipointExp::new(
            input,
            2,
            vec![10, 25, 40],
            Integer::from(3u32),
            file,
            Arc::new(AtomicBool::new(false)),
        );
        let seen: Rc<RefCell<Vec<u64>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        task.set_on_point(Box::new(move |i, _| sink.borrow_mut().push(i)));
        task.run(&mut gw).unwrap();

        assert_eq!(*seen.borrow(), vec![40]);
        assert_eq!(task.state().unwrap().x, reference(3, 2, 40, &modulus));
    }

    #[test]
    fn gap_exponent_cache_reused_across_equal_gaps() {
        // Equal gaps exercise the cached-exponent path; correctness is
        // observable through the committed residues.
        let dir = tempfile::tempdir().unwrap();
        let input = InputNum::new(1, 2, 10, -15);
        let modulus = input.value();
        let mut gw = ctx(&input);
        let mut task = MultipointExp::new(
            input,
            5,
            vec![4, 8, 12],
            Integer::from(7u32),
            StateFile::new(dir.path().join("mp.json")),
            Arc::new(AtomicBool::new(false)),
        );
        task.run(&mut gw).unwrap();
        assert_eq!(task.state().unwrap().x, reference(7, 5, 12, &modulus));
    }
}

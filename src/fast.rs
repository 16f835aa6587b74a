//! Left-to-right binary exponentiation of a small base to a large exponent.
//!
//! The multiply-by-base is fused into the squaring via the provider's
//! mul-by-const slot, so each exponent bit costs exactly one multiplication.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use rug::Integer;
use tracing::info;

use crate::checkpoint::{State, StateFile};
use crate::gw::{GwNum, GwState, MulHints};
use crate::input::InputNum;
use crate::task::{ExpCore, ExpError, MULS_PER_STATE_UPDATE};

/// Computes `x0^exp` modulo the input.
pub struct FastExp {
    input: InputNum,
    exp: Integer,
    x0: u32,
    file: StateFile,
    state: Option<State>,
    state_update_period: u64,
    core: ExpCore,
}

impl FastExp {
    pub fn new(
        input: InputNum,
        exp: Integer,
        x0: u32,
        file: StateFile,
        abort: Arc<AtomicBool>,
    ) -> Self {
        assert!(exp >= 1u32);
        FastExp {
            input,
            exp,
            x0,
            file,
            state: None,
            state_update_period: MULS_PER_STATE_UPDATE,
            core: ExpCore::new(abort),
        }
    }

    pub fn iterations(&self) -> u64 {
        self.exp.significant_bits() as u64 - 1
    }

    pub fn state(&self) -> Option<&State> {
        self.state.as_ref()
    }

    pub fn set_state_update_period(&mut self, period: u64) {
        self.state_update_period = period.max(1);
    }

    pub fn core_mut(&mut self) -> &mut ExpCore {
        &mut self.core
    }

    /// Load any saved state and decide the run configuration. The base must
    /// fit the provider's mul-by-const slot.
    pub fn init(&mut self, gw: &GwState) {
        assert!(
            self.x0 <= gw.maxmulbyconst(),
            "base {} exceeds maxmulbyconst {}",
            self.x0,
            gw.maxmulbyconst()
        );
        self.core
            .init(gw, self.iterations(), self.state_update_period);
        self.core
            .set_prefix(format!("{} ", self.input.display_text()));
        self.state = self.file.read_state();
        if let Some(s) = &self.state {
            info!(
                "{}restarting at {:.1}%",
                self.core.prefix(),
                self.core.percent(s.iteration)
            );
        }
        if self.core.error_check() {
            info!("{}max roundoff check enabled", self.core.prefix());
        }
    }

    pub fn execute(&mut self, gw: &mut GwState) -> Result<(), ExpError> {
        let len = self.core.iterations();
        let mut i;
        let mut x;
        match &self.state {
            None => {
                i = 0;
                x = gw.alloc();
                gw.set_small(&mut x, self.x0);
                gw.set_carefully_count(30);
            }
            Some(s) => {
                i = s.iteration;
                x = gw.from_integer(&s.x);
            }
        }
        gw.set_mulbyconst(self.x0);
        while i < len {
            let bit = self.exp.get_bit(crate::checked_u32(len - i - 1));
            gw.square(
                &mut x,
                MulHints::chain_if(!self.core.is_last(i)).with_mulbyconst(bit),
            )?;
            i += 1;
            self.commit(i, &x, gw)?;
        }
        self.core.done(gw);
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

    fn commit(&mut self, i: u64, x: &GwNum, gw: &GwState) -> Result<(), ExpError> {
        self.core.check_abort()?;
        if self.core.should_commit(i) {
            let s = State {
                iteration: i,
                x: gw.to_integer(x),
            };
            self.file.write_state(&s)?;
            self.state = Some(s);
            self.core.update_progress(i, gw);
        }
        Ok(())
    }
}

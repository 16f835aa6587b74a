//! Input descriptions of the form k·b^n+c.
//!
//! An [`InputNum`] names the modulus under test and knows how to configure
//! the arithmetic context for it. Tasks keep one around for log prefixes and
//! for rebuilding the context after a restart.

use rug::ops::Pow;
use rug::Integer;

use crate::gw::{GwError, GwState};

/// Modulus description k·b^n+c.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputNum {
    k: u64,
    b: u32,
    n: u64,
    c: i64,
}

impl InputNum {
    pub fn new(k: u64, b: u32, n: u64, c: i64) -> Self {
        InputNum { k, b, n, c }
    }

    pub fn k(&self) -> u64 {
        self.k
    }

    pub fn b(&self) -> u32 {
        self.b
    }

    pub fn n(&self) -> u64 {
        self.n
    }

    pub fn c(&self) -> i64 {
        self.c
    }

    /// The modulus value N = k·b^n+c.
    pub fn value(&self) -> Integer {
        let mut v = Integer::from(self.k) * Integer::from(self.b).pow(crate::checked_u32(self.n));
        if self.c >= 0 {
            v += self.c as u64;
        } else {
            v -= self.c.unsigned_abs();
        }
        v
    }

    /// Human-readable form, e.g. `3*2^50000+1`.
    pub fn display_text(&self) -> String {
        format!(
            "{}*{}^{}{}{}",
            self.k,
            self.b,
            self.n,
            if self.c >= 0 { "+" } else { "-" },
            self.c.unsigned_abs()
        )
    }

    /// (Re)configure the arithmetic context for this modulus.
    pub fn setup(&self, gw: &mut GwState) -> Result<(), GwError> {
        gw.setup(self.value(), &self.display_text())
    }
}

impl std::fmt::Display for InputNum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display_text())
    }
}

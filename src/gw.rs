//! Arithmetic provider: transform-style modular multiplication contract plus
//! a software reference implementation backed by GMP (via `rug`).
//!
//! The engine drives millions of modular squarings through this interface.
//! A hardware provider (GWNUM-style IBDWT) would implement the same surface;
//! the software provider here reduces with plain GMP arithmetic, which makes
//! every engine path executable and testable on any platform.
//!
//! # Transform-domain hints
//!
//! `MulHints` carries the pipelining hints a transform backend understands:
//! `start_next_fft` (leave the result in transform domain for the next
//! multiplication), `fft_s1`/`fft_s2` (source already transformed), and
//! `mul_by_const` (fuse a small-constant multiply into the operation). The
//! software provider accepts and ignores the domain hints; callers must
//! still set them correctly, since a transform backend produces residues
//! that cannot be read back while `start_next_fft` chains are open.
//!
//! # Careful path
//!
//! `carefully()` returns a façade that performs each operation with the
//! extra-safety-margin path, selected per call. `set_carefully_count(n)`
//! additionally forces the next `n` operations onto that path regardless of
//! the façade used — the engine requests this for the first 30
//! multiplications of a fresh run.
//!
//! # Fault injection
//!
//! `inject_bitflip_after` and `inject_roundoff_after` arm one-shot faults
//! used by torture tests: a silent single-bit corruption (caught only by the
//! Gerbicz check) or a reported roundoff excursion. Careful-path operations
//! are never faulted.

use rug::ops::RemRounding;
use rug::Integer;

/// Errors reported by the arithmetic provider.
#[derive(Debug, Clone)]
pub enum GwError {
    /// Context setup failed (degenerate modulus or unsupported parameters).
    SetupFailed { reason: String },
    /// Roundoff error detected after a multiplication.
    Roundoff,
}

impl std::fmt::Display for GwError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GwError::SetupFailed { reason } => write!(f, "context setup failed: {}", reason),
            GwError::Roundoff => write!(f, "roundoff error detected"),
        }
    }
}

impl std::error::Error for GwError {}

/// Per-call multiplication hints.
#[derive(Debug, Clone, Copy, Default)]
pub struct MulHints {
    /// Leave the result in transform domain for the next multiplication.
    pub start_next_fft: bool,
    /// First source is already in transform domain.
    pub fft_s1: bool,
    /// Second source is already in transform domain.
    pub fft_s2: bool,
    /// Fuse the small constant set via `set_mulbyconst` into the operation.
    pub mul_by_const: bool,
}

impl MulHints {
    pub fn none() -> Self {
        Self::default()
    }

    /// `start_next_fft` iff `cond` holds.
    pub fn chain_if(cond: bool) -> Self {
        MulHints {
            start_next_fft: cond,
            ..Self::default()
        }
    }

    pub fn with_mulbyconst(mut self, cond: bool) -> Self {
        self.mul_by_const = cond;
        self
    }

    pub fn with_sources_transformed(mut self, s1: bool, s2: bool) -> Self {
        self.fft_s1 = s1;
        self.fft_s2 = s2;
        self
    }
}

/// A residue modulo the configured input, owned by the task that created it.
///
/// Values are always kept reduced to `[0, N)`.
#[derive(Debug, Clone)]
pub struct GwNum {
    value: Integer,
}

impl GwNum {
    pub fn is_zero(&self) -> bool {
        self.value == 0u32
    }
}

#[derive(Debug, Clone)]
enum Fault {
    BitFlip { after_muls: u64, bit: u32 },
    Roundoff { after_muls: u64 },
}

/// Arithmetic context for a fixed modulus.
///
/// Single-threaded by design: each exponentiation task drives one context
/// sequentially. `fft_count` counts transforms (two per multiplication), so
/// progress reporting divides by two to recover multiplication counts.
pub struct GwState {
    modulus: Integer,
    bits: u64,
    fft_length: u64,
    fft_description: String,
    maxmulbyconst: u32,
    mulbyconst: u32,
    carefully_count: u32,
    fft_count: u64,
    fault: Option<Fault>,
}

impl GwState {
    /// Create an unconfigured context. `InputNum::setup` must run before any
    /// arithmetic.
    pub fn new() -> Self {
        GwState {
            modulus: Integer::new(),
            bits: 0,
            fft_length: 0,
            fft_description: String::new(),
            maxmulbyconst: 65535,
            mulbyconst: 1,
            carefully_count: 0,
            fft_count: 0,
            fault: None,
        }
    }

    /// Configure the context for the given modulus. Called by
    /// `InputNum::setup`.
    pub fn setup(&mut self, modulus: Integer, display: &str) -> Result<(), GwError> {
        if modulus <= 1u32 {
            return Err(GwError::SetupFailed {
                reason: format!("modulus {} for {} is degenerate", modulus, display),
            });
        }
        self.bits = modulus.significant_bits() as u64;
        // Roughly 18 bits per FFT word, rounded up to a power of two.
        self.fft_length = (self.bits / 18 + 1).next_power_of_two();
        self.fft_description = format!(
            "software GMP core, {} word virtual FFT, {} bit modulus",
            self.fft_length, self.bits
        );
        self.modulus = modulus;
        Ok(())
    }

    /// Tear the context down. The transform counter is reset; callers that
    /// rebuild a context preserve it explicitly.
    pub fn done(&mut self) {
        self.modulus = Integer::new();
        self.bits = 0;
        self.fft_length = 0;
        self.fft_description.clear();
        self.mulbyconst = 1;
        self.carefully_count = 0;
        self.fft_count = 0;
    }

    pub fn fft_count(&self) -> u64 {
        self.fft_count
    }

    pub fn set_fft_count(&mut self, count: u64) {
        self.fft_count = count;
    }

    pub fn fft_description(&self) -> &str {
        &self.fft_description
    }

    pub fn fft_length(&self) -> u64 {
        self.fft_length
    }

    /// Whether the current FFT size is near its reliability limit. The
    /// software path has no roundoff, so this is always false; a transform
    /// provider reports true when the modulus crowds the FFT word size.
    pub fn near_fft_limit(&self) -> bool {
        false
    }

    pub fn maxmulbyconst(&self) -> u32 {
        self.maxmulbyconst
    }

    /// Set the small constant fused by the `mul_by_const` hint.
    pub fn set_mulbyconst(&mut self, c: u32) {
        debug_assert!(c <= self.maxmulbyconst);
        self.mulbyconst = c;
    }

    /// Force the next `n` operations onto the careful path.
    pub fn set_carefully_count(&mut self, n: u32) {
        self.carefully_count = n;
    }

    /// Arm a one-shot silent bit flip on the first non-careful
    /// multiplication after `muls` multiplications have completed.
    pub fn inject_bitflip_after(&mut self, muls: u64, bit: u32) {
        self.fault = Some(Fault::BitFlip {
            after_muls: muls,
            bit,
        });
    }

    /// Arm a one-shot reported roundoff error, same trigger rule.
    pub fn inject_roundoff_after(&mut self, muls: u64) {
        self.fault = Some(Fault::Roundoff { after_muls: muls });
    }

    pub fn alloc(&self) -> GwNum {
        GwNum {
            value: Integer::new(),
        }
    }

    pub fn from_integer(&self, n: &Integer) -> GwNum {
        debug_assert!(self.bits > 0, "context not configured");
        GwNum {
            value: n.clone().rem_euc(&self.modulus),
        }
    }

    pub fn to_integer(&self, g: &GwNum) -> Integer {
        g.value.clone()
    }

    pub fn set_small(&self, g: &mut GwNum, v: u32) {
        g.value = Integer::from(v).rem_euc(&self.modulus);
    }

    pub fn copy(&self, src: &GwNum, dst: &mut GwNum) {
        dst.value.clone_from(&src.value);
    }

    /// `x <- x^2`, optionally fused with the mul-by-const slot.
    pub fn square(&mut self, x: &mut GwNum, hints: MulHints) -> Result<(), GwError> {
        let careful = self.begin_op(false);
        x.value.square_mut();
        if hints.mul_by_const {
            x.value *= self.mulbyconst;
        }
        x.value %= &self.modulus;
        self.finish_op(careful, &mut x.value)
    }

    /// `dst <- src^2`.
    pub fn square_from(
        &mut self,
        src: &GwNum,
        dst: &mut GwNum,
        hints: MulHints,
    ) -> Result<(), GwError> {
        let careful = self.begin_op(false);
        dst.value.clone_from(&src.value);
        dst.value.square_mut();
        if hints.mul_by_const {
            dst.value *= self.mulbyconst;
        }
        dst.value %= &self.modulus;
        self.finish_op(careful, &mut dst.value)
    }

    /// `dst <- a * b` with `dst` distinct from both sources.
    pub fn mul(
        &mut self,
        a: &GwNum,
        b: &GwNum,
        dst: &mut GwNum,
        hints: MulHints,
    ) -> Result<(), GwError> {
        let careful = self.begin_op(false);
        dst.value.clone_from(&a.value);
        dst.value *= &b.value;
        if hints.mul_by_const {
            dst.value *= self.mulbyconst;
        }
        dst.value %= &self.modulus;
        self.finish_op(careful, &mut dst.value)
    }

    /// `dst <- dst * src`.
    pub fn mul_into(
        &mut self,
        dst: &mut GwNum,
        src: &GwNum,
        hints: MulHints,
    ) -> Result<(), GwError> {
        let careful = self.begin_op(false);
        dst.value *= &src.value;
        if hints.mul_by_const {
            dst.value *= self.mulbyconst;
        }
        dst.value %= &self.modulus;
        self.finish_op(careful, &mut dst.value)
    }

    /// `dst <- a - b (mod N)`. Addition-class: no transforms, no faults.
    pub fn sub(&self, a: &GwNum, b: &GwNum, dst: &mut GwNum) {
        dst.value.clone_from(&a.value);
        dst.value -= &b.value;
        if dst.value < 0u32 {
            dst.value += &self.modulus;
        }
    }

    /// The extra-safety-margin façade. Operations through it never chain
    /// transforms and are exempt from fault injection.
    pub fn carefully(&mut self) -> Careful<'_> {
        Careful { gw: self }
    }

    fn begin_op(&mut self, careful: bool) -> bool {
        debug_assert!(self.bits > 0, "context not configured");
        let effective = careful || self.carefully_count > 0;
        if self.carefully_count > 0 {
            self.carefully_count -= 1;
        }
        effective
    }

    fn finish_op(&mut self, careful: bool, result: &mut Integer) -> Result<(), GwError> {
        self.fft_count += 2;
        if !careful {
            let muls_done = self.fft_count / 2;
            match self.fault {
                Some(Fault::BitFlip { after_muls, bit }) if muls_done > after_muls => {
                    result.toggle_bit(bit % self.bits as u32);
                    self.fault = None;
                }
                Some(Fault::Roundoff { after_muls }) if muls_done > after_muls => {
                    self.fault = None;
                    return Err(GwError::Roundoff);
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl Default for GwState {
    fn default() -> Self {
        Self::new()
    }
}

/// Careful-path façade borrowed from a [`GwState`].
pub struct Careful<'a> {
    gw: &'a mut GwState,
}

impl Careful<'_> {
    pub fn square(&mut self, x: &mut GwNum) -> Result<(), GwError> {
        let careful = self.gw.begin_op(true);
        x.value.square_mut();
        x.value %= &self.gw.modulus;
        self.gw.finish_op(careful, &mut x.value)
    }

    /// `dst <- src^2`.
    pub fn square_from(&mut self, src: &GwNum, dst: &mut GwNum) -> Result<(), GwError> {
        let careful = self.gw.begin_op(true);
        dst.value.clone_from(&src.value);
        dst.value.square_mut();
        dst.value %= &self.gw.modulus;
        self.gw.finish_op(careful, &mut dst.value)
    }

    /// `dst <- a * b` with `dst` distinct from both sources.
    pub fn mul(&mut self, a: &GwNum, b: &GwNum, dst: &mut GwNum) -> Result<(), GwError> {
        let careful = self.gw.begin_op(true);
        dst.value.clone_from(&a.value);
        dst.value *= &b.value;
        dst.value %= &self.gw.modulus;
        self.gw.finish_op(careful, &mut dst.value)
    }

    /// `dst <- dst * src`.
    pub fn mul_into(&mut self, dst: &mut GwNum, src: &GwNum) -> Result<(), GwError> {
        let careful = self.gw.begin_op(true);
        dst.value *= &src.value;
        dst.value %= &self.gw.modulus;
        self.gw.finish_op(careful, &mut dst.value)
    }

    pub fn sub(&self, a: &GwNum, b: &GwNum, dst: &mut GwNum) {
        self.gw.sub(a, b, dst)
    }
}

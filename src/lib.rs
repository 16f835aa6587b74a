//! # Deepsquare — Core Library
//!
//! A checkpointed, error-checked modular exponentiation engine for PRP
//! testing of k·b^n+c candidates. The modulus is typically millions of bits;
//! every multiplication goes through a transform-style arithmetic provider,
//! and the engineering lives in orchestrating millions of multiplications
//! safely: crash-resumable checkpoints, the Gerbicz–Li error-check protocol,
//! and sliding-window exponentiation for general bases.
//!
//! ## Module Organization
//!
//! **Engine tasks** (one per exponentiation strategy):
//! - [`fast`] — small base raised to a large exponent, multiply-by-base
//!   fused into the squaring
//! - [`slow`] — large base, explicit multiplies
//! - [`multipoint`] — iterated exponentiation over a schedule of checkpoint
//!   "points", with sliding-window exponentiation for bases other than 2
//! - [`gerbicz`] — the multipoint task hardened with the Gerbicz–Li check
//!   and dual recovery/working state streams
//!
//! **Infrastructure**:
//! - [`input`] — k·b^n+c modulus descriptions
//! - [`gw`] — the arithmetic provider contract and the software reference
//!   provider
//! - [`task`] — shared lifecycle (timing, cadence, abort, restart policy)
//! - [`checkpoint`] — versioned, atomically written state files
//! - [`progress`] — progress counters and the background reporter
//!
//! ## Design Notes
//!
//! The final residue of any task depends only on the input, the exponent,
//! and the starting value — never on where checkpoints were taken or how
//! many times execution was interrupted and resumed. Tasks are
//! single-threaded and own their residues; cancellation is cooperative
//! through an abort flag polled at commit points.

pub mod checkpoint;
pub mod fast;
pub mod gerbicz;
pub mod gw;
pub mod input;
pub mod multipoint;
pub mod progress;
pub mod slow;
pub mod task;

/// Convert a `u64` exponent to `u32` for `rug::Integer::pow()`, panicking
/// with a clear message if the value exceeds `u32::MAX`. This prevents
/// silent truncation that would produce a wrong modulus or exponent.
#[inline]
pub fn checked_u32(n: u64) -> u32 {
    u32::try_from(n).unwrap_or_else(|_| {
        panic!(
            "exponent {} exceeds u32::MAX ({}); value would be silently wrong",
            n,
            u32::MAX
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checked_u32_valid_values() {
        assert_eq!(checked_u32(0), 0);
        assert_eq!(checked_u32(1), 1);
        assert_eq!(checked_u32(u32::MAX as u64), u32::MAX);
    }

    #[test]
    #[should_panic(expected = "exceeds u32::MAX")]
    fn checked_u32_overflow_panics() {
        checked_u32(u32::MAX as u64 + 1);
    }
}

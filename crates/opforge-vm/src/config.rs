//! Interpreter-wide tuning knobs.

use crate::dispatch::TierCounter;

/// Runtime options shared by every root program running under this
/// interpreter, mirroring the host-configurable knobs a generated
/// interpreter normally exposes per language (`setUncachedInterpreterThreshold`
/// and the cached tier's loop-report stride).
#[derive(Debug, Clone, Copy)]
pub struct InterpreterConfig {
    /// Uncached-tier invocation count before a call site is promoted to
    /// the cached tier.
    pub uncached_interpreter_threshold: u32,
    /// `BranchBackward` iteration count the cached tier accumulates before
    /// firing a loop-report / on-stack-replacement safepoint poll.
    pub report_loop_stride: u32,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            uncached_interpreter_threshold: TierCounter::PROMOTION_THRESHOLD,
            report_loop_stride: 1024,
        }
    }
}

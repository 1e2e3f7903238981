//! The uncached dispatch tier: no profiling, no specialized nodes, always
//! takes the generic path through every instruction. Every call starts
//! here; [`crate::dispatch::TierCounter`] tracks when a call site should be
//! promoted to [`super::cached`].

use crate::custom::CustomInstructionRegistry;
use crate::error::ExecutionResult;
use crate::frame::Frame;
use crate::quicken::QuickenableProgram;

use super::{run, ExecutionOutcome, TierContext};

/// Run `quickenable` once in the uncached tier.
pub fn run_uncached(
    quickenable: &QuickenableProgram,
    registry: &CustomInstructionRegistry,
    frame: &mut Frame,
) -> ExecutionResult<ExecutionOutcome> {
    run(quickenable, registry, frame, &TierContext::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opforge_builder::builder::{Builder, BuilderConfig};
    use opforge_builder::InstructionTable;

    #[test]
    fn runs_a_trivial_return_program() {
        let mut b = Builder::new(InstructionTable::with_builtins(), BuilderConfig::default());
        b.begin_root().unwrap();
        b.emit_load_constant(opforge_builder::Constant::Int(7));
        b.emit_return().unwrap();
        let program = b.end_root().unwrap();

        let quickenable = QuickenableProgram::new(program);
        let registry = CustomInstructionRegistry::new();
        let mut frame = Frame::new(0, vec![]);

        let outcome = run_uncached(&quickenable, &registry, &mut frame).unwrap();
        match outcome {
            ExecutionOutcome::Returned(crate::frame::Value::Int(7)) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}

//! The instrumented dispatch tier: every instruction is visible to an
//! external observer. Used while a debugger or profiler is attached to a
//! call; otherwise a root program runs uncached or cached as usual.
//!
//! Built on the same shared step loop as [`super::uncached`] and
//! [`super::cached`] — the only addition is `ctx.on_instruction`, invoked
//! once per bci before the instruction executes.

use crate::custom::CustomInstructionRegistry;
use crate::error::ExecutionResult;
use crate::frame::Frame;
use crate::quicken::QuickenableProgram;

use super::{run, ExecutionOutcome, TierContext};
use opforge_builder::InstructionKind;

/// Observer invoked for every instruction the instrumented tier steps over.
pub trait InstructionObserver {
    fn on_instruction(&self, bci: u32, kind: InstructionKind);
}

/// Run `quickenable` once in the instrumented tier, reporting every step to
/// `observer`. Instrumented execution always takes the cached-tier custom
/// instruction path, matching Truffle's `*_WITH_INSTRUMENTATION` variants
/// being derived from the cached bytecode set.
pub fn run_instrumented(
    quickenable: &QuickenableProgram,
    registry: &CustomInstructionRegistry,
    frame: &mut Frame,
    observer: &dyn InstructionObserver,
) -> ExecutionResult<ExecutionOutcome> {
    let hook = |bci: u32, kind: InstructionKind| observer.on_instruction(bci, kind);
    let ctx = TierContext {
        cached: true,
        on_instruction: Some(&hook),
        ..TierContext::default()
    };
    run(quickenable, registry, frame, &ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opforge_builder::builder::{Builder, BuilderConfig};
    use opforge_builder::InstructionTable;
    use parking_lot::Mutex;

    struct RecordingObserver {
        seen: Mutex<Vec<InstructionKind>>,
    }

    impl InstructionObserver for RecordingObserver {
        fn on_instruction(&self, _bci: u32, kind: InstructionKind) {
            self.seen.lock().push(kind);
        }
    }

    #[test]
    fn every_instruction_is_reported() {
        let mut b = Builder::new(InstructionTable::with_builtins(), BuilderConfig::default());
        b.begin_root().unwrap();
        b.emit_load_constant(opforge_builder::Constant::Int(1));
        b.emit_return().unwrap();
        let program = b.end_root().unwrap();

        let quickenable = QuickenableProgram::new(program);
        let registry = CustomInstructionRegistry::new();
        let mut frame = Frame::new(0, vec![]);
        let observer = RecordingObserver { seen: Mutex::new(Vec::new()) };

        run_instrumented(&quickenable, &registry, &mut frame, &observer).unwrap();
        let seen = observer.seen.lock();
        assert_eq!(seen.as_slice(), &[InstructionKind::LoadConstant, InstructionKind::Return]);
    }
}

//! The cached dispatch tier: custom instructions execute through their
//! `execute(operands, node_slot)` specialization path instead of
//! `execute_uncached`. A call site is promoted here once its
//! [`super::TierCounter`] crosses [`super::TierCounter::PROMOTION_THRESHOLD`].
//!
//! Real Truffle-style interpreters lazily allocate a `cachedNodes` array
//! sized by `RootProgram::num_nodes` the first time a call site is promoted,
//! publishing it with a release fence so a concurrent uncached call never
//! observes a partially initialized node. `CachedNodes` below models that
//! with `OnceCell` per slot, which gives the same "write once, read many,
//! no torn writes" guarantee without hand-rolled atomics.

use once_cell::sync::OnceCell;

use crate::config::InterpreterConfig;
use crate::custom::CustomInstructionRegistry;
use crate::error::ExecutionResult;
use crate::frame::Frame;
use crate::quicken::QuickenableProgram;

use super::{run, ExecutionOutcome, TierContext};

/// Observer for the cached tier's loop-report / on-stack-replacement
/// safepoint poll, fired every `InterpreterConfig::report_loop_stride`
/// backward-branch iterations (and once more at `Return` with whatever
/// partial count remains).
pub trait LoopReportObserver {
    /// Called with the number of `BranchBackward` iterations since the
    /// last report.
    fn on_loop_report(&self, iterations: u32);
}

/// Lazily-populated per-root cached-data array. Slot indices come from
/// `SlotAllocators::alloc_node` at build time, so `nodes.len()` always
/// matches `RootProgram::num_nodes`.
pub struct CachedNodes {
    nodes: Vec<OnceCell<()>>,
}

impl CachedNodes {
    pub fn new(num_nodes: u32) -> Self {
        Self {
            nodes: (0..num_nodes).map(|_| OnceCell::new()).collect(),
        }
    }

    /// Mark slot `index` as populated, idempotently. A real embedding would
    /// store an actual specialization struct here instead of `()`.
    pub fn ensure_initialized(&self, index: u32) {
        let _ = self.nodes[index as usize].get_or_init(|| ());
    }
}

/// Run `quickenable` once in the cached tier.
pub fn run_cached(
    quickenable: &QuickenableProgram,
    registry: &CustomInstructionRegistry,
    frame: &mut Frame,
    nodes: &CachedNodes,
) -> ExecutionResult<ExecutionOutcome> {
    run_cached_with(quickenable, registry, frame, nodes, &InterpreterConfig::default(), None)
}

/// Run `quickenable` once in the cached tier, reporting loop-iteration
/// strides to `loop_observer` per `config.report_loop_stride`.
pub fn run_cached_with(
    quickenable: &QuickenableProgram,
    registry: &CustomInstructionRegistry,
    frame: &mut Frame,
    nodes: &CachedNodes,
    config: &InterpreterConfig,
    loop_observer: Option<&dyn LoopReportObserver>,
) -> ExecutionResult<ExecutionOutcome> {
    for index in 0..nodes.nodes.len() as u32 {
        nodes.ensure_initialized(index);
    }
    let hook = |iterations: u32| {
        if let Some(observer) = loop_observer {
            observer.on_loop_report(iterations);
        }
    };
    run(
        quickenable,
        registry,
        frame,
        &TierContext {
            cached: true,
            report_loop_stride: config.report_loop_stride,
            loop_report: Some(&hook),
            ..TierContext::default()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custom::CustomInstruction;
    use crate::frame::Value;
    use opforge_builder::builder::{Builder, BuilderConfig};
    use opforge_builder::{Arity, Instruction, InstructionTable, OperationKind};

    struct Double;
    impl CustomInstruction for Double {
        fn id(&self) -> u16 {
            opforge_builder::instruction::FIRST_CUSTOM_ID
        }

        fn arity(&self) -> usize {
            1
        }

        fn execute_uncached(&self, operands: &[Value]) -> ExecutionResult<Value> {
            match operands.first() {
                Some(Value::Int(n)) => Ok(Value::Int(n * 2)),
                _ => Ok(Value::Null),
            }
        }

        fn execute(&self, operands: &[Value], _node_slot: u32) -> ExecutionResult<Value> {
            self.execute_uncached(operands)
        }
    }

    #[test]
    fn cached_tier_uses_the_specialized_path() {
        let mut instructions = InstructionTable::with_builtins();
        let double_id = instructions.register_custom(Instruction::custom(
            0,
            "DOUBLE",
            false,
            vec![opforge_builder::ImmediateKind::Node],
            0,
            vec![None],
            None,
        ));

        let mut b = Builder::new(instructions, BuilderConfig::default());
        b.begin_root().unwrap();
        b.emit_load_constant(opforge_builder::Constant::Int(21));
        b.begin_custom(OperationKind::CustomSimple, Arity::Fixed(1), false).unwrap();
        b.end_custom(double_id, Arity::Fixed(1)).unwrap();
        b.emit_return().unwrap();
        let program = b.end_root().unwrap();

        let quickenable = QuickenableProgram::new(program);
        let mut registry = CustomInstructionRegistry::new();
        registry.register(Box::new(Double));
        let nodes = CachedNodes::new(quickenable.program().num_nodes);
        let mut frame = Frame::new(0, vec![]);

        let outcome = run_cached(&quickenable, &registry, &mut frame, &nodes).unwrap();
        match outcome {
            ExecutionOutcome::Returned(Value::Int(42)) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}

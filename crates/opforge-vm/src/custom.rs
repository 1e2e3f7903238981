//! Contract an embedding implements for each `Custom`/`CustomShortCircuit`
//! instruction it registers with `opforge_builder::InstructionTable`.

use crate::error::ExecutionResult;
use crate::frame::Value;

/// One custom instruction's runtime behavior. `execute_uncached` always
/// works but is free to be slow (e.g. a generic dynamic dispatch); `execute`
/// is the same operation specialized for whatever node state the cached
/// tier has already installed at this bci, and may assume a guard has
/// already been checked by the dispatch loop.
pub trait CustomInstruction: Send + Sync {
    /// Stable id this instruction was registered under.
    fn id(&self) -> u16;

    /// Number of operands the dispatch loop must pop off the stack before
    /// calling `execute`/`execute_uncached`, matching the `operand_types`
    /// the instruction was registered with in `opforge_builder::Instruction::custom`.
    fn arity(&self) -> usize;

    /// Slow-path, no-cache execution (the uncached tier always calls this).
    fn execute_uncached(&self, operands: &[Value]) -> ExecutionResult<Value>;

    /// Cached-tier execution. The default forwards to `execute_uncached`;
    /// override to exploit type feedback stored at `node_slot`.
    fn execute(&self, operands: &[Value], node_slot: u32) -> ExecutionResult<Value> {
        let _ = node_slot;
        self.execute_uncached(operands)
    }
}

/// Registry mapping an instruction id to its `CustomInstruction` impl,
/// looked up once per dispatch-loop hit.
#[derive(Default)]
pub struct CustomInstructionRegistry {
    instructions: Vec<Box<dyn CustomInstruction>>,
}

impl CustomInstructionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, instruction: Box<dyn CustomInstruction>) {
        self.instructions.push(instruction);
    }

    pub fn get(&self, id: u16) -> Option<&dyn CustomInstruction> {
        self.instructions
            .iter()
            .find(|i| i.id() == id)
            .map(|boxed| boxed.as_ref())
    }
}

//! Finally-handler capture and inline duplication, the hardest subsystem
//! in the builder.
//!
//! **Child order.** `FinallyTry`'s first parsed child is the *handler*, its
//! second is the *guarded body*. This is the load-bearing detail that makes
//! raw-bytecode duplication possible at all for a streaming builder: by the
//! time the guarded body starts emitting real instructions into the real
//! buffer, the handler is already frozen as a template, so a `Branch`
//! crossing the `FinallyTry` mid-body can inline a full copy of it right
//! then. See `DESIGN.md` for the worked-example arithmetic that pins this
//! down — a branch-out plus a fallthrough exit only emits the handler
//! exactly twice under this ordering.

use crate::buffer::{BytecodeBuffer, ExceptionHandlerEntry, SourceInfoEntry};
use crate::constant_pool::{Constant, ConstantPool};
use crate::error::{BuilderError, BuilderResult};
use crate::instruction::{ImmediateKind, InstructionKind, InstructionTable};
use crate::label::{LabelId, LabelTable};
use crate::local::Local;

/// Counters for runtime-consumed immediate slots (`Node`, `Profile`).
/// Every occurrence of a Node/Profile-bearing instruction — including each
/// copy made during handler replay — gets its own fresh slot.
#[derive(Debug, Default)]
pub struct SlotAllocators {
    pub num_nodes: u32,
    pub num_profiles: u32,
}

impl SlotAllocators {
    pub fn alloc_node(&mut self) -> u32 {
        let slot = self.num_nodes;
        self.num_nodes += 1;
        slot
    }

    pub fn alloc_profile(&mut self) -> u32 {
        let slot = self.num_profiles;
        self.num_profiles += 1;
        slot
    }
}

/// A branch immediate inside a handler template whose original target was a
/// label outside the handler (`UNINIT` at capture time).
#[derive(Debug, Clone, Copy)]
struct ReverseEntry {
    /// bci of the immediate word, relative to the template's own start.
    immediate_bci: u32,
    label: LabelId,
    stack_height_at_site: i32,
}

/// State captured for one `beginFinallyTry`/`endFinallyTry` pair.
pub struct FinallyTryContext {
    pub sequence_number: u64,
    pub exc_local: Option<Local>,
    /// Outer buffer, swapped out while the handler is being captured and
    /// swapped back in once it is frozen.
    saved_outer: Option<BytecodeBuffer>,
    /// Frozen once the handler child ends.
    handler_bc: Option<BytecodeBuffer>,
    reverse_unresolved: Vec<ReverseEntry>,
}

impl FinallyTryContext {
    fn new(sequence_number: u64, exc_local: Option<Local>) -> Self {
        Self {
            sequence_number,
            exc_local,
            saved_outer: None,
            handler_bc: None,
            reverse_unresolved: Vec::new(),
        }
    }

    pub fn is_capturing_handler(&self) -> bool {
        self.handler_bc.is_none()
    }

    pub fn handler(&self) -> Option<&BytecodeBuffer> {
        self.handler_bc.as_ref()
    }
}

/// Stack of nested finally contexts for a single root under construction.
#[derive(Default)]
pub struct FinallyStack {
    contexts: Vec<FinallyTryContext>,
}

impl FinallyStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn top(&self) -> Option<&FinallyTryContext> {
        self.contexts.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut FinallyTryContext> {
        self.contexts.last_mut()
    }

    pub fn get(&self, index: usize) -> &FinallyTryContext {
        &self.contexts[index]
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// `beginFinallyTry` step 1+2: allocate the context, capture the outer
    /// buffer, and redirect emission into a fresh one for the handler.
    pub fn begin(
        &mut self,
        sequence_number: u64,
        exc_local: Option<Local>,
        buffer: &mut BytecodeBuffer,
    ) -> usize {
        let mut ctx = FinallyTryContext::new(sequence_number, exc_local);
        let fresh = BytecodeBuffer::new();
        let outer = buffer.swap(fresh);
        ctx.saved_outer = Some(outer);
        self.contexts.push(ctx);
        self.contexts.len() - 1
    }

    /// End of the handler child: freeze the handler buffer and restore the
    /// outer buffer so the guarded body parses into its real position.
    pub fn end_handler_child(&mut self, index: usize, buffer: &mut BytecodeBuffer) {
        let ctx = &mut self.contexts[index];
        let outer = ctx.saved_outer.take().expect("handler capture not started");
        let handler_buffer = buffer.swap(outer);
        ctx.handler_bc = Some(handler_buffer);
    }

    /// `endFinallyTry`: pop the context once the guarded body has finished
    /// and every exit point has already been inlined.
    pub fn end(&mut self) -> FinallyTryContext {
        self.contexts.pop().expect("unbalanced finally stack")
    }

    /// Route a branch emitted while capturing the handler at `ctx_index`
    /// toward either the normal (internal) label table — if `label` was
    /// declared inside the handler itself — or `ctx.reverse_unresolved` if
    /// it targets something declared outside.
    ///
    /// Returns `true` if the branch was routed externally (immediate left
    /// as `UNINIT` for later relocation), `false` if the caller should
    /// resolve it normally against the live `LabelTable`.
    pub fn route_branch_during_capture(
        &mut self,
        ctx_index: usize,
        label: LabelId,
        labels: &LabelTable,
        immediate_bci: u32,
        stack_height: i32,
    ) -> bool {
        let ctx = &mut self.contexts[ctx_index];
        let declared_inside = labels.declaring_op_seq(label) > ctx.sequence_number;
        if declared_inside {
            return false;
        }
        ctx.reverse_unresolved.push(ReverseEntry {
            immediate_bci,
            label,
            stack_height_at_site: stack_height,
        });
        true
    }

    /// A label created while capturing some handler may only be targeted
    /// from within that same handler capture.
    pub fn check_cross_handler(
        &self,
        label_finally_seq: Option<u64>,
        current_ctx_seq: Option<u64>,
    ) -> BuilderResult<()> {
        if let Some(label_seq) = label_finally_seq {
            if current_ctx_seq != Some(label_seq) {
                return Err(BuilderError::CrossHandlerBranch);
            }
        }
        Ok(())
    }

    /// Copy `ctx`'s handler template into `buffer` starting at its current
    /// end, relocating every branch immediate and allocating fresh
    /// Node/Profile slots for every copy.
    #[allow(clippy::too_many_arguments)]
    pub fn emit_handler_copy(
        &mut self,
        ctx_index: usize,
        buffer: &mut BytecodeBuffer,
        labels: &mut LabelTable,
        instructions: &InstructionTable,
        slots: &mut SlotAllocators,
        constants: &mut ConstantPool,
        current_stack_height: i32,
    ) -> u32 {
        // Clone the handler data we need before borrowing `buffer` mutably,
        // to avoid holding an immutable borrow of `self.contexts` across
        // the mutation below.
        let (handler_code, handler_source_info, handler_ex_handlers, reverse) = {
            let ctx = &self.contexts[ctx_index];
            let handler = ctx.handler().expect("handler not yet captured");
            (
                handler.code().to_vec(),
                handler.source_info().to_vec(),
                handler.exception_handlers().to_vec(),
                ctx.reverse_unresolved.clone(),
            )
        };

        let offset = buffer.current_bci();
        let mut pos: u32 = 0;
        while (pos as usize) < handler_code.len() {
            let opcode_id = handler_code[pos as usize];
            let instr = instructions.get(opcode_id);
            let this_bci = pos;
            buffer.emit_word(opcode_id);
            pos += 1;
            for immediate in instr.immediates.clone() {
                let raw = handler_code[pos as usize];
                let local_immediate_bci = pos;
                let final_immediate_bci = offset + pos;
                let new_value = match immediate {
                    ImmediateKind::BytecodeIndex if instr.kind.is_branch() || matches!(instr.kind, crate::instruction::InstructionKind::Yield) => {
                        if raw == u16::MAX {
                            let entry = reverse
                                .iter()
                                .find(|e| e.immediate_bci == local_immediate_bci)
                                .expect("missing reverse-map entry for UNINIT branch");
                            if labels.is_defined(entry.label) {
                                labels.bci(entry.label).unwrap() as u16
                            } else {
                                labels.register_unresolved_branch(
                                    entry.label,
                                    final_immediate_bci,
                                    current_stack_height + entry.stack_height_at_site,
                                );
                                u16::MAX
                            }
                        } else {
                            // A resolved branch inside a captured template is
                            // always template-relative; relocating a copy is
                            // just adding this copy's start offset.
                            (offset + raw as u32) as u16
                        }
                    }
                    ImmediateKind::Node => slots.alloc_node() as u16,
                    ImmediateKind::Profile => slots.alloc_profile() as u16,
                    ImmediateKind::Constant if instr.kind == InstructionKind::Yield => {
                        // A duplicated `Yield` is a distinct suspension point
                        // from the one it was copied from: it must resume at
                        // this copy's own bci, not the template's, so it
                        // gets its own fresh continuation record rather than
                        // sharing the original's constant-pool slot.
                        let resume_bci = final_immediate_bci + 1;
                        constants.add_constant(Constant::Int(resume_bci as i64)) as u16
                    }
                    _ => raw,
                };
                buffer.emit_word(new_value);
                pos += 1;
            }
            let _ = this_bci;
        }

        for entry in &handler_source_info {
            buffer.push_source_info(SourceInfoEntry {
                bci: entry.bci + offset,
                ..*entry
            });
        }
        for entry in &handler_ex_handlers {
            buffer.push_exception_handler(ExceptionHandlerEntry {
                start_bci: entry.start_bci + offset,
                end_bci: entry.end_bci + offset,
                handler_bci: entry.handler_bci + offset,
                ..*entry
            });
        }

        offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{builtin_id, InstructionTable};

    #[test]
    fn capture_and_copy_handler_twice() {
        let mut buffer = BytecodeBuffer::new();
        let mut labels = LabelTable::new();
        let mut stack = FinallyStack::new();
        let mut slots = SlotAllocators::default();
        let mut constants = ConstantPool::new();
        let instructions = InstructionTable::with_builtins();

        let ctx_index = stack.begin(0, None, &mut buffer);
        // handler body: POP (a stand-in single instruction)
        buffer.emit_word(builtin_id::POP);
        stack.end_handler_child(ctx_index, &mut buffer);

        // emit two independent copies, as if at two different exit points
        let first =
            stack.emit_handler_copy(ctx_index, &mut buffer, &mut labels, &instructions, &mut slots, &mut constants, 0);
        let second =
            stack.emit_handler_copy(ctx_index, &mut buffer, &mut labels, &instructions, &mut slots, &mut constants, 0);
        assert_eq!(first, 0);
        assert_eq!(second, 1);
        assert_eq!(buffer.code(), &[builtin_id::POP, builtin_id::POP]);
    }

    #[test]
    fn yield_inside_a_duplicated_handler_gets_a_fresh_continuation_slot() {
        let mut buffer = BytecodeBuffer::new();
        let mut labels = LabelTable::new();
        let mut stack = FinallyStack::new();
        let mut slots = SlotAllocators::default();
        let mut constants = ConstantPool::new();
        let instructions = InstructionTable::with_builtins();

        let ctx_index = stack.begin(0, None, &mut buffer);
        // handler body: YIELD referencing constant-pool slot 0.
        buffer.emit_word(builtin_id::YIELD);
        buffer.emit_word(constants.add_constant(Constant::Int(0)) as u16);
        stack.end_handler_child(ctx_index, &mut buffer);

        let first =
            stack.emit_handler_copy(ctx_index, &mut buffer, &mut labels, &instructions, &mut slots, &mut constants, 0);
        let second =
            stack.emit_handler_copy(ctx_index, &mut buffer, &mut labels, &instructions, &mut slots, &mut constants, 0);

        let first_slot = buffer.code()[(first + 1) as usize];
        let second_slot = buffer.code()[(second + 1) as usize];
        assert_ne!(
            first_slot, second_slot,
            "each copy of a Yield must install its own continuation record, not share one"
        );
        assert_eq!(constants.get(first_slot as u32), Some(&Constant::Int((first + 2) as i64)));
        assert_eq!(constants.get(second_slot as u32), Some(&Constant::Int((second + 2) as i64)));
    }
}

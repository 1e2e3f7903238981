//! The `begin*`/`end*`/`emit*` facade.
//!
//! One [`Builder`] is good for exactly one root program at a time; call
//! [`Builder::begin_root`] to start, build the tree of `begin*`/`emit*`/`end*`
//! calls a front-end would naturally make while lowering its AST, and
//! [`Builder::end_root`] freezes the result into a [`crate::root::RootProgram`].

use tracing::trace;

use crate::buffer::{BytecodeBuffer, SourceInfoEntry};
use crate::constant_pool::{Constant, ConstantPool};
use crate::error::{BuilderError, BuilderResult};
use crate::finally::{FinallyStack, SlotAllocators};
use crate::instruction::{builtin_id, ImmediateKind, InstructionTable};
use crate::label::{LabelId, LabelTable};
use crate::local::{Local, LocalAllocator};
use crate::operation::{Arity, OperationKind};
use crate::opstack::{
    ConditionalData, CustomOperationData, FinallyTryData, FrameData, IfThenData, IfThenElseData,
    OperationStack, TryCatchData, WhileData,
};
use crate::root::RootProgram;

/// Knobs that do not change the program's semantics, only how much
/// bookkeeping the builder keeps around while constructing it.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Track basic-block boundaries alongside the bytecode, consumed later
    /// by the cached/instrumented tiers for OSR and quickening decisions.
    pub track_basic_blocks: bool,
    /// Attach source-info entries for every emitted instruction, not just
    /// ones inside an explicit `SourceSection`.
    pub always_track_source: bool,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            track_basic_blocks: true,
            always_track_source: false,
        }
    }
}

/// The builder's live state for one root under construction.
pub struct Builder {
    config: BuilderConfig,
    instructions: InstructionTable,
    constants: ConstantPool,
    locals: LocalAllocator,
    labels: LabelTable,
    ops: OperationStack,
    finally: FinallyStack,
    slots: SlotAllocators,
    buffer: BytecodeBuffer,
    stack_height: i32,
    max_stack_height: i32,
    current_source: Option<(u32, u32)>,
    root_open: bool,
}

impl Builder {
    pub fn new(instructions: InstructionTable, config: BuilderConfig) -> Self {
        Self {
            buffer: BytecodeBuffer::with_tracing(config.track_basic_blocks),
            config,
            instructions,
            constants: ConstantPool::new(),
            locals: LocalAllocator::new(),
            labels: LabelTable::new(),
            ops: OperationStack::new(),
            finally: FinallyStack::new(),
            slots: SlotAllocators::default(),
            stack_height: 0,
            max_stack_height: 0,
            current_source: None,
            root_open: false,
        }
    }

    fn current_finally_seq(&self) -> Option<u64> {
        self.finally.top().map(|c| c.sequence_number)
    }

    fn push(&mut self, kind: OperationKind, is_void: bool) -> u64 {
        let seq = self.ops.push(kind, is_void, self.stack_height);
        trace!(?kind, seq, "begin operation");
        seq
    }

    fn after_child(&mut self, produced_value: bool) {
        if let Some(frame) = self.ops.top_mut() {
            frame.child_count += 1;
            frame.last_child_produced_value = produced_value;
            frame.last_child_bci = 0;
        }
    }

    fn emit_instruction(&mut self, opcode: u16, immediates: &[u16]) -> u32 {
        let bci = self.buffer.emit_word(opcode);
        for &imm in immediates {
            self.buffer.emit_word(imm);
        }
        let instr = self.instructions.get(opcode);
        self.stack_height += instr.stack_effect() as i32;
        self.max_stack_height = self.max_stack_height.max(self.stack_height);
        if let Some((start, len)) = self.current_source {
            self.buffer.push_source_info(SourceInfoEntry {
                bci,
                start_offset: start,
                length: len,
            });
        } else if self.config.always_track_source {
            self.buffer.push_source_info(SourceInfoEntry {
                bci,
                start_offset: 0,
                length: 0,
            });
        }
        bci
    }

    fn node_or_profile_immediate(&mut self, kind: ImmediateKind) -> u16 {
        match kind {
            ImmediateKind::Node => self.slots.alloc_node() as u16,
            ImmediateKind::Profile => self.slots.alloc_profile() as u16,
            _ => 0,
        }
    }

    // ---- Root ------------------------------------------------------

    pub fn begin_root(&mut self) -> BuilderResult<()> {
        if self.root_open {
            return Err(BuilderError::MissingBeginRoot);
        }
        self.root_open = true;
        self.push(OperationKind::Root, false);
        Ok(())
    }

    pub fn end_root(&mut self) -> BuilderResult<RootProgram> {
        let frame = self.ops.pop().ok_or(BuilderError::UnexpectedOperationEnd { operation: "Root" })?;
        self.labels.check_no_orphans(&frame.declared_labels)?;
        self.root_open = false;

        let mut handlers: Vec<_> = self.buffer.exception_handlers().to_vec();
        // Innermost-first: narrower [startBci, endBci) ranges sort before
        // wider ones so dispatch finds the nearest enclosing handler first
        // (Open Question resolved in DESIGN.md).
        handlers.sort_by_key(|h| (h.end_bci - h.start_bci, h.start_bci));

        Ok(RootProgram {
            bc: self.buffer.code().to_vec(),
            constants: std::mem::take(&mut self.constants).into_vec(),
            handlers,
            num_locals: self.locals.count() as u32,
            num_nodes: self.slots.num_nodes,
            num_profiles: self.slots.num_profiles,
            max_stack_height: self.max_stack_height,
            source_info: self.buffer.source_info().to_vec(),
        })
    }

    pub fn declare_local(&mut self) -> Local {
        self.locals.allocate()
    }

    /// `beginSourceSection`/`endSourceSection`: attach `(start_offset, length)`
    /// to every instruction emitted in between, regardless of `always_track_source`.
    pub fn begin_source_section(&mut self, start_offset: u32, length: u32) {
        self.current_source = Some((start_offset, length));
    }

    pub fn end_source_section(&mut self) {
        self.current_source = None;
    }

    pub fn create_label(&mut self) -> BuilderResult<LabelId> {
        let frame = self.ops.top().ok_or(BuilderError::MissingBeginRoot)?;
        let label = self
            .labels
            .create_label(frame.sequence_number, self.current_finally_seq());
        self.ops.top_mut().unwrap().declared_labels.push(label);
        Ok(label)
    }

    pub fn emit_label(&mut self, label: LabelId) -> BuilderResult<()> {
        self.labels
            .resolve_label(label, self.buffer.current_bci(), self.stack_height, &mut self.buffer)
    }

    // ---- Plain loads/stores ----------------------------------------

    pub fn emit_load_local(&mut self, local: Local) {
        self.emit_instruction(builtin_id::LOAD_LOCAL, &[local.index()]);
        self.after_child(true);
    }

    pub fn emit_store_local(&mut self, local: Local) {
        self.emit_instruction(builtin_id::STORE_LOCAL, &[local.index()]);
        self.after_child(false);
    }

    pub fn emit_load_local_materialized(&mut self, local: Local) {
        self.emit_instruction(builtin_id::LOAD_LOCAL_MATERIALIZED, &[local.index()]);
        self.after_child(true);
    }

    pub fn emit_store_local_materialized(&mut self, local: Local) {
        self.emit_instruction(builtin_id::STORE_LOCAL_MATERIALIZED, &[local.index()]);
        self.after_child(false);
    }

    pub fn emit_load_argument(&mut self, index: u16) {
        self.emit_instruction(builtin_id::LOAD_ARGUMENT, &[index]);
        self.after_child(true);
    }

    pub fn emit_load_constant(&mut self, value: Constant) {
        let idx = self.constants.add_constant(value);
        self.emit_instruction(builtin_id::LOAD_CONSTANT, &[idx as u16]);
        self.after_child(true);
    }

    pub fn emit_pop(&mut self) {
        self.emit_instruction(builtin_id::POP, &[]);
    }

    pub fn emit_throw(&mut self) {
        self.emit_instruction(builtin_id::THROW, &[]);
        self.after_child(false);
    }

    pub fn emit_yield(&mut self, continuation: Constant) {
        let idx = self.constants.add_constant(continuation);
        self.emit_instruction(builtin_id::YIELD, &[idx as u16]);
        self.after_child(true);
    }

    // ---- Return ------------------------------------------------------

    pub fn emit_return(&mut self) -> BuilderResult<()> {
        self.emit_leaves_for_non_local_exit(-1)?;
        self.emit_instruction(builtin_id::RETURN, &[]);
        self.after_child(false);
        Ok(())
    }

    // ---- Branch --------------------------------------------------------

    pub fn emit_branch(&mut self, label: LabelId) -> BuilderResult<()> {
        if self.labels.declaring_op_seq(label) > self.ops.top().map(|f| f.sequence_number).unwrap_or(0)
            && !self.ops.contains_seq(self.labels.declaring_op_seq(label))
        {
            return Err(BuilderError::InvalidBranchTarget { label: label.0 });
        }
        self.labels.check_branch_allowed(label, self.buffer.current_bci())?;
        self.check_cross_handler(label)?;

        let declaring_seq = self.labels.declaring_op_seq(label) as i64;
        self.emit_leaves_for_non_local_exit(declaring_seq)?;

        if let Some(ctx_index) = self.active_capturing_handler_index() {
            let immediate_bci = self.buffer.emit_word(builtin_id::BRANCH);
            let stack_at_site = self.stack_height;
            let routed_external = self.finally.route_branch_during_capture(
                ctx_index,
                label,
                &self.labels,
                immediate_bci + 1,
                stack_at_site,
            );
            if routed_external {
                self.buffer.emit_word(u16::MAX);
            } else if self.labels.is_defined(label) {
                self.buffer.emit_word(self.labels.bci(label).unwrap() as u16);
            } else {
                let imm_bci = immediate_bci + 1;
                self.buffer.emit_word(u16::MAX);
                self.labels.register_unresolved_branch(label, imm_bci, self.stack_height);
            }
            return Ok(());
        }

        let immediate_bci = self.buffer.emit_word(builtin_id::BRANCH) + 1;
        if self.labels.is_defined(label) {
            self.buffer.emit_word(self.labels.bci(label).unwrap() as u16);
        } else {
            self.buffer.emit_word(u16::MAX);
            self.labels.register_unresolved_branch(label, immediate_bci, self.stack_height);
        }
        Ok(())
    }

    fn active_capturing_handler_index(&self) -> Option<usize> {
        if self.finally.len() == 0 {
            return None;
        }
        let idx = self.finally.len() - 1;
        self.finally.get(idx).is_capturing_handler().then_some(idx)
    }

    fn check_cross_handler(&self, label: LabelId) -> BuilderResult<()> {
        let label_seq = self.labels.finally_try_op_seq(label);
        self.finally
            .check_cross_handler(label_seq, self.current_finally_seq())
    }

    /// Replay the handler of every enclosing `FinallyTry` between the
    /// current frame and `target_seq` (exclusive), nearest first.
    /// `target_seq < 0` walks to the root.
    fn emit_leaves_for_non_local_exit(&mut self, target_seq: i64) -> BuilderResult<()> {
        let finally_frames: Vec<u64> = self
            .ops
            .frames_above(target_seq)
            .filter(|f| f.is_finally_try())
            .map(|f| f.sequence_number)
            .collect();

        for seq in finally_frames {
            let ctx_index = self.finally_context_index_for(seq);
            if let Some(ctx_index) = ctx_index {
                self.finally.emit_handler_copy(
                    ctx_index,
                    &mut self.buffer,
                    &mut self.labels,
                    &self.instructions,
                    &mut self.slots,
                    &mut self.constants,
                    self.stack_height,
                );
            }
        }
        Ok(())
    }

    fn finally_context_index_for(&self, sequence_number: u64) -> Option<usize> {
        (0..self.finally.len()).find(|&i| self.finally.get(i).sequence_number == sequence_number)
    }

    // ---- Block ---------------------------------------------------------

    pub fn begin_block(&mut self) {
        self.push(OperationKind::Block, true);
    }

    pub fn end_block(&mut self) -> BuilderResult<()> {
        let frame = self.ops.pop().ok_or(BuilderError::UnexpectedOperationEnd { operation: "Block" })?;
        self.labels.check_no_orphans(&frame.declared_labels)?;
        self.after_child(frame.last_child_produced_value);
        Ok(())
    }

    // ---- IfThen ----------------------------------------------------------

    pub fn begin_if_then(&mut self) {
        self.push(OperationKind::IfThen, true);
    }

    /// Call once the condition child has been emitted (child 0).
    pub fn if_then_condition_emitted(&mut self) {
        let false_fixup_bci = self.emit_instruction(builtin_id::BRANCH_FALSE, &[u16::MAX]) + 1;
        if let Some(frame) = self.ops.top_mut() {
            frame.data = FrameData::IfThen(IfThenData { false_fixup_bci });
        }
    }

    pub fn end_if_then(&mut self) -> BuilderResult<()> {
        let frame = self.ops.pop().ok_or(BuilderError::UnexpectedOperationEnd { operation: "IfThen" })?;
        self.labels.check_no_orphans(&frame.declared_labels)?;
        if let FrameData::IfThen(data) = frame.data {
            self.buffer.patch_word(data.false_fixup_bci, self.buffer.current_bci() as u16);
        }
        self.after_child(false);
        Ok(())
    }

    // ---- IfThenElse --------------------------------------------------------

    pub fn begin_if_then_else(&mut self) {
        self.push(OperationKind::IfThenElse, true);
    }

    pub fn if_then_else_condition_emitted(&mut self) {
        let false_fixup_bci = self.emit_instruction(builtin_id::BRANCH_FALSE, &[u16::MAX]) + 1;
        if let Some(frame) = self.ops.top_mut() {
            frame.data = FrameData::IfThenElse(IfThenElseData { false_fixup_bci, end_fixup_bci: 0 });
        }
    }

    pub fn if_then_else_then_emitted(&mut self) {
        let end_fixup_bci = self.emit_instruction(builtin_id::BRANCH, &[u16::MAX]) + 1;
        let false_target = self.buffer.current_bci() as u16;
        let false_fixup = match self.ops.top_mut() {
            Some(frame) => match &mut frame.data {
                FrameData::IfThenElse(data) => {
                    data.end_fixup_bci = end_fixup_bci;
                    Some(data.false_fixup_bci)
                }
                _ => None,
            },
            None => None,
        };
        if let Some(false_fixup) = false_fixup {
            self.buffer.patch_word(false_fixup, false_target);
        }
    }

    pub fn end_if_then_else(&mut self) -> BuilderResult<()> {
        let frame = self
            .ops
            .pop()
            .ok_or(BuilderError::UnexpectedOperationEnd { operation: "IfThenElse" })?;
        self.labels.check_no_orphans(&frame.declared_labels)?;
        if let FrameData::IfThenElse(data) = frame.data {
            self.buffer.patch_word(data.end_fixup_bci, self.buffer.current_bci() as u16);
        }
        self.after_child(false);
        Ok(())
    }

    // ---- Conditional (ternary, value-producing) -----------------------

    pub fn begin_conditional(&mut self) {
        self.push(OperationKind::Conditional, false);
    }

    pub fn conditional_condition_emitted(&mut self) {
        let false_fixup_bci = self.emit_instruction(builtin_id::BRANCH_FALSE, &[u16::MAX]) + 1;
        if let Some(frame) = self.ops.top_mut() {
            frame.data = FrameData::Conditional(ConditionalData { false_fixup_bci, end_fixup_bci: 0 });
        }
    }

    /// Call once the then-arm (child 1) has finished parsing. Mirrors
    /// `if_then_else_then_emitted`: an unconditional branch skips the
    /// else-arm once the then-arm has run, and the else-arm starts right
    /// where the pending `BRANCH_FALSE` now points.
    pub fn conditional_then_emitted(&mut self) {
        let end_fixup_bci = self.emit_instruction(builtin_id::BRANCH, &[u16::MAX]) + 1;
        let false_target = self.buffer.current_bci() as u16;
        let false_fixup = match self.ops.top_mut() {
            Some(frame) => match &mut frame.data {
                FrameData::Conditional(data) => {
                    data.end_fixup_bci = end_fixup_bci;
                    Some(data.false_fixup_bci)
                }
                _ => None,
            },
            None => None,
        };
        if let Some(false_fixup) = false_fixup {
            self.buffer.patch_word(false_fixup, false_target);
        }
        // The then-arm and else-arm are mutually exclusive at runtime, but
        // the builder walks both linearly while tracking static stack
        // height; undo the then-arm's push so the else-arm starts from the
        // same base height and the two converge on one value, not two.
        self.stack_height -= 1;
    }

    pub fn end_conditional(&mut self) -> BuilderResult<()> {
        let frame = self
            .ops
            .pop()
            .ok_or(BuilderError::UnexpectedOperationEnd { operation: "Conditional" })?;
        self.labels.check_no_orphans(&frame.declared_labels)?;
        if let FrameData::Conditional(data) = frame.data {
            self.buffer.patch_word(data.end_fixup_bci, self.buffer.current_bci() as u16);
        }
        self.after_child(true);
        Ok(())
    }

    // ---- While -----------------------------------------------------------

    pub fn begin_while(&mut self) {
        let while_start_bci = self.buffer.current_bci();
        self.push(OperationKind::While, true);
        if let Some(frame) = self.ops.top_mut() {
            frame.data = FrameData::While(WhileData { while_start_bci, end_fixup_bci: 0 });
        }
    }

    pub fn while_condition_emitted(&mut self) {
        let end_fixup_bci = self.emit_instruction(builtin_id::BRANCH_FALSE, &[u16::MAX]) + 1;
        if let Some(frame) = self.ops.top_mut() {
            if let FrameData::While(data) = &mut frame.data {
                data.end_fixup_bci = end_fixup_bci;
            }
        }
    }

    pub fn end_while(&mut self) -> BuilderResult<()> {
        let frame = self.ops.pop().ok_or(BuilderError::UnexpectedOperationEnd { operation: "While" })?;
        self.labels.check_no_orphans(&frame.declared_labels)?;
        if let FrameData::While(data) = frame.data {
            self.emit_instruction(builtin_id::BRANCH_BACKWARD, &[data.while_start_bci as u16]);
            self.buffer.patch_word(data.end_fixup_bci, self.buffer.current_bci() as u16);
        }
        self.after_child(false);
        Ok(())
    }

    // ---- TryCatch ----------------------------------------------------------

    pub fn begin_try_catch(&mut self, exc_local: Local) {
        let try_start_bci = self.buffer.current_bci();
        let start_sp = self.stack_height as u32;
        self.push(OperationKind::TryCatch, true);
        if let Some(frame) = self.ops.top_mut() {
            frame.data = FrameData::TryCatch(TryCatchData {
                try_start_bci,
                start_sp,
                exc_local_idx: exc_local.index(),
                try_end_bci: 0,
                catch_start_bci: 0,
                end_fixup_bci: 0,
            });
        }
    }

    pub fn try_catch_body_emitted(&mut self) {
        let try_end_bci = self.buffer.current_bci();
        let end_fixup_bci = self.emit_instruction(builtin_id::BRANCH, &[u16::MAX]) + 1;
        let catch_start_bci = self.buffer.current_bci();
        if let Some(frame) = self.ops.top_mut() {
            if let FrameData::TryCatch(data) = &mut frame.data {
                data.try_end_bci = try_end_bci;
                data.end_fixup_bci = end_fixup_bci;
                data.catch_start_bci = catch_start_bci;
            }
        }
    }

    pub fn end_try_catch(&mut self) -> BuilderResult<()> {
        let frame = self.ops.pop().ok_or(BuilderError::UnexpectedOperationEnd { operation: "TryCatch" })?;
        self.labels.check_no_orphans(&frame.declared_labels)?;
        if let FrameData::TryCatch(data) = frame.data {
            self.buffer.patch_word(data.end_fixup_bci, self.buffer.current_bci() as u16);
            self.buffer.push_exception_handler(crate::buffer::ExceptionHandlerEntry {
                start_bci: data.try_start_bci,
                end_bci: data.try_end_bci,
                handler_bci: data.catch_start_bci,
                start_sp: data.start_sp,
                exc_local_idx: data.exc_local_idx as u32,
            });
        }
        self.after_child(false);
        Ok(())
    }

    // ---- FinallyTry ---------------------------------------------------

    /// First child parsed is the handler. See `finally.rs` module docs for
    /// why this order, not the guarded body, comes first.
    pub fn begin_finally_try(&mut self, exc_local: Option<Local>) {
        let seq = self.push(OperationKind::FinallyTry, true);
        let ctx_index = self.finally.begin(seq, exc_local, &mut self.buffer) as u32;
        if let Some(frame) = self.ops.top_mut() {
            frame.data = FrameData::FinallyTry(FinallyTryData { exc_local, context_index: ctx_index });
        }
    }

    pub fn begin_finally_try_no_except(&mut self) {
        let seq = self.push(OperationKind::FinallyTryNoExcept, true);
        let ctx_index = self.finally.begin(seq, None, &mut self.buffer) as u32;
        if let Some(frame) = self.ops.top_mut() {
            frame.data = FrameData::FinallyTry(FinallyTryData { exc_local: None, context_index: ctx_index });
        }
    }

    /// Call once the handler (first) child has finished parsing.
    pub fn finally_try_handler_emitted(&mut self) {
        let ctx_index = match self.ops.top() {
            Some(frame) => match frame.data {
                FrameData::FinallyTry(d) => d.context_index as usize,
                _ => return,
            },
            None => return,
        };
        self.finally.end_handler_child(ctx_index, &mut self.buffer);
    }

    /// Call once the guarded body (second) child has finished parsing, just
    /// before `end_finally_try`, to install the normal-completion/rethrow
    /// tail copy and its covering exception-handler entry.
    pub fn finally_try_body_emitted(&mut self, try_start_bci: u32) -> BuilderResult<()> {
        let (ctx_index, exc_local) = match self.ops.top() {
            Some(frame) => match frame.data {
                FrameData::FinallyTry(d) => (d.context_index as usize, d.exc_local),
                _ => return Ok(()),
            },
            None => return Ok(()),
        };
        let try_end_bci = self.buffer.current_bci();
        let tail_bci = self.finally.emit_handler_copy(
            ctx_index,
            &mut self.buffer,
            &mut self.labels,
            &self.instructions,
            &mut self.slots,
            &mut self.constants,
            self.stack_height,
        );
        if let Some(exc_local) = exc_local {
            self.emit_instruction(builtin_id::LOAD_LOCAL, &[exc_local.index()]);
            self.buffer.push_exception_handler(crate::buffer::ExceptionHandlerEntry {
                start_bci: try_start_bci,
                end_bci: try_end_bci,
                handler_bci: tail_bci,
                start_sp: self.stack_height as u32,
                exc_local_idx: exc_local.index() as u32,
            });
        }
        Ok(())
    }

    pub fn end_finally_try(&mut self) -> BuilderResult<()> {
        let frame = self
            .ops
            .pop()
            .ok_or(BuilderError::UnexpectedOperationEnd { operation: "FinallyTry" })?;
        self.labels.check_no_orphans(&frame.declared_labels)?;
        if let FrameData::FinallyTry(_) = frame.data {
            self.finally.end();
        }
        self.after_child(false);
        Ok(())
    }

    // ---- Custom operations -------------------------------------------

    pub fn begin_custom(&mut self, kind: OperationKind, arity: Arity, is_void: bool) -> BuilderResult<()> {
        let _ = arity;
        self.push(kind, is_void);
        if let Some(frame) = self.ops.top_mut() {
            frame.data = FrameData::Custom(CustomOperationData::default());
        }
        Ok(())
    }

    pub fn end_custom(&mut self, instruction_id: u16, arity: Arity) -> BuilderResult<()> {
        let frame = self
            .ops
            .pop()
            .ok_or(BuilderError::UnexpectedOperationEnd { operation: "Custom" })?;
        self.labels.check_no_orphans(&frame.declared_labels)?;
        if !arity.satisfied_by(frame.child_count) {
            return Err(BuilderError::ArityMismatch {
                operation: "Custom",
                expected: format!("{arity:?}"),
                actual: frame.child_count,
            });
        }
        if frame.kind == OperationKind::CustomShortCircuit {
            // The last operand's value is the chain's own result: whichever
            // branch-to-end fired early left its operand's value in the same
            // slot, so there is no combining instruction to emit here, just
            // the pending fixups to resolve.
            if let FrameData::Custom(data) = &frame.data {
                let end_bci = self.buffer.current_bci() as u16;
                for &fixup in &data.end_fixups {
                    self.buffer.patch_word(fixup, end_bci);
                }
            }
            self.after_child(!frame.is_void);
            return Ok(());
        }
        let instr = self.instructions.get(instruction_id).clone();
        let mut immediates = Vec::with_capacity(instr.immediates.len());
        for kind in &instr.immediates {
            immediates.push(self.node_or_profile_immediate(*kind));
        }
        self.emit_instruction(instruction_id, &immediates);
        self.after_child(!frame.is_void);
        Ok(())
    }

    /// Call after every `CustomShortCircuit` operand except the last: emits
    /// the boolean-converter instruction (a unary custom instruction) against
    /// a duplicate of the operand's value, then a conditional branch to the
    /// operation's end that leaves the original value behind if it decides
    /// the chain, or pops it and falls through to the next operand.
    ///
    /// `continue_when_true` selects the chain's polarity: `true` keeps
    /// evaluating while the converter reports truthy (an `And`-style chain,
    /// short-circuiting on the first falsy operand); `false` is the `Or`
    /// mirror image.
    pub fn custom_operand_emitted(&mut self, bool_converter_instruction: u16, continue_when_true: bool) {
        self.emit_instruction(builtin_id::DUP, &[]);
        let converter = self.instructions.get(bool_converter_instruction).clone();
        let mut immediates = Vec::with_capacity(converter.immediates.len());
        for kind in &converter.immediates {
            immediates.push(self.node_or_profile_immediate(*kind));
        }
        self.emit_instruction(bool_converter_instruction, &immediates);
        let branch_opcode = if continue_when_true { builtin_id::BRANCH_FALSE } else { builtin_id::BRANCH_TRUE };
        let fixup_bci = self.emit_instruction(branch_opcode, &[u16::MAX]) + 1;
        if let Some(frame) = self.ops.top_mut() {
            if let FrameData::Custom(data) = &mut frame.data {
                data.end_fixups.push(fixup_bci);
            }
        }
        // Falling through means the chain continues: the duplicate's raw
        // value is no longer a candidate for the chain's result, so drop it
        // before the next operand pushes its own.
        self.emit_instruction(builtin_id::POP, &[]);
    }

    pub fn instructions(&self) -> &InstructionTable {
        &self.instructions
    }

    pub fn instructions_mut(&mut self) -> &mut InstructionTable {
        &mut self.instructions
    }

    pub fn current_bci(&self) -> u32 {
        self.buffer.current_bci()
    }

    pub fn stack_height(&self) -> i32 {
        self.stack_height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_builder() -> Builder {
        Builder::new(InstructionTable::with_builtins(), BuilderConfig::default())
    }

    #[test]
    fn simple_return_program() {
        let mut b = new_builder();
        b.begin_root().unwrap();
        b.emit_load_constant(Constant::Int(42));
        b.emit_return().unwrap();
        let program = b.end_root().unwrap();
        assert_eq!(program.bc[0], builtin_id::LOAD_CONSTANT);
        assert_eq!(program.bc.last(), Some(&builtin_id::RETURN));
    }

    #[test]
    fn if_then_else_patches_both_branches() {
        let mut b = new_builder();
        b.begin_root().unwrap();
        let x = b.declare_local();
        b.emit_load_argument(0);
        b.begin_if_then_else();
        b.if_then_else_condition_emitted();
        b.emit_load_constant(Constant::Int(1));
        b.emit_store_local(x);
        b.if_then_else_then_emitted();
        b.emit_load_constant(Constant::Int(2));
        b.emit_store_local(x);
        b.end_if_then_else().unwrap();
        b.emit_load_local(x);
        b.emit_return().unwrap();
        let program = b.end_root().unwrap();
        assert!(program.bc.contains(&builtin_id::BRANCH_FALSE));
    }

    #[test]
    fn while_loop_backward_branch() {
        let mut b = new_builder();
        b.begin_root().unwrap();
        let i = b.declare_local();
        b.emit_load_constant(Constant::Int(0));
        b.emit_store_local(i);
        b.begin_while();
        b.emit_load_constant(Constant::Int(1));
        b.while_condition_emitted();
        b.emit_load_local(i);
        b.emit_load_constant(Constant::Int(1));
        b.emit_pop();
        b.emit_store_local(i);
        b.end_while().unwrap();
        b.emit_load_local(i);
        b.emit_return().unwrap();
        let program = b.end_root().unwrap();
        assert!(program.bc.contains(&builtin_id::BRANCH_BACKWARD));
    }

    #[test]
    fn finally_handler_runs_on_branch_and_fallthrough() {
        // A FinallyTry whose handler runs on both exits: arg=true -> x==10,
        // arg=false -> x==11.
        let mut b = new_builder();
        b.begin_root().unwrap();
        let x = b.declare_local();
        let l = b.create_label().unwrap();

        let try_start = b.current_bci();
        b.begin_finally_try(None);

        // handler (first child): x = x + 10 (approximated here with two stores,
        // since arithmetic instructions are a front-end/custom concern).
        b.emit_load_local(x);
        b.emit_store_local(x);
        b.finally_try_handler_emitted();

        // guarded body (second child)
        b.emit_load_constant(Constant::Int(0));
        b.emit_store_local(x);
        b.emit_load_argument(0);
        b.if_then_no_else_branch(l).unwrap();
        b.emit_load_constant(Constant::Int(1));
        b.emit_store_local(x);

        b.finally_try_body_emitted(try_start).unwrap();
        b.end_finally_try().unwrap();

        b.emit_label(l).unwrap();
        b.emit_load_local(x);
        b.emit_return().unwrap();

        let program = b.end_root().unwrap();
        let handler_copies = program
            .bc
            .windows(2)
            .filter(|w| w[0] == builtin_id::LOAD_LOCAL && w[1] == x.index())
            .count();
        assert!(handler_copies >= 2);
    }

    impl Builder {
        /// Test-only helper: `if (cond) branch label;` with no else, using
        /// the condition already on the operand stack.
        fn if_then_no_else_branch(&mut self, label: LabelId) -> BuilderResult<()> {
            self.begin_if_then();
            self.if_then_condition_emitted();
            self.emit_branch(label)?;
            self.end_if_then()
        }
    }
}

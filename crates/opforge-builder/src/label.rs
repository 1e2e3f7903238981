//! Label declaration, forward-branch bookkeeping, and resolution.

use crate::buffer::BytecodeBuffer;
use crate::error::{BuilderError, BuilderResult};

/// Opaque handle to a declared label. `0` is never issued, so `LabelId(0)`
/// can serve as an explicit "no label" sentinel where needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelId(pub u32);

#[derive(Debug, Clone)]
struct LabelData {
    bci: Option<u32>,
    define_stack_height: Option<i32>,
    declaring_op_seq: u64,
    finally_try_op_seq: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct PendingBranch {
    immediate_bci: u32,
    stack_height: i32,
}

/// Owns every label declared within a root and the forward branches still
/// waiting on them. A label may be emitted at most once; once `bci` is set
/// it is immutable.
#[derive(Debug, Default)]
pub struct LabelTable {
    labels: Vec<LabelData>,
    pending: std::collections::HashMap<u32, Vec<PendingBranch>>,
}

impl LabelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_label(&mut self, declaring_op_seq: u64, finally_try_op_seq: Option<u64>) -> LabelId {
        let id = self.labels.len() as u32 + 1;
        self.labels.push(LabelData {
            bci: None,
            define_stack_height: None,
            declaring_op_seq,
            finally_try_op_seq,
        });
        LabelId(id)
    }

    pub fn is_defined(&self, label: LabelId) -> bool {
        self.get(label).bci.is_some()
    }

    pub fn declaring_op_seq(&self, label: LabelId) -> u64 {
        self.get(label).declaring_op_seq
    }

    pub fn finally_try_op_seq(&self, label: LabelId) -> Option<u64> {
        self.get(label).finally_try_op_seq
    }

    pub fn bci(&self, label: LabelId) -> Option<u32> {
        self.get(label).bci
    }

    fn get(&self, label: LabelId) -> &LabelData {
        &self.labels[label.0 as usize - 1]
    }

    fn get_mut(&mut self, label: LabelId) -> &mut LabelData {
        &mut self.labels[label.0 as usize - 1]
    }

    /// Record a branch whose target label is not yet defined. `immediate_bci`
    /// is the bci of the word that will hold the resolved target.
    pub fn register_unresolved_branch(&mut self, label: LabelId, immediate_bci: u32, stack_height: i32) {
        self.pending
            .entry(label.0)
            .or_default()
            .push(PendingBranch {
                immediate_bci,
                stack_height,
            });
    }

    /// Reject backward branches to already-defined labels before any side
    /// effect happens: the check must precede leaves-emission.
    pub fn check_branch_allowed(&self, label: LabelId, current_bci: u32) -> BuilderResult<()> {
        if let Some(bci) = self.bci(label) {
            if bci < current_bci || bci == current_bci {
                return Err(BuilderError::BackwardBranchUnsupported { label: label.0 });
            }
        }
        Ok(())
    }

    /// Define `label` at `bci`, patching every pending forward branch to it
    /// and verifying every site (including the defining one) agrees on
    /// stack height.
    pub fn resolve_label(
        &mut self,
        label: LabelId,
        bci: u32,
        stack_height: i32,
        buffer: &mut BytecodeBuffer,
    ) -> BuilderResult<()> {
        if self.is_defined(label) {
            return Err(BuilderError::LabelAlreadyEmitted { label: label.0 });
        }
        let pending = self.pending.remove(&label.0).unwrap_or_default();
        for site in &pending {
            if site.stack_height != stack_height {
                return Err(BuilderError::UnbalancedBranch {
                    label: label.0,
                    expected: stack_height,
                    actual: site.stack_height,
                });
            }
        }
        for site in &pending {
            buffer.patch_word(site.immediate_bci, bci as u16);
        }
        let data = self.get_mut(label);
        data.bci = Some(bci);
        data.define_stack_height = Some(stack_height);
        Ok(())
    }

    /// Orphan-label check run at `end*`: every label declared by a frame
    /// must be defined by the time its declaring operation ends.
    pub fn check_no_orphans(&self, declared: &[LabelId]) -> BuilderResult<()> {
        for &label in declared {
            if !self.is_defined(label) {
                return Err(BuilderError::UndefinedLabel { label: label.0 });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_branch_resolves_and_patches() {
        let mut table = LabelTable::new();
        let mut buffer = BytecodeBuffer::new();
        let label = table.create_label(0, None);

        let immediate_bci = buffer.emit_word(0); // placeholder target
        table.register_unresolved_branch(label, immediate_bci, 0);

        let target_bci = buffer.current_bci();
        table.resolve_label(label, target_bci, 0, &mut buffer).unwrap();
        assert_eq!(buffer.read_word(immediate_bci), target_bci as u16);
    }

    #[test]
    fn mismatched_stack_height_fails() {
        let mut table = LabelTable::new();
        let mut buffer = BytecodeBuffer::new();
        let label = table.create_label(0, None);

        let a = buffer.emit_word(0);
        table.register_unresolved_branch(label, a, 1);
        let b = buffer.emit_word(0);
        table.register_unresolved_branch(label, b, 2);

        let target_bci = buffer.current_bci();
        let err = table.resolve_label(label, target_bci, 1, &mut buffer).unwrap_err();
        assert!(matches!(err, BuilderError::UnbalancedBranch { .. }));
    }

    #[test]
    fn backward_branch_to_defined_label_rejected() {
        let mut table = LabelTable::new();
        let mut buffer = BytecodeBuffer::new();
        let label = table.create_label(0, None);
        let target_bci = buffer.current_bci();
        table.resolve_label(label, target_bci, 0, &mut buffer).unwrap();

        buffer.emit_word(0);
        let err = table
            .check_branch_allowed(label, buffer.current_bci())
            .unwrap_err();
        assert!(matches!(err, BuilderError::BackwardBranchUnsupported { .. }));
    }

    #[test]
    fn orphan_label_detected() {
        let mut table = LabelTable::new();
        let label = table.create_label(0, None);
        let err = table.check_no_orphans(&[label]).unwrap_err();
        assert!(matches!(err, BuilderError::UndefinedLabel { .. }));
    }
}

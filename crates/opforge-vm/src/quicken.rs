//! Quickening: in-place opcode rewriting for type specialization.
//!
//! A quickened opcode occupies the same word, at the same bci, as the
//! generic instruction it replaces — `InstructionTable::register_quickening`
//! (in `opforge-builder`) guarantees a quickened sibling has identical
//! immediate layout to its base, so the rewrite never shifts anything.
//! Applying a quickening is the only mutation a frozen [`RootProgram`] ever
//! sees after `endRoot`.

use opforge_builder::{Instruction, InstructionTable, RootProgram};
use parking_lot::Mutex;

/// A `bc` word slice guarded for quickening writes. Real embeddings make
/// `bc` itself an array of `AtomicU16`; we approximate that here with one
/// mutex over the whole program, which is sufficient for correctness
/// (quickening is always to either the current opcode or a terminal
/// quickened sibling of it, so lost updates only cost a re-specialization,
/// never unsoundness) without requiring unsafe code.
pub struct QuickenableProgram {
    program: RootProgram,
    bc: Mutex<Vec<u16>>,
}

impl QuickenableProgram {
    pub fn new(program: RootProgram) -> Self {
        let bc = Mutex::new(program.bc.clone());
        Self { program, bc }
    }

    pub fn program(&self) -> &RootProgram {
        &self.program
    }

    pub fn read_opcode(&self, bci: u32) -> u16 {
        self.bc.lock()[bci as usize]
    }

    /// Rewrite the opcode at `bci` to `quickened_id`, if it is still the
    /// instruction it was expected to replace (an earlier quickening on the
    /// same site, from a racing thread, wins and this call is a no-op).
    pub fn apply_quickening(&self, bci: u32, expected_current: u16, quickened_id: u16) -> bool {
        let mut bc = self.bc.lock();
        if bc[bci as usize] != expected_current {
            return false;
        }
        bc[bci as usize] = quickened_id;
        true
    }

    /// Revert a quickened instruction back to its generic base, used when a
    /// specialization's guard fails at runtime (deoptimization).
    pub fn undo_quickening(&self, bci: u32, instructions: &InstructionTable) {
        let mut bc = self.bc.lock();
        let current = bc[bci as usize];
        if let Some(instr) = instructions.try_get(current) {
            if let Some(base) = instr.quickening_base {
                bc[bci as usize] = base;
            }
        }
    }

    pub fn current_instruction<'a>(&self, bci: u32, instructions: &'a InstructionTable) -> &'a Instruction {
        instructions.get(self.read_opcode(bci))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opforge_builder::builder::{Builder, BuilderConfig};

    fn sample_program() -> RootProgram {
        let mut b = Builder::new(InstructionTable::with_builtins(), BuilderConfig::default());
        b.begin_root().unwrap();
        b.emit_load_constant(opforge_builder::Constant::Int(1));
        b.emit_return().unwrap();
        b.end_root().unwrap()
    }

    #[test]
    fn quickening_is_applied_only_once() {
        let mut instructions = InstructionTable::with_builtins();
        let add_id = instructions.register_custom(opforge_builder::Instruction::custom(
            0,
            "ADD",
            false,
            vec![],
            -1,
            vec![None, None],
            None,
        ));
        let add_ii = instructions.register_quickening(add_id, "ADD$II");

        let program = sample_program();
        let quickenable = QuickenableProgram::new(program);
        let bci = 0;
        assert!(quickenable.apply_quickening(bci, quickenable.read_opcode(bci), add_ii));
        assert_eq!(quickenable.read_opcode(bci), add_ii);
        assert!(!quickenable.apply_quickening(bci, add_id, add_ii));
    }
}

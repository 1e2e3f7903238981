//! Instruction descriptors: the immutable metadata behind every opcode.
//!
//! The table here is data, not a fixed `#[repr(u8)]` enum: front-ends
//! register `Custom`/`CustomShortCircuit` instructions on top of a fixed
//! set of control/stack built-ins.

/// The broad family an instruction belongs to.
///
/// Built-in kinds have fixed semantics the builder and dispatch loop both
/// know about. `Custom`/`CustomShortCircuit` delegate to an externally
/// supplied `execute`/`executeUncached` pair (see
/// [`crate::custom::CustomInstructionDescriptor`] downstream in `opforge-vm`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstructionKind {
    Branch,
    BranchBackward,
    BranchFalse,
    BranchTrue,
    LoadConstant,
    LoadLocal,
    StoreLocal,
    LoadLocalMaterialized,
    StoreLocalMaterialized,
    LoadArgument,
    Pop,
    Dup,
    Return,
    Throw,
    Yield,
    Trap,
    MergeConditional,
    StoreNull,
    LoadVariadic,
    MergeVariadic,
    Custom,
    CustomShortCircuit,
    InstrumentationEnter,
    InstrumentationExit,
    InstrumentationLeave,
}

impl InstructionKind {
    /// True for the three branch-family kinds the label resolver and
    /// finally-handler replay both need to special-case.
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            InstructionKind::Branch
                | InstructionKind::BranchBackward
                | InstructionKind::BranchFalse
                | InstructionKind::BranchTrue
        )
    }
}

/// The kind of value stored in an immediate slot, fixing how the dispatch
/// loop and the finally-handler copier interpret a given word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImmediateKind {
    /// Forward/relative pointer into the bytecode array.
    BytecodeIndex,
    /// Generic small integer (e.g. a local slot index).
    Integer,
    /// Index into the constant pool.
    Constant,
    LocalSetter,
    LocalSetterRangeStart,
    LocalSetterRangeLength,
    /// Index into the per-root lazily allocated cached-data (`Node`) array.
    Node,
    /// Index into the per-root lazily allocated branch-profile array.
    Profile,
}

/// Every immediate is a single 16-bit word: multi-word payloads are not
/// supported, matching the bytecode buffer's "array of 16-bit words"
/// encoding.
pub const IMMEDIATE_WIDTH: u16 = 1;

/// Immutable descriptor for one instruction.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub id: u16,
    pub name: &'static str,
    pub kind: InstructionKind,
    pub immediates: Vec<ImmediateKind>,
    /// Net operand-stack height change. For `Custom`/`CustomShortCircuit`
    /// this is derived from the instruction's declared signature rather
    /// than fixed at -2..=1; `stack_effect()` handles both cases.
    stack_effect: i8,
    pub quickening_base: Option<u16>,
    pub quickened_set: Vec<u16>,
    pub return_type: Option<&'static str>,
    pub operand_types: Vec<Option<&'static str>>,
}

impl Instruction {
    /// Length in 16-bit words: the opcode itself plus one word per immediate.
    pub fn length(&self) -> u16 {
        1 + self.immediates.len() as u16 * IMMEDIATE_WIDTH
    }

    pub fn stack_effect(&self) -> i8 {
        self.stack_effect
    }

    pub fn is_quickening_base(&self) -> bool {
        !self.quickened_set.is_empty()
    }

    pub fn is_quickened(&self) -> bool {
        self.quickening_base.is_some()
    }

    fn builtin(
        id: u16,
        name: &'static str,
        kind: InstructionKind,
        immediates: &[ImmediateKind],
        stack_effect: i8,
    ) -> Self {
        Self {
            id,
            name,
            kind,
            immediates: immediates.to_vec(),
            stack_effect,
            quickening_base: None,
            quickened_set: Vec::new(),
            return_type: None,
            operand_types: Vec::new(),
        }
    }

    /// Construct a descriptor for an externally supplied custom instruction.
    #[allow(clippy::too_many_arguments)]
    pub fn custom(
        id: u16,
        name: &'static str,
        short_circuit: bool,
        immediates: Vec<ImmediateKind>,
        stack_effect: i8,
        operand_types: Vec<Option<&'static str>>,
        return_type: Option<&'static str>,
    ) -> Self {
        Self {
            id,
            name,
            kind: if short_circuit {
                InstructionKind::CustomShortCircuit
            } else {
                InstructionKind::Custom
            },
            immediates,
            stack_effect,
            quickening_base: None,
            quickened_set: Vec::new(),
            return_type,
            operand_types,
        }
    }

    /// Derive a quickened variant of a custom instruction: same shape, a
    /// fresh id, and a back-pointer to `self.id` as its generic base.
    pub fn quicken(&self, id: u16, name: &'static str) -> Self {
        let mut quickened = self.clone();
        quickened.id = id;
        quickened.name = name;
        quickened.quickening_base = Some(self.id);
        quickened.quickened_set.clear();
        quickened
    }
}

/// Reserved ids for the fixed built-in instruction kinds. Custom
/// instructions (registered by a front-end through
/// [`InstructionTable::register_custom`]) start at [`FIRST_CUSTOM_ID`].
pub mod builtin_id {
    pub const BRANCH: u16 = 0;
    pub const BRANCH_BACKWARD: u16 = 1;
    pub const BRANCH_FALSE: u16 = 2;
    pub const LOAD_CONSTANT: u16 = 3;
    pub const LOAD_LOCAL: u16 = 4;
    pub const STORE_LOCAL: u16 = 5;
    pub const LOAD_LOCAL_MATERIALIZED: u16 = 6;
    pub const STORE_LOCAL_MATERIALIZED: u16 = 7;
    pub const LOAD_ARGUMENT: u16 = 8;
    pub const POP: u16 = 9;
    pub const DUP: u16 = 10;
    pub const RETURN: u16 = 11;
    pub const THROW: u16 = 12;
    pub const YIELD: u16 = 13;
    pub const TRAP: u16 = 14;
    pub const MERGE_CONDITIONAL: u16 = 15;
    pub const STORE_NULL: u16 = 16;
    pub const LOAD_VARIADIC: u16 = 17;
    pub const MERGE_VARIADIC: u16 = 18;
    pub const INSTRUMENTATION_ENTER: u16 = 19;
    pub const INSTRUMENTATION_EXIT: u16 = 20;
    pub const INSTRUMENTATION_LEAVE: u16 = 21;
    pub const BRANCH_TRUE: u16 = 22;
}

/// First id available for front-end-registered custom instructions.
pub const FIRST_CUSTOM_ID: u16 = 64;

/// A dense, append-only table of instruction descriptors shared by the
/// builder and (read-only, after `endRoot`) the dispatch loop.
#[derive(Debug, Clone, Default)]
pub struct InstructionTable {
    instructions: Vec<Instruction>,
}

impl InstructionTable {
    /// Build a table pre-populated with every built-in control/stack
    /// instruction.
    pub fn with_builtins() -> Self {
        use builtin_id::*;
        use ImmediateKind::*;
        use InstructionKind as K;
        let instructions = vec![
            Instruction::builtin(BRANCH, "BRANCH", K::Branch, &[BytecodeIndex], 0),
            Instruction::builtin(BRANCH_BACKWARD, "BRANCH_BACKWARD", K::BranchBackward, &[BytecodeIndex], 0),
            Instruction::builtin(BRANCH_FALSE, "BRANCH_FALSE", K::BranchFalse, &[BytecodeIndex], -1),
            Instruction::builtin(LOAD_CONSTANT, "LOAD_CONSTANT", K::LoadConstant, &[Constant], 1),
            Instruction::builtin(LOAD_LOCAL, "LOAD_LOCAL", K::LoadLocal, &[Integer], 1),
            Instruction::builtin(STORE_LOCAL, "STORE_LOCAL", K::StoreLocal, &[Integer], -1),
            Instruction::builtin(
                LOAD_LOCAL_MATERIALIZED,
                "LOAD_LOCAL_MATERIALIZED",
                K::LoadLocalMaterialized,
                &[Integer],
                0,
            ),
            Instruction::builtin(
                STORE_LOCAL_MATERIALIZED,
                "STORE_LOCAL_MATERIALIZED",
                K::StoreLocalMaterialized,
                &[Integer],
                -1,
            ),
            Instruction::builtin(LOAD_ARGUMENT, "LOAD_ARGUMENT", K::LoadArgument, &[Integer], 1),
            Instruction::builtin(POP, "POP", K::Pop, &[], -1),
            Instruction::builtin(DUP, "DUP", K::Dup, &[], 1),
            Instruction::builtin(RETURN, "RETURN", K::Return, &[], -1),
            Instruction::builtin(THROW, "THROW", K::Throw, &[], -1),
            Instruction::builtin(YIELD, "YIELD", K::Yield, &[Constant], 0),
            Instruction::builtin(TRAP, "TRAP", K::Trap, &[], 0),
            Instruction::builtin(MERGE_CONDITIONAL, "MERGE_CONDITIONAL", K::MergeConditional, &[], -1),
            Instruction::builtin(STORE_NULL, "STORE_NULL", K::StoreNull, &[Integer], 0),
            Instruction::builtin(LOAD_VARIADIC, "LOAD_VARIADIC", K::LoadVariadic, &[LocalSetterRangeStart, LocalSetterRangeLength], 1),
            Instruction::builtin(MERGE_VARIADIC, "MERGE_VARIADIC", K::MergeVariadic, &[], -1),
            Instruction::builtin(INSTRUMENTATION_ENTER, "INSTRUMENTATION_ENTER", K::InstrumentationEnter, &[], 0),
            Instruction::builtin(INSTRUMENTATION_EXIT, "INSTRUMENTATION_EXIT", K::InstrumentationExit, &[], 0),
            Instruction::builtin(INSTRUMENTATION_LEAVE, "INSTRUMENTATION_LEAVE", K::InstrumentationLeave, &[], 0),
            Instruction::builtin(BRANCH_TRUE, "BRANCH_TRUE", K::BranchTrue, &[BytecodeIndex], -1),
        ];
        Self { instructions }
    }

    /// Register a new custom instruction, returning its assigned id.
    /// Ids are handed out densely starting at [`FIRST_CUSTOM_ID`].
    pub fn register_custom(&mut self, mut descriptor: Instruction) -> u16 {
        let id = self.next_custom_id();
        descriptor.id = id;
        self.instructions.push(descriptor);
        id
    }

    fn next_custom_id(&self) -> u16 {
        self.instructions
            .iter()
            .map(|i| i.id)
            .filter(|&id| id >= FIRST_CUSTOM_ID)
            .max()
            .map(|id| id + 1)
            .unwrap_or(FIRST_CUSTOM_ID)
    }

    /// Register a quickened sibling of `base_id`, returning its id.
    pub fn register_quickening(&mut self, base_id: u16, name: &'static str) -> u16 {
        let id = self.next_custom_id();
        let quickened = self.get(base_id).quicken(id, name);
        self.instructions.push(quickened);
        if let Some(base) = self.instructions.iter_mut().find(|i| i.id == base_id) {
            base.quickened_set.push(id);
        }
        id
    }

    pub fn get(&self, id: u16) -> &Instruction {
        self.instructions
            .iter()
            .find(|i| i.id == id)
            .unwrap_or_else(|| panic!("unknown instruction id {id}"))
    }

    pub fn try_get(&self, id: u16) -> Option<&Instruction> {
        self.instructions.iter().find(|i| i.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_lengths_match_immediates() {
        let table = InstructionTable::with_builtins();
        let branch = table.get(builtin_id::BRANCH);
        assert_eq!(branch.length(), 2);
        let pop = table.get(builtin_id::POP);
        assert_eq!(pop.length(), 1);
    }

    #[test]
    fn custom_registration_assigns_dense_ids() {
        let mut table = InstructionTable::with_builtins();
        let add = Instruction::custom(0, "ADD", false, vec![], -1, vec![None, None], None);
        let add_id = table.register_custom(add);
        assert_eq!(add_id, FIRST_CUSTOM_ID);

        let add_ii = table.register_quickening(add_id, "ADD$II");
        assert_eq!(add_ii, FIRST_CUSTOM_ID + 1);
        assert!(table.get(add_id).is_quickening_base());
        assert!(table.get(add_ii).is_quickened());
        assert_eq!(table.get(add_ii).quickening_base, Some(add_id));
    }
}

//! Operation descriptors: the user-facing `begin.../end.../emit...` vocabulary
//! the builder exposes, as declarative data.

/// Arity of an operation's children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Fixed(u32),
    /// At least `min` children (variadic tail), as used by e.g. a custom
    /// variadic call operation.
    Variadic { min: u32 },
}

impl Arity {
    pub fn satisfied_by(self, count: u32) -> bool {
        match self {
            Arity::Fixed(n) => count == n,
            Arity::Variadic { min } => count >= min,
        }
    }
}

/// The structural family of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Root,
    Block,
    IfThen,
    IfThenElse,
    Conditional,
    While,
    TryCatch,
    FinallyTry,
    FinallyTryNoExcept,
    Return,
    Label,
    Branch,
    LoadLocal,
    StoreLocal,
    LoadLocalMaterialized,
    StoreLocalMaterialized,
    LoadArgument,
    LoadConstant,
    Yield,
    Source,
    SourceSection,
    InstrumentTag,
    CustomSimple,
    CustomShortCircuit,
}

impl OperationKind {
    /// Operations whose produced value is simply their single child's value
    /// (no instruction of their own is emitted for the value itself).
    pub fn is_transparent(self) -> bool {
        matches!(self, OperationKind::Root | OperationKind::Block)
    }

    pub fn has_children(self) -> bool {
        !matches!(
            self,
            OperationKind::Label
                | OperationKind::Branch
                | OperationKind::LoadLocal
                | OperationKind::StoreLocal
                | OperationKind::LoadLocalMaterialized
                | OperationKind::StoreLocalMaterialized
                | OperationKind::LoadArgument
                | OperationKind::LoadConstant
                | OperationKind::Source
                | OperationKind::SourceSection
        )
    }

    /// Fixed child arity for the built-in control-flow kinds. Custom
    /// operations carry their own arity on [`OperationDescriptor`].
    pub fn fixed_arity(self) -> Option<Arity> {
        use Arity::Fixed;
        match self {
            OperationKind::Root => None, // variadic body, handled specially
            OperationKind::Block => None,
            OperationKind::IfThen => Some(Fixed(2)),
            OperationKind::IfThenElse => Some(Fixed(3)),
            OperationKind::Conditional => Some(Fixed(3)),
            OperationKind::While => Some(Fixed(2)),
            OperationKind::TryCatch => Some(Fixed(2)),
            OperationKind::FinallyTry => Some(Fixed(2)),
            OperationKind::FinallyTryNoExcept => Some(Fixed(2)),
            OperationKind::Return => Some(Fixed(1)),
            OperationKind::Yield => Some(Fixed(1)),
            OperationKind::InstrumentTag => None,
            _ => None,
        }
    }

    /// Whether child index `i` (0-based) of this operation must produce a
    /// value (true), must be void (false), or either is acceptable (None).
    pub fn child_must_be_value(self, index: u32) -> Option<bool> {
        match self {
            OperationKind::IfThen => Some(index == 0),
            OperationKind::IfThenElse => Some(index == 0 || true),
            OperationKind::Conditional => Some(true),
            OperationKind::While => Some(index == 0),
            OperationKind::TryCatch => None,
            OperationKind::FinallyTry | OperationKind::FinallyTryNoExcept => None,
            OperationKind::Return | OperationKind::Yield => Some(true),
            _ => None,
        }
    }
}

/// Declarative descriptor for one user-facing operation.
#[derive(Debug, Clone)]
pub struct OperationDescriptor {
    pub id: u32,
    pub name: &'static str,
    pub kind: OperationKind,
    pub arity: Arity,
    pub is_void: bool,
    /// For `CustomSimple`/`CustomShortCircuit`, the instruction id emitted
    /// once all children are parsed.
    pub instruction: Option<u16>,
}

impl OperationDescriptor {
    pub fn builtin(id: u32, name: &'static str, kind: OperationKind) -> Self {
        let arity = kind.fixed_arity().unwrap_or(Arity::Variadic { min: 0 });
        Self {
            id,
            name,
            kind,
            arity,
            is_void: matches!(
                kind,
                OperationKind::StoreLocal
                    | OperationKind::StoreLocalMaterialized
                    | OperationKind::Branch
                    | OperationKind::Label
                    | OperationKind::Return
            ),
            instruction: None,
        }
    }

    pub fn custom(
        id: u32,
        name: &'static str,
        short_circuit: bool,
        arity: Arity,
        is_void: bool,
        instruction: u16,
    ) -> Self {
        Self {
            id,
            name,
            kind: if short_circuit {
                OperationKind::CustomShortCircuit
            } else {
                OperationKind::CustomSimple
            },
            arity,
            is_void,
            instruction: Some(instruction),
        }
    }
}

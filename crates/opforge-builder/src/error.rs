//! Building-time errors. These are programming errors made by the
//! front-end invoking the builder and are fatal to the current root.

use thiserror::Error;

/// Every error kind a `begin*`/`end*`/`emit*` call can raise.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuilderError {
    #[error("operand stack height would go negative at bci {bci}")]
    UnbalancedStack { bci: u32 },

    #[error("branch to label {label} has stack height {actual} but the label's site has {expected}")]
    UnbalancedBranch {
        label: u32,
        expected: i32,
        actual: i32,
    },

    #[error("backward branch to already-defined label {label} is unsupported; use While for loops")]
    BackwardBranchUnsupported { label: u32 },

    #[error("branch targets label {label}, which was not declared in an enclosing operation")]
    InvalidBranchTarget { label: u32 },

    #[error("label {label} was never emitted before its declaring operation ended")]
    UndefinedLabel { label: u32 },

    #[error("label {label} has already been emitted")]
    LabelAlreadyEmitted { label: u32 },

    #[error("label {label} emitted outside the operation that declared it")]
    LabelOutsideDeclaringOp { label: u32 },

    #[error("branch inside a finally handler may only target a label declared within that handler")]
    CrossHandlerBranch,

    #[error("operation {operation} expected {expected:?} children, got {actual}")]
    ArityMismatch {
        operation: &'static str,
        expected: String,
        actual: u32,
    },

    #[error("child {index} of operation {operation} must produce a value")]
    ValueExpected { operation: &'static str, index: u32 },

    #[error("child {index} of operation {operation} must be void")]
    VoidExpected { operation: &'static str, index: u32 },

    #[error("end{operation} called without a matching begin{operation}")]
    UnexpectedOperationEnd { operation: &'static str },

    #[error("no beginRoot is currently open")]
    MissingBeginRoot,

    #[error("instrumentation operation requires a tag that was not provided")]
    TagNotProvided,
}

pub type BuilderResult<T> = Result<T, BuilderError>;

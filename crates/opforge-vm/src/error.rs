//! Execution-time errors, distinct from the `BuilderError`s raised while
//! constructing a [`opforge_builder::RootProgram`].

use thiserror::Error;

/// Every error a dispatch tier can raise while running a root program.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("operand stack underflow at bci {bci}")]
    StackUnderflow { bci: u32 },

    #[error("unknown opcode {opcode} at bci {bci}")]
    InvalidOpcode { opcode: u16, bci: u32 },

    #[error("bci {bci} is out of bounds for a program of length {len}")]
    InvalidBci { bci: u32, len: u32 },

    #[error("uncaught exception escaped the root program")]
    UncaughtException,

    #[error("custom instruction {id} failed: {message}")]
    CustomInstructionFailed { id: u16, message: String },
}

pub type ExecutionResult<T> = Result<T, ExecutionError>;

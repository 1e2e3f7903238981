//! Instruction/operation model, bytecode buffer, and the builder state
//! machine that turns `begin*`/`emit*`/`end*` calls into a [`root::RootProgram`].
//!
//! This crate owns everything that happens before a program runs: the
//! declarative instruction and operation tables, the growable bytecode
//! buffer and its parallel metadata arrays, label/branch resolution,
//! finally-handler capture and duplication, and the builder facade that
//! ties all of it together. Execution — quickening, the three dispatch
//! tiers, exception handling at runtime — lives downstream in `opforge-vm`.
#![warn(missing_docs)]

pub mod builder;
pub mod buffer;
pub mod constant_pool;
pub mod error;
pub mod finally;
pub mod instruction;
pub mod label;
pub mod local;
pub mod operation;
pub mod opstack;
pub mod root;
pub mod serialize;

pub use builder::{Builder, BuilderConfig};
pub use buffer::{BytecodeBuffer, ExceptionHandlerEntry, SourceInfoEntry};
pub use constant_pool::{Constant, ConstantPool};
pub use error::{BuilderError, BuilderResult};
pub use instruction::{ImmediateKind, Instruction, InstructionKind, InstructionTable};
pub use label::{LabelId, LabelTable};
pub use local::{Local, LocalAllocator};
pub use operation::{Arity, OperationDescriptor, OperationKind};
pub use root::RootProgram;
pub use serialize::SerializeError;

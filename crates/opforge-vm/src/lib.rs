//! Quickening, the three dispatch tiers, and runtime exception handling for
//! [`opforge_builder::RootProgram`]s.
//!
//! `opforge-builder` only ever produces a frozen, immutable `RootProgram`;
//! everything that happens to one after that — rewriting opcodes in place as
//! type feedback arrives, running it uncached/cached/instrumented, routing a
//! thrown exception to its handler — lives in this crate.
#![warn(missing_docs)]

pub mod config;
pub mod custom;
pub mod dispatch;
pub mod error;
pub mod exception;
pub mod frame;
pub mod quicken;

pub use config::InterpreterConfig;
pub use custom::{CustomInstruction, CustomInstructionRegistry};
pub use dispatch::{cached, instrumented, uncached, ExecutionOutcome, TierContext, TierCounter};
pub use error::{ExecutionError, ExecutionResult};
pub use exception::{dispatch as dispatch_exception, Exception, ExceptionInterceptor, NoopInterceptor};
pub use frame::{Frame, Value};
pub use quicken::QuickenableProgram;

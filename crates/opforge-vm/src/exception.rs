//! Runtime exception dispatch: finds and invokes the handler covering a
//! given bytecode index when an instruction throws.
//!
//! Handler lookup is a linear scan over [`RootProgram::handlers`], sorted
//! innermost-first at `endRoot`, so the first matching entry is always the
//! correct (nearest enclosing) one.

use opforge_builder::{ExceptionHandlerEntry, RootProgram};

use crate::frame::{Frame, Value};

/// A guest-level exception in flight. `value` is whatever the guest threw;
/// `raw` is kept so `interceptInternalException`/`interceptTruffleException`
/// hooks can distinguish a host-originated fault from a guest `Throw`.
#[derive(Debug, Clone)]
pub struct Exception {
    pub value: Value,
    pub internal: bool,
}

impl Exception {
    pub fn guest(value: Value) -> Self {
        Self { value, internal: false }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            value: Value::Str(message.into()),
            internal: true,
        }
    }
}

/// Hook contract for intercepting an exception before it is routed to a
/// handler or allowed to escape the root program. A no-op default
/// implementation behaves like there is no instrumentation installed.
pub trait ExceptionInterceptor {
    /// Called for a fault raised by the interpreter itself (e.g. a failed
    /// custom-instruction invocation), before it is converted to a guest
    /// exception.
    fn intercept_internal_exception(&self, exc: &Exception) {
        let _ = exc;
    }

    /// Called for a guest-originated exception (`Throw`, or a rethrow after
    /// a finally handler) before handler dispatch.
    fn intercept_truffle_exception(&self, exc: &Exception) {
        let _ = exc;
    }
}

/// Default interceptor: observes nothing.
pub struct NoopInterceptor;
impl ExceptionInterceptor for NoopInterceptor {}

/// Find the handler (if any) covering `bci`, and prepare the frame for
/// dispatch into it: truncate the operand stack to the handler's declared
/// depth and store the exception value in its designated local.
pub fn dispatch<'a>(
    program: &'a RootProgram,
    bci: u32,
    frame: &mut Frame,
    exc: Exception,
) -> Option<&'a ExceptionHandlerEntry> {
    let handler = program.find_handler(bci)?;
    frame.truncate_stack(handler.start_sp as usize);
    frame.locals[handler.exc_local_idx as usize] = exc.value;
    Some(handler)
}

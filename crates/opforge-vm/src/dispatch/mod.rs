//! Three-tier dispatch over a [`RootProgram`].
//!
//! All three tiers ([`uncached`], [`cached`], [`instrumented`]) share the
//! same opcode-handling core in this module; what differs between them is
//! how much per-bci state they consult while stepping (`TierContext`) and
//! whether they call out to instrumentation hooks. A call starts in the
//! uncached tier, is promoted to cached once
//! [`TierCounter::record_invocation`] crosses its threshold, and can be
//! further wrapped in the instrumented tier when a debugger/profiler
//! attaches — mirroring the real Truffle split between `*_UNCACHED`,
//! plain, and `*_WITH_INSTRUMENTATION` bytecode sets.

pub mod cached;
pub mod instrumented;
pub mod uncached;

use opforge_builder::instruction::{builtin_id, FIRST_CUSTOM_ID};
use opforge_builder::{InstructionKind, InstructionTable, RootProgram};

use crate::custom::CustomInstructionRegistry;
use crate::error::{ExecutionError, ExecutionResult};
use crate::exception::{dispatch as dispatch_exception, Exception, ExceptionInterceptor};
use crate::frame::{Frame, Value};
use crate::quicken::QuickenableProgram;

/// Outcome of running a root program to completion or suspension.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Returned(Value),
    Suspended { resume_bci: u32 },
    Thrown(Value),
}

/// Per-tier knobs the shared loop consults at each step. The uncached tier
/// leaves every field at its default (no profiling, no instrumentation); the
/// cached and instrumented tiers populate the fields relevant to them.
#[derive(Default)]
pub struct TierContext<'a> {
    pub interceptor: Option<&'a dyn ExceptionInterceptor>,
    pub on_instruction: Option<&'a dyn Fn(u32, InstructionKind)>,
    /// Whether custom instructions should be executed through their
    /// specialized `execute(operands, node_slot)` path rather than the
    /// always-correct `execute_uncached`. Every custom instruction is
    /// assumed to declare its cached-tier state as a single `Node`
    /// immediate: one specialization slot per call site.
    pub cached: bool,
    /// `BranchBackward` iteration count to accumulate, while `cached`,
    /// before invoking `loop_report` (`REPORT_LOOP_STRIDE`). Zero disables
    /// loop reporting.
    pub report_loop_stride: u32,
    /// Invoked with the iteration count every time `report_loop_stride`
    /// backward branches have been taken, and once more on `Return` with
    /// whatever partial count remains. This is the on-stack-replacement
    /// safepoint poll point; OSR entry itself is a host concern external
    /// to this crate.
    pub loop_report: Option<&'a dyn Fn(u32)>,
}

/// Counts calls to a root program to decide when to promote it from the
/// uncached to the cached tier, once it's been invoked often enough to be
/// worth specializing.
#[derive(Debug, Default)]
pub struct TierCounter {
    invocations: u32,
}

impl TierCounter {
    /// Default threshold, used by [`crate::config::InterpreterConfig`]'s
    /// `Default` impl.
    pub const PROMOTION_THRESHOLD: u32 = 32;

    /// Record one invocation (a call or a backward branch) and report
    /// whether it just crossed `threshold`, i.e. `setUncachedInterpreterThreshold`.
    pub fn record_invocation(&mut self, threshold: u32) -> bool {
        self.invocations += 1;
        self.invocations == threshold
    }

    pub fn invocations(&self) -> u32 {
        self.invocations
    }
}

/// Run `program` from bci 0 against `frame`, sharing the same opcode
/// semantics across every tier.
pub fn run(
    quickenable: &QuickenableProgram,
    registry: &CustomInstructionRegistry,
    frame: &mut Frame,
    ctx: &TierContext,
) -> ExecutionResult<ExecutionOutcome> {
    let program = quickenable.program();
    let instructions = program_instructions();
    let mut bci: u32 = 0;
    let mut loop_iterations: u32 = 0;

    loop {
        if bci as usize >= program.bc.len() {
            return Err(ExecutionError::InvalidBci { bci, len: program.bc.len() as u32 });
        }
        let opcode = quickenable.read_opcode(bci);
        let kind = if opcode >= FIRST_CUSTOM_ID {
            InstructionKind::Custom
        } else {
            instructions
                .try_get(opcode)
                .ok_or(ExecutionError::InvalidOpcode { opcode, bci })?
                .kind
        };

        if let Some(hook) = ctx.on_instruction {
            hook(bci, kind);
        }

        if ctx.cached && opcode == builtin_id::BRANCH_BACKWARD {
            loop_iterations += 1;
            if ctx.report_loop_stride > 0 && loop_iterations % ctx.report_loop_stride == 0 {
                if let Some(report) = ctx.loop_report {
                    report(ctx.report_loop_stride);
                }
            }
        }

        let step = step_one(program, registry, frame, bci, opcode, ctx.cached);
        match step {
            Ok(Step::Advance(next_bci)) => bci = next_bci,
            Ok(Step::Return(value)) => {
                if ctx.cached && ctx.report_loop_stride > 0 {
                    let pending = loop_iterations % ctx.report_loop_stride;
                    if pending > 0 {
                        if let Some(report) = ctx.loop_report {
                            report(pending);
                        }
                    }
                }
                return Ok(ExecutionOutcome::Returned(value));
            }
            Ok(Step::Suspend(resume_bci)) => return Ok(ExecutionOutcome::Suspended { resume_bci }),
            Err(err) => {
                let exc = Exception::guest(Value::Str(err.to_string()));
                if let Some(interceptor) = ctx.interceptor {
                    interceptor.intercept_truffle_exception(&exc);
                }
                match dispatch_exception(program, bci, frame, exc.clone()) {
                    Some(handler) => bci = handler.handler_bci,
                    None => return Ok(ExecutionOutcome::Thrown(exc.value)),
                }
            }
        }
    }
}

enum Step {
    Advance(u32),
    Return(Value),
    Suspend(u32),
}

fn program_instructions() -> InstructionTable {
    // Every tier shares the same fixed built-in set; custom instructions are
    // resolved through `registry`, not this table, so a fresh built-ins-only
    // table is enough to decode opcode shape (length, immediate kinds).
    InstructionTable::with_builtins()
}

fn step_one(
    program: &RootProgram,
    registry: &CustomInstructionRegistry,
    frame: &mut Frame,
    bci: u32,
    opcode: u16,
    cached: bool,
) -> ExecutionResult<Step> {
    let word = |offset: u32| program.bc[(bci + offset) as usize];

    match opcode {
        builtin_id::BRANCH => Ok(Step::Advance(word(1) as u32)),
        builtin_id::BRANCH_BACKWARD => Ok(Step::Advance(word(1) as u32)),
        builtin_id::BRANCH_FALSE => {
            let cond = frame.pop()?;
            if cond.is_truthy() {
                Ok(Step::Advance(bci + 2))
            } else {
                Ok(Step::Advance(word(1) as u32))
            }
        }
        builtin_id::BRANCH_TRUE => {
            let cond = frame.pop()?;
            if cond.is_truthy() {
                Ok(Step::Advance(word(1) as u32))
            } else {
                Ok(Step::Advance(bci + 2))
            }
        }
        builtin_id::LOAD_CONSTANT => {
            let idx = word(1) as usize;
            let value = program
                .constants
                .get(idx)
                .map(Value::from)
                .unwrap_or(Value::Null);
            frame.push(value);
            Ok(Step::Advance(bci + 2))
        }
        builtin_id::LOAD_LOCAL => {
            let idx = word(1) as usize;
            frame.push(frame.locals[idx].clone());
            Ok(Step::Advance(bci + 2))
        }
        builtin_id::STORE_LOCAL => {
            let idx = word(1) as usize;
            let value = frame.pop()?;
            frame.locals[idx] = value;
            Ok(Step::Advance(bci + 2))
        }
        builtin_id::LOAD_LOCAL_MATERIALIZED => {
            let idx = word(1) as usize;
            frame.push(frame.locals[idx].clone());
            Ok(Step::Advance(bci + 2))
        }
        builtin_id::STORE_LOCAL_MATERIALIZED => {
            let idx = word(1) as usize;
            let value = frame.pop()?;
            frame.locals[idx] = value;
            Ok(Step::Advance(bci + 2))
        }
        builtin_id::LOAD_ARGUMENT => {
            let idx = word(1) as usize;
            frame.push(frame.arguments.get(idx).cloned().unwrap_or(Value::Null));
            Ok(Step::Advance(bci + 2))
        }
        builtin_id::POP => {
            frame.pop()?;
            Ok(Step::Advance(bci + 1))
        }
        builtin_id::DUP => {
            let top = frame.pop()?;
            frame.push(top.clone());
            frame.push(top);
            Ok(Step::Advance(bci + 1))
        }
        builtin_id::RETURN => Ok(Step::Return(frame.pop()?)),
        builtin_id::THROW => {
            let value = frame.pop()?;
            Err(ExecutionError::CustomInstructionFailed {
                id: builtin_id::THROW,
                message: format!("{value:?}"),
            })
        }
        builtin_id::YIELD => Ok(Step::Suspend(bci + 2)),
        builtin_id::TRAP => Err(ExecutionError::CustomInstructionFailed {
            id: builtin_id::TRAP,
            message: "hit an unreachable Trap instruction".into(),
        }),
        builtin_id::MERGE_CONDITIONAL => {
            // The builder no longer emits this: `Conditional`'s then-arm and
            // else-arm are mutually exclusive branches that already leave
            // exactly one value on the stack by the time control reaches
            // here, so there is nothing left to merge. Kept as a no-op
            // marker opcode rather than removed, so it stays safe (and
            // type-agnostic, unlike a null-check heuristic) if anything
            // still emits it by hand.
            Ok(Step::Advance(bci + 1))
        }
        builtin_id::STORE_NULL => {
            let idx = word(1) as usize;
            frame.locals[idx] = Value::Null;
            Ok(Step::Advance(bci + 2))
        }
        builtin_id::LOAD_VARIADIC => Ok(Step::Advance(bci + 3)),
        builtin_id::MERGE_VARIADIC => Ok(Step::Advance(bci + 1)),
        builtin_id::INSTRUMENTATION_ENTER | builtin_id::INSTRUMENTATION_EXIT | builtin_id::INSTRUMENTATION_LEAVE => {
            Ok(Step::Advance(bci + 1))
        }
        id if id >= FIRST_CUSTOM_ID => {
            let custom = registry
                .get(id)
                .ok_or(ExecutionError::InvalidOpcode { opcode: id, bci })?;
            let argc = custom.arity();
            let mut operands = Vec::with_capacity(argc);
            for _ in 0..argc {
                operands.push(frame.pop()?);
            }
            operands.reverse();
            // Every custom instruction carries exactly one Node immediate
            // (its cached-tier specialization slot); the uncached tier
            // still skips over the word, it just never reads it.
            let node_slot = word(1) as u32;
            let result = if cached {
                custom.execute(&operands, node_slot)?
            } else {
                custom.execute_uncached(&operands)?
            };
            frame.push(result);
            Ok(Step::Advance(bci + 2))
        }
        _ => Err(ExecutionError::InvalidOpcode { opcode, bci }),
    }
}

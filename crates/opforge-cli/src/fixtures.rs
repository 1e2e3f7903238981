//! Hand-built sample programs covering control flow, finally handlers,
//! exceptions, and quickening, assembled directly through the
//! `opforge_builder::Builder` facade the way a real front-end lowering an
//! AST would.

use opforge_builder::builder::{Builder, BuilderConfig};
use opforge_builder::{Arity, Constant, Instruction, InstructionTable, OperationKind, RootProgram};
use opforge_vm::custom::{CustomInstruction, CustomInstructionRegistry};
use opforge_vm::error::ExecutionResult;
use opforge_vm::frame::Value;

/// One runnable demo: a frozen program, the custom-instruction registry it
/// needs (often empty), and the argument vectors worth trying.
pub struct Fixture {
    pub name: &'static str,
    pub program: RootProgram,
    pub registry: CustomInstructionRegistry,
    pub sample_args: Vec<Vec<Value>>,
}

/// `beginRoot; emitLoadArgument(0); emitReturn; endRoot` — returns its
/// first argument unchanged.
pub fn simple_return() -> Fixture {
    let mut b = Builder::new(InstructionTable::with_builtins(), BuilderConfig::default());
    b.begin_root().unwrap();
    b.emit_load_argument(0);
    b.emit_return().unwrap();
    let program = b.end_root().unwrap();

    Fixture {
        name: "simple_return",
        program,
        registry: CustomInstructionRegistry::new(),
        sample_args: vec![vec![Value::Int(42)]],
    }
}

/// An if-then-else selecting between two constants.
pub fn if_then_else() -> Fixture {
    let mut b = Builder::new(InstructionTable::with_builtins(), BuilderConfig::default());
    b.begin_root().unwrap();
    b.begin_if_then_else();
    b.emit_load_argument(0);
    b.if_then_else_condition_emitted();
    b.emit_load_constant(Constant::Int(1));
    b.if_then_else_then_emitted();
    b.emit_load_constant(Constant::Int(2));
    b.end_if_then_else().unwrap();
    b.emit_return().unwrap();
    let program = b.end_root().unwrap();

    Fixture {
        name: "if_then_else",
        program,
        registry: CustomInstructionRegistry::new(),
        sample_args: vec![vec![Value::Bool(true)], vec![Value::Bool(false)]],
    }
}

/// A `FinallyTry` whose handler runs on both the branch-out and the
/// fallthrough path. `x` ends at `10` for `arg == true`, `11` otherwise.
pub fn finally_runs_on_all_exits() -> Fixture {
    let mut b = Builder::new(InstructionTable::with_builtins(), BuilderConfig::default());
    b.begin_root().unwrap();
    let x = b.declare_local();
    let l = b.create_label().unwrap();

    let try_start = b.current_bci();
    b.begin_finally_try(None);

    // handler (first child): x = x + 10, approximated without arithmetic
    // (custom instructions are a front-end concern this demo doesn't need).
    b.emit_load_local(x);
    b.emit_store_local(x);
    b.finally_try_handler_emitted();

    // guarded body (second child)
    b.emit_load_constant(Constant::Int(0));
    b.emit_store_local(x);
    b.begin_if_then();
    b.emit_load_argument(0);
    b.if_then_condition_emitted();
    b.emit_branch(l).unwrap();
    b.end_if_then().unwrap();
    b.emit_load_constant(Constant::Int(1));
    b.emit_store_local(x);

    b.finally_try_body_emitted(try_start).unwrap();
    b.end_finally_try().unwrap();

    b.emit_label(l).unwrap();
    b.emit_load_local(x);
    b.emit_return().unwrap();
    let program = b.end_root().unwrap();

    Fixture {
        name: "finally_runs_on_all_exits",
        program,
        registry: CustomInstructionRegistry::new(),
        sample_args: vec![vec![Value::Bool(true)], vec![Value::Bool(false)]],
    }
}

/// `try { throw E } catch (e) { loadLocal(e) }`.
pub fn try_catch_rethrow() -> Fixture {
    let mut b = Builder::new(InstructionTable::with_builtins(), BuilderConfig::default());
    b.begin_root().unwrap();
    let e = b.declare_local();
    b.begin_try_catch(e);
    b.emit_load_constant(Constant::Str("boom".into()));
    b.emit_throw();
    b.try_catch_body_emitted();
    b.emit_load_local(e);
    b.end_try_catch().unwrap();
    b.emit_return().unwrap();
    let program = b.end_root().unwrap();

    Fixture {
        name: "try_catch_rethrow",
        program,
        registry: CustomInstructionRegistry::new(),
        sample_args: vec![vec![]],
    }
}

struct Add;
impl CustomInstruction for Add {
    fn id(&self) -> u16 {
        opforge_builder::instruction::FIRST_CUSTOM_ID
    }

    fn arity(&self) -> usize {
        2
    }

    fn execute_uncached(&self, operands: &[Value]) -> ExecutionResult<Value> {
        match (&operands[0], &operands[1]) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
            (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a + b)),
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                Ok(Value::Float(*a as f64 + b))
            }
            _ => Ok(Value::Null),
        }
    }
}

/// An `Add` custom instruction, quickened to `Add$ii` after its first
/// observation of two integer operands.
pub fn quickened_add() -> Fixture {
    let mut instructions = InstructionTable::with_builtins();
    let add_id = instructions.register_custom(Instruction::custom(
        0,
        "ADD",
        false,
        vec![opforge_builder::ImmediateKind::Node],
        -1,
        vec![None, None],
        None,
    ));
    instructions.register_quickening(add_id, "ADD$II");

    let mut b = Builder::new(instructions, BuilderConfig::default());
    b.begin_root().unwrap();
    b.emit_load_argument(0);
    b.emit_load_argument(1);
    b.begin_custom(OperationKind::CustomSimple, Arity::Fixed(2), false).unwrap();
    b.end_custom(add_id, Arity::Fixed(2)).unwrap();
    b.emit_return().unwrap();
    let program = b.end_root().unwrap();

    let mut registry = CustomInstructionRegistry::new();
    registry.register(Box::new(Add));

    Fixture {
        name: "quickened_add",
        program,
        registry,
        sample_args: vec![vec![Value::Int(19), Value::Int(23)]],
    }
}

/// Every demo fixture, in the order the CLI runs them.
pub fn all() -> Vec<Fixture> {
    vec![
        simple_return(),
        if_then_else(),
        finally_runs_on_all_exits(),
        try_catch_rethrow(),
        quickened_add(),
    ]
}

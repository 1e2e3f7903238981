//! Demonstration CLI: runs the fixture programs in `fixtures.rs` through
//! each opforge dispatch tier and prints the result.

mod fixtures;

use clap::{Parser, Subcommand};
use tracing::{debug, info, Level};
use tracing_subscriber::{fmt, EnvFilter};

use opforge_vm::dispatch::cached::{run_cached, CachedNodes};
use opforge_vm::dispatch::instrumented::{run_instrumented, InstructionObserver};
use opforge_vm::dispatch::uncached::run_uncached;
use opforge_vm::frame::Frame;
use opforge_vm::quicken::QuickenableProgram;

#[derive(Parser)]
#[command(name = "opforge")]
#[command(about = "Run opforge fixture programs under each dispatch tier")]
struct Cli {
    /// Increase logging verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run every fixture once per tier and print its result (default).
    Run {
        /// Only run the fixture with this name.
        name: Option<String>,
    },
    /// List the available fixtures.
    List,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let env_filter =
        EnvFilter::from_default_env().add_directive(format!("opforge={level}").parse().unwrap());
    fmt().with_env_filter(env_filter).with_target(false).init();

    match cli.command.unwrap_or(Command::Run { name: None }) {
        Command::Run { name } => run(name.as_deref()),
        Command::List => {
            for fixture in fixtures::all() {
                println!("{}", fixture.name);
            }
            Ok(())
        }
    }
}

struct PrintingObserver;
impl InstructionObserver for PrintingObserver {
    fn on_instruction(&self, bci: u32, kind: opforge_builder::InstructionKind) {
        debug!(bci, ?kind, "instrumented step");
    }
}

fn run(only: Option<&str>) -> anyhow::Result<()> {
    for fixture in fixtures::all() {
        if only.is_some_and(|n| n != fixture.name) {
            continue;
        }
        info!(fixture = fixture.name, "running");
        let quickenable = QuickenableProgram::new(fixture.program);
        let nodes = CachedNodes::new(quickenable.program().num_nodes);

        for args in &fixture.sample_args {
            let mut frame = Frame::new(quickenable.program().num_locals, args.clone());
            let uncached = run_uncached(&quickenable, &fixture.registry, &mut frame)?;
            println!("{:<28} uncached     args={args:?} -> {uncached:?}", fixture.name);

            let mut frame = Frame::new(quickenable.program().num_locals, args.clone());
            let cached = run_cached(&quickenable, &fixture.registry, &mut frame, &nodes)?;
            println!("{:<28} cached       args={args:?} -> {cached:?}", fixture.name);

            let mut frame = Frame::new(quickenable.program().num_locals, args.clone());
            let observer = PrintingObserver;
            let instrumented = run_instrumented(&quickenable, &fixture.registry, &mut frame, &observer)?;
            println!("{:<28} instrumented args={args:?} -> {instrumented:?}", fixture.name);
        }
    }
    Ok(())
}

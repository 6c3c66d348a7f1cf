#![warn(clippy::all, clippy::pedantic)]

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use dialoguer::{Input, Select};
use log::info;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};

use vecpipe::common::Address;
use vecpipe::config::{
    CacheConfig, MemoryConfig, PipelineConfig, SystemConfig, DEFAULT_CACHE_LINES,
    DEFAULT_MAX_CYCLES, DEFAULT_MEMORY_DELAY, DEFAULT_MEMORY_LINES,
};
use vecpipe::instruction::assembler::assemble_program;
use vecpipe::instruction::instruction::{Instruction, RawInstruction};
use vecpipe::pipeline::pipeline::{RunReport, SystemMessage};
use vecpipe::system::system::System;

#[derive(Parser, Debug)]
#[command(version, about = "Runs a program on the vecpipe simulator")]
struct RunnerArgs {
    /// Assembly source, or machine words with `--binary`
    program: PathBuf,
    #[arg(long, help = "Read the program as big-endian 32-bit words")]
    binary: bool,
    #[arg(
        long,
        default_value_t = 0,
        help = "Address to load and start the program at",
    )]
    start: Address,
    #[arg(
        long,
        help = "Run each instruction through all stages before fetching the next",
    )]
    no_pipeline: bool,
    #[arg(long, help = "Send every access straight to main memory")]
    no_cache: bool,
    #[arg(long, default_value_t = DEFAULT_CACHE_LINES)]
    cache_lines: usize,
    #[arg(long, default_value_t = DEFAULT_MEMORY_LINES)]
    memory_lines: usize,
    #[arg(
        long,
        default_value_t = DEFAULT_MEMORY_DELAY,
        help = "Memory wait states per access",
    )]
    delay: usize,
    #[arg(long, help = "Allocate cache lines on program stores")]
    write_allocate: bool,
    #[arg(long, default_value_t = DEFAULT_MAX_CYCLES)]
    max_cycles: usize,
    #[arg(long, short, help = "Step through the run with prompts")]
    interactive: bool,
    #[arg(long, default_value = "warn")]
    log_level: String,
}

impl From<&RunnerArgs> for SystemConfig {
    fn from(args: &RunnerArgs) -> Self {
        SystemConfig {
            memory: MemoryConfig {
                lines: args.memory_lines,
                delay: args.delay,
            },
            cache: CacheConfig {
                lines: args.cache_lines,
                write_allocate: args.write_allocate,
            },
            pipeline: PipelineConfig {
                use_pipeline: !args.no_pipeline,
                use_cache: !args.no_cache,
                max_cycles: args.max_cycles,
            },
            ..SystemConfig::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
enum Action {
    #[strum(serialize = "Advance clock")]
    AdvanceClock,
    #[strum(serialize = "Advance clock N cycles")]
    AdvanceMany,
    #[strum(serialize = "Run to completion")]
    RunToCompletion,
    #[strum(serialize = "Show registers")]
    ShowRegisters,
    #[strum(serialize = "Show cache")]
    ShowCache,
    #[strum(serialize = "Show memory")]
    ShowMemory,
    Quit,
}

fn read_program(args: &RunnerArgs) -> Result<Vec<RawInstruction>> {
    info!("Reading program {}", args.program.display());
    if args.binary {
        let bytes = std::fs::read(&args.program)?;
        if bytes.len() % 4 != 0 {
            bail!("Program length isn't an integer multiple of 32 bits");
        }
        Ok(bytes
            .chunks_exact(4)
            .map(|word| u32::from_be_bytes([word[0], word[1], word[2], word[3]]))
            .collect())
    } else {
        let source = std::fs::read_to_string(&args.program)?;
        Ok(assemble_program(&source)?
            .iter()
            .map(Instruction::encode)
            .collect())
    }
}

fn print_state(system: &System) {
    println!("{}", system.registers);
    for num in 0..system.vector_registers.count() {
        let slots = system.vector_registers.get(num);
        if slots.iter().any(Option::is_some) {
            let slots = slots
                .iter()
                .map(|slot| slot.map_or_else(|| String::from("_"), |val| val.to_string()))
                .collect::<Vec<_>>()
                .join(", ");
            println!("V{num:02}: [{slots}]");
        }
    }
}

fn print_report(system: &System, report: &RunReport) {
    print_state(system);
    println!("{}", system.cache);
    println!("{report}");
}

/// Advances up to `cycles` cycles, stopping early when the run ends
fn advance(system: &mut System, cycles: usize) -> Result<()> {
    for _ in 0..cycles {
        if system.clock() >= system.config.pipeline.max_cycles {
            bail!(
                "Program did not halt within {} cycles",
                system.config.pipeline.max_cycles
            );
        }
        match system.step()? {
            SystemMessage::Running => {}
            SystemMessage::Halt => {
                print_report(system, &system.pipeline.report());
                return Ok(());
            }
            SystemMessage::Idle => {
                println!("Program is not running");
                return Ok(());
            }
        }
    }
    print!("{}", system.pipeline);
    Ok(())
}

fn interact(system: &mut System, args: &RunnerArgs) -> Result<()> {
    system.start(args.start, !args.no_pipeline, None);
    let actions: Vec<Action> = Action::iter().collect();

    loop {
        let choice = Select::new()
            .with_prompt(format!("Cycle {}", system.clock()))
            .items(&actions)
            .default(0)
            .interact()?;
        match actions[choice] {
            Action::AdvanceClock => advance(system, 1)?,
            Action::AdvanceMany => {
                let cycles: usize = Input::new().with_prompt("Cycles").interact_text()?;
                advance(system, cycles)?;
            }
            Action::RunToCompletion => advance(system, usize::MAX)?,
            Action::ShowRegisters => print_state(system),
            Action::ShowCache => println!("{}", system.cache),
            Action::ShowMemory => {
                let start: Address = Input::new().with_prompt("Start address").interact_text()?;
                let count: usize = Input::new()
                    .with_prompt("Words")
                    .default(16)
                    .interact_text()?;
                for address in start..start.saturating_add(count) {
                    println!("{address:>8}: {}", system.peek(address));
                }
            }
            Action::Quit => return Ok(()),
        }
    }
}

fn run(args: &RunnerArgs) -> Result<()> {
    let mut system = System::new(args.into())?;
    let program = read_program(args)?;
    let loaded = system.load_program(args.start, &program)?;
    println!("Loaded {loaded} words at address {}", args.start);

    if args.interactive {
        return interact(&mut system, args);
    }

    let report = system
        .run_to_completion(args.start)
        .with_context(|| format!("Run failed at cycle {}", system.clock()))?;
    print_report(&system, &report);

    Ok(())
}

fn main() -> Result<()> {
    let args = RunnerArgs::parse();
    let _logger = flexi_logger::Logger::try_with_str(&args.log_level)?.start()?;

    run(&args)
}

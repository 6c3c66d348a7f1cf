#![warn(clippy::all, clippy::pedantic)]

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use vecpipe::instruction::assembler::{assemble_program, strip};
use vecpipe::instruction::instruction::{Instruction, HALT};

const DEFAULT_OUTPUT_PATH: &str = "a";

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Assembles a vecpipe program into big-endian machine words",
)]
struct AssemblerArgs {
    input_file: PathBuf,
    #[arg(long, short, help = "Path to store the output file")]
    output_path: Option<PathBuf>,
    #[arg(long, short, help = "Verbose output")]
    verbose: bool,
}

#[derive(Debug)]
struct AssemblerOptions {
    input_path: PathBuf,
    output_path: Option<PathBuf>,
    verbose: bool,
}

impl From<AssemblerArgs> for AssemblerOptions {
    fn from(value: AssemblerArgs) -> Self {
        AssemblerOptions {
            input_path: value.input_file,
            output_path: value.output_path,
            verbose: value.verbose,
        }
    }
}

fn read_input(opts: &AssemblerOptions) -> Result<String> {
    let path = opts.input_path.canonicalize()?;
    if opts.verbose {
        println!("Reading in file: {}", path.display());
    }
    let data = std::fs::read_to_string(path)?;
    Ok(data)
}

fn write_program(instrs: &[Instruction], opts: &AssemblerOptions) -> Result<()> {
    let output_path: PathBuf = if let Some(ref path) = opts.output_path {
        path.into()
    } else {
        DEFAULT_OUTPUT_PATH.into()
    };

    if opts.verbose {
        println!("Writing to path {}", output_path.display());
    }

    let mut words: Vec<u32> = instrs.iter().map(Instruction::encode).collect();
    if words.last() != Some(&HALT) {
        if opts.verbose {
            println!("Appending HALT");
        }
        words.push(HALT);
    }
    let bin_reps: Vec<u8> = words.iter().flat_map(|word| word.to_be_bytes()).collect();

    std::fs::write(output_path, bin_reps)?;

    Ok(())
}

/// Reads in the contents of the file specified in `opts`, assembles the instructions
/// specified within, and writes it to the file specified in `opts`
fn assemble(opts: &AssemblerOptions) -> Result<()> {
    let file_conts = read_input(opts)?;
    if opts.verbose {
        for (line_num, line) in strip(&file_conts) {
            println!("Line {line_num}: Retaining: {line}");
        }
    }

    let instructions = assemble_program(&file_conts)?;
    if opts.verbose {
        for (address, instr) in instructions.iter().enumerate() {
            println!("{address:>5}: 0x{:08X}  {instr}", instr.encode());
        }
    }
    write_program(&instructions, opts)?;

    Ok(())
}

fn main() {
    let args = AssemblerArgs::parse();
    let opts: AssemblerOptions = args.into();

    if let Err(e) = assemble(&opts) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

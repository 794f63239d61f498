// File: src/main.rs
//
// Main entry point for the Quill interpreter.
// One optional positional argument: a script path to run. With no argument,
// an interactive REPL starts. Exit codes follow the sysexits convention:
// 64 usage, 65 compile error, 70 runtime error, 74 unreadable input file.

mod bytecode;
mod compiler;
mod debug;
mod errors;
mod lexer;
mod memory;
mod object;
mod repl;
mod table;
mod value;
mod vm;

use clap::error::ErrorKind;
use clap::Parser as ClapParser;
use std::fs;
use std::path::PathBuf;

use vm::{Vm, VmOptions};

#[derive(ClapParser)]
#[command(
    name = "quill",
    about = "Quill: a small class-based scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    /// Path to the script to run; starts a REPL when omitted
    script: Option<PathBuf>,

    /// Disassemble each function after it compiles
    #[arg(long)]
    disassemble: bool,

    /// Trace the stack and each instruction while executing
    #[arg(long)]
    trace: bool,

    /// Collect garbage at every allocation (for debugging the collector)
    #[arg(long)]
    gc_stress: bool,

    /// Log garbage collection cycles
    #[arg(long)]
    gc_log: bool,
}

impl Cli {
    fn vm_options(&self) -> VmOptions {
        VmOptions {
            trace: self.trace || std::env::var("QUILL_TRACE").is_ok(),
            disassemble: self.disassemble || std::env::var("QUILL_DISASSEMBLE").is_ok(),
            gc_stress: self.gc_stress || std::env::var("QUILL_GC_STRESS").is_ok(),
            gc_log: self.gc_log || std::env::var("QUILL_GC_LOG").is_ok(),
        }
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error)
            if matches!(error.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) =>
        {
            let _ = error.print();
            std::process::exit(0);
        }
        Err(error) => {
            let _ = error.print();
            std::process::exit(64);
        }
    };

    let options = cli.vm_options();
    match cli.script {
        Some(path) => run_file(&path, options),
        None => match repl::Repl::new(options) {
            Ok(mut repl) => {
                if let Err(error) = repl.run() {
                    eprintln!("REPL error: {}", error);
                    std::process::exit(70);
                }
            }
            Err(error) => {
                eprintln!("Failed to start REPL: {}", error);
                std::process::exit(70);
            }
        },
    }
}

fn run_file(path: &PathBuf, options: VmOptions) -> ! {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(_) => {
            eprintln!("Could not open file \"{}\".", path.display());
            std::process::exit(74);
        }
    };

    let mut vm = Vm::new(options);
    match vm.interpret(&source) {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            eprintln!("{}", error);
            std::process::exit(error.exit_code());
        }
    }
}

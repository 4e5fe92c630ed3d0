// nux.rs - NUX bytecode runner

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;

use clap::Parser;

use nuxvm::vm::VM;

#[derive(Debug, Parser)]
#[command(name = "nux")]
#[command(about = "Run a NUX bytecode program", version)]
struct Args {
    /// Bytecode program to run
    program: PathBuf,

    /// Show the execution trace (PC and stack per instruction)
    #[arg(long)]
    trace: bool,

    /// Step through the program interactively
    #[arg(long)]
    debug: bool,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let program = match fs::read(&args.program) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("Error reading file: {}", err);
            process::exit(1);
        }
    };

    let mut machine = VM::new(&program);

    if args.debug {
        run_debug(&mut machine);
    } else if args.trace {
        run_trace(&mut machine);
    } else if let Err(err) = machine.run() {
        eprintln!("---Runtime error---");
        eprintln!("Error: {}", err);
        eprintln!("{}", machine.debug_info());
        process::exit(1);
    }
}

fn run_debug(machine: &mut VM) {
    println!("=== NUX Debugger ===");
    println!("Press Enter to step, 'q' to quit, 'c' to continue");
    println!();

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        println!("PC: {}, Stack: {:?}", machine.pc(), machine.stack());
        print!("> ");
        let _ = io::stdout().flush();

        let input = match lines.next() {
            Some(Ok(line)) => line.trim().to_string(),
            _ => break,
        };

        if input == "q" {
            break;
        }

        if input == "c" {
            if let Err(err) = machine.run() {
                eprintln!("Error: {}", err);
            }
            break;
        }

        match machine.step() {
            Ok(true) => {}
            Ok(false) => {
                println!("Program halted");
                break;
            }
            Err(err) => {
                eprintln!("Error: {}", err);
                break;
            }
        }
    }

    println!();
    println!("Final stack: {:?}", machine.stack());
}

fn run_trace(machine: &mut VM) {
    println!("=== Execution Trace ===");
    println!();

    loop {
        println!("PC={} Stack={:?}", machine.pc(), machine.stack());

        match machine.step() {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                eprintln!("Error: {}", err);
                process::exit(1);
            }
        }
    }

    println!();
    println!("Final stack: {:?}", machine.stack());
}

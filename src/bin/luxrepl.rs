// luxrepl.rs - interactive LUX REPL

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use nuxvm::repl::{parse_command, Command, EvalError, EvalOutcome, Repl};

#[derive(Debug, Parser)]
#[command(name = "luxrepl")]
#[command(about = "Interactive LUX session", version)]
struct Args {
    /// LUX source files to evaluate before the prompt appears
    files: Vec<PathBuf>,
}

fn main() -> rustyline::Result<()> {
    env_logger::init();
    let args = Args::parse();

    print_banner();

    let mut repl = Repl::new();

    for path in &args.files {
        match fs::read_to_string(path) {
            Ok(contents) => {
                load_source(&mut repl, &contents);
                println!("Loaded: {}", path.display());
            }
            Err(err) => eprintln!("Error loading {}: {}", path.display(), err),
        }
    }

    let mut rl = DefaultEditor::new()?;
    let history_file = dirs::home_dir().map(|mut p| {
        p.push(".luxrepl_history");
        p
    });

    if let Some(ref path) = history_file {
        let _ = rl.load_history(path);
    }

    loop {
        let readline = rl.readline("lux> ");

        match readline {
            Ok(line) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(input);

                if let Some(command) = parse_command(input) {
                    if handle_command(&mut repl, command) {
                        break;
                    }
                    continue;
                }

                evaluate(&mut repl, input);
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    if let Some(ref path) = history_file {
        let _ = rl.save_history(path);
    }

    Ok(())
}

fn load_source(repl: &mut Repl, contents: &str) {
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Err(err) = repl.eval(line) {
            eprintln!("Error: {}", err);
        }
    }
}

fn evaluate(repl: &mut Repl, line: &str) {
    match repl.eval(line) {
        Ok(EvalOutcome::Defined(name)) => {
            println!("Defined word '{}'", name);
        }
        Ok(EvalOutcome::Ran { stack, output }) => {
            let _ = io::stdout().write_all(&output);
            let _ = io::stdout().flush();
            print_stack(&stack);
        }
        Err(EvalError::Runtime { error, output }) => {
            let _ = io::stdout().write_all(&output);
            let _ = io::stdout().flush();
            println!("Runtime error: {}", error);
        }
        Err(err) => println!("{}", err),
    }
}

/// Returns true when the session should end.
fn handle_command(repl: &mut Repl, command: Command) -> bool {
    match command {
        Command::Exit => {
            println!("Goodbye!");
            return true;
        }
        Command::Help => print_help(),
        Command::Clear => {
            repl.clear();
            println!("History cleared");
        }
        Command::ClearStack => {
            repl.clear_stack();
            println!("Stack cleared");
        }
        Command::Stack => print_stack(repl.stack()),
        Command::Drop => {
            if repl.drop_top().is_some() {
                print_stack(repl.stack());
            } else {
                println!("Stack is empty");
            }
        }
        Command::Words => {
            if repl.definitions().is_empty() {
                println!("No words defined");
            } else {
                println!("Defined words: {}", repl.definitions().join(", "));
            }
        }
        Command::History => {
            if repl.history().is_empty() {
                println!("No history");
            } else {
                print!("{}", repl.history());
            }
        }
    }
    false
}

fn print_stack(stack: &[i32]) {
    println!("  Stack: {:?}", stack);
}

fn print_banner() {
    println!("LUX REPL");
    println!("Stack-based language on the NUX virtual machine");
    println!();
    println!("Type 'help' for commands, 'exit' to quit");
    println!();
}

fn print_help() {
    println!();
    println!("Commands:");
    println!("  help, ?          - Show this help");
    println!("  exit, quit, q    - Exit REPL");
    println!("  clear, reset     - Clear word definitions");
    println!("  clearstack, cs   - Clear the stack");
    println!("  stack, .s        - Show current stack");
    println!("  drop             - Drop top stack value");
    println!("  words            - List defined words");
    println!("  history          - Show definition history");
    println!();
    println!("Examples:");
    println!("  5 10 +           - Arithmetic on the stack");
    println!("  42 .             - Print top of stack as a number");
    println!("  72 emit          - Print top of stack as a character");
    println!("  @square dup * ;  - Define a word");
    println!("  5 square         - Use it");
    println!("  5 [ 0 > ] [ DUP 1 - ] |:   - Count down with a loop");
    println!();
}

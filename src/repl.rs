// repl.rs - LUX REPL evaluator
//
// The evaluator is UI-free: it owns the accumulated definition history and
// the saved data stack, and recompiles the whole session for every input
// line. The luxrepl binary renders prompts and command output around it.

use std::fmt;

use crate::compiler::{self, CompileError};
use crate::vm::{VmError, VM};

// ============================================================================
// COMMANDS
// ============================================================================

/// Session commands, matched case-sensitively, one per line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Help,
    Exit,
    Clear,
    ClearStack,
    Stack,
    Drop,
    Words,
    History,
}

/// Recognizes a REPL command line. Anything else is LUX source.
pub fn parse_command(line: &str) -> Option<Command> {
    match line {
        "help" | "?" => Some(Command::Help),
        "exit" | "quit" | "q" => Some(Command::Exit),
        "clear" | "reset" => Some(Command::Clear),
        "clearstack" | "cs" => Some(Command::ClearStack),
        "stack" | ".s" => Some(Command::Stack),
        "drop" => Some(Command::Drop),
        "words" => Some(Command::Words),
        "history" => Some(Command::History),
        _ => None,
    }
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug)]
pub enum EvalError {
    /// A `@...` line without the closing `;`.
    DefinitionMissingSemicolon,
    Compile(CompileError),
    /// The program trapped. Output written before the trap is preserved so
    /// the caller can still show it.
    Runtime { error: VmError, output: Vec<u8> },
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EvalError::DefinitionMissingSemicolon => {
                write!(f, "word definition must end with ';'")
            }
            EvalError::Compile(err) => write!(f, "compile error: {}", err),
            EvalError::Runtime { error, .. } => write!(f, "runtime error: {}", error),
        }
    }
}

impl std::error::Error for EvalError {}

// ============================================================================
// EVALUATOR
// ============================================================================

/// Result of evaluating one input line.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalOutcome {
    /// The line defined a word; nothing ran.
    Defined(String),
    /// The line ran; the saved stack was replaced and OUT produced `output`.
    Ran { stack: Vec<i32>, output: Vec<u8> },
}

#[derive(Debug, Default)]
pub struct Repl {
    history: String,
    stack: Vec<i32>,
    definitions: Vec<String>,
}

impl Repl {
    pub fn new() -> Self {
        Repl::default()
    }

    pub fn stack(&self) -> &[i32] {
        &self.stack
    }

    pub fn definitions(&self) -> &[String] {
        &self.definitions
    }

    pub fn history(&self) -> &str {
        &self.history
    }

    /// Clears the definition history and the word list.
    pub fn clear(&mut self) {
        self.history.clear();
        self.definitions.clear();
    }

    pub fn clear_stack(&mut self) {
        self.stack.clear();
    }

    /// Drops the top saved stack value, returning it if there was one.
    pub fn drop_top(&mut self) -> Option<i32> {
        self.stack.pop()
    }

    /// Evaluates one non-command line. Definitions accumulate; anything else
    /// is compiled together with the history and the pushes that rebuild the
    /// saved stack, then run on a fresh VM. Errors leave the session state
    /// exactly as it was.
    pub fn eval(&mut self, line: &str) -> Result<EvalOutcome, EvalError> {
        let line = line.trim();

        if let Some(rest) = line.strip_prefix('@') {
            if !line.contains(';') {
                return Err(EvalError::DefinitionMissingSemicolon);
            }
            self.history.push_str(line);
            self.history.push('\n');

            let name = rest.split_whitespace().next().unwrap_or("").to_string();
            if !name.is_empty() {
                self.definitions.push(name.clone());
            }
            return Ok(EvalOutcome::Defined(name));
        }

        let mut source = self.history.clone();
        for value in &self.stack {
            source.push_str(&value.to_string());
            source.push(' ');
        }
        source.push_str(line);

        let bytecode = compiler::compile(&source).map_err(EvalError::Compile)?;

        let mut vm = VM::new(&bytecode);
        vm.capture_output();
        if let Err(error) = vm.run() {
            let output = vm.captured_output().unwrap_or_default().to_vec();
            return Err(EvalError::Runtime { error, output });
        }

        self.stack = vm.stack().to_vec();
        let output = vm.captured_output().unwrap_or_default().to_vec();
        Ok(EvalOutcome::Ran {
            stack: self.stack.clone(),
            output,
        })
    }
}

// vm.rs - NUX stack-based virtual machine

use std::fmt;
use std::io::{self, Write};

use crate::opcodes::*;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Maximum number of elements on the data stack.
pub const MAX_STACK_SIZE: usize = 8192;

/// Maximum number of elements on the return stack.
pub const MAX_RETURN_STACK_SIZE: usize = 1024;

/// Size of the reserved memory region used by the compiler for combinator
/// scratch storage (quotation addresses, loop counters).
pub const RESERVED_MEMORY_SIZE: u32 = 4096;

/// User programs load and start here, right after reserved memory.
pub const USER_MEMORY_OFFSET: u32 = RESERVED_MEMORY_SIZE;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// A runtime trap. Carries the address of the faulting instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct VmError {
    pub pc: u32,
    pub kind: VmErrorKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VmErrorKind {
    StackUnderflow { op: &'static str },
    StackOverflow,
    ReturnStackOverflow,
    ReturnStackUnderflow,
    DivisionByZero,
    ModulusByZero,
    InvalidCallTarget(i32),
    LoadOutOfBounds(u32),
    StoreOutOfBounds(u32),
    OperandOutOfBounds { op: &'static str },
    PcOutOfBounds,
    UnknownOpcode(u8),
    Io(String),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "error at PC={}: {}", self.pc, self.kind)
    }
}

impl fmt::Display for VmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VmErrorKind::StackUnderflow { op } => {
                write!(f, "stack underflow in {}", op)
            }
            VmErrorKind::StackOverflow => {
                write!(f, "stack overflow: max size {} reached", MAX_STACK_SIZE)
            }
            VmErrorKind::ReturnStackOverflow => write!(f, "return stack overflow"),
            VmErrorKind::ReturnStackUnderflow => write!(f, "return stack underflow"),
            VmErrorKind::DivisionByZero => write!(f, "division by zero"),
            VmErrorKind::ModulusByZero => write!(f, "modulus by zero"),
            VmErrorKind::InvalidCallTarget(addr) => {
                write!(f, "callstack target {} out of bounds", addr)
            }
            VmErrorKind::LoadOutOfBounds(addr) => {
                write!(f, "load address out of bounds: {}", addr)
            }
            VmErrorKind::StoreOutOfBounds(addr) => {
                write!(f, "store address out of bounds: {}", addr)
            }
            VmErrorKind::OperandOutOfBounds { op } => {
                write!(f, "{}: not enough bytes for operand", op)
            }
            VmErrorKind::PcOutOfBounds => write!(f, "program counter out of bounds"),
            VmErrorKind::UnknownOpcode(op) => write!(f, "unknown opcode 0x{:02X}", op),
            VmErrorKind::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for VmError {}

// ============================================================================
// STACK IMPLEMENTATIONS
// ============================================================================

/// Bounded data stack of 32-bit signed integers.
#[derive(Debug, Clone, Default)]
pub struct Stack {
    data: Vec<i32>,
}

impl Stack {
    pub fn new() -> Self {
        Stack {
            data: Vec::with_capacity(256),
        }
    }

    pub fn push(&mut self, value: i32) -> Result<(), VmErrorKind> {
        if self.data.len() >= MAX_STACK_SIZE {
            return Err(VmErrorKind::StackOverflow);
        }
        self.data.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<i32> {
        self.data.pop()
    }

    pub fn peek(&self) -> Option<i32> {
        self.data.last().copied()
    }

    pub fn depth(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.data
    }
}

/// Bounded return stack, touched only by CALL, CALLSTACK and RET.
#[derive(Debug, Clone, Default)]
pub struct ReturnStack {
    data: Vec<i32>,
}

impl ReturnStack {
    pub fn new() -> Self {
        ReturnStack {
            data: Vec::with_capacity(64),
        }
    }

    pub fn push(&mut self, value: i32) -> Result<(), VmErrorKind> {
        if self.data.len() >= MAX_RETURN_STACK_SIZE {
            return Err(VmErrorKind::ReturnStackOverflow);
        }
        self.data.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<i32> {
        self.data.pop()
    }

    pub fn depth(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.data
    }
}

// ============================================================================
// OUTPUT SINK
// ============================================================================

/// Where OUT writes. Captured mode exists so tests and the REPL can observe
/// program output without touching the process stdout.
#[derive(Debug)]
enum Output {
    Stdout,
    Captured(Vec<u8>),
}

// ============================================================================
// VIRTUAL MACHINE
// ============================================================================

/// The NUX virtual machine. Memory is a flat byte array: a reserved region
/// for compiler scratch followed by the loaded program, where the PC starts.
pub struct VM {
    stack: Stack,
    return_stack: ReturnStack,
    memory: Vec<u8>,
    pc: u32,
    running: bool,
    reserved_memory_size: u32,
    user_memory_start: u32,
    output: Output,
}

impl VM {
    /// Creates a VM with the default reserved region and the program loaded
    /// at `USER_MEMORY_OFFSET`.
    pub fn new(program: &[u8]) -> Self {
        Self::with_reserved_memory(program, RESERVED_MEMORY_SIZE)
    }

    /// Creates a VM with a custom reserved-memory size.
    pub fn with_reserved_memory(program: &[u8], reserved_size: u32) -> Self {
        let mut memory = vec![0u8; reserved_size as usize + program.len()];
        memory[reserved_size as usize..].copy_from_slice(program);

        VM {
            stack: Stack::new(),
            return_stack: ReturnStack::new(),
            memory,
            pc: reserved_size,
            running: true,
            reserved_memory_size: reserved_size,
            user_memory_start: reserved_size,
            output: Output::Stdout,
        }
    }

    /// Redirects OUT into an internal buffer readable via `captured_output`.
    pub fn capture_output(&mut self) {
        self.output = Output::Captured(Vec::new());
    }

    /// The bytes written by OUT so far, if output capture is enabled.
    pub fn captured_output(&self) -> Option<&[u8]> {
        match &self.output {
            Output::Stdout => None,
            Output::Captured(buf) => Some(buf),
        }
    }

    pub fn stack(&self) -> &[i32] {
        self.stack.as_slice()
    }

    pub fn return_stack(&self) -> &[i32] {
        self.return_stack.as_slice()
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn user_memory_start(&self) -> u32 {
        self.user_memory_start
    }

    pub fn reserved_memory_size(&self) -> u32 {
        self.reserved_memory_size
    }

    pub fn memory_len(&self) -> usize {
        self.memory.len()
    }

    /// Writes into the reserved region, bounds-checked.
    pub fn write_reserved_memory(&mut self, offset: u32, data: &[u8]) -> Result<(), String> {
        if offset >= self.reserved_memory_size {
            return Err(format!(
                "reserved memory offset {} out of bounds (max {})",
                offset, self.reserved_memory_size
            ));
        }
        if offset as usize + data.len() > self.reserved_memory_size as usize {
            return Err(format!(
                "reserved memory write would overflow (offset {} + size {} > {})",
                offset,
                data.len(),
                self.reserved_memory_size
            ));
        }
        self.memory[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Reads from the reserved region, bounds-checked.
    pub fn read_reserved_memory(&self, offset: u32, size: u32) -> Result<&[u8], String> {
        if offset >= self.reserved_memory_size {
            return Err(format!(
                "reserved memory offset {} out of bounds (max {})",
                offset, self.reserved_memory_size
            ));
        }
        if offset + size > self.reserved_memory_size {
            return Err(format!(
                "reserved memory read would overflow (offset {} + size {} > {})",
                offset, size, self.reserved_memory_size
            ));
        }
        Ok(&self.memory[offset as usize..(offset + size) as usize])
    }

    fn trap(&self, pc: u32, kind: VmErrorKind) -> VmError {
        VmError { pc, kind }
    }

    /// Reads the 4-byte big-endian operand at the current PC without
    /// advancing.
    fn read_operand(&self, op: &'static str) -> Result<i32, VmErrorKind> {
        let pc = self.pc as usize;
        if pc + 4 > self.memory.len() {
            return Err(VmErrorKind::OperandOutOfBounds { op });
        }
        let bytes: [u8; 4] = self.memory[pc..pc + 4]
            .try_into()
            .map_err(|_| VmErrorKind::OperandOutOfBounds { op })?;
        Ok(i32::from_be_bytes(bytes))
    }

    fn pop(&mut self, op: &'static str) -> Result<i32, VmErrorKind> {
        self.stack.pop().ok_or(VmErrorKind::StackUnderflow { op })
    }

    fn pop2(&mut self, op: &'static str) -> Result<(i32, i32), VmErrorKind> {
        if self.stack.depth() < 2 {
            return Err(VmErrorKind::StackUnderflow { op });
        }
        let b = self.pop(op)?;
        let a = self.pop(op)?;
        Ok((a, b))
    }

    fn binary_op(
        &mut self,
        op: &'static str,
        f: impl FnOnce(i32, i32) -> Result<i32, VmErrorKind>,
    ) -> Result<(), VmErrorKind> {
        let (a, b) = self.pop2(op)?;
        self.stack.push(f(a, b)?)
    }

    fn unary_op(
        &mut self,
        op: &'static str,
        f: impl FnOnce(i32) -> i32,
    ) -> Result<(), VmErrorKind> {
        let value = self.pop(op)?;
        self.stack.push(f(value))
    }

    fn write_out(&mut self, format: i32, value: i32) -> Result<(), VmErrorKind> {
        let bytes = if format == 1 {
            vec![value as u8]
        } else {
            value.to_string().into_bytes()
        };
        match &mut self.output {
            Output::Stdout => {
                let mut stdout = io::stdout();
                stdout
                    .write_all(&bytes)
                    .and_then(|_| stdout.flush())
                    .map_err(|e| VmErrorKind::Io(e.to_string()))
            }
            Output::Captured(buf) => {
                buf.extend_from_slice(&bytes);
                Ok(())
            }
        }
    }

    /// Fetches, decodes and executes a single instruction.
    pub fn execute_instruction(&mut self) -> Result<(), VmError> {
        let current_pc = self.pc;
        if self.pc as usize >= self.memory.len() {
            self.running = false;
            return Err(self.trap(current_pc, VmErrorKind::PcOutOfBounds));
        }
        let opcode = self.memory[self.pc as usize];
        self.pc += 1;

        log::trace!(
            "PC={} op={} stack={:?} rstack={:?}",
            current_pc,
            opcode_name(opcode),
            self.stack.as_slice(),
            self.return_stack.as_slice()
        );

        match self.dispatch(opcode) {
            Ok(()) => Ok(()),
            Err(kind) => {
                // A trap halts the machine; nothing runs past it.
                self.running = false;
                Err(self.trap(current_pc, kind))
            }
        }
    }

    fn dispatch(&mut self, opcode: u8) -> Result<(), VmErrorKind> {
        match opcode {
            OP_PUSH => {
                let value = self.read_operand("PUSH")?;
                self.stack.push(value)?;
                self.pc += 4;
            }
            OP_POP => {
                self.pop("POP")?;
            }
            OP_DUP => {
                let value = self
                    .stack
                    .peek()
                    .ok_or(VmErrorKind::StackUnderflow { op: "DUP" })?;
                self.stack.push(value)?;
            }
            OP_SWAP => {
                let (a, b) = self.pop2("SWAP")?;
                self.stack.push(b)?;
                self.stack.push(a)?;
            }
            OP_ROLL => {
                // Copies the second-from-top to the top: [a b] -> [a b a].
                let (a, b) = self.pop2("ROLL")?;
                self.stack.push(a)?;
                self.stack.push(b)?;
                self.stack.push(a)?;
            }
            OP_ROT => {
                if self.stack.depth() < 3 {
                    return Err(VmErrorKind::StackUnderflow { op: "ROT" });
                }
                let c = self.pop("ROT")?;
                let b = self.pop("ROT")?;
                let a = self.pop("ROT")?;
                self.stack.push(b)?;
                self.stack.push(c)?;
                self.stack.push(a)?;
            }
            OP_ADD => self.binary_op("ADD", |a, b| Ok(a.wrapping_add(b)))?,
            OP_SUB => self.binary_op("SUB", |a, b| Ok(a.wrapping_sub(b)))?,
            OP_MUL => self.binary_op("MUL", |a, b| Ok(a.wrapping_mul(b)))?,
            OP_DIV => self.binary_op("DIV", |a, b| {
                if b == 0 {
                    Err(VmErrorKind::DivisionByZero)
                } else {
                    Ok(a.wrapping_div(b))
                }
            })?,
            OP_MOD => self.binary_op("MOD", |a, b| {
                if b == 0 {
                    Err(VmErrorKind::ModulusByZero)
                } else {
                    Ok(a.wrapping_rem(b))
                }
            })?,
            OP_INC => self.unary_op("INC", |v| v.wrapping_add(1))?,
            OP_DEC => self.unary_op("DEC", |v| v.wrapping_sub(1))?,
            OP_NEG => self.unary_op("NEG", |v| v.wrapping_neg())?,
            OP_AND => self.binary_op("AND", |a, b| Ok(a & b))?,
            OP_OR => self.binary_op("OR", |a, b| Ok(a | b))?,
            OP_XOR => self.binary_op("XOR", |a, b| Ok(a ^ b))?,
            OP_NOT => self.unary_op("NOT", |v| !v)?,
            OP_SHL => self.binary_op("SHL", |a, b| {
                Ok(a.wrapping_shl(b.rem_euclid(32) as u32))
            })?,
            OP_EQ => self.binary_op("EQ", |a, b| Ok((a == b) as i32))?,
            OP_LT => self.binary_op("LT", |a, b| Ok((a < b) as i32))?,
            OP_GT => self.binary_op("GT", |a, b| Ok((a > b) as i32))?,
            OP_CALLSTACK => {
                if self.return_stack.depth() >= MAX_RETURN_STACK_SIZE {
                    return Err(VmErrorKind::ReturnStackOverflow);
                }
                let addr = self.pop("CALLSTACK")?;
                if addr < self.user_memory_start as i32 || addr as usize >= self.memory.len() {
                    return Err(VmErrorKind::InvalidCallTarget(addr));
                }
                self.return_stack.push(self.pc as i32)?;
                self.pc = addr as u32;
            }
            OP_JMP => {
                let addr = self.read_operand("JMP")?;
                self.pc = addr as u32;
            }
            OP_JZ => {
                let addr = self.read_operand("JZ")?;
                let cond = self.pop("JZ")?;
                if cond == 0 {
                    self.pc = addr as u32;
                } else {
                    self.pc += 4;
                }
            }
            OP_JNZ => {
                let addr = self.read_operand("JNZ")?;
                let cond = self.pop("JNZ")?;
                if cond != 0 {
                    self.pc = addr as u32;
                } else {
                    self.pc += 4;
                }
            }
            OP_CALL => {
                let addr = self.read_operand("CALL")?;
                self.return_stack.push(self.pc as i32 + 4)?;
                self.pc = addr as u32;
            }
            OP_RET => {
                let addr = self
                    .return_stack
                    .pop()
                    .ok_or(VmErrorKind::ReturnStackUnderflow)?;
                self.pc = addr as u32;
            }
            OP_LOAD => {
                let addr = self.read_operand("LOAD")? as u32;
                if addr as usize + 4 > self.memory.len() {
                    return Err(VmErrorKind::LoadOutOfBounds(addr));
                }
                let bytes: [u8; 4] = self.memory[addr as usize..addr as usize + 4]
                    .try_into()
                    .map_err(|_| VmErrorKind::LoadOutOfBounds(addr))?;
                self.stack.push(i32::from_be_bytes(bytes))?;
                self.pc += 4;
            }
            OP_STORE => {
                let value = self.pop("STORE")?;
                let addr = self.read_operand("STORE")? as u32;
                if addr as usize + 4 > self.memory.len() {
                    return Err(VmErrorKind::StoreOutOfBounds(addr));
                }
                self.memory[addr as usize..addr as usize + 4]
                    .copy_from_slice(&value.to_be_bytes());
                self.pc += 4;
            }
            OP_OUT => {
                if self.stack.depth() < 2 {
                    return Err(VmErrorKind::StackUnderflow { op: "OUT" });
                }
                let format = self.pop("OUT")?;
                let value = self.pop("OUT")?;
                self.write_out(format, value)?;
            }
            OP_HALT => {
                self.running = false;
            }
            _ => return Err(VmErrorKind::UnknownOpcode(opcode)),
        }
        Ok(())
    }

    /// Runs until HALT, a trap, or the PC walking off the end of memory.
    pub fn run(&mut self) -> Result<(), VmError> {
        while self.running && (self.pc as usize) < self.memory.len() {
            self.execute_instruction()?;
        }
        Ok(())
    }

    /// Executes one instruction. Returns whether execution can continue.
    /// A halted VM steps as a no-op.
    pub fn step(&mut self) -> Result<bool, VmError> {
        if !self.running || self.pc as usize >= self.memory.len() {
            return Ok(false);
        }
        self.execute_instruction()?;
        Ok(self.running && (self.pc as usize) < self.memory.len())
    }

    /// Detailed state dump for runtime-error reporting.
    pub fn debug_info(&self) -> String {
        let mut info = format!(
            "PC: {} (0x{:X})\n",
            self.pc.saturating_sub(self.user_memory_start),
            self.pc
        );
        info += &format!("Stack: {:?}\n", self.stack.as_slice());
        info += &format!("Return Stack: {:?}\n", self.return_stack.as_slice());
        info += &format!("Stack Depth: {}/{}\n", self.stack.depth(), MAX_STACK_SIZE);
        info += &format!(
            "Return Stack Depth: {}/{}\n",
            self.return_stack.depth(),
            MAX_RETURN_STACK_SIZE
        );
        info += &format!(
            "Reserved Memory: 0x0-0x{:X} ({} bytes)\n",
            self.reserved_memory_size, self.reserved_memory_size
        );
        info += &format!(
            "User Memory: 0x{:X}-0x{:X}\n",
            self.user_memory_start,
            self.memory.len()
        );

        if (self.pc as usize) < self.memory.len() {
            let current = self.memory[self.pc as usize];
            info += &format!(
                "\nCurrent Instruction: {} (0x{:02X})\n",
                opcode_name(current),
                current
            );

            let start = (self.pc as usize).saturating_sub(5);
            let end = (self.pc as usize + 10).min(self.memory.len());
            info += "\nBytecode around PC:\n";
            for i in start..end {
                let marker = if i == self.pc as usize { ">" } else { " " };
                let opcode = self.memory[i];
                info += &format!(
                    "{} {:04}: 0x{:02X}  {}\n",
                    marker,
                    i,
                    opcode,
                    opcode_name(opcode)
                );
            }
        }

        info
    }
}

// opcodes.rs - NUX bytecode instruction set

/// VM-space address of an instruction or data cell.
pub type Address = i32;

// ============================================================================
// OPCODES
// ============================================================================
// 32 opcodes, 0x00-0x1F. PUSH, JMP, JZ, JNZ, CALL, LOAD and STORE carry a
// 4-byte big-endian signed operand; everything else is a single byte.

pub const OP_PUSH: u8 = 0x00;
pub const OP_POP: u8 = 0x01;
pub const OP_DUP: u8 = 0x02;
pub const OP_SWAP: u8 = 0x03;
/// Copies the second-from-top value to the top (Forth's OVER). The name is
/// historical and kept for bytecode compatibility.
pub const OP_ROLL: u8 = 0x04;
/// Rotates the top three values: [a b c] -> [b c a].
pub const OP_ROT: u8 = 0x05;
pub const OP_ADD: u8 = 0x06;
pub const OP_SUB: u8 = 0x07;
pub const OP_MUL: u8 = 0x08;
pub const OP_DIV: u8 = 0x09;
pub const OP_MOD: u8 = 0x0A;
pub const OP_INC: u8 = 0x0B;
pub const OP_DEC: u8 = 0x0C;
pub const OP_NEG: u8 = 0x0D;
pub const OP_AND: u8 = 0x0E;
pub const OP_OR: u8 = 0x0F;
pub const OP_XOR: u8 = 0x10;
pub const OP_NOT: u8 = 0x11;
pub const OP_SHL: u8 = 0x12;
pub const OP_EQ: u8 = 0x13;
pub const OP_LT: u8 = 0x14;
pub const OP_GT: u8 = 0x15;
/// Pops a target address from the data stack and calls it. Used for
/// quotation invocation.
pub const OP_CALLSTACK: u8 = 0x16;
pub const OP_JMP: u8 = 0x17;
pub const OP_JZ: u8 = 0x18;
pub const OP_JNZ: u8 = 0x19;
pub const OP_CALL: u8 = 0x1A;
pub const OP_RET: u8 = 0x1B;
pub const OP_LOAD: u8 = 0x1C;
pub const OP_STORE: u8 = 0x1D;
/// Pops a format flag (0 = decimal, 1 = character) then a value, and writes
/// it to stdout.
pub const OP_OUT: u8 = 0x1E;
pub const OP_HALT: u8 = 0x1F;

/// Human-readable mnemonic for an opcode byte.
pub fn opcode_name(op: u8) -> String {
    let name = match op {
        OP_PUSH => "PUSH",
        OP_POP => "POP",
        OP_DUP => "DUP",
        OP_SWAP => "SWAP",
        OP_ROLL => "ROLL",
        OP_ROT => "ROT",
        OP_ADD => "ADD",
        OP_SUB => "SUB",
        OP_MUL => "MUL",
        OP_DIV => "DIV",
        OP_MOD => "MOD",
        OP_INC => "INC",
        OP_DEC => "DEC",
        OP_NEG => "NEG",
        OP_AND => "AND",
        OP_OR => "OR",
        OP_XOR => "XOR",
        OP_NOT => "NOT",
        OP_SHL => "SHL",
        OP_EQ => "EQ",
        OP_LT => "LT",
        OP_GT => "GT",
        OP_CALLSTACK => "CALLSTACK",
        OP_JMP => "JMP",
        OP_JZ => "JZ",
        OP_JNZ => "JNZ",
        OP_CALL => "CALL",
        OP_RET => "RET",
        OP_LOAD => "LOAD",
        OP_STORE => "STORE",
        OP_OUT => "OUT",
        OP_HALT => "HALT",
        _ => return format!("UNKNOWN(0x{:02X})", op),
    };
    name.to_string()
}

// ============================================================================
// PROGRAM BUILDING HELPERS
// ============================================================================
// Used by the compiler, the demos, and hand-assembled test programs.

/// Encodes a 32-bit integer as big-endian bytes.
pub fn encode_i32(value: i32) -> [u8; 4] {
    value.to_be_bytes()
}

fn with_operand(op: u8, value: i32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5);
    buf.push(op);
    buf.extend_from_slice(&encode_i32(value));
    buf
}

/// PUSH instruction with the given value.
pub fn push_instruction(value: i32) -> Vec<u8> {
    with_operand(OP_PUSH, value)
}

/// JMP instruction to the given address.
pub fn jmp_instruction(addr: Address) -> Vec<u8> {
    with_operand(OP_JMP, addr)
}

/// JZ instruction to the given address.
pub fn jz_instruction(addr: Address) -> Vec<u8> {
    with_operand(OP_JZ, addr)
}

/// JNZ instruction to the given address.
pub fn jnz_instruction(addr: Address) -> Vec<u8> {
    with_operand(OP_JNZ, addr)
}

/// CALL instruction to the given address.
pub fn call_instruction(addr: Address) -> Vec<u8> {
    with_operand(OP_CALL, addr)
}

/// LOAD instruction from the given address.
pub fn load_instruction(addr: Address) -> Vec<u8> {
    with_operand(OP_LOAD, addr)
}

/// STORE instruction to the given address.
pub fn store_instruction(addr: Address) -> Vec<u8> {
    with_operand(OP_STORE, addr)
}

/// Bytecode that prints the top of stack as a decimal number.
pub fn out_number() -> Vec<u8> {
    let mut buf = push_instruction(0);
    buf.push(OP_OUT);
    buf
}

/// Bytecode that prints the low byte of the top of stack as a character.
pub fn out_character() -> Vec<u8> {
    let mut buf = push_instruction(1);
    buf.push(OP_OUT);
    buf
}

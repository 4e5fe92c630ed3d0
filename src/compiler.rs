// compiler.rs - LUX to NUX bytecode compiler

use std::collections::HashMap;
use std::fmt;

use crate::lexer::{parse_number, LexError, Lexer, Token, TokenKind};
use crate::opcodes::*;
use crate::vm::{RESERVED_MEMORY_SIZE, USER_MEMORY_OFFSET};

// ============================================================================
// BUILTINS AND COMBINATORS
// ============================================================================

/// Maps a canonicalized (UPPERCASE) word to the single opcode it compiles to.
fn builtin_opcode(name: &str) -> Option<u8> {
    let op = match name {
        // Stack operations
        "DUP" => OP_DUP,
        "DROP" => OP_POP,
        "SWAP" => OP_SWAP,
        "ROLL" => OP_ROLL,
        "ROT" => OP_ROT,
        // Arithmetic
        "+" => OP_ADD,
        "-" => OP_SUB,
        "*" => OP_MUL,
        "/" => OP_DIV,
        "MOD" => OP_MOD,
        "INC" => OP_INC,
        "DEC" => OP_DEC,
        "NEGATE" => OP_NEG,
        // Bitwise
        "AND" => OP_AND,
        "OR" => OP_OR,
        "XOR" => OP_XOR,
        "NOT" => OP_NOT,
        "LSHIFT" => OP_SHL,
        // Comparison
        "=" => OP_EQ,
        "<" => OP_LT,
        ">" => OP_GT,
        // Control flow
        "EXIT" => OP_RET,
        _ => return None,
    };
    Some(op)
}

/// Control-flow combinators. These consume quotation addresses at runtime.
fn is_combinator(name: &str) -> bool {
    matches!(name, "?" | "?:" | "!:" | "|:" | "#:" | "CALL" | "DIP" | "KEEP")
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum CompileError {
    Lex(LexError),
    UnknownWord { text: String, line: usize },
    UnexpectedRBracket { line: usize },
    UnclosedQuotation { line: usize },
    NestedDefinition { line: usize },
    UnexpectedEofInDefinition { name: String },
    ExpectedName { what: &'static str, line: usize },
    SemicolonInQuotation { line: usize },
    CombinatorInQuotation { name: String, line: usize },
    ReservedMemoryOverflow,
    FirstPassStall { pos: usize },
    UnexpectedToken { text: String, line: usize },
    UnpatchedPlaceholder { temp_addr: i32 },
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CompileError::Lex(err) => err.fmt(f),
            CompileError::UnknownWord { text, line } => {
                write!(f, "unknown word '{}' at line {}", text, line)
            }
            CompileError::UnexpectedRBracket { line } => {
                write!(f, "unexpected ] at line {}", line)
            }
            CompileError::UnclosedQuotation { line } => {
                write!(f, "unclosed quotation at line {}", line)
            }
            CompileError::NestedDefinition { line } => {
                write!(f, "nested word definitions not allowed at line {}", line)
            }
            CompileError::UnexpectedEofInDefinition { name } => {
                write!(f, "unexpected end of file in word definition '{}'", name)
            }
            CompileError::ExpectedName { what, line } => {
                write!(f, "expected {} at line {}", what, line)
            }
            CompileError::SemicolonInQuotation { line } => {
                write!(f, "unexpected ; inside quotation at line {}", line)
            }
            CompileError::CombinatorInQuotation { name, line } => {
                write!(
                    f,
                    "combinator '{}' not supported inside a quotation at line {}",
                    name, line
                )
            }
            CompileError::ReservedMemoryOverflow => {
                write!(
                    f,
                    "reserved memory overflow: exceeded {} bytes",
                    RESERVED_MEMORY_SIZE
                )
            }
            CompileError::FirstPassStall { pos } => {
                write!(f, "compiler failed to advance in first pass at token {}", pos)
            }
            CompileError::UnexpectedToken { text, line } => {
                write!(f, "unexpected token '{}' at line {}", text, line)
            }
            CompileError::UnpatchedPlaceholder { temp_addr } => {
                write!(f, "internal error: unpatched quotation placeholder {}", temp_addr)
            }
        }
    }
}

impl std::error::Error for CompileError {}

impl From<LexError> for CompileError {
    fn from(err: LexError) -> Self {
        CompileError::Lex(err)
    }
}

// ============================================================================
// COMPILE-TIME RECORDS
// ============================================================================

/// A user-defined word in the dictionary, keyed by its qualified UPPERCASE
/// name.
#[derive(Debug, Clone)]
pub struct Word {
    pub name: String,
    pub address: i32,
    pub module: String,
}

/// A compiled quotation body awaiting placement in the quotation pool.
#[derive(Debug, Clone)]
struct Quotation {
    temp_addr: i32,
    address: i32,
    code: Vec<u8>,
}

/// Where a `PUSH <placeholder>` operand was emitted. Recording the sites
/// means patching never has to guess whether four bytes are an operand or
/// unrelated instruction bytes.
#[derive(Debug, Clone, Copy)]
enum PatchSite {
    /// Operand offset into the main bytecode buffer.
    Main { offset: usize },
    /// Operand offset into a quotation's own code buffer.
    Quotation { index: usize, offset: usize },
}

#[derive(Debug, Clone, Copy)]
struct QuotationPatch {
    site: PatchSite,
    temp_addr: i32,
}

// ============================================================================
// COMPILER
// ============================================================================

/// Compiles LUX source to a NUX bytecode image.
pub fn compile(source: &str) -> Result<Vec<u8>, CompileError> {
    let tokens = Lexer::new(source).tokenize()?;
    Compiler::new(tokens).compile()
}

pub struct Compiler {
    tokens: Vec<Token>,
    pos: usize,
    bytecode: Vec<u8>,
    dictionary: HashMap<String, Word>,
    quotations: Vec<Quotation>,
    patches: Vec<QuotationPatch>,
    current_module: String,
    imports: HashMap<String, String>,
    base_addr: i32,
    temp_alloc: i32,
}

impl Compiler {
    pub fn new(mut tokens: Vec<Token>) -> Self {
        if tokens.last().map_or(true, |t| t.kind != TokenKind::Eof) {
            tokens.push(Token {
                kind: TokenKind::Eof,
                text: String::new(),
                line: 0,
                column: 0,
            });
        }
        Compiler {
            tokens,
            pos: 0,
            bytecode: Vec::new(),
            dictionary: HashMap::new(),
            quotations: Vec::new(),
            patches: Vec::new(),
            current_module: String::new(),
            imports: HashMap::new(),
            base_addr: USER_MEMORY_OFFSET as i32,
            temp_alloc: 0,
        }
    }

    /// Runs both passes and produces the final image:
    ///
    /// ```text
    /// JMP main | word bodies | main body | JMP halt | quotations | HALT
    /// ```
    pub fn compile(mut self) -> Result<Vec<u8>, CompileError> {
        let entry_jmp = self.emit_jump(OP_JMP);

        let start_pos = self.pos;
        self.first_pass()?;

        let main_start = self.current_address();
        log::debug!("main code starts at address {}", main_start);
        self.patch_operand(entry_jmp, main_start);

        self.pos = start_pos;
        self.current_module.clear();
        self.second_pass()?;

        // Jump over the quotation pool, placed next.
        let skip_jmp = self.emit_jump(OP_JMP);

        let mut placed_at = Vec::with_capacity(self.quotations.len());
        for i in 0..self.quotations.len() {
            self.quotations[i].address = self.current_address();
            log::debug!(
                "placing quotation {} at address {} (was temp {})",
                i,
                self.quotations[i].address,
                self.quotations[i].temp_addr
            );
            placed_at.push(self.bytecode.len());
            let code = std::mem::take(&mut self.quotations[i].code);
            self.bytecode.extend_from_slice(&code);
        }

        let halt_addr = self.current_address();
        self.emit(OP_HALT);
        self.patch_operand(skip_jmp, halt_addr);

        self.apply_quotation_patches(&placed_at)?;

        Ok(self.bytecode)
    }

    // ------------------------------------------------------------------
    // First pass: directives and word definitions
    // ------------------------------------------------------------------

    fn first_pass(&mut self) -> Result<(), CompileError> {
        // Guards against malformed input that fails to advance the cursor.
        let max_iterations = self.tokens.len() * 2;
        let mut iterations = 0;

        while self.peek().kind != TokenKind::Eof {
            iterations += 1;
            if iterations > max_iterations {
                return Err(CompileError::FirstPassStall { pos: self.pos });
            }

            let token = self.peek().clone();
            match token.kind {
                TokenKind::Word if token.text.eq_ignore_ascii_case("MODULE") => {
                    self.handle_module_directive()?;
                }
                TokenKind::Word if token.text.eq_ignore_ascii_case("IMPORT") => {
                    self.handle_import_directive()?;
                }
                TokenKind::AtSign => {
                    self.compile_word_definition()?;
                }
                _ => {
                    self.advance();
                }
            }
        }
        Ok(())
    }

    fn handle_module_directive(&mut self) -> Result<(), CompileError> {
        self.advance(); // MODULE
        let name = self.peek().clone();
        if name.kind != TokenKind::Word {
            return Err(CompileError::ExpectedName {
                what: "module name after MODULE",
                line: name.line,
            });
        }
        self.current_module = name.text.to_uppercase();
        self.advance();
        Ok(())
    }

    fn handle_import_directive(&mut self) -> Result<(), CompileError> {
        self.advance(); // IMPORT
        let name = self.peek().clone();
        if name.kind != TokenKind::Word {
            return Err(CompileError::ExpectedName {
                what: "module name after IMPORT",
                line: name.line,
            });
        }
        let module_name = name.text.to_uppercase();
        self.advance();

        if self.peek().kind == TokenKind::Word && self.peek().text.eq_ignore_ascii_case("AS") {
            self.advance(); // AS
            let alias = self.peek().clone();
            if alias.kind != TokenKind::Word {
                return Err(CompileError::ExpectedName {
                    what: "shorthand name after AS",
                    line: alias.line,
                });
            }
            self.imports.insert(alias.text.to_uppercase(), module_name);
            self.advance();
        } else {
            // A bare IMPORT makes the module addressable under its own name.
            self.imports.insert(module_name.clone(), module_name);
        }
        Ok(())
    }

    fn compile_word_definition(&mut self) -> Result<(), CompileError> {
        self.advance(); // @
        let name_token = self.advance();
        if name_token.kind != TokenKind::Word {
            return Err(CompileError::ExpectedName {
                what: "word name after '@'",
                line: name_token.line,
            });
        }

        let base = name_token.text.to_uppercase();
        let word_name = if !self.current_module.is_empty() && !base.contains("::") {
            format!("{}::{}", self.current_module, base)
        } else {
            base
        };
        let address = self.current_address();

        // Registered before the body compiles so the definition can call
        // itself directly.
        if self.dictionary.contains_key(&word_name) {
            log::warn!("word '{}' redefined, previous definition shadowed", word_name);
        }
        self.dictionary.insert(
            word_name.clone(),
            Word {
                name: word_name.clone(),
                address,
                module: self.current_module.clone(),
            },
        );

        loop {
            let token = self.peek().clone();
            match token.kind {
                TokenKind::Eof => {
                    return Err(CompileError::UnexpectedEofInDefinition { name: word_name })
                }
                TokenKind::Semicolon => {
                    self.advance();
                    break;
                }
                TokenKind::AtSign => {
                    return Err(CompileError::NestedDefinition { line: token.line })
                }
                TokenKind::LBracket => {
                    self.begin_quotation_in_main();
                    self.advance();
                    let index = self.quotations.len() - 1;
                    self.compile_quotation(index)?;
                }
                TokenKind::RBracket => {
                    return Err(CompileError::UnexpectedRBracket { line: token.line })
                }
                _ => {
                    self.compile_token(&token)?;
                    self.advance();
                }
            }
        }

        self.emit(OP_RET);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Second pass: main body and quotations
    // ------------------------------------------------------------------

    fn second_pass(&mut self) -> Result<(), CompileError> {
        while self.peek().kind != TokenKind::Eof {
            let token = self.peek().clone();

            if token.kind == TokenKind::Word {
                if token.text.eq_ignore_ascii_case("MODULE") {
                    self.advance();
                    // Track the module again so unqualified main-body words
                    // resolve against the module they appear in.
                    let name = self.advance();
                    self.current_module = name.text.to_uppercase();
                    continue;
                }
                if token.text.eq_ignore_ascii_case("IMPORT") {
                    self.advance();
                    self.advance();
                    if self.peek().kind == TokenKind::Word
                        && self.peek().text.eq_ignore_ascii_case("AS")
                    {
                        self.advance();
                        self.advance();
                    }
                    continue;
                }
            }

            match token.kind {
                TokenKind::AtSign => self.skip_word_definition(),
                TokenKind::LBracket => {
                    self.begin_quotation_in_main();
                    self.advance();
                    let index = self.quotations.len() - 1;
                    self.compile_quotation(index)?;
                }
                TokenKind::RBracket => {
                    return Err(CompileError::UnexpectedRBracket { line: token.line })
                }
                _ => {
                    self.compile_token(&token)?;
                    self.advance();
                }
            }
        }
        Ok(())
    }

    fn skip_word_definition(&mut self) {
        self.advance(); // @
        self.advance(); // name
        let mut depth = 0;
        while self.peek().kind != TokenKind::Eof {
            match self.peek().kind {
                TokenKind::LBracket => depth += 1,
                TokenKind::RBracket => depth -= 1,
                TokenKind::Semicolon if depth == 0 => {
                    self.advance();
                    break;
                }
                _ => {}
            }
            self.advance();
        }
    }

    /// Compiles a Number, String or Word token into the main buffer.
    fn compile_token(&mut self, token: &Token) -> Result<(), CompileError> {
        match token.kind {
            TokenKind::Number => {
                let value = parse_number(token)?;
                self.emit_push(value);
            }
            TokenKind::String => {
                for ch in token.text.chars() {
                    self.emit_push(ch as i32);
                    self.emit_push(1);
                    self.emit(OP_OUT);
                }
            }
            TokenKind::Word => return self.compile_word_token(token),
            _ => {
                return Err(CompileError::UnexpectedToken {
                    text: token.text.clone(),
                    line: token.line,
                })
            }
        }
        Ok(())
    }

    fn compile_word_token(&mut self, token: &Token) -> Result<(), CompileError> {
        let upper = token.text.to_uppercase();

        if upper == "." {
            self.emit_push(0);
            self.emit(OP_OUT);
            return Ok(());
        }
        if upper == "EMIT" {
            self.emit_push(1);
            self.emit(OP_OUT);
            return Ok(());
        }
        if let Some(word) = self.resolve_word(&upper) {
            log::trace!("call to word '{}' at address {}", word.name, word.address);
            let address = word.address;
            self.emit(OP_CALL);
            self.emit_bytes(&encode_i32(address));
            return Ok(());
        }
        if is_combinator(&upper) {
            return self.compile_combinator(&upper);
        }
        if let Some(opcode) = builtin_opcode(&upper) {
            self.emit(opcode);
            return Ok(());
        }

        Err(CompileError::UnknownWord {
            text: token.text.clone(),
            line: token.line,
        })
    }

    // ------------------------------------------------------------------
    // Word resolution
    // ------------------------------------------------------------------

    /// Resolves an UPPERCASE word reference: exact match, then qualified
    /// with the current module, then through an import alias.
    fn resolve_word(&self, upper_name: &str) -> Option<&Word> {
        if let Some(word) = self.dictionary.get(upper_name) {
            return Some(word);
        }
        if !upper_name.contains("::") && !self.current_module.is_empty() {
            let qualified = format!("{}::{}", self.current_module, upper_name);
            if let Some(word) = self.dictionary.get(&qualified) {
                return Some(word);
            }
        }
        if let Some((prefix, tail)) = upper_name.split_once("::") {
            if let Some(full_module) = self.imports.get(prefix) {
                let qualified = format!("{}::{}", full_module, tail);
                if let Some(word) = self.dictionary.get(&qualified) {
                    return Some(word);
                }
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Quotations
    // ------------------------------------------------------------------

    /// Allocates a quotation record and emits `PUSH <placeholder>` into the
    /// main buffer, recording the operand as a patch site.
    fn begin_quotation_in_main(&mut self) {
        let temp_addr = self.new_quotation();
        self.patches.push(QuotationPatch {
            site: PatchSite::Main {
                offset: self.bytecode.len() + 1,
            },
            temp_addr,
        });
        self.emit(OP_PUSH);
        self.emit_bytes(&encode_i32(temp_addr));
    }

    /// Deterministic placeholder addresses, one per quotation. The recorded
    /// patch sites are what gets rewritten, so these only need to be unique.
    fn new_quotation(&mut self) -> i32 {
        let temp_addr = 0x1000 + (self.quotations.len() as i32) * 0x100;
        self.quotations.push(Quotation {
            temp_addr,
            address: 0,
            code: Vec::new(),
        });
        temp_addr
    }

    /// Compiles tokens into the quotation's own buffer until the matching
    /// `]`, then appends the terminating RET.
    fn compile_quotation(&mut self, index: usize) -> Result<(), CompileError> {
        let mut code = Vec::new();

        loop {
            let token = self.peek().clone();
            match token.kind {
                TokenKind::Eof => {
                    return Err(CompileError::UnclosedQuotation { line: token.line })
                }
                TokenKind::RBracket => {
                    self.advance();
                    break;
                }
                TokenKind::LBracket => {
                    let temp_addr = self.new_quotation();
                    self.patches.push(QuotationPatch {
                        site: PatchSite::Quotation {
                            index,
                            offset: code.len() + 1,
                        },
                        temp_addr,
                    });
                    code.push(OP_PUSH);
                    code.extend_from_slice(&encode_i32(temp_addr));
                    self.advance();
                    let nested = self.quotations.len() - 1;
                    self.compile_quotation(nested)?;
                }
                TokenKind::Semicolon => {
                    return Err(CompileError::SemicolonInQuotation { line: token.line })
                }
                TokenKind::Number => {
                    let value = parse_number(&token)?;
                    code.push(OP_PUSH);
                    code.extend_from_slice(&encode_i32(value));
                    self.advance();
                }
                TokenKind::String => {
                    for ch in token.text.chars() {
                        code.push(OP_PUSH);
                        code.extend_from_slice(&encode_i32(ch as i32));
                        code.push(OP_PUSH);
                        code.extend_from_slice(&encode_i32(1));
                        code.push(OP_OUT);
                    }
                    self.advance();
                }
                TokenKind::Word => {
                    self.compile_quotation_word(&token, &mut code)?;
                    self.advance();
                }
                TokenKind::AtSign => {
                    return Err(CompileError::UnexpectedToken {
                        text: token.text.clone(),
                        line: token.line,
                    })
                }
            }
        }

        code.push(OP_RET);
        self.quotations[index].code = code;
        Ok(())
    }

    fn compile_quotation_word(
        &mut self,
        token: &Token,
        code: &mut Vec<u8>,
    ) -> Result<(), CompileError> {
        let upper = token.text.to_uppercase();

        if upper == "." {
            code.push(OP_PUSH);
            code.extend_from_slice(&encode_i32(0));
            code.push(OP_OUT);
            return Ok(());
        }
        if upper == "EMIT" {
            code.push(OP_PUSH);
            code.extend_from_slice(&encode_i32(1));
            code.push(OP_OUT);
            return Ok(());
        }
        if let Some(word) = self.resolve_word(&upper) {
            let address = word.address;
            code.push(OP_CALL);
            code.extend_from_slice(&encode_i32(address));
            return Ok(());
        }
        if is_combinator(&upper) {
            // Only the combinators that lower to plain stack code work here.
            // The looping ones jump to absolute addresses, which do not exist
            // while the quotation body is still unplaced.
            return match upper.as_str() {
                "CALL" | "DIP" => {
                    code.push(OP_CALLSTACK);
                    Ok(())
                }
                "KEEP" => {
                    code.push(OP_SWAP);
                    code.push(OP_DUP);
                    code.push(OP_ROT);
                    code.push(OP_CALLSTACK);
                    Ok(())
                }
                _ => Err(CompileError::CombinatorInQuotation {
                    name: token.text.clone(),
                    line: token.line,
                }),
            };
        }
        if let Some(opcode) = builtin_opcode(&upper) {
            code.push(opcode);
            return Ok(());
        }

        Err(CompileError::UnknownWord {
            text: token.text.clone(),
            line: token.line,
        })
    }

    fn apply_quotation_patches(&mut self, placed_at: &[usize]) -> Result<(), CompileError> {
        let addr_map: HashMap<i32, i32> = self
            .quotations
            .iter()
            .map(|q| (q.temp_addr, q.address))
            .collect();

        for patch in &self.patches {
            let real_addr = *addr_map
                .get(&patch.temp_addr)
                .ok_or(CompileError::UnpatchedPlaceholder {
                    temp_addr: patch.temp_addr,
                })?;
            let offset = match patch.site {
                PatchSite::Main { offset } => offset,
                PatchSite::Quotation { index, offset } => placed_at[index] + offset,
            };
            self.bytecode[offset..offset + 4].copy_from_slice(&encode_i32(real_addr));
            log::debug!(
                "patched placeholder {} -> {} at offset {}",
                patch.temp_addr,
                real_addr,
                offset
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Combinator lowering
    // ------------------------------------------------------------------

    fn compile_combinator(&mut self, name: &str) -> Result<(), CompileError> {
        match name {
            // Both pop the quotation address off the top and invoke it.
            "CALL" | "DIP" => {
                self.emit(OP_CALLSTACK);
                Ok(())
            }
            "?" => {
                self.compile_if();
                Ok(())
            }
            "?:" => {
                self.compile_if_else();
                Ok(())
            }
            "!:" => {
                self.compile_unless();
                Ok(())
            }
            "|:" => self.compile_while(),
            "#:" => self.compile_times(),
            "KEEP" => {
                // x quot -- quot x -- quot x x -- x x quot -- x result
                self.emit(OP_SWAP);
                self.emit(OP_DUP);
                self.emit(OP_ROT);
                self.emit(OP_CALLSTACK);
                Ok(())
            }
            _ => unreachable!("combinator table out of sync: {}", name),
        }
    }

    /// `cond [body] ?` - run body iff cond is nonzero.
    fn compile_if(&mut self) {
        self.emit(OP_SWAP);
        let skip_jump = self.emit_jump(OP_JZ);
        self.emit(OP_CALLSTACK);
        let end_jump = self.emit_jump(OP_JMP);
        let skip = self.current_address();
        self.emit(OP_POP); // discard the unused body address
        let end = self.current_address();
        self.patch_operand(skip_jump, skip);
        self.patch_operand(end_jump, end);
    }

    /// `cond [true] [false] ?:` - run exactly one branch.
    fn compile_if_else(&mut self) {
        // Stack at the call site: cond true-addr false-addr
        self.emit(OP_SWAP);
        self.emit(OP_ROT);
        // Stack: false-addr true-addr cond
        let else_jump = self.emit_jump(OP_JZ);
        self.emit(OP_SWAP);
        self.emit(OP_POP);
        self.emit(OP_CALLSTACK);
        let end_jump = self.emit_jump(OP_JMP);
        let else_branch = self.current_address();
        self.emit(OP_POP);
        self.emit(OP_CALLSTACK);
        let end = self.current_address();
        self.patch_operand(else_jump, else_branch);
        self.patch_operand(end_jump, end);
    }

    /// `cond [body] !:` - run body iff cond is zero.
    fn compile_unless(&mut self) {
        self.emit(OP_SWAP);
        let skip_jump = self.emit_jump(OP_JNZ);
        self.emit(OP_CALLSTACK);
        let end_jump = self.emit_jump(OP_JMP);
        let skip = self.current_address();
        self.emit(OP_POP);
        let end = self.current_address();
        self.patch_operand(skip_jump, skip);
        self.patch_operand(end_jump, end);
    }

    /// `[cond] [body] |:` - while cond leaves nonzero, run body. The value
    /// beneath the quotations is threaded through both.
    fn compile_while(&mut self) -> Result<(), CompileError> {
        let cond_slot = self.alloc_temp(4)?;
        let body_slot = self.alloc_temp(4)?;

        self.emit(OP_STORE);
        self.emit_bytes(&encode_i32(body_slot));
        self.emit(OP_STORE);
        self.emit_bytes(&encode_i32(cond_slot));

        let loop_start = self.current_address();
        self.emit(OP_DUP);
        self.emit(OP_LOAD);
        self.emit_bytes(&encode_i32(cond_slot));
        self.emit(OP_CALLSTACK);
        // cond's result is on top; JZ consumes it.
        let exit_jump = self.emit_jump(OP_JZ);
        self.emit(OP_LOAD);
        self.emit_bytes(&encode_i32(body_slot));
        self.emit(OP_CALLSTACK);
        self.emit(OP_JMP);
        self.emit_bytes(&encode_i32(loop_start));

        let exit = self.current_address();
        self.patch_operand(exit_jump, exit);
        Ok(())
    }

    /// `init [body] n #:` - run body n times on the data beneath the loop
    /// controls, which are parked in reserved memory around each call.
    fn compile_times(&mut self) -> Result<(), CompileError> {
        let quot_slot = self.alloc_temp(4)?;
        let count_slot = self.alloc_temp(4)?;

        let loop_start = self.current_address();
        // Stack: data... quot-addr count
        self.emit(OP_DUP);
        let exit_jump = self.emit_jump(OP_JZ);
        self.emit(OP_DEC);
        self.emit(OP_STORE);
        self.emit_bytes(&encode_i32(count_slot));
        self.emit(OP_STORE);
        self.emit_bytes(&encode_i32(quot_slot));
        // Stack: data... - run the body on it
        self.emit(OP_LOAD);
        self.emit_bytes(&encode_i32(quot_slot));
        self.emit(OP_CALLSTACK);
        // Restore loop variables for the next round
        self.emit(OP_LOAD);
        self.emit_bytes(&encode_i32(quot_slot));
        self.emit(OP_LOAD);
        self.emit_bytes(&encode_i32(count_slot));
        self.emit(OP_JMP);
        self.emit_bytes(&encode_i32(loop_start));

        let exit = self.current_address();
        self.emit(OP_POP); // count (zero)
        self.emit(OP_POP); // quotation address
        self.patch_operand(exit_jump, exit);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Emission helpers
    // ------------------------------------------------------------------

    fn peek(&self) -> &Token {
        // The token stream always ends with Eof, so the cursor never walks
        // past the end while callers stop on Eof.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn emit(&mut self, byte: u8) {
        self.bytecode.push(byte);
    }

    fn emit_bytes(&mut self, bytes: &[u8]) {
        self.bytecode.extend_from_slice(bytes);
    }

    fn emit_push(&mut self, value: i32) {
        self.emit(OP_PUSH);
        self.emit_bytes(&encode_i32(value));
    }

    /// Emits a jump-family opcode with a zero operand and returns the
    /// operand's offset for later patching.
    fn emit_jump(&mut self, opcode: u8) -> usize {
        self.emit(opcode);
        let offset = self.bytecode.len();
        self.emit_bytes(&[0, 0, 0, 0]);
        offset
    }

    fn patch_operand(&mut self, offset: usize, address: i32) {
        self.bytecode[offset..offset + 4].copy_from_slice(&encode_i32(address));
    }

    /// Current append position as a VM-space address.
    fn current_address(&self) -> i32 {
        self.base_addr + self.bytecode.len() as i32
    }

    /// Claims scratch space in reserved memory for combinator state.
    fn alloc_temp(&mut self, size: i32) -> Result<i32, CompileError> {
        let addr = self.temp_alloc;
        self.temp_alloc += size;
        if self.temp_alloc > RESERVED_MEMORY_SIZE as i32 {
            return Err(CompileError::ReservedMemoryOverflow);
        }
        Ok(addr)
    }
}

//! Property-based tests for the VM and compiler:
//! - Involution round-trips (NEG NEG, NOT NOT)
//! - Stack-shape round-trips (DUP DROP, SWAP SWAP)
//! - Byte-determinism of compilation
//! - Lexing stability on canonicalized token streams

use proptest::prelude::*;

use nuxvm::compiler;
use nuxvm::lexer::{Lexer, TokenKind};
use nuxvm::opcodes::*;
use nuxvm::vm::VM;

/// Runs a hand-assembled program and returns the final stack.
fn run_program(prog: &[u8]) -> Vec<i32> {
    let mut vm = VM::new(prog);
    vm.capture_output();
    vm.run().unwrap();
    vm.stack().to_vec()
}

proptest! {
    #[test]
    fn double_neg_is_identity(n in any::<i32>()) {
        let prog = [
            push_instruction(n),
            vec![OP_NEG, OP_NEG, OP_HALT],
        ]
        .concat();
        prop_assert_eq!(run_program(&prog), vec![n]);
    }

    #[test]
    fn double_not_is_identity(n in any::<i32>()) {
        let prog = [
            push_instruction(n),
            vec![OP_NOT, OP_NOT, OP_HALT],
        ]
        .concat();
        prop_assert_eq!(run_program(&prog), vec![n]);
    }

    #[test]
    fn dup_drop_is_identity(n in any::<i32>()) {
        let prog = [
            push_instruction(n),
            vec![OP_DUP, OP_POP, OP_HALT],
        ]
        .concat();
        prop_assert_eq!(run_program(&prog), vec![n]);
    }

    #[test]
    fn swap_swap_is_identity(a in any::<i32>(), b in any::<i32>()) {
        let prog = [
            push_instruction(a),
            push_instruction(b),
            vec![OP_SWAP, OP_SWAP, OP_HALT],
        ]
        .concat();
        prop_assert_eq!(run_program(&prog), vec![a, b]);
    }

    #[test]
    fn call_and_ret_leave_the_data_stack_alone(values in proptest::collection::vec(any::<i32>(), 0..8)) {
        // JMP main | sub: RET | main: pushes, CALL sub, HALT
        let mut prog = jmp_instruction(4096 + 6);
        prog.push(OP_RET);
        for v in &values {
            prog.extend_from_slice(&push_instruction(*v));
        }
        prog.extend_from_slice(&call_instruction(4096 + 5));
        prog.push(OP_HALT);
        prop_assert_eq!(run_program(&prog), values);
    }

    #[test]
    fn compilation_is_deterministic(numbers in proptest::collection::vec(-1000i32..1000, 1..20)) {
        let source = numbers
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let first = compiler::compile(&source).unwrap();
        let second = compiler::compile(&source).unwrap();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn compiled_numbers_end_up_on_the_stack(numbers in proptest::collection::vec(any::<i32>(), 1..20)) {
        let source = numbers
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let bytecode = compiler::compile(&source).unwrap();
        prop_assert_eq!(run_program(&bytecode), numbers);
    }

    #[test]
    fn lexing_canonicalized_tokens_is_stable(
        words in proptest::collection::vec("[A-Z][A-Z0-9_]{0,8}", 1..12),
        numbers in proptest::collection::vec(any::<i32>(), 1..12),
    ) {
        // Interleave words and numbers, render, and lex twice.
        let mut parts = Vec::new();
        for (w, n) in words.iter().zip(&numbers) {
            parts.push(w.clone());
            parts.push(n.to_string());
        }
        let source = parts.join(" ");

        let first = Lexer::new(&source).tokenize().unwrap();
        let rendered = first
            .iter()
            .filter(|t| t.kind != TokenKind::Eof)
            .map(|t| t.text.clone())
            .collect::<Vec<_>>()
            .join(" ");
        let second = Lexer::new(&rendered).tokenize().unwrap();

        let shape = |tokens: &[nuxvm::lexer::Token]| {
            tokens
                .iter()
                .map(|t| (t.kind, t.text.clone()))
                .collect::<Vec<_>>()
        };
        prop_assert_eq!(shape(&first), shape(&second));
    }
}

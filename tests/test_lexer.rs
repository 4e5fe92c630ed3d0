use nuxvm::lexer::{parse_number, LexError, Lexer, Token, TokenKind};

fn tokenize(input: &str) -> Vec<Token> {
    Lexer::new(input).tokenize().unwrap()
}

/// Kinds and texts, without the trailing Eof.
fn kinds_and_texts(input: &str) -> Vec<(TokenKind, String)> {
    tokenize(input)
        .into_iter()
        .filter(|t| t.kind != TokenKind::Eof)
        .map(|t| (t.kind, t.text))
        .collect()
}

#[test]
fn test_empty_input_yields_eof() {
    let tokens = tokenize("");
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].kind, TokenKind::Eof);
}

#[test]
fn test_single_char_tokens() {
    assert_eq!(
        kinds_and_texts("@ ; [ ]"),
        vec![
            (TokenKind::AtSign, "@".to_string()),
            (TokenKind::Semicolon, ";".to_string()),
            (TokenKind::LBracket, "[".to_string()),
            (TokenKind::RBracket, "]".to_string()),
        ]
    );
}

#[test]
fn test_numbers() {
    assert_eq!(
        kinds_and_texts("42 -17 0"),
        vec![
            (TokenKind::Number, "42".to_string()),
            (TokenKind::Number, "-17".to_string()),
            (TokenKind::Number, "0".to_string()),
        ]
    );
}

#[test]
fn test_hex_numbers() {
    assert_eq!(
        kinds_and_texts("0xFF 0X10"),
        vec![
            (TokenKind::Number, "0xFF".to_string()),
            (TokenKind::Number, "0X10".to_string()),
        ]
    );
}

#[test]
fn test_minus_alone_is_a_word() {
    assert_eq!(
        kinds_and_texts("- -5"),
        vec![
            (TokenKind::Word, "-".to_string()),
            (TokenKind::Number, "-5".to_string()),
        ]
    );
}

#[test]
fn test_number_followed_by_letter_splits() {
    // Digits stop the number; the rest lexes as a word.
    assert_eq!(
        kinds_and_texts("5x"),
        vec![
            (TokenKind::Number, "5".to_string()),
            (TokenKind::Word, "x".to_string()),
        ]
    );
}

#[test]
fn test_words() {
    assert_eq!(
        kinds_and_texts("DUP swap MyWord + < ?"),
        vec![
            (TokenKind::Word, "DUP".to_string()),
            (TokenKind::Word, "swap".to_string()),
            (TokenKind::Word, "MyWord".to_string()),
            (TokenKind::Word, "+".to_string()),
            (TokenKind::Word, "<".to_string()),
            (TokenKind::Word, "?".to_string()),
        ]
    );
}

#[test]
fn test_qualified_word() {
    assert_eq!(
        kinds_and_texts("MATH::SQUARE m::sq"),
        vec![
            (TokenKind::Word, "MATH::SQUARE".to_string()),
            (TokenKind::Word, "m::sq".to_string()),
        ]
    );
}

#[test]
fn test_combinator_tokens() {
    assert_eq!(
        kinds_and_texts("?: !: |: #:"),
        vec![
            (TokenKind::Word, "?:".to_string()),
            (TokenKind::Word, "!:".to_string()),
            (TokenKind::Word, "|:".to_string()),
            (TokenKind::Word, "#:".to_string()),
        ]
    );
}

#[test]
fn test_string_literal() {
    let tokens = tokenize(r#""hello world""#);
    assert_eq!(tokens[0].kind, TokenKind::String);
    assert_eq!(tokens[0].text, "hello world");
}

#[test]
fn test_string_escapes() {
    let tokens = tokenize(r#""a\nb\tc\\d\"e\qf""#);
    // Unknown escapes keep the escaped character.
    assert_eq!(tokens[0].text, "a\nb\tc\\d\"eqf");
}

#[test]
fn test_unclosed_string() {
    let err = Lexer::new("\"oops").tokenize().unwrap_err();
    assert!(matches!(err, LexError::UnclosedString { line: 1, .. }));
}

#[test]
fn test_block_comments_are_discarded() {
    assert_eq!(
        kinds_and_texts("1 ( this is ( nested ) commentary ) 2"),
        vec![
            (TokenKind::Number, "1".to_string()),
            (TokenKind::Number, "2".to_string()),
        ]
    );
}

#[test]
fn test_unclosed_comment() {
    let err = Lexer::new("( never closed").tokenize().unwrap_err();
    assert!(matches!(err, LexError::UnclosedComment { line: 1, .. }));
}

#[test]
fn test_line_comments_are_discarded() {
    assert_eq!(
        kinds_and_texts("1 // ignored to end of line\n2"),
        vec![
            (TokenKind::Number, "1".to_string()),
            (TokenKind::Number, "2".to_string()),
        ]
    );
}

#[test]
fn test_definition_tokens() {
    assert_eq!(
        kinds_and_texts("@square dup * ;"),
        vec![
            (TokenKind::AtSign, "@".to_string()),
            (TokenKind::Word, "square".to_string()),
            (TokenKind::Word, "dup".to_string()),
            (TokenKind::Word, "*".to_string()),
            (TokenKind::Semicolon, ";".to_string()),
        ]
    );
}

#[test]
fn test_brackets_terminate_words() {
    assert_eq!(
        kinds_and_texts("[dup]"),
        vec![
            (TokenKind::LBracket, "[".to_string()),
            (TokenKind::Word, "dup".to_string()),
            (TokenKind::RBracket, "]".to_string()),
        ]
    );
}

#[test]
fn test_line_and_column_tracking() {
    let tokens = tokenize("1\n  2");
    assert_eq!((tokens[0].line, tokens[0].column), (1, 1));
    assert_eq!((tokens[1].line, tokens[1].column), (2, 3));
}

#[test]
fn test_parse_number_decimal() {
    let tokens = tokenize("-2147483648 2147483647");
    assert_eq!(parse_number(&tokens[0]).unwrap(), i32::MIN);
    assert_eq!(parse_number(&tokens[1]).unwrap(), i32::MAX);
}

#[test]
fn test_parse_number_hex() {
    let tokens = tokenize("0xFF 0x7FFFFFFF");
    assert_eq!(parse_number(&tokens[0]).unwrap(), 255);
    assert_eq!(parse_number(&tokens[1]).unwrap(), i32::MAX);
}

#[test]
fn test_parse_number_out_of_range() {
    let tokens = tokenize("2147483648");
    assert!(matches!(
        parse_number(&tokens[0]),
        Err(LexError::InvalidNumber { .. })
    ));
}

#[test]
fn test_parse_number_bare_hex_prefix() {
    let tokens = tokenize("0x");
    assert!(matches!(
        parse_number(&tokens[0]),
        Err(LexError::InvalidNumber { .. })
    ));
}

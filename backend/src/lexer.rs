// Lexer for the tuple-type grammar.
//
// Tokenizes strings such as `Tuple2<Float,Integer>` or `Tuple3::Double`.
// Uses the `logos` crate for DFA-based lexing.
//
// Preconditions: input is valid UTF-8.
// Postconditions: returns all tokens with byte-offset spans, plus any lex errors.
// Failure modes: unrecognized characters produce `LexError`; lexing continues.
// Side effects: none.

use logos::Logos;
use std::fmt;

/// Byte-offset span in source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// A lexer error with location.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub span: Span,
    pub message: String,
}

/// Result of lexing: tokens plus any errors (non-fatal).
#[derive(Debug)]
pub struct LexResult {
    pub tokens: Vec<(Token, Span)>,
    pub errors: Vec<LexError>,
}

/// Type-grammar tokens. Identifiers carry no value; use the span to read
/// the element type name from the source.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
pub enum Token {
    /// `TupleN` with its declared arity.
    #[regex(r"Tuple[0-9]+", parse_arity)]
    Tuple(usize),

    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token(",")]
    Comma,
    #[token("::")]
    PathSep,

    /// Element type name (`Float`, `Integer`, ...). Letters only, so
    /// `Tuple2` always lexes as `Tuple` by longest match.
    #[regex(r"[A-Za-z]+")]
    Ident,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Tuple(n) => write!(f, "Tuple{}", n),
            Token::Lt => write!(f, "<"),
            Token::Gt => write!(f, ">"),
            Token::Comma => write!(f, ","),
            Token::PathSep => write!(f, "::"),
            Token::Ident => write!(f, "<type name>"),
        }
    }
}

fn parse_arity(lex: &mut logos::Lexer<'_, Token>) -> Option<usize> {
    lex.slice()["Tuple".len()..].parse().ok()
}

/// Lex a type-grammar string into tokens.
///
/// Lexing is non-fatal: errors are collected and the lexer continues past
/// bad characters.
pub fn lex(source: &str) -> LexResult {
    let lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    let mut errors = Vec::new();

    for (result, range) in lexer.spanned() {
        let span = Span {
            start: range.start,
            end: range.end,
        };
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => errors.push(LexError {
                span,
                message: format!("unexpected character: {:?}", &source[span.start..span.end]),
            }),
        }
    }

    LexResult { tokens, errors }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_ok(source: &str) -> Vec<Token> {
        let result = lex(source);
        assert!(
            result.errors.is_empty(),
            "unexpected lex errors: {:?}",
            result.errors
        );
        result.tokens.into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn tuple_with_fields() {
        assert_eq!(
            lex_ok("Tuple2<Float, Integer>"),
            vec![
                Token::Tuple(2),
                Token::Lt,
                Token::Ident,
                Token::Comma,
                Token::Ident,
                Token::Gt,
            ]
        );
    }

    #[test]
    fn repeated_form() {
        assert_eq!(
            lex_ok("Tuple11::Double"),
            vec![Token::Tuple(11), Token::PathSep, Token::Ident]
        );
    }

    #[test]
    fn nested_closers_are_separate() {
        let tokens = lex_ok("Tuple1<Tuple1<Long>>");
        assert_eq!(tokens.iter().filter(|t| **t == Token::Gt).count(), 2);
    }

    #[test]
    fn bare_tuple_is_ident() {
        assert_eq!(lex_ok("Tuple"), vec![Token::Ident]);
    }

    #[test]
    fn bad_character_is_collected() {
        let result = lex("Tuple2<Float;Float>");
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].span, Span { start: 12, end: 13 });
        assert_eq!(result.tokens.len(), 5);
    }
}

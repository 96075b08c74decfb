// Parser for the tuple-type grammar.
//
// Parses `TupleN<T1,...,TN>`, `TupleN::T` (one element type repeated N times)
// and bare element type names into a `TypeDescriptor`. Tuple fields may nest.
// Uses chumsky combinators over the token stream from `lexer::lex()`.
//
// Preconditions: none.
// Postconditions: a returned descriptor satisfies the arity invariant.
// Failure modes: any lex or parse error, an unknown element type name, or a
//                declared arity that differs from the field count yields
//                `TypeError::MalformedTypeGrammar`.
// Side effects: none.

use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;
use chumsky::span::SimpleSpan;

use crate::error::TypeError;
use crate::lexer::Token;
use crate::types::{ScalarKind, TypeDescriptor};

/// Parse a type-grammar string into a descriptor.
pub fn parse_type(source: &str) -> Result<TypeDescriptor, TypeError> {
    let malformed = |reason: String| TypeError::MalformedTypeGrammar {
        input: source.to_string(),
        reason,
    };

    let lex_result = crate::lexer::lex(source);
    if let Some(err) = lex_result.errors.first() {
        return Err(malformed(err.message.clone()));
    }
    let len = source.len();

    let token_iter = lex_result.tokens.into_iter().map(|(tok, span)| {
        let cspan: SimpleSpan = (span.start..span.end).into();
        (tok, cspan)
    });
    let eoi: SimpleSpan = (len..len).into();
    let stream = Stream::from_iter(token_iter).map(eoi, |(t, s): (_, _)| (t, s));

    let (ty, errors) = type_parser(source).parse(stream).into_output_errors();
    if let Some(err) = errors.first() {
        return Err(malformed(err.to_string()));
    }
    ty.ok_or_else(|| malformed("empty type".to_string()))
}

// ── Grammar ──
//
//   type     = tuple | repeated | scalar
//   tuple    = TupleN '<' type (',' type)* '>'
//   repeated = TupleN '::' scalar
//   scalar   = Byte | Character | Short | Integer | Long | Float | Double | Boolean

fn type_parser<'tokens, 'src: 'tokens, I>(
    source: &'src str,
) -> impl Parser<'tokens, I, TypeDescriptor, extra::Err<Rich<'tokens, Token, SimpleSpan>>> + 'src
where
    'tokens: 'src,
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    let scalar = just(Token::Ident).try_map(move |_, span: SimpleSpan| {
        let name = &source[span.start()..span.end()];
        ScalarKind::from_grammar_name(name)
            .ok_or_else(|| Rich::custom(span, format!("unknown element type `{}`", name)))
    });

    let arity = select! { Token::Tuple(n) => n };

    recursive(|ty| {
        let tuple = arity
            .clone()
            .then(
                ty.separated_by(just(Token::Comma))
                    .at_least(1)
                    .collect::<Vec<_>>()
                    .delimited_by(just(Token::Lt), just(Token::Gt)),
            )
            .try_map(|(n, fields): (usize, Vec<TypeDescriptor>), span| {
                if fields.len() != n {
                    return Err(Rich::custom(
                        span,
                        format!("Tuple{} declares {} fields", n, fields.len()),
                    ));
                }
                TypeDescriptor::composite(fields).map_err(|e| Rich::custom(span, e.to_string()))
            });

        let repeated = arity
            .clone()
            .then_ignore(just(Token::PathSep))
            .then(scalar.clone())
            .try_map(|(n, kind), span| {
                TypeDescriptor::uniform(kind, n).map_err(|e| Rich::custom(span, e.to_string()))
            });

        tuple
            .or(repeated)
            .or(scalar.clone().map(TypeDescriptor::Scalar))
    })
    .then_ignore(end())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(k: ScalarKind) -> TypeDescriptor {
        TypeDescriptor::Scalar(k)
    }

    fn assert_malformed(source: &str) {
        match parse_type(source) {
            Err(TypeError::MalformedTypeGrammar { input, .. }) => assert_eq!(input, source),
            other => panic!("expected malformed grammar for {:?}, got {:?}", source, other),
        }
    }

    #[test]
    fn parses_listed_tuple() {
        let t = parse_type("Tuple2<Float,Float>").unwrap();
        assert_eq!(
            t,
            TypeDescriptor::Composite(vec![scalar(ScalarKind::Float), scalar(ScalarKind::Float)])
        );
    }

    #[test]
    fn parses_repeated_tuple() {
        let t = parse_type("Tuple3::Integer").unwrap();
        assert_eq!(t, TypeDescriptor::uniform(ScalarKind::Int, 3).unwrap());
    }

    #[test]
    fn parses_bare_scalar() {
        assert_eq!(parse_type("Character").unwrap(), scalar(ScalarKind::Char));
    }

    #[test]
    fn parses_nested_tuple_with_spaces() {
        let t = parse_type("Tuple2< Tuple2<Integer, Long>, Double >").unwrap();
        assert_eq!(t.arity(), 2);
        assert_eq!(t.fields()[0].arity(), 2);
        assert_eq!(t.to_string(), "Tuple2<Tuple2<Integer,Long>,Double>");
    }

    #[test]
    fn parses_max_arity() {
        let t = parse_type("Tuple11::Short").unwrap();
        assert_eq!(t.arity(), 11);
    }

    #[test]
    fn display_roundtrips_through_parser() {
        let t = parse_type("Tuple3<Byte,Boolean,Double>").unwrap();
        assert_eq!(t.to_string().parse::<TypeDescriptor>().unwrap(), t);
    }

    #[test]
    fn rejects_arity_mismatch() {
        assert_malformed("Tuple3<Float,Float>");
    }

    #[test]
    fn rejects_arity_out_of_range() {
        assert_malformed("Tuple12::Float");
        assert_malformed("Tuple0::Float");
    }

    #[test]
    fn rejects_unknown_type_name() {
        assert_malformed("Tuple2<Float,String>");
    }

    #[test]
    fn rejects_garbage() {
        assert_malformed("");
        assert_malformed("Tuple2<Float,Float");
        assert_malformed("Tuple2<Float;Float>");
        assert_malformed("Float Float");
    }
}

//! Nom parser for policy source
//!
//! Produces a raw [`Module`]. No shape rules are applied here: a module with
//! two classes, a class with three bases, or a stray `(import os)` form all
//! parse successfully and are rejected later by the validator with a
//! specific reason.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{alpha1, alphanumeric1, char, digit1, multispace0, multispace1, one_of},
    combinator::{all_consuming, cut, map, opt, recognize, value},
    error::{context, ErrorKind, ParseError as _, VerboseError, VerboseErrorKind},
    multi::{many0, many1},
    sequence::{pair, preceded},
    IResult,
};
use thiserror::Error;

use crate::ast::*;

type Res<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

/// Hard bound on bracket nesting. The parser is recursive descent, so this
/// is checked on the raw text before any combinator runs.
pub const MAX_NESTING: usize = 48;

/// Syntax error with a rendered nom trace
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("syntax error at offset {offset}: {message}")]
pub struct ParseError {
    pub offset: usize,
    pub message: String,
}

// ============================================================================
// Public API
// ============================================================================

/// Parse a complete policy module from source text
pub fn parse_module(input: &str) -> Result<Module, ParseError> {
    check_nesting(input)?;
    match all_consuming(|i| module(i, input))(input) {
        Ok((_, module)) => Ok(module),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            let offset = e
                .errors
                .first()
                .map(|(rest, _)| input.len() - rest.len())
                .unwrap_or(0);
            Err(ParseError {
                offset,
                message: nom::error::convert_error(input, e),
            })
        }
        Err(nom::Err::Incomplete(_)) => Err(ParseError {
            offset: input.len(),
            message: "incomplete input".to_string(),
        }),
    }
}

/// Parse a single value or expression (tests and the CLI use this)
pub fn parse_expression(input: &str) -> Result<Node, ParseError> {
    let trimmed = input.trim();
    check_nesting(trimmed)?;
    match all_consuming(|i| node(i, trimmed))(trimmed) {
        Ok((_, node)) => Ok(node),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(ParseError {
            offset: e
                .errors
                .first()
                .map(|(rest, _)| trimmed.len() - rest.len())
                .unwrap_or(0),
            message: nom::error::convert_error(trimmed, e),
        }),
        Err(nom::Err::Incomplete(_)) => Err(ParseError {
            offset: trimmed.len(),
            message: "incomplete input".to_string(),
        }),
    }
}

/// Reject text nested deeper than [`MAX_NESTING`]. Strings and comments
/// are skipped; unbalanced brackets are left for the parser to report.
pub fn check_nesting(input: &str) -> Result<(), ParseError> {
    let mut depth = 0usize;
    let mut chars = input.char_indices().peekable();
    while let Some((offset, c)) = chars.next() {
        match c {
            '"' => {
                while let Some((_, c)) = chars.next() {
                    match c {
                        '\\' => {
                            chars.next();
                        }
                        '"' => break,
                        _ => {}
                    }
                }
            }
            ';' if matches!(chars.peek(), Some((_, ';'))) => {
                for (_, c) in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '(' | '[' | '{' => {
                depth += 1;
                if depth > MAX_NESTING {
                    return Err(ParseError {
                        offset,
                        message: format!("nesting deeper than {MAX_NESTING} levels"),
                    });
                }
            }
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    Ok(())
}

// ============================================================================
// Module structure
// ============================================================================

fn module<'a>(input: &'a str, original: &'a str) -> Res<'a, Module> {
    let (input, _) = multispace0(input)?;
    let (input, items) = many0(|i| item(i, original))(input)?;
    let (input, _) = multispace0(input)?;
    Ok((input, Module { items }))
}

fn item<'a>(input: &'a str, original: &'a str) -> Res<'a, Item> {
    let (input, _) = multispace0(input)?;
    alt((
        map(comment, Item::Comment),
        map(|i| class_def(i, original), Item::Class),
        map(|i| call(i, original), Item::Form),
    ))(input)
}

fn comment(input: &str) -> Res<'_, String> {
    let (input, _) = tag(";;")(input)?;
    let (input, text) = take_while(|c| c != '\n')(input)?;
    let (input, _) = opt(char('\n'))(input)?;
    Ok((input, text.trim().to_string()))
}

/// Whitespace and comments inside a form
fn sp(input: &str) -> Res<'_, ()> {
    value((), many0(alt((multispace1, recognize(comment)))))(input)
}

// ============================================================================
// Class definitions
// ============================================================================

fn class_def<'a>(input: &'a str, original: &'a str) -> Res<'a, ClassDef> {
    let start = original.len() - input.len();
    let (input, decorations) = many0(|i| decorated(i, original))(input)?;

    let (input, _) = char('(')(input)?;
    let (input, _) = multispace0(input)?;
    let (input, _) = tag("class")(input)?;
    let (input, _) = multispace1(input)?;

    let (input, name) = cut(context("class name", identifier))(input)?;
    let (input, _) = sp(input)?;
    let (input, bases) = cut(context("base list", base_list))(input)?;
    let (input, members) = many0(|i| member(i, original))(input)?;
    let (input, _) = sp(input)?;
    let (input, _) = cut(context("closing parenthesis", char(')')))(input)?;

    let end = original.len() - input.len();
    Ok((
        input,
        ClassDef {
            name: name.to_string(),
            bases,
            decorations,
            members,
            span: Span::new(start, end),
        },
    ))
}

fn decorated<'a>(input: &'a str, original: &'a str) -> Res<'a, Decoration> {
    let (input, d) = decoration(input, original)?;
    let (input, _) = sp(input)?;
    Ok((input, d))
}

fn decoration<'a>(input: &'a str, original: &'a str) -> Res<'a, Decoration> {
    let (input, _) = tag("#(")(input)?;
    let (input, _) = multispace0(input)?;
    let (input, name) = cut(context("decoration name", identifier))(input)?;
    let (input, arguments) = many0(|i| decoration_arg(i, original))(input)?;
    let (input, _) = sp(input)?;
    let (input, _) = cut(context("closing parenthesis", char(')')))(input)?;
    Ok((
        input,
        Decoration {
            name: name.to_string(),
            arguments,
        },
    ))
}

fn decoration_arg<'a>(input: &'a str, original: &'a str) -> Res<'a, (String, Node)> {
    let (input, _) = sp(input)?;
    let (input, key) = keyword(input)?;
    let (input, _) = multispace1(input)?;
    let (input, val) = cut(context("decoration value", |i| node(i, original)))(input)?;
    Ok((input, (key, val)))
}

fn base_list(input: &str) -> Res<'_, Vec<String>> {
    let (input, _) = char('[')(input)?;
    let (input, _) = multispace0(input)?;
    let (input, bases) = many0(base_name)(input)?;
    let (input, _) = cut(context("closing bracket", char(']')))(input)?;
    Ok((input, bases))
}

fn base_name(input: &str) -> Res<'_, String> {
    let (input, base) = identifier(input)?;
    let (input, _) = multispace0(input)?;
    let (input, _) = opt(pair(char(','), multispace0))(input)?;
    Ok((input, base.to_string()))
}

fn member<'a>(input: &'a str, original: &'a str) -> Res<'a, Member> {
    let (input, _) = sp(input)?;
    let start = original.len() - input.len();
    let (input, key) = keyword(input)?;
    let (input, _) = cut(multispace1)(input)?;
    let (input, val) = cut(context("member value", |i| node(i, original)))(input)?;
    let end = original.len() - input.len();
    Ok((
        input,
        Member {
            key,
            value: val,
            span: Span::new(start, end),
        },
    ))
}

fn keyword(input: &str) -> Res<'_, String> {
    let (input, _) = char(':')(input)?;
    let (input, name) = identifier(input)?;
    Ok((input, name.to_string()))
}

fn identifier(input: &str) -> Res<'_, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_"), tag("-")))),
    ))(input)
}

fn operator(input: &str) -> Res<'_, &str> {
    alt((identifier, recognize(many1(one_of("+-*/%<>=!")))))(input)
}

// ============================================================================
// Values
// ============================================================================

fn node<'a>(input: &'a str, original: &'a str) -> Res<'a, Node> {
    alt((
        |i| symbol_ref(i, original),
        map(string_literal, |s| Node::Literal(Literal::String(s))),
        map(integer_literal, |n| Node::Literal(Literal::Integer(n))),
        |i| list(i, original),
        |i| map_literal(i, original),
        |i| call(i, original),
        word,
    ))(input)
}

/// Bare word: `true`, `false`, `nil`, or an identifier
fn word(input: &str) -> Res<'_, Node> {
    let (input, w) = identifier(input)?;
    let node = match w {
        "true" => Node::Literal(Literal::Boolean(true)),
        "false" => Node::Literal(Literal::Boolean(false)),
        "nil" => Node::Literal(Literal::Nil),
        other => Node::Ident(other.to_string()),
    };
    Ok((input, node))
}

fn symbol_ref<'a>(input: &'a str, original: &'a str) -> Res<'a, Node> {
    let start = original.len() - input.len();
    let (input, _) = char('@')(input)?;
    let (input, name) = cut(context("symbol name", identifier))(input)?;
    let end = original.len() - input.len();
    Ok((
        input,
        Node::SymbolRef {
            name: name.to_string(),
            span: Span::new(start, end),
        },
    ))
}

fn failure<'a>(input: &'a str, message: &'static str) -> nom::Err<VerboseError<&'a str>> {
    nom::Err::Failure(VerboseError {
        errors: vec![(input, VerboseErrorKind::Context(message))],
    })
}

// Hand-rolled so that "" parses; escaped_transform rejects empty bodies.
fn string_literal(input: &str) -> Res<'_, String> {
    let (mut rest, _) = char('"')(input)?;
    let mut out = String::new();
    loop {
        let mut chars = rest.chars();
        match chars.next() {
            None => return Err(failure(rest, "unterminated string")),
            Some('"') => return Ok((chars.as_str(), out)),
            Some('\\') => match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some('\\') => out.push('\\'),
                Some('"') => out.push('"'),
                _ => return Err(failure(rest, "invalid escape sequence")),
            },
            Some(c) => out.push(c),
        }
        rest = chars.as_str();
    }
}

fn integer_literal(input: &str) -> Res<'_, i64> {
    let (rest, digits) = recognize(pair(opt(char('-')), digit1))(input)?;
    match digits.parse::<i64>() {
        Ok(n) => Ok((rest, n)),
        Err(_) => Err(nom::Err::Failure(VerboseError::from_error_kind(
            input,
            ErrorKind::Digit,
        ))),
    }
}

fn list<'a>(input: &'a str, original: &'a str) -> Res<'a, Node> {
    let start = original.len() - input.len();
    let (input, _) = char('[')(input)?;
    let (input, items) = many0(|i| list_item(i, original))(input)?;
    let (input, _) = sp(input)?;
    let (input, _) = cut(context("closing bracket", char(']')))(input)?;
    let end = original.len() - input.len();
    Ok((
        input,
        Node::List {
            items,
            span: Span::new(start, end),
        },
    ))
}

fn list_item<'a>(input: &'a str, original: &'a str) -> Res<'a, Node> {
    let (input, _) = sp(input)?;
    let (input, item) = node(input, original)?;
    let (input, _) = opt(preceded(multispace0, char(',')))(input)?;
    Ok((input, item))
}

fn map_literal<'a>(input: &'a str, original: &'a str) -> Res<'a, Node> {
    let start = original.len() - input.len();
    let (input, _) = char('{')(input)?;
    let (input, entries) = many0(|i| map_entry(i, original))(input)?;
    let (input, _) = sp(input)?;
    let (input, _) = cut(context("closing brace", char('}')))(input)?;
    let end = original.len() - input.len();
    Ok((
        input,
        Node::Map {
            entries,
            span: Span::new(start, end),
        },
    ))
}

fn map_entry<'a>(input: &'a str, original: &'a str) -> Res<'a, (String, Node)> {
    let (input, _) = sp(input)?;
    let (input, key) = keyword(input)?;
    let (input, _) = cut(multispace1)(input)?;
    let (input, val) = cut(context("map value", |i| node(i, original)))(input)?;
    Ok((input, (key, val)))
}

fn call_arg<'a>(input: &'a str, original: &'a str) -> Res<'a, Node> {
    let (input, _) = sp(input)?;
    node(input, original)
}

fn call<'a>(input: &'a str, original: &'a str) -> Res<'a, Node> {
    let start = original.len() - input.len();
    let (input, _) = char('(')(input)?;
    let (input, _) = multispace0(input)?;
    let (input, op) = operator(input)?;
    let (input, args) = many0(|i| call_arg(i, original))(input)?;
    let (input, _) = sp(input)?;
    let (input, _) = cut(context("closing parenthesis", char(')')))(input)?;
    let end = original.len() - input.len();
    Ok((
        input,
        Node::Call {
            op: op.to_string(),
            args,
            span: Span::new(start, end),
        },
    ))
}

// ============================================================================
// Tests
// ============================================================================

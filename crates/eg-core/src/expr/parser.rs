use winnow::ascii::multispace0;
use winnow::combinator::{alt, cut_err, opt, separated};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::prelude::*;
use winnow::token::{literal, take_while};

use super::ast::{BinOp, Expr};

// ---------------------------------------------------------------------------
// Public entry
// ---------------------------------------------------------------------------

/// Parse one complete expression; trailing input is an error.
pub fn parse_expression(src: &str) -> Result<Expr, String> {
    let mut input = src;
    ws_skip
        .parse_next(&mut input)
        .map_err(|e| format!("parse error in {src:?}: {e}"))?;
    let expr = parse_expr(&mut input).map_err(|e| format!("parse error in {src:?}: {e}"))?;
    ws_skip
        .parse_next(&mut input)
        .map_err(|e| format!("parse error in {src:?}: {e}"))?;
    if !input.is_empty() {
        return Err(format!("trailing input {input:?} in expression {src:?}"));
    }
    Ok(expr)
}

pub(super) fn parse_expr(input: &mut &str) -> ModalResult<Expr> {
    or_expr.parse_next(input)
}

// ---------------------------------------------------------------------------
// Precedence levels (lowest to highest)
// ---------------------------------------------------------------------------

/// `or_expr = and_expr { ("||" | "or") and_expr }`
fn or_expr(input: &mut &str) -> ModalResult<Expr> {
    let mut left = and_expr.parse_next(input)?;
    loop {
        ws_skip.parse_next(input)?;
        let found = opt(alt((literal("||").void(), kw("or")))).parse_next(input)?;
        if found.is_some() {
            ws_skip.parse_next(input)?;
            let right = cut_err(and_expr).parse_next(input)?;
            left = Expr::BinOp {
                op: BinOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        } else {
            break;
        }
    }
    Ok(left)
}

/// `and_expr = not_expr { ("&&" | "and") not_expr }`
fn and_expr(input: &mut &str) -> ModalResult<Expr> {
    let mut left = not_expr.parse_next(input)?;
    loop {
        ws_skip.parse_next(input)?;
        let found = opt(alt((literal("&&").void(), kw("and")))).parse_next(input)?;
        if found.is_some() {
            ws_skip.parse_next(input)?;
            let right = cut_err(not_expr).parse_next(input)?;
            left = Expr::BinOp {
                op: BinOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        } else {
            break;
        }
    }
    Ok(left)
}

/// `not_expr = ("!" | "not") not_expr | cmp_expr`
fn not_expr(input: &mut &str) -> ModalResult<Expr> {
    ws_skip.parse_next(input)?;
    let found = opt(alt((literal("!").void(), kw("not")))).parse_next(input)?;
    if found.is_some() {
        ws_skip.parse_next(input)?;
        let inner = cut_err(not_expr).parse_next(input)?;
        Ok(Expr::Not(Box::new(inner)))
    } else {
        cmp_expr.parse_next(input)
    }
}

/// `cmp_expr = add_expr [cmp_op add_expr | ["not"] "in" "(" list ")"]`
fn cmp_expr(input: &mut &str) -> ModalResult<Expr> {
    let left = add_expr.parse_next(input)?;
    ws_skip.parse_next(input)?;

    if opt((kw("not"), ws_skip, kw("in"))).parse_next(input)?.is_some() {
        ws_skip.parse_next(input)?;
        let list = in_list.parse_next(input)?;
        return Ok(Expr::InList {
            expr: Box::new(left),
            list,
            negated: true,
        });
    }

    if opt(kw("in")).parse_next(input)?.is_some() {
        ws_skip.parse_next(input)?;
        let list = in_list.parse_next(input)?;
        return Ok(Expr::InList {
            expr: Box::new(left),
            list,
            negated: false,
        });
    }

    if let Some(op) = opt(cmp_op).parse_next(input)? {
        ws_skip.parse_next(input)?;
        let right = cut_err(add_expr).parse_next(input)?;
        return Ok(Expr::BinOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        });
    }

    Ok(left)
}

fn in_list(input: &mut &str) -> ModalResult<Vec<Expr>> {
    cut_err(literal("(")).parse_next(input)?;
    ws_skip.parse_next(input)?;
    let list: Vec<Expr> =
        separated(1.., (ws_skip, parse_expr).map(|(_, e)| e), literal(",")).parse_next(input)?;
    ws_skip.parse_next(input)?;
    cut_err(literal(")")).parse_next(input)?;
    Ok(list)
}

fn cmp_op(input: &mut &str) -> ModalResult<BinOp> {
    alt((
        literal("==").value(BinOp::Eq),
        literal("!=").value(BinOp::Ne),
        literal("<=").value(BinOp::Le),
        literal(">=").value(BinOp::Ge),
        literal("<").value(BinOp::Lt),
        literal(">").value(BinOp::Gt),
    ))
    .parse_next(input)
}

/// `add_expr = mul_expr { ("+" | "-") mul_expr }`
fn add_expr(input: &mut &str) -> ModalResult<Expr> {
    let mut left = mul_expr.parse_next(input)?;
    loop {
        ws_skip.parse_next(input)?;
        let op = opt(alt((
            literal("+").value(BinOp::Add),
            literal("-").value(BinOp::Sub),
        )))
        .parse_next(input)?;
        if let Some(op) = op {
            ws_skip.parse_next(input)?;
            let right = cut_err(mul_expr).parse_next(input)?;
            left = Expr::BinOp {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        } else {
            break;
        }
    }
    Ok(left)
}

/// `mul_expr = unary_expr { ("*" | "/" | "%") unary_expr }`
fn mul_expr(input: &mut &str) -> ModalResult<Expr> {
    let mut left = unary_expr.parse_next(input)?;
    loop {
        ws_skip.parse_next(input)?;
        let op = opt(alt((
            literal("*").value(BinOp::Mul),
            literal("/").value(BinOp::Div),
            literal("%").value(BinOp::Mod),
        )))
        .parse_next(input)?;
        if let Some(op) = op {
            ws_skip.parse_next(input)?;
            let right = cut_err(unary_expr).parse_next(input)?;
            left = Expr::BinOp {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        } else {
            break;
        }
    }
    Ok(left)
}

/// `unary_expr = ["-"] primary`
fn unary_expr(input: &mut &str) -> ModalResult<Expr> {
    if opt(literal("-")).parse_next(input)?.is_some() {
        ws_skip.parse_next(input)?;
        let inner = primary.parse_next(input)?;
        Ok(Expr::Neg(Box::new(inner)))
    } else {
        primary.parse_next(input)
    }
}

// ---------------------------------------------------------------------------
// Primary
// ---------------------------------------------------------------------------

fn primary(input: &mut &str) -> ModalResult<Expr> {
    ws_skip.parse_next(input)?;
    alt((
        number_literal.map(Expr::Number),
        quoted_string.map(Expr::StringLit),
        kw("true").map(|_| Expr::Bool(true)),
        kw("false").map(|_| Expr::Bool(false)),
        paren_expr,
        ident_primary,
    ))
    .context(StrContext::Expected(StrContextValue::Description(
        "expression",
    )))
    .parse_next(input)
}

fn paren_expr(input: &mut &str) -> ModalResult<Expr> {
    literal("(").parse_next(input)?;
    ws_skip.parse_next(input)?;
    let inner = cut_err(parse_expr).parse_next(input)?;
    ws_skip.parse_next(input)?;
    cut_err(literal(")")).parse_next(input)?;
    Ok(inner)
}

/// Parse an ident-based primary: function call or dotted field reference.
fn ident_primary(input: &mut &str) -> ModalResult<Expr> {
    let first = ident.parse_next(input)?;
    ws_skip.parse_next(input)?;

    // first( ... ) → function call
    if opt(literal("(")).parse_next(input)?.is_some() {
        return func_call_args(first.to_string(), input);
    }

    // first.second.third → dotted field path
    let mut path = first.to_string();
    while opt(literal(".")).parse_next(input)?.is_some() {
        let segment = cut_err(ident).parse_next(input)?;
        path.push('.');
        path.push_str(segment);
    }
    Ok(Expr::Field(path))
}

fn func_call_args(name: String, input: &mut &str) -> ModalResult<Expr> {
    ws_skip.parse_next(input)?;
    if opt(literal(")")).parse_next(input)?.is_some() {
        return Ok(Expr::FuncCall { name, args: vec![] });
    }

    let args: Vec<Expr> =
        separated(1.., (ws_skip, parse_expr).map(|(_, e)| e), literal(",")).parse_next(input)?;
    ws_skip.parse_next(input)?;
    cut_err(literal(")")).parse_next(input)?;

    Ok(Expr::FuncCall { name, args })
}

// ---------------------------------------------------------------------------
// Lexical helpers
// ---------------------------------------------------------------------------

pub(super) fn ident<'a>(input: &mut &'a str) -> ModalResult<&'a str> {
    // First character must be alphabetic or underscore (not digit).
    if !input.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
        return Err(ErrMode::Backtrack(ContextError::new()));
    }
    take_while(1.., |c: char| c.is_ascii_alphanumeric() || c == '_').parse_next(input)
}

pub(super) fn quoted_string(input: &mut &str) -> ModalResult<String> {
    let quote = alt((literal("\""), literal("'"))).parse_next(input)?;
    let end = quote.chars().next().unwrap_or('"');
    let content = take_while(0.., move |c: char| c != end).parse_next(input)?;
    cut_err(literal(quote))
        .context(StrContext::Expected(StrContextValue::Description(
            "closing quote",
        )))
        .parse_next(input)?;
    Ok(content.to_string())
}

pub(super) fn ws_skip(input: &mut &str) -> ModalResult<()> {
    multispace0.parse_next(input)?;
    Ok(())
}

/// Match an exact keyword, ensuring it is not a prefix of a longer
/// identifier.
pub(super) fn kw<'a>(keyword: &'static str) -> impl FnMut(&mut &'a str) -> ModalResult<()> {
    move |input: &mut &'a str| {
        let saved = *input;
        literal(keyword).parse_next(input)?;
        if input.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_') {
            *input = saved;
            return Err(ErrMode::Backtrack(ContextError::new()));
        }
        Ok(())
    }
}

/// Parse a number literal: integer or float.
pub(super) fn number_literal(input: &mut &str) -> ModalResult<f64> {
    let integer_part = take_while(1.., |c: char| c.is_ascii_digit()).parse_next(input)?;
    let has_dot = opt(literal(".")).parse_next(input)?.is_some();
    if has_dot {
        let frac_part = take_while(1.., |c: char| c.is_ascii_digit())
            .context(StrContext::Expected(StrContextValue::Description(
                "digits after decimal point",
            )))
            .parse_next(input)?;
        let s = format!("{integer_part}.{frac_part}");
        s.parse().map_err(|_| ErrMode::Cut(ContextError::new()))
    } else {
        integer_part
            .parse()
            .map_err(|_| ErrMode::Cut(ContextError::new()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Restricted expression evaluator for decision-table input expressions.
//!
//! Fixed grammar: decimal/string/bool/list literals, identifiers resolved
//! against an explicit scope map, unary minus, `+ - * /` arithmetic,
//! comparison operators, and `in` / `not in` membership tests. No host-code
//! execution, no attribute access, no function calls.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{alpha1, alphanumeric1, char, digit1, multispace0, multispace1},
    combinator::{all_consuming, map, map_res, opt, recognize, value},
    error::VerboseError,
    multi::{many0, separated_list0},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;

use super::value::{compare, RuleOperator, RuleValue, ValueError};

type ParseResult<'a, O> = IResult<&'a str, O, VerboseError<&'a str>>;

/// Parsed expression tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(RuleValue),
    List(Vec<Expr>),
    Var(String),
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Compare(RuleOperator),
}

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),
    #[error("type error: {0}")]
    TypeError(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error(transparent)]
    Value(#[from] ValueError),
}

/// Parse an expression from source text.
pub fn parse(input: &str) -> Result<Expr, ExprError> {
    match all_consuming(delimited(multispace0, expression, multispace0))(input) {
        Ok((_, expr)) => Ok(expr),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            Err(ExprError::Parse(nom::error::convert_error(input, e)))
        }
        Err(nom::Err::Incomplete(_)) => Err(ExprError::Parse("incomplete input".to_string())),
    }
}

/// Parse and evaluate `source` against the given variable scope.
pub fn evaluate(
    source: &str,
    scope: &HashMap<String, serde_json::Value>,
) -> Result<RuleValue, ExprError> {
    eval(&parse(source)?, scope)
}

/// Evaluate a parsed expression against the given variable scope.
pub fn eval(
    expr: &Expr,
    scope: &HashMap<String, serde_json::Value>,
) -> Result<RuleValue, ExprError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::List(items) => {
            let values: Result<Vec<_>, _> = items.iter().map(|e| eval(e, scope)).collect();
            Ok(RuleValue::List(values?))
        }
        Expr::Var(name) => {
            let json = scope
                .get(name)
                .ok_or_else(|| ExprError::UnknownVariable(name.clone()))?;
            Ok(RuleValue::try_from(json)?)
        }
        Expr::Neg(inner) => match eval(inner, scope)? {
            RuleValue::Decimal(d) => Ok(RuleValue::Decimal(-d)),
            other => Err(ExprError::TypeError(format!(
                "cannot negate {}",
                other.type_name()
            ))),
        },
        Expr::Binary { op, left, right } => {
            let lhs = eval(left, scope)?;
            let rhs = eval(right, scope)?;
            match op {
                BinaryOp::Compare(operator) => {
                    Ok(RuleValue::Bool(compare(*operator, &lhs, &rhs)?))
                }
                BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                    let (RuleValue::Decimal(a), RuleValue::Decimal(b)) = (&lhs, &rhs) else {
                        return Err(ExprError::TypeError(format!(
                            "arithmetic requires decimals, got {} and {}",
                            lhs.type_name(),
                            rhs.type_name()
                        )));
                    };
                    let result = match op {
                        BinaryOp::Add => *a + *b,
                        BinaryOp::Sub => *a - *b,
                        BinaryOp::Mul => *a * *b,
                        BinaryOp::Div => {
                            if b.is_zero() {
                                return Err(ExprError::DivisionByZero);
                            }
                            *a / *b
                        }
                        BinaryOp::Compare(_) => unreachable!(),
                    };
                    Ok(RuleValue::Decimal(result))
                }
            }
        }
    }
}

// ── Grammar ───────────────────────────────────────────────────
//
//   expression     = additive (cmp_op additive)?
//   additive       = multiplicative (('+' | '-') multiplicative)*
//   multiplicative = unary (('*' | '/') unary)*
//   unary          = '-' unary | atom
//   atom           = number | string | bool | list | ident | '(' expression ')'

fn expression(input: &str) -> ParseResult<'_, Expr> {
    let (input, left) = additive(input)?;
    let (input, tail) = opt(pair(preceded(multispace0, comparison_op), additive))(input)?;
    match tail {
        Some((op, right)) => Ok((
            input,
            Expr::Binary {
                op: BinaryOp::Compare(op),
                left: Box::new(left),
                right: Box::new(right),
            },
        )),
        None => Ok((input, left)),
    }
}

fn comparison_op(input: &str) -> ParseResult<'_, RuleOperator> {
    alt((
        value(RuleOperator::Le, tag("<=")),
        value(RuleOperator::Ge, tag(">=")),
        value(RuleOperator::Eq, tag("==")),
        value(RuleOperator::Ne, tag("!=")),
        value(RuleOperator::Lt, char('<')),
        value(RuleOperator::Gt, char('>')),
        value(
            RuleOperator::NotIn,
            tuple((tag("not"), multispace1, tag("in"), multispace1)),
        ),
        value(RuleOperator::In, terminated(tag("in"), multispace1)),
    ))(input)
}

fn additive(input: &str) -> ParseResult<'_, Expr> {
    let (input, first) = multiplicative(input)?;
    let (input, rest) = many0(pair(
        preceded(multispace0, alt((char('+'), char('-')))),
        multiplicative,
    ))(input)?;
    Ok((input, fold_binary(first, rest)))
}

fn multiplicative(input: &str) -> ParseResult<'_, Expr> {
    let (input, first) = unary(input)?;
    let (input, rest) = many0(pair(
        preceded(multispace0, alt((char('*'), char('/')))),
        unary,
    ))(input)?;
    Ok((input, fold_binary(first, rest)))
}

fn fold_binary(first: Expr, rest: Vec<(char, Expr)>) -> Expr {
    rest.into_iter().fold(first, |left, (op, right)| {
        let op = match op {
            '+' => BinaryOp::Add,
            '-' => BinaryOp::Sub,
            '*' => BinaryOp::Mul,
            _ => BinaryOp::Div,
        };
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    })
}

fn unary(input: &str) -> ParseResult<'_, Expr> {
    let (input, _) = multispace0(input)?;
    match opt(char('-'))(input)? {
        (input, Some(_)) => {
            let (input, inner) = unary(input)?;
            Ok((input, Expr::Neg(Box::new(inner))))
        }
        (input, None) => atom(input),
    }
}

fn atom(input: &str) -> ParseResult<'_, Expr> {
    let (input, _) = multispace0(input)?;
    alt((
        number_literal,
        string_literal,
        list_literal,
        identifier_expr,
        bool_literal,
        delimited(
            char('('),
            delimited(multispace0, expression, multispace0),
            char(')'),
        ),
    ))(input)
}

fn number_literal(input: &str) -> ParseResult<'_, Expr> {
    map_res(
        recognize(pair(digit1, opt(pair(char('.'), digit1)))),
        |text: &str| {
            Decimal::from_str(text).map(|d| Expr::Literal(RuleValue::Decimal(d)))
        },
    )(input)
}

fn string_literal(input: &str) -> ParseResult<'_, Expr> {
    // No escape sequences — the grammar is deliberately small.
    let single = delimited(char('\''), take_while(|c| c != '\''), char('\''));
    let double = delimited(char('"'), take_while(|c| c != '"'), char('"'));
    map(alt((single, double)), |text: &str| {
        Expr::Literal(RuleValue::Text(text.to_string()))
    })(input)
}

fn bool_literal(input: &str) -> ParseResult<'_, Expr> {
    alt((
        value(Expr::Literal(RuleValue::Bool(true)), tag("true")),
        value(Expr::Literal(RuleValue::Bool(false)), tag("false")),
    ))(input)
}

fn list_literal(input: &str) -> ParseResult<'_, Expr> {
    map(
        delimited(
            char('['),
            separated_list0(preceded(multispace0, char(',')), expression),
            preceded(multispace0, char(']')),
        ),
        Expr::List,
    )(input)
}

fn identifier_expr(input: &str) -> ParseResult<'_, Expr> {
    let (rest, name) = identifier(input)?;
    if matches!(name, "true" | "false" | "in" | "not") {
        return Err(nom::Err::Error(nom::error::VerboseError {
            errors: vec![(input, nom::error::VerboseErrorKind::Context("identifier"))],
        }));
    }
    Ok((rest, Expr::Var(name.to_string())))
}

fn identifier(input: &str) -> ParseResult<'_, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_")))),
    ))(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope(entries: &[(&str, serde_json::Value)]) -> HashMap<String, serde_json::Value> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn dec(s: &str) -> RuleValue {
        RuleValue::Decimal(Decimal::from_str(s).unwrap())
    }

    #[test]
    fn arithmetic_precedence() {
        let empty = HashMap::new();
        assert_eq!(evaluate("1 + 2 * 3", &empty).unwrap(), dec("7"));
        assert_eq!(evaluate("(1 + 2) * 3", &empty).unwrap(), dec("9"));
        assert_eq!(evaluate("10 / 4", &empty).unwrap(), dec("2.5"));
        assert_eq!(evaluate("-2 + 5", &empty).unwrap(), dec("3"));
    }

    #[test]
    fn exact_decimal_arithmetic() {
        let empty = HashMap::new();
        assert_eq!(
            evaluate("0.1 + 0.2 == 0.3", &empty).unwrap(),
            RuleValue::Bool(true)
        );
    }

    #[test]
    fn variables_resolve_from_scope() {
        let s = scope(&[("age", json!(20)), ("name", json!("bob"))]);
        assert_eq!(evaluate("age + 1", &s).unwrap(), dec("21"));
        assert_eq!(
            evaluate("name == 'bob'", &s).unwrap(),
            RuleValue::Bool(true)
        );
    }

    #[test]
    fn comparisons() {
        let s = scope(&[("age", json!(20))]);
        assert_eq!(evaluate("age >= 18", &s).unwrap(), RuleValue::Bool(true));
        assert_eq!(evaluate("age < 18", &s).unwrap(), RuleValue::Bool(false));
        assert_eq!(evaluate("age != 20", &s).unwrap(), RuleValue::Bool(false));
    }

    #[test]
    fn membership() {
        let s = scope(&[("color", json!("red"))]);
        assert_eq!(
            evaluate("color in ['red', 'blue']", &s).unwrap(),
            RuleValue::Bool(true)
        );
        assert_eq!(
            evaluate("color not in ['green']", &s).unwrap(),
            RuleValue::Bool(true)
        );
    }

    #[test]
    fn unknown_variable_is_an_error() {
        let empty = HashMap::new();
        let err = evaluate("age >= 18", &empty).unwrap_err();
        assert!(matches!(err, ExprError::UnknownVariable(name) if name == "age"));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let empty = HashMap::new();
        assert!(matches!(
            evaluate("1 / 0", &empty).unwrap_err(),
            ExprError::DivisionByZero
        ));
    }

    #[test]
    fn malformed_input_is_a_parse_error() {
        let empty = HashMap::new();
        assert!(matches!(
            evaluate("1 +", &empty).unwrap_err(),
            ExprError::Parse(_)
        ));
        assert!(matches!(
            evaluate("(1", &empty).unwrap_err(),
            ExprError::Parse(_)
        ));
    }

    #[test]
    fn arithmetic_on_text_is_a_type_error() {
        let empty = HashMap::new();
        assert!(matches!(
            evaluate("'a' + 'b'", &empty).unwrap_err(),
            ExprError::TypeError(_)
        ));
    }
}

//! Text expression evaluation.
//!
//! [`evaluate_expression`] runs a shunting-yard pass over numeric
//! operands with the operator ladder (loosest to tightest binding):
//!
//! ```text
//! + -   <   * / %   <   ^   <   comparisons   <   &&   <   ||
//! ```
//!
//! Parentheses group as usual. Identifiers resolve against the current
//! variables; unknown tokens are invalid-argument faults. Comparison
//! results are booleans, everything else stays numeric.

use crate::ScriptError;
use serde_json::Value;

/// A value on the evaluation stack.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Operand {
    Num(f64),
    Bool(bool),
}

impl Operand {
    fn as_num(self) -> Result<f64, ScriptError> {
        match self {
            Self::Num(n) => Ok(n),
            Self::Bool(b) => Ok(if b { 1.0 } else { 0.0 }),
        }
    }

    fn as_bool(self) -> Result<bool, ScriptError> {
        match self {
            Self::Bool(b) => Ok(b),
            Self::Num(n) => Ok(n != 0.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(&'static str),
    LeftParen,
    RightParen,
}

/// Binding strength; higher binds tighter.
fn precedence(op: &str) -> u8 {
    match op {
        "+" | "-" => 1,
        "*" | "/" | "%" => 2,
        "^" => 3,
        "<" | "<=" | ">" | ">=" | "==" | "!=" => 4,
        "&&" => 5,
        "||" => 6,
        _ => 0,
    }
}

fn right_associative(op: &str) -> bool {
    op == "^"
}

fn tokenize(text: &str) -> Result<Vec<Token>, ScriptError> {
    let mut tokens = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' | '$' => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.')
                {
                    i += 1;
                }
                let literal = &text[start..i];
                let number = literal.parse::<f64>().map_err(|_| {
                    ScriptError::InvalidArgument(format!("bad number literal: {literal}"))
                })?;
                tokens.push(Token::Number(number));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(text[start..i].to_string()));
            }
            '(' => {
                tokens.push(Token::LeftParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RightParen);
                i += 1;
            }
            '+' | '-' | '*' | '/' | '%' | '^' => {
                tokens.push(Token::Op(match c {
                    '+' => "+",
                    '-' => "-",
                    '*' => "*",
                    '/' => "/",
                    '%' => "%",
                    _ => "^",
                }));
                i += 1;
            }
            '<' | '>' | '=' | '!' => {
                let two = bytes.get(i + 1) == Some(&b'=');
                let op = match (c, two) {
                    ('<', true) => "<=",
                    ('<', false) => "<",
                    ('>', true) => ">=",
                    ('>', false) => ">",
                    ('=', true) => "==",
                    ('!', true) => "!=",
                    _ => {
                        return Err(ScriptError::InvalidArgument(format!(
                            "unexpected character '{c}' in expression: {text}"
                        )))
                    }
                };
                i += if two { 2 } else { 1 };
                tokens.push(Token::Op(op));
            }
            '&' | '|' => {
                if bytes.get(i + 1) != Some(&(c as u8)) {
                    return Err(ScriptError::InvalidArgument(format!(
                        "unexpected character '{c}' in expression: {text}"
                    )));
                }
                tokens.push(Token::Op(if c == '&' { "&&" } else { "||" }));
                i += 2;
            }
            _ => {
                return Err(ScriptError::InvalidArgument(format!(
                    "unexpected character '{c}' in expression: {text}"
                )))
            }
        }
    }
    Ok(tokens)
}

fn apply(op: &str, left: Operand, right: Operand) -> Result<Operand, ScriptError> {
    Ok(match op {
        "+" => Operand::Num(left.as_num()? + right.as_num()?),
        "-" => Operand::Num(left.as_num()? - right.as_num()?),
        "*" => Operand::Num(left.as_num()? * right.as_num()?),
        "/" => {
            let divisor = right.as_num()?;
            if divisor == 0.0 {
                return Err(ScriptError::DivisionByZero);
            }
            Operand::Num(left.as_num()? / divisor)
        }
        "%" => {
            let divisor = right.as_num()?;
            if divisor == 0.0 {
                return Err(ScriptError::DivisionByZero);
            }
            Operand::Num(left.as_num()? % divisor)
        }
        "^" => Operand::Num(left.as_num()?.powf(right.as_num()?)),
        "<" => Operand::Bool(left.as_num()? < right.as_num()?),
        "<=" => Operand::Bool(left.as_num()? <= right.as_num()?),
        ">" => Operand::Bool(left.as_num()? > right.as_num()?),
        ">=" => Operand::Bool(left.as_num()? >= right.as_num()?),
        "==" => Operand::Bool((left.as_num()? - right.as_num()?).abs() < f64::EPSILON),
        "!=" => Operand::Bool((left.as_num()? - right.as_num()?).abs() >= f64::EPSILON),
        "&&" => Operand::Bool(left.as_bool()? && right.as_bool()?),
        "||" => Operand::Bool(left.as_bool()? || right.as_bool()?),
        _ => {
            return Err(ScriptError::InvalidArgument(format!(
                "unknown operator: {op}"
            )))
        }
    })
}

/// Converts a numeric result back to JSON, preferring integers when
/// the value is integral.
#[must_use]
pub(crate) fn number_value(x: f64) -> Value {
    const SAFE_INT: f64 = 9_007_199_254_740_992.0;
    if x.is_finite() && x.fract() == 0.0 && x.abs() < SAFE_INT {
        Value::from(x as i64)
    } else {
        Value::from(x)
    }
}

/// Evaluates an expression string against the given variable resolver.
///
/// `$` characters are cosmetic variable markers and are skipped during
/// tokenization, so `"$x + 1"` and `"x + 1"` are equivalent.
///
/// # Errors
///
/// Unknown identifiers and malformed syntax are invalid-argument
/// faults; division by zero is a runtime fault.
pub fn evaluate_expression(
    text: &str,
    resolve: &dyn Fn(&str) -> Option<Value>,
) -> Result<Value, ScriptError> {
    let tokens = tokenize(text)?;
    if tokens.is_empty() {
        return Err(ScriptError::InvalidArgument(format!(
            "empty expression: {text:?}"
        )));
    }

    let mut output: Vec<Operand> = Vec::new();
    let mut ops: Vec<Token> = Vec::new();

    let pop_apply = |output: &mut Vec<Operand>, op: &str| -> Result<(), ScriptError> {
        let right = output.pop();
        let left = output.pop();
        let (Some(left), Some(right)) = (left, right) else {
            return Err(ScriptError::InvalidArgument(format!(
                "malformed expression: {text}"
            )));
        };
        output.push(apply(op, left, right)?);
        Ok(())
    };

    for token in tokens {
        match token {
            Token::Number(n) => output.push(Operand::Num(n)),
            Token::Ident(name) => {
                let value = resolve(&name)
                    .ok_or_else(|| ScriptError::VariableNotFound(name.clone()))?;
                let operand = match value {
                    Value::Number(n) => Operand::Num(n.as_f64().unwrap_or(0.0)),
                    Value::Bool(b) => Operand::Bool(b),
                    other => {
                        return Err(ScriptError::InvalidArgument(format!(
                            "variable {name} is not numeric: {other}"
                        )))
                    }
                };
                output.push(operand);
            }
            Token::Op(op) => {
                while let Some(&Token::Op(top)) = ops.last() {
                    let tighter = precedence(top) > precedence(op)
                        || (precedence(top) == precedence(op) && !right_associative(op));
                    if !tighter {
                        break;
                    }
                    ops.pop();
                    pop_apply(&mut output, top)?;
                }
                ops.push(Token::Op(op));
            }
            Token::LeftParen => ops.push(Token::LeftParen),
            Token::RightParen => loop {
                match ops.pop() {
                    Some(Token::Op(op)) => pop_apply(&mut output, op)?,
                    Some(Token::LeftParen) => break,
                    _ => {
                        return Err(ScriptError::InvalidArgument(format!(
                            "unbalanced parentheses: {text}"
                        )))
                    }
                }
            },
        }
    }

    while let Some(token) = ops.pop() {
        match token {
            Token::Op(op) => pop_apply(&mut output, op)?,
            _ => {
                return Err(ScriptError::InvalidArgument(format!(
                    "unbalanced parentheses: {text}"
                )))
            }
        }
    }

    match output.as_slice() {
        [Operand::Num(n)] => Ok(number_value(*n)),
        [Operand::Bool(b)] => Ok(Value::Bool(*b)),
        _ => Err(ScriptError::InvalidArgument(format!(
            "malformed expression: {text}"
        ))),
    }
}

//! Arithmetic expression evaluation for `assign` right-hand sides.
//!
//! Supports `+ - * / % **` with unary `+ -`, standard precedence,
//! left-to-right associativity (`**` right-associative). `/` is always
//! floating-point division; `%` takes the dividend's sign. Division or modulo
//! by zero is an evaluation error.

use serde_json::{Number, Value};

use crate::error::{ErrorKind, VmError};

/// Numeric intermediate: integer arithmetic stays exact until an operation
/// forces a float.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }

    fn is_zero(self) -> bool {
        match self {
            Num::Int(i) => i == 0,
            Num::Float(f) => f == 0.0,
        }
    }

    fn into_value(self) -> Result<Value, EvalErr> {
        match self {
            Num::Int(i) => Ok(Value::Number(Number::from(i))),
            Num::Float(f) => Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| eval_error("expression produced a non-finite number")),
        }
    }
}

fn eval_error(message: impl Into<String>) -> EvalErr {
    EvalErr::Eval(VmError::new(ErrorKind::ToolFailed, message))
}

/// Internal split between "not an expression after all" (the caller stores
/// the string verbatim) and a genuine evaluation failure.
#[derive(Debug)]
enum EvalErr {
    NotAnExpression,
    Eval(VmError),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Num),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    DoubleStar,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    tokens.push(Token::DoubleStar);
                    i += 2;
                } else {
                    tokens.push(Token::Star);
                    i += 1;
                }
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                let mut seen_dot = false;
                let mut seen_exp = false;
                while i < chars.len() {
                    let d = chars[i];
                    if d.is_ascii_digit() {
                        i += 1;
                    } else if d == '.' && !seen_dot && !seen_exp {
                        seen_dot = true;
                        i += 1;
                    } else if (d == 'e' || d == 'E') && !seen_exp && i > start {
                        seen_exp = true;
                        i += 1;
                        if matches!(chars.get(i), Some('+') | Some('-')) {
                            i += 1;
                        }
                    } else {
                        break;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let num = if seen_dot || seen_exp {
                    Num::Float(text.parse::<f64>().ok()?)
                } else {
                    match text.parse::<i64>() {
                        Ok(v) => Num::Int(v),
                        Err(_) => Num::Float(text.parse::<f64>().ok()?),
                    }
                };
                tokens.push(Token::Number(num));
            }
            _ => return None,
        }
    }
    Some(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    // additive := multiplicative (("+" | "-") multiplicative)*
    fn additive(&mut self) -> Result<Num, EvalErr> {
        let mut left = self.multiplicative()?;
        while let Some(op) = self.peek().cloned() {
            match op {
                Token::Plus => {
                    self.pos += 1;
                    let right = self.multiplicative()?;
                    left = add(left, right)?;
                }
                Token::Minus => {
                    self.pos += 1;
                    let right = self.multiplicative()?;
                    left = sub(left, right)?;
                }
                _ => break,
            }
        }
        Ok(left)
    }

    // multiplicative := unary (("*" | "/" | "%") unary)*
    fn multiplicative(&mut self) -> Result<Num, EvalErr> {
        let mut left = self.unary()?;
        while let Some(op) = self.peek().cloned() {
            match op {
                Token::Star => {
                    self.pos += 1;
                    let right = self.unary()?;
                    left = mul(left, right)?;
                }
                Token::Slash => {
                    self.pos += 1;
                    let right = self.unary()?;
                    left = div(left, right)?;
                }
                Token::Percent => {
                    self.pos += 1;
                    let right = self.unary()?;
                    left = rem(left, right)?;
                }
                _ => break,
            }
        }
        Ok(left)
    }

    // unary := ("+" | "-")* power
    fn unary(&mut self) -> Result<Num, EvalErr> {
        match self.peek() {
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()
            }
            Some(Token::Minus) => {
                self.pos += 1;
                let value = self.unary()?;
                Ok(match value {
                    Num::Int(i) => i
                        .checked_neg()
                        .map(Num::Int)
                        .unwrap_or(Num::Float(-(i as f64))),
                    Num::Float(f) => Num::Float(-f),
                })
            }
            _ => self.power(),
        }
    }

    // power := atom ("**" unary)?   (right-associative; exponent may carry
    // its own unary sign, as in 2 ** -1)
    fn power(&mut self) -> Result<Num, EvalErr> {
        let base = self.atom()?;
        if self.peek() == Some(&Token::DoubleStar) {
            self.pos += 1;
            let exponent = self.unary()?;
            return pow(base, exponent);
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Num, EvalErr> {
        match self.next() {
            Some(Token::Number(n)) => Ok(n),
            Some(Token::LParen) => {
                let inner = self.additive()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(EvalErr::NotAnExpression),
                }
            }
            _ => Err(EvalErr::NotAnExpression),
        }
    }
}

fn add(a: Num, b: Num) -> Result<Num, EvalErr> {
    Ok(match (a, b) {
        (Num::Int(x), Num::Int(y)) => x
            .checked_add(y)
            .map(Num::Int)
            .unwrap_or(Num::Float(x as f64 + y as f64)),
        _ => Num::Float(a.as_f64() + b.as_f64()),
    })
}

fn sub(a: Num, b: Num) -> Result<Num, EvalErr> {
    Ok(match (a, b) {
        (Num::Int(x), Num::Int(y)) => x
            .checked_sub(y)
            .map(Num::Int)
            .unwrap_or(Num::Float(x as f64 - y as f64)),
        _ => Num::Float(a.as_f64() - b.as_f64()),
    })
}

fn mul(a: Num, b: Num) -> Result<Num, EvalErr> {
    Ok(match (a, b) {
        (Num::Int(x), Num::Int(y)) => x
            .checked_mul(y)
            .map(Num::Int)
            .unwrap_or(Num::Float(x as f64 * y as f64)),
        _ => Num::Float(a.as_f64() * b.as_f64()),
    })
}

// `/` is floating-point division regardless of operand types.
fn div(a: Num, b: Num) -> Result<Num, EvalErr> {
    if b.is_zero() {
        return Err(eval_error("division by zero"));
    }
    Ok(Num::Float(a.as_f64() / b.as_f64()))
}

// `%` follows the sign of the dividend (truncated remainder).
fn rem(a: Num, b: Num) -> Result<Num, EvalErr> {
    if b.is_zero() {
        return Err(eval_error("modulo by zero"));
    }
    Ok(match (a, b) {
        (Num::Int(x), Num::Int(y)) => Num::Int(x.wrapping_rem(y)),
        _ => Num::Float(a.as_f64() % b.as_f64()),
    })
}

fn pow(base: Num, exponent: Num) -> Result<Num, EvalErr> {
    if let (Num::Int(b), Num::Int(e)) = (base, exponent) {
        if (0..=u32::MAX as i64).contains(&e) {
            if let Some(result) = b.checked_pow(e as u32) {
                return Ok(Num::Int(result));
            }
        }
    }
    Ok(Num::Float(base.as_f64().powf(exponent.as_f64())))
}

/// Whether the string could be a pure arithmetic expression: only digits,
/// operators, parentheses and whitespace, with at least one digit.
pub fn looks_like_expression(text: &str) -> bool {
    let mut has_digit = false;
    for c in text.chars() {
        match c {
            '0'..='9' => has_digit = true,
            '+' | '-' | '*' | '/' | '%' | '(' | ')' | '.' | 'e' | 'E' => {}
            c if c.is_whitespace() => {}
            _ => return false,
        }
    }
    has_digit
}

/// Evaluate a pure arithmetic expression to a JSON number.
///
/// Returns `Ok(None)` when the text does not parse as an expression (the
/// caller then stores it as a plain string); `Err` only for genuine
/// evaluation failures such as division by zero.
pub fn eval_expression(text: &str) -> Result<Option<Value>, VmError> {
    if !looks_like_expression(text) {
        return Ok(None);
    }
    let Some(tokens) = tokenize(text) else {
        return Ok(None);
    };
    if tokens.is_empty() {
        return Ok(None);
    }
    let mut parser = Parser { tokens, pos: 0 };
    let result = match parser.additive() {
        Ok(value) => value,
        Err(EvalErr::NotAnExpression) => return Ok(None),
        Err(EvalErr::Eval(e)) => return Err(e),
    };
    if parser.pos != parser.tokens.len() {
        // Trailing tokens ("1 2"): not an expression.
        return Ok(None);
    }
    match result.into_value() {
        Ok(value) => Ok(Some(value)),
        Err(EvalErr::Eval(e)) => Err(e),
        Err(EvalErr::NotAnExpression) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(text: &str) -> Value {
        eval_expression(text).unwrap().expect("expression")
    }

    #[test]
    fn test_precedence_and_associativity() {
        assert_eq!(eval("3 * 2 + 1"), json!(7));
        assert_eq!(eval("1 + 3 * 2"), json!(7));
        assert_eq!(eval("10 - 4 - 3"), json!(3));
        assert_eq!(eval("(1 + 3) * 2"), json!(8));
    }

    #[test]
    fn test_power_is_right_associative() {
        // 2 ** 3 ** 2 = 2 ** 9
        assert_eq!(eval("2 ** 3 ** 2"), json!(512));
        assert_eq!(eval("2 ** -1"), json!(0.5));
    }

    #[test]
    fn test_division_is_floating_point() {
        assert_eq!(eval("7 / 2"), json!(3.5));
        assert_eq!(eval("4 / 2"), json!(2.0));
    }

    #[test]
    fn test_modulo_follows_dividend_sign() {
        assert_eq!(eval("7 % 3"), json!(1));
        assert_eq!(eval("-7 % 3"), json!(-1));
        assert_eq!(eval("7 % -3"), json!(1));
    }

    #[test]
    fn test_unary_operators() {
        assert_eq!(eval("-3 + 5"), json!(2));
        assert_eq!(eval("+4"), json!(4));
        assert_eq!(eval("--2"), json!(2));
    }

    #[test]
    fn test_division_by_zero_is_an_error() {
        assert!(eval_expression("1 / 0").is_err());
        assert!(eval_expression("1 % 0").is_err());
    }

    #[test]
    fn test_non_expressions_pass_through() {
        assert_eq!(eval_expression("hello world").unwrap(), None);
        assert_eq!(eval_expression("").unwrap(), None);
        assert_eq!(eval_expression("a + 1").unwrap(), None);
        // Plain numbers are expressions; stored as numbers.
        assert_eq!(eval("42"), json!(42));
        assert_eq!(eval("4.5"), json!(4.5));
    }

    #[test]
    fn test_integer_overflow_promotes_to_float() {
        let value = eval("9223372036854775807 + 1");
        assert!(value.as_f64().unwrap() > 9.2e18);
    }
}

//! Expression language for conditions and assignments
//!
//! Deliberately small: literals, variable references, arithmetic
//! (`+ - * / %`), comparisons, boolean logic (`&& || !` or `and or not`),
//! string concatenation with `+`, and a fixed set of functions:
//!
//! | function | result |
//! |---|---|
//! | `regex_match(text, pattern)` | bool, pattern found anywhere in text |
//! | `regex_extract(text, pattern[, group])` | capture group (1 if the pattern has groups, else 0) or `null` |
//! | `contains(text, needle)` | bool |
//! | `starts_with(text, prefix)` | bool |
//! | `len(text)` | character count |
//! | `number(x)` | numeric conversion |
//! | `str(x)` | text conversion |
//! | `upper(x)`, `lower(x)`, `trim(x)` | text |
//! | `now()` | RFC 3339 timestamp |
//!
//! Identifiers may contain dots (`step1.option`) so confirmation results can
//! be referenced directly.

use super::{Value, VariableContext};
use chrono::Local;
use regex::Regex;
use std::fmt;
use thiserror::Error;

/// Expression errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    /// Malformed source text
    #[error("Syntax error at {position}: {message}")]
    Syntax {
        /// Byte offset
        position: usize,
        /// What went wrong
        message: String,
    },

    /// Reference to an unset variable
    #[error("Unknown variable '{0}'")]
    UnknownVariable(String),

    /// Call to a function that does not exist
    #[error("Unknown function '{0}'")]
    UnknownFunction(String),

    /// Wrong number of arguments
    #[error("{name}() takes {expected} argument(s), got {got}")]
    Arity {
        /// Function name
        name: String,
        /// Accepted argument count(s)
        expected: &'static str,
        /// Supplied argument count
        got: usize,
    },

    /// Operand of the wrong type
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// Division or remainder by zero
    #[error("Division by zero")]
    DivisionByZero,

    /// Pattern failed to compile
    #[error("Invalid regex '{pattern}': {message}")]
    InvalidRegex {
        /// Pattern text
        pattern: String,
        /// Compiler message
        message: String,
    },
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::And => "&&",
            Self::Or => "||",
        };
        f.write_str(s)
    }
}

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Literal value
    Literal(Value),
    /// Variable reference
    Variable(String),
    /// `!x`
    Not(Box<Expr>),
    /// `-x`
    Neg(Box<Expr>),
    /// `a op b`
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// `name(args...)`
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

fn syntax(position: usize, message: impl Into<String>) -> ExprError {
    ExprError::Syntax {
        position,
        message: message.into(),
    }
}

const OPERATORS: [&str; 16] = [
    "==", "!=", "<=", ">=", "&&", "||", "<", ">", "+", "-", "*", "/", "%", "!", "=", "|",
];

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;
        match c {
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            b'(' => {
                tokens.push((start, Token::LParen));
                i += 1;
            }
            b')' => {
                tokens.push((start, Token::RParen));
                i += 1;
            }
            b',' => {
                tokens.push((start, Token::Comma));
                i += 1;
            }
            b'"' | b'\'' => {
                let (text, next) = read_string(src, i)?;
                tokens.push((start, Token::Str(text)));
                i = next;
            }
            b'0'..=b'9' => {
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                let n = src[start..i]
                    .parse::<f64>()
                    .map_err(|_| syntax(start, format!("bad number '{}'", &src[start..i])))?;
                tokens.push((start, Token::Number(n)));
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'.') {
                    i += 1;
                }
                tokens.push((start, Token::Ident(src[start..i].to_string())));
            }
            _ => {
                let op = OPERATORS
                    .iter()
                    .find(|op| src[i..].starts_with(*op))
                    .ok_or_else(|| syntax(start, format!("unexpected character '{}'", &src[i..].chars().next().unwrap_or('?'))))?;
                if *op == "=" || *op == "|" {
                    return Err(syntax(start, format!("unexpected '{op}'")));
                }
                tokens.push((start, Token::Op(op)));
                i += op.len();
            }
        }
    }
    Ok(tokens)
}

fn read_string(src: &str, open: usize) -> Result<(String, usize), ExprError> {
    let quote = src.as_bytes()[open] as char;
    let mut out = String::new();
    let mut chars = src[open + 1..].char_indices();

    while let Some((offset, c)) = chars.next() {
        match c {
            c if c == quote => return Ok((out, open + 1 + offset + 1)),
            '\\' => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 'r')) => out.push('\r'),
                Some((_, 't')) => out.push('\t'),
                Some((_, c)) if c == quote || c == '\\' => out.push(c),
                // Anything else keeps its backslash so regex escapes survive
                Some((_, c)) => {
                    out.push('\\');
                    out.push(c);
                }
                None => break,
            },
            c => out.push(c),
        }
    }
    Err(syntax(open, "unterminated string"))
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(o, _)| *o)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    /// Consume an operator (or its keyword spelling) if it is next
    fn eat_op(&mut self, symbol: &str, keyword: Option<&str>) -> bool {
        let hit = match self.peek() {
            Some(Token::Op(op)) => *op == symbol,
            Some(Token::Ident(word)) => keyword.is_some_and(|k| k == word),
            _ => false,
        };
        if hit {
            self.pos += 1;
        }
        hit
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<(), ExprError> {
        if self.peek() == Some(token) {
            self.pos += 1;
            Ok(())
        } else {
            Err(syntax(self.offset(), format!("expected {what}")))
        }
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.and()?;
        while self.eat_op("||", Some("or")) {
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(self.and()?));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.equality()?;
        while self.eat_op("&&", Some("and")) {
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(self.equality()?));
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.comparison()?;
        loop {
            let op = if self.eat_op("==", None) {
                BinaryOp::Eq
            } else if self.eat_op("!=", None) {
                BinaryOp::Ne
            } else {
                return Ok(lhs);
            };
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(self.comparison()?));
        }
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.additive()?;
        loop {
            let op = if self.eat_op("<=", None) {
                BinaryOp::Le
            } else if self.eat_op(">=", None) {
                BinaryOp::Ge
            } else if self.eat_op("<", None) {
                BinaryOp::Lt
            } else if self.eat_op(">", None) {
                BinaryOp::Gt
            } else {
                return Ok(lhs);
            };
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(self.additive()?));
        }
    }

    fn additive(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = if self.eat_op("+", None) {
                BinaryOp::Add
            } else if self.eat_op("-", None) {
                BinaryOp::Sub
            } else {
                return Ok(lhs);
            };
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(self.multiplicative()?));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.unary()?;
        loop {
            let op = if self.eat_op("*", None) {
                BinaryOp::Mul
            } else if self.eat_op("/", None) {
                BinaryOp::Div
            } else if self.eat_op("%", None) {
                BinaryOp::Rem
            } else {
                return Ok(lhs);
            };
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(self.unary()?));
        }
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.eat_op("!", Some("not")) {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        if self.eat_op("-", None) {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(Value::Number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::Text(s))),
            Some(Token::LParen) => {
                let inner = self.or()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                "and" | "or" | "not" => Err(syntax(offset, format!("unexpected '{word}'"))),
                _ if self.peek() == Some(&Token::LParen) => {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if !self.eat_close() {
                        loop {
                            args.push(self.or()?);
                            if self.eat_close() {
                                break;
                            }
                            self.expect(&Token::Comma, "',' or ')'")?;
                        }
                    }
                    check_call(&word, &args)?;
                    Ok(Expr::Call(word, args))
                }
                _ => Ok(Expr::Variable(word)),
            },
            Some(token) => Err(syntax(offset, format!("unexpected {token:?}"))),
            None => Err(syntax(offset, "unexpected end of expression")),
        }
    }

    fn eat_close(&mut self) -> bool {
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
            true
        } else {
            false
        }
    }
}

/// Arity (min, max, label) of each known function
fn arity(name: &str) -> Option<(usize, usize, &'static str)> {
    Some(match name {
        "now" => (0, 0, "0"),
        "len" | "number" | "str" | "upper" | "lower" | "trim" => (1, 1, "1"),
        "regex_match" | "contains" | "starts_with" => (2, 2, "2"),
        "regex_extract" => (2, 3, "2 or 3"),
        _ => return None,
    })
}

/// Resolve names and arity at parse time; literal regex patterns are compiled
fn check_call(name: &str, args: &[Expr]) -> Result<(), ExprError> {
    let (min, max, expected) = arity(name).ok_or_else(|| ExprError::UnknownFunction(name.to_string()))?;
    if args.len() < min || args.len() > max {
        return Err(ExprError::Arity {
            name: name.to_string(),
            expected,
            got: args.len(),
        });
    }
    if name.starts_with("regex_") {
        if let Expr::Literal(Value::Text(pattern)) = &args[1] {
            compile(pattern)?;
        }
    }
    Ok(())
}

fn compile(pattern: &str) -> Result<Regex, ExprError> {
    Regex::new(pattern).map_err(|e| ExprError::InvalidRegex {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

/// Parse an expression
pub fn parse(source: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(syntax(0, "empty expression"));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: source.len(),
    };
    let expr = parser.or()?;
    if parser.pos < parser.tokens.len() {
        return Err(syntax(parser.offset(), "unexpected trailing input"));
    }
    Ok(expr)
}

fn numeric(op: BinaryOp, v: &Value) -> Result<f64, ExprError> {
    v.as_number().ok_or_else(|| {
        ExprError::TypeMismatch(format!("'{op}' needs numbers, got {} '{v}'", v.type_name()))
    })
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Text(x), Value::Text(y)) => x == y,
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        _ => match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => x == y,
            _ => a.to_string() == b.to_string(),
        },
    }
}

fn text_arg(v: Value) -> String {
    match v {
        Value::Text(s) => s,
        other => other.to_string(),
    }
}

impl Expr {
    /// Evaluate against a variable context
    pub fn eval(&self, ctx: &VariableContext) -> Result<Value, ExprError> {
        match self {
            Self::Literal(v) => Ok(v.clone()),
            Self::Variable(name) => ctx.get(name).ok_or_else(|| ExprError::UnknownVariable(name.clone())),
            Self::Not(inner) => Ok(Value::Bool(!inner.eval(ctx)?.is_truthy())),
            Self::Neg(inner) => Ok(Value::Number(-numeric(BinaryOp::Sub, &inner.eval(ctx)?)?)),
            Self::Binary(BinaryOp::And, a, b) => {
                Ok(Value::Bool(a.eval(ctx)?.is_truthy() && b.eval(ctx)?.is_truthy()))
            }
            Self::Binary(BinaryOp::Or, a, b) => {
                Ok(Value::Bool(a.eval(ctx)?.is_truthy() || b.eval(ctx)?.is_truthy()))
            }
            Self::Binary(op, a, b) => binary(*op, a.eval(ctx)?, b.eval(ctx)?),
            Self::Call(name, args) => {
                let values = args.iter().map(|a| a.eval(ctx)).collect::<Result<Vec<_>, _>>()?;
                call(name, values)
            }
        }
    }

    /// Evaluate and reduce to a boolean
    pub fn eval_bool(&self, ctx: &VariableContext) -> Result<bool, ExprError> {
        self.eval(ctx).map(|v| v.is_truthy())
    }
}

fn binary(op: BinaryOp, a: Value, b: Value) -> Result<Value, ExprError> {
    Ok(match op {
        BinaryOp::Add => match (&a, &b) {
            (Value::Text(_), _) | (_, Value::Text(_)) => Value::Text(format!("{a}{b}")),
            _ => Value::Number(numeric(op, &a)? + numeric(op, &b)?),
        },
        BinaryOp::Sub => Value::Number(numeric(op, &a)? - numeric(op, &b)?),
        BinaryOp::Mul => Value::Number(numeric(op, &a)? * numeric(op, &b)?),
        BinaryOp::Div | BinaryOp::Rem => {
            let (x, y) = (numeric(op, &a)?, numeric(op, &b)?);
            if y == 0.0 {
                return Err(ExprError::DivisionByZero);
            }
            Value::Number(if op == BinaryOp::Div { x / y } else { x % y })
        }
        BinaryOp::Eq => Value::Bool(loose_eq(&a, &b)),
        BinaryOp::Ne => Value::Bool(!loose_eq(&a, &b)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (&a, &b) {
                (Value::Text(x), Value::Text(y)) if a.as_number().is_none() || b.as_number().is_none() => {
                    x.partial_cmp(y)
                }
                _ => numeric(op, &a)?.partial_cmp(&numeric(op, &b)?),
            };
            let Some(ordering) = ordering else {
                return Ok(Value::Bool(false));
            };
            Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            })
        }
        BinaryOp::And | BinaryOp::Or => Value::Bool(a.is_truthy() && b.is_truthy()),
    })
}

fn call(name: &str, args: Vec<Value>) -> Result<Value, ExprError> {
    let mut args = args.into_iter();
    let mut next = || args.next().unwrap_or_default();

    Ok(match name {
        "now" => Value::Text(Local::now().to_rfc3339()),
        "len" => Value::Number(text_arg(next()).chars().count() as f64),
        "number" => {
            let v = next();
            Value::Number(v.as_number().ok_or_else(|| {
                ExprError::TypeMismatch(format!("cannot convert {} '{v}' to a number", v.type_name()))
            })?)
        }
        "str" => Value::Text(text_arg(next())),
        "upper" => Value::Text(text_arg(next()).to_uppercase()),
        "lower" => Value::Text(text_arg(next()).to_lowercase()),
        "trim" => Value::Text(text_arg(next()).trim().to_string()),
        "contains" => {
            let (hay, needle) = (text_arg(next()), text_arg(next()));
            Value::Bool(hay.contains(&needle))
        }
        "starts_with" => {
            let (text, prefix) = (text_arg(next()), text_arg(next()));
            Value::Bool(text.starts_with(&prefix))
        }
        "regex_match" => {
            let text = text_arg(next());
            Value::Bool(compile(&text_arg(next()))?.is_match(&text))
        }
        "regex_extract" => {
            let text = text_arg(next());
            let re = compile(&text_arg(next()))?;
            let group = match next() {
                Value::Null => usize::from(re.captures_len() > 1),
                v => v
                    .as_number()
                    .filter(|n| *n >= 0.0)
                    .map(|n| n as usize)
                    .ok_or_else(|| ExprError::TypeMismatch(format!("group index '{v}'")))?,
            };
            re.captures(&text)
                .and_then(|c| c.get(group))
                .map_or(Value::Null, |m| Value::Text(m.as_str().to_string()))
        }
        other => return Err(ExprError::UnknownFunction(other.to_string())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> VariableContext {
        let mut ctx = VariableContext::new();
        ctx.set("x", 10.0);
        ctx.set("reply", "+CSQ: 23,99");
        ctx.set("count", "3");
        ctx.set("step1.confirmed", true);
        ctx
    }

    fn eval(src: &str) -> Value {
        ctx().evaluate(src).unwrap()
    }

    #[test]
    fn test_arithmetic_and_precedence() {
        assert_eq!(eval("1 + 2 * 3"), Value::Number(7.0));
        assert_eq!(eval("(1 + 2) * 3"), Value::Number(9.0));
        assert_eq!(eval("x % 4 - -1"), Value::Number(3.0));
        assert_eq!(eval("count * 2"), Value::Number(6.0));
        assert_eq!(ctx().evaluate("x / 0"), Err(ExprError::DivisionByZero));
    }

    #[test]
    fn test_strings_and_concatenation() {
        assert_eq!(eval("\"42\""), Value::Text("42".into()));
        assert_eq!(eval("'v' + x"), Value::Text("v10".into()));
        assert_eq!(eval(r#""a\"b""#), Value::Text("a\"b".into()));
    }

    #[test]
    fn test_comparison_and_logic() {
        assert_eq!(eval("x > 5 && x <= 10"), Value::Bool(true));
        assert_eq!(eval("x == '10'"), Value::Bool(true));
        assert_eq!(eval("'abc' < 'abd'"), Value::Bool(true));
        assert_eq!(eval("not step1.confirmed or x != 10"), Value::Bool(false));
        assert_eq!(eval("!(1 > 2)"), Value::Bool(true));
    }

    #[test]
    fn test_short_circuit_skips_unknown_variable() {
        assert_eq!(eval("false && missing"), Value::Bool(false));
        assert_eq!(eval("true || missing"), Value::Bool(true));
        assert_eq!(
            ctx().evaluate("missing + 1"),
            Err(ExprError::UnknownVariable("missing".into()))
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(eval(r"'a\nb'"), Value::Text("a\nb".into()));
        assert_eq!(eval(r"'\d+'"), Value::Text(r"\d+".into()));
    }

    #[test]
    fn test_regex_functions() {
        assert_eq!(eval(r"regex_match(reply, '\+CSQ: \d+')"), Value::Bool(true));
        assert_eq!(eval(r"regex_extract(reply, 'CSQ: (\d+)')"), Value::Text("23".into()));
        assert_eq!(eval(r"regex_extract(reply, '(\d+),(\d+)', 2)"), Value::Text("99".into()));
        assert_eq!(eval(r"regex_extract(reply, 'CSQ')"), Value::Text("CSQ".into()));
        assert_eq!(eval(r"regex_extract(reply, 'NOPE(\d)')"), Value::Null);
        assert_eq!(eval(r"number(regex_extract(reply, '(\d+),')) + 1"), Value::Number(24.0));
    }

    #[test]
    fn test_other_functions() {
        assert_eq!(eval("len(reply)"), Value::Number(11.0));
        assert_eq!(eval("contains(reply, 'CSQ')"), Value::Bool(true));
        assert_eq!(eval("upper('ok')"), Value::Text("OK".into()));
        assert_eq!(eval("str(x)"), Value::Text("10".into()));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse(""), Err(ExprError::Syntax { .. })));
        assert!(matches!(parse("1 +"), Err(ExprError::Syntax { .. })));
        assert!(matches!(parse("x = 1"), Err(ExprError::Syntax { .. })));
        assert!(matches!(parse("'open"), Err(ExprError::Syntax { .. })));
        assert!(matches!(parse("(1"), Err(ExprError::Syntax { .. })));
        assert!(matches!(parse("1 2"), Err(ExprError::Syntax { .. })));
        assert_eq!(parse("exec('rm')"), Err(ExprError::UnknownFunction("exec".into())));
        assert!(matches!(parse("len()"), Err(ExprError::Arity { .. })));
        assert!(matches!(parse("regex_match(x, '(')"), Err(ExprError::InvalidRegex { .. })));
    }
}

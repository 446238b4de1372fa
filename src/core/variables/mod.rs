//! Per-execution variable store
//!
//! Holds named [`Value`]s, rewrites `${name}` placeholders in text, and
//! evaluates expressions (see [`expr`]) against the stored values.

pub mod expr;

pub use expr::{parse as parse_expression, Expr, ExprError};

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Name of the read-only clock variable
pub const CURRENT_TIME: &str = "current_time";

/// A variable value
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Absent / null
    #[default]
    Null,
    /// Boolean
    Bool(bool),
    /// Number (all numbers are f64)
    Number(f64),
    /// Text
    Text(String),
}

impl Value {
    /// Truthiness used by conditions: empty text, zero, null and false are false
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0.0 && !n.is_nan(),
            Self::Text(s) => !s.is_empty(),
        }
    }

    /// Numeric view; text is parsed after trimming and must be finite
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            Self::Null => None,
        }
    }

    /// Text payload, if this is text
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Type name for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::Text(_) => "text",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            // Integral values print without a fraction
            Self::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<u16> for Value {
    fn from(n: u16) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// Named values scoped to one workflow execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableContext {
    vars: HashMap<String, Value>,
}

impl VariableContext {
    /// Empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Context seeded from `initial`, then overlaid with `overrides`
    pub fn seeded<'a, I, J>(initial: I, overrides: J) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a Value)>,
        J: IntoIterator<Item = (&'a String, &'a Value)>,
    {
        let mut ctx = Self::new();
        for (name, value) in initial.into_iter().chain(overrides) {
            ctx.set(name, value.clone());
        }
        ctx
    }

    /// Look up a variable; `current_time` resolves to now unless explicitly set
    pub fn get(&self, name: &str) -> Option<Value> {
        match self.vars.get(name) {
            Some(v) => Some(v.clone()),
            None if name == CURRENT_TIME => Some(Value::Text(Local::now().to_rfc3339())),
            None => None,
        }
    }

    /// Set a variable
    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.vars.insert(name.to_string(), value.into());
    }

    /// Remove a variable, returning its value
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.vars.remove(name)
    }

    /// Whether a variable is explicitly set
    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    /// Number of set variables
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether no variables are set
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Sorted copy of every set variable
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Replace each `${name}` with the variable's text. Unknown names and
    /// unterminated placeholders are left exactly as written.
    pub fn substitute(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                out.push_str(&rest[start..]);
                return out;
            };
            let placeholder = &rest[start..start + 2 + end + 1];
            match self.get(after[..end].trim()) {
                Some(value) if end > 0 => out.push_str(&value.to_string()),
                _ => out.push_str(placeholder),
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        out
    }

    /// Parse and evaluate an expression against this context
    pub fn evaluate(&self, source: &str) -> Result<Value, ExprError> {
        expr::parse(source)?.eval(self)
    }
}

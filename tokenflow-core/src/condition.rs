//! Sequence-flow condition expressions.
//!
//! Conditions are boolean expressions over process variables:
//!
//! - `approved` - variable is truthy
//! - `order.total > 100` - nested field of a JSON variable
//! - `status == "open"`, `status != "open"` - equality with strings, numbers,
//!   booleans or `null`
//! - `>`, `>=`, `<`, `<=` - numeric comparison
//! - `!expr`, `a && b`, `a || b`, `(expr)` - `&&` binds tighter than `||`
//!
//! A missing variable evaluates as `null`.

use crate::error::CoreError;
use serde_json::Value;

/// A parsed condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Truthy(String),
    Eq(String, Value),
    Ne(String, Value),
    Gt(String, f64),
    Ge(String, f64),
    Lt(String, f64),
    Le(String, f64),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(invalid("empty condition"));
        }

        let mut parser = Parser::new(s);
        let condition = parser.parse_or()?;
        parser.skip_whitespace();
        if parser.pos < s.len() {
            return Err(invalid(format!(
                "unexpected input at position {}: '{}'",
                parser.pos,
                &s[parser.pos..]
            )));
        }
        Ok(condition)
    }

    /// Evaluates the condition, resolving variable names through `lookup`.
    pub fn evaluate(&self, lookup: &dyn Fn(&str) -> Option<Value>) -> bool {
        match self {
            Condition::Truthy(path) => is_truthy(&resolve(lookup, path)),
            Condition::Eq(path, expected) => values_equal(&resolve(lookup, path), expected),
            Condition::Ne(path, expected) => !values_equal(&resolve(lookup, path), expected),
            Condition::Gt(path, n) => compare(lookup, path, |v| v > *n),
            Condition::Ge(path, n) => compare(lookup, path, |v| v >= *n),
            Condition::Lt(path, n) => compare(lookup, path, |v| v < *n),
            Condition::Le(path, n) => compare(lookup, path, |v| v <= *n),
            Condition::And(l, r) => l.evaluate(lookup) && r.evaluate(lookup),
            Condition::Or(l, r) => l.evaluate(lookup) || r.evaluate(lookup),
            Condition::Not(inner) => !inner.evaluate(lookup),
        }
    }
}

fn invalid(reason: impl Into<String>) -> CoreError {
    CoreError::InvalidCondition {
        reason: reason.into(),
    }
}

/// First path segment names the variable, the rest walks into its JSON.
fn resolve(lookup: &dyn Fn(&str) -> Option<Value>, path: &str) -> Value {
    let mut segments = path.split('.');
    let Some(name) = segments.next() else {
        return Value::Null;
    };
    let mut current = lookup(name).unwrap_or(Value::Null);
    for segment in segments {
        current = match current {
            Value::Object(mut map) => map.remove(segment).unwrap_or(Value::Null),
            _ => return Value::Null,
        };
    }
    current
}

fn compare(
    lookup: &dyn Fn(&str) -> Option<Value>,
    path: &str,
    op: impl Fn(f64) -> bool,
) -> bool {
    resolve(lookup, path).as_f64().map(op).unwrap_or(false)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .map(|(a, b)| (a - b).abs() < f64::EPSILON)
            .unwrap_or(false),
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        _ => false,
    }
}

/// Recursive descent parser.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse_or(&mut self) -> Result<Condition, CoreError> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();
        while self.eat("||") {
            let right = self.parse_and()?;
            left = Condition::Or(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Condition, CoreError> {
        let mut left = self.parse_unary()?;
        self.skip_whitespace();
        while self.eat("&&") {
            let right = self.parse_unary()?;
            left = Condition::And(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Condition, CoreError> {
        self.skip_whitespace();
        if self.peek_char() == Some('!') && !self.peek_str("!=") {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Condition::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Condition, CoreError> {
        self.skip_whitespace();
        if self.eat("(") {
            let inner = self.parse_or()?;
            self.skip_whitespace();
            if !self.eat(")") {
                return Err(invalid("expected ')'"));
            }
            return Ok(inner);
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Condition, CoreError> {
        let path = self.parse_path()?;
        self.skip_whitespace();

        if self.eat("==") {
            return Ok(Condition::Eq(path, self.parse_literal()?));
        }
        if self.eat("!=") {
            return Ok(Condition::Ne(path, self.parse_literal()?));
        }
        if self.eat(">=") {
            return Ok(Condition::Ge(path, self.parse_number()?));
        }
        if self.eat("<=") {
            return Ok(Condition::Le(path, self.parse_number()?));
        }
        if self.eat(">") {
            return Ok(Condition::Gt(path, self.parse_number()?));
        }
        if self.eat("<") {
            return Ok(Condition::Lt(path, self.parse_number()?));
        }
        Ok(Condition::Truthy(path))
    }

    fn parse_path(&mut self) -> Result<String, CoreError> {
        self.skip_whitespace();
        let start = self.pos;
        match self.peek_char() {
            Some(c) if c.is_alphabetic() || c == '_' => {}
            _ => {
                return Err(invalid(format!(
                    "expected variable name at position {}",
                    start
                )))
            }
        }
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' || c == '.' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        let path = &self.input[start..self.pos];
        if path.ends_with('.') || path.contains("..") {
            return Err(invalid(format!("malformed variable path '{}'", path)));
        }
        Ok(path.to_string())
    }

    fn parse_literal(&mut self) -> Result<Value, CoreError> {
        self.skip_whitespace();
        for (word, value) in [
            ("true", Value::Bool(true)),
            ("false", Value::Bool(false)),
            ("null", Value::Null),
        ] {
            if self.eat(word) {
                return Ok(value);
            }
        }
        if self.peek_char() == Some('"') {
            return self.parse_string();
        }
        let n = self.parse_number()?;
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .ok_or_else(|| invalid(format!("number out of range: {}", n)))
    }

    fn parse_string(&mut self) -> Result<Value, CoreError> {
        self.pos += 1;
        let mut out = String::new();
        let mut chars = self.input[self.pos..].char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '"' => {
                    self.pos += i + 1;
                    return Ok(Value::String(out));
                }
                '\\' => match chars.next() {
                    Some((_, escaped)) => out.push(escaped),
                    None => break,
                },
                c => out.push(c),
            }
        }
        Err(invalid("unterminated string"))
    }

    fn parse_number(&mut self) -> Result<f64, CoreError> {
        self.skip_whitespace();
        let start = self.pos;
        if self.peek_char() == Some('-') {
            self.pos += 1;
        }
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() || c == '.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = &self.input[start..self.pos];
        text.parse::<f64>()
            .map_err(|_| invalid(format!("invalid number: '{}'", text)))
    }

    fn eat(&mut self, token: &str) -> bool {
        self.skip_whitespace();
        if self.peek_str(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if !c.is_whitespace() {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}

//! Connection conditions evaluated against workflow state.
//!
//! Conditions are CEL expressions over the JSON state, e.g.
//! `state.ticket.priority == 'urgent' && state.ticket.category == 'technical'`.
//! The state is bound as `state`, and each top-level key of an object state is
//! also bound on its own, so the `state.` prefix is optional.
//!
//! Flows authored for JavaScript runtimes often write `===`, `!==` or
//! `this.state`; those spellings are rewritten to their CEL equivalents before
//! compiling. A condition that fails at evaluation time (a missing key, a type
//! mismatch, an unknown function) does not hold.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use cel_interpreter::{Context, Program, Value as CelValue};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

/// A compiled, reusable condition.
///
/// ```
/// use flowstate::Condition;
/// use serde_json::json;
///
/// let cond = Condition::parse("state.profileIsComplete == true").unwrap();
/// assert!(cond.evaluate(&json!({ "profileIsComplete": true })));
/// assert!(!cond.evaluate(&json!({ "profileIsComplete": false })));
/// ```
#[derive(Clone)]
pub struct Condition {
    source: String,
    program: Arc<Program>,
}

impl Condition {
    /// Compile a condition expression.
    pub fn parse(source: &str) -> Result<Self> {
        let program = Program::compile(&normalize(source))
            .map_err(|e| Error::invalid_condition(source, e.to_string()))?;
        Ok(Self {
            source: source.to_string(),
            program: Arc::new(program),
        })
    }

    /// Evaluate against the state.
    pub fn evaluate(&self, state: &Value) -> bool {
        let mut context = Context::default();
        context.add_variable_from_value("undefined", CelValue::Null);
        if let Value::Object(fields) = state {
            for (key, value) in fields {
                context.add_variable_from_value(key.as_str(), json_to_cel(value));
            }
        }
        context.add_variable_from_value("state", json_to_cel(state));

        match self.program.execute(&context) {
            Ok(value) => truthy(&value),
            Err(e) => {
                debug!(condition = %self.source, error = %e, "Condition did not evaluate");
                false
            }
        }
    }

    /// The original expression text.
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// Integers that fit `i64` become CEL ints so they compare with int literals.
fn json_to_cel(value: &Value) -> CelValue {
    match value {
        Value::Null => CelValue::Null,
        Value::Bool(b) => CelValue::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => CelValue::Int(i),
            None => CelValue::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => CelValue::from(s.clone()),
        Value::Array(items) => CelValue::from(items.iter().map(json_to_cel).collect::<Vec<_>>()),
        Value::Object(fields) => CelValue::from(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), json_to_cel(v)))
                .collect::<HashMap<_, _>>(),
        ),
    }
}

fn truthy(value: &CelValue) -> bool {
    match value {
        CelValue::Bool(b) => *b,
        CelValue::Int(i) => *i != 0,
        CelValue::UInt(u) => *u != 0,
        CelValue::Float(f) => *f != 0.0 && !f.is_nan(),
        CelValue::String(s) => !s.is_empty(),
        CelValue::Null => false,
        CelValue::List(_) | CelValue::Map(_) => true,
        _ => false,
    }
}

/// Rewrites `===`, `!==` and `this.state` outside string literals.
fn normalize(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut quote: Option<char> = None;
    let mut rest = source;

    while let Some(c) = rest.chars().next() {
        if let Some(q) = quote {
            if c == '\\' {
                let escaped: String = rest.chars().take(2).collect();
                out.push_str(&escaped);
                rest = &rest[escaped.len()..];
                continue;
            }
            if c == q {
                quote = None;
            }
        } else if c == '\'' || c == '"' {
            quote = Some(c);
        } else if rest.starts_with("===") || rest.starts_with("!==") {
            out.push(c);
            out.push('=');
            rest = &rest[3..];
            continue;
        } else if rest.starts_with("this.state") && !out.ends_with(is_ident_char) {
            rest = &rest["this.".len()..];
            continue;
        }
        out.push(c);
        rest = &rest[c.len_utf8()..];
    }

    out
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

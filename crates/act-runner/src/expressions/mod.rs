// Expression evaluation for `if:` conditions and `${{ }}` interpolation.
//
// The engine only depends on the `ExpressionEvaluator` trait; `BasicEvaluator`
// is the bundled implementation covering the expression language used by
// workflow conditions.

mod parser;

use anyhow::{anyhow, bail, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;

use act_common::StepStatus;

use crate::error::RunnerError;
use parser::{CompareOp, Expr};

/// Status check applied when a condition does not call a status function itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DefaultStatusCheck {
    /// Evaluate the expression as written.
    None,
    #[default]
    Success,
    Always,
    Failure,
    Cancelled,
}

/// Named contexts (`github`, `env`, `job`, `steps`, ...) plus the job status
/// the status functions observe.
#[derive(Debug, Clone)]
pub struct ExpressionContext {
    pub contexts: Map<String, Value>,
    pub job_status: StepStatus,
    pub cancelled: bool,
}

impl Default for ExpressionContext {
    fn default() -> Self {
        Self {
            contexts: Map::new(),
            job_status: StepStatus::Success,
            cancelled: false,
        }
    }
}

impl ExpressionContext {
    pub fn with(mut self, name: &str, value: Value) -> Self {
        self.contexts.insert(name.to_string(), value);
        self
    }

    pub fn insert(&mut self, name: &str, value: Value) {
        self.contexts.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.contexts.get(name)
    }
}

pub trait ExpressionEvaluator: Send + Sync {
    /// Replace every `${{ }}` segment of `template` with its string value.
    fn interpolate(&self, ctx: &ExpressionContext, template: &str) -> String;

    /// Evaluate a condition. Failures surface as `RunnerError::Evaluation`.
    fn eval_bool(
        &self,
        ctx: &ExpressionContext,
        expression: &str,
        default_status: DefaultStatusCheck,
    ) -> Result<bool>;

    fn interpolate_map(
        &self,
        ctx: &ExpressionContext,
        values: &HashMap<String, String>,
    ) -> HashMap<String, String> {
        values
            .iter()
            .map(|(k, v)| (k.clone(), self.interpolate(ctx, v)))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BasicEvaluator;

impl BasicEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate a bare expression (no `${{ }}` wrapper) to a JSON value.
    pub fn evaluate(&self, ctx: &ExpressionContext, expression: &str) -> Result<Value> {
        let expr = parser::parse(expression)?;
        eval(ctx, &expr)
    }
}

impl ExpressionEvaluator for BasicEvaluator {
    fn interpolate(&self, ctx: &ExpressionContext, template: &str) -> String {
        if !template.contains("${{") {
            return template.to_string();
        }
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("${{") {
            out.push_str(&rest[..start]);
            let body = &rest[start + 3..];
            let Some(end) = find_closing(body) else {
                out.push_str(&rest[start..]);
                return out;
            };
            let expression = body[..end].trim();
            match self.evaluate(ctx, expression) {
                Ok(value) => out.push_str(&to_display_string(&value)),
                Err(e) => {
                    tracing::warn!(target: "job", "Unable to interpolate expression '{}': {}", expression, e);
                }
            }
            rest = &body[end + 2..];
        }
        out.push_str(rest);
        out
    }

    fn eval_bool(
        &self,
        ctx: &ExpressionContext,
        expression: &str,
        default_status: DefaultStatusCheck,
    ) -> Result<bool> {
        let raw = expression;
        let evaluation_error = |message: String| RunnerError::Evaluation {
            expression: raw.to_string(),
            message,
        };

        let inner = strip_wrapper(expression.trim());
        if inner.is_empty() {
            return Ok(status_check(ctx, default_status));
        }
        let expr = parser::parse(inner).map_err(|e| evaluation_error(e.to_string()))?;
        if !expr.references_status() && !status_check(ctx, default_status) {
            return Ok(false);
        }
        let value = eval(ctx, &expr).map_err(|e| evaluation_error(e.to_string()))?;
        Ok(truthy(&value))
    }
}

fn status_check(ctx: &ExpressionContext, check: DefaultStatusCheck) -> bool {
    match check {
        DefaultStatusCheck::None | DefaultStatusCheck::Always => true,
        DefaultStatusCheck::Success => ctx.job_status == StepStatus::Success && !ctx.cancelled,
        DefaultStatusCheck::Failure => ctx.job_status == StepStatus::Failure,
        DefaultStatusCheck::Cancelled => ctx.cancelled,
    }
}

/// Strips one `${{ }}` wrapper when it spans the whole condition.
fn strip_wrapper(expression: &str) -> &str {
    if let Some(body) = expression.strip_prefix("${{") {
        if let Some(end) = find_closing(body) {
            if body[end + 2..].trim().is_empty() {
                return body[..end].trim();
            }
        }
    }
    expression
}

/// Index of the `}}` closing an interpolation, skipping quoted literals.
fn find_closing(body: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut in_string = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => in_string = !in_string,
            b'}' if !in_string && bytes.get(i + 1) == Some(&b'}') => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

fn eval(ctx: &ExpressionContext, expr: &Expr) -> Result<Value> {
    Ok(match expr {
        Expr::Literal(value) => value.clone(),
        Expr::Context(name) => match ctx.get(name) {
            Some(value) => value.clone(),
            None if is_known_context(name) => Value::Null,
            None => bail!("unknown context '{}'", name),
        },
        Expr::Property(target, name) => {
            let target = eval(ctx, target)?;
            property(&target, name)
        }
        Expr::Index(target, index) => {
            let target = eval(ctx, target)?;
            let index = eval(ctx, index)?;
            match (&target, &index) {
                (Value::Array(items), _) => number_of(&index)
                    .filter(|n| *n >= 0.0)
                    .and_then(|n| items.get(n as usize).cloned())
                    .unwrap_or(Value::Null),
                (_, Value::String(key)) => property(&target, key),
                _ => Value::Null,
            }
        }
        Expr::Splat(target) => match eval(ctx, target)? {
            Value::Array(items) => Value::Array(items),
            Value::Object(map) => Value::Array(map.into_iter().map(|(_, v)| v).collect()),
            _ => Value::Array(Vec::new()),
        },
        Expr::Not(inner) => Value::Bool(!truthy(&eval(ctx, inner)?)),
        Expr::And(left, right) => {
            let left = eval(ctx, left)?;
            if !truthy(&left) {
                left
            } else {
                eval(ctx, right)?
            }
        }
        Expr::Or(left, right) => {
            let left = eval(ctx, left)?;
            if truthy(&left) {
                left
            } else {
                eval(ctx, right)?
            }
        }
        Expr::Compare(op, left, right) => {
            let left = eval(ctx, left)?;
            let right = eval(ctx, right)?;
            Value::Bool(compare(*op, &left, &right))
        }
        Expr::Call(name, args) => call(ctx, name, args)?,
    })
}

fn is_known_context(name: &str) -> bool {
    matches!(
        name,
        "github"
            | "env"
            | "vars"
            | "job"
            | "jobs"
            | "steps"
            | "runner"
            | "secrets"
            | "strategy"
            | "matrix"
            | "needs"
            | "inputs"
    )
}

/// Property lookup; object keys match case-insensitively. Arrays project the
/// property over their elements (the result of a `.*` filter).
fn property(target: &Value, name: &str) -> Value {
    match target {
        Value::Object(map) => map
            .get(name)
            .or_else(|| {
                map.iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v)
            })
            .cloned()
            .unwrap_or(Value::Null),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| property(item, name))
                .filter(|v| !v.is_null())
                .collect(),
        ),
        _ => Value::Null,
    }
}

fn call(ctx: &ExpressionContext, name: &str, args: &[Expr]) -> Result<Value> {
    let lower = name.to_ascii_lowercase();
    let values = args
        .iter()
        .map(|arg| eval(ctx, arg))
        .collect::<Result<Vec<_>>>()?;
    let arity = |min: usize, max: usize| -> Result<()> {
        if values.len() < min || values.len() > max {
            bail!("{}() expects {} to {} arguments, got {}", name, min, max, values.len());
        }
        Ok(())
    };

    Ok(match lower.as_str() {
        "success" => {
            arity(0, 0)?;
            Value::Bool(status_check(ctx, DefaultStatusCheck::Success))
        }
        "failure" => {
            arity(0, 0)?;
            Value::Bool(status_check(ctx, DefaultStatusCheck::Failure))
        }
        "always" => {
            arity(0, 0)?;
            Value::Bool(true)
        }
        "cancelled" => {
            arity(0, 0)?;
            Value::Bool(ctx.cancelled)
        }
        "contains" => {
            arity(2, 2)?;
            let found = match &values[0] {
                Value::Array(items) => items.iter().any(|item| loose_equals(item, &values[1])),
                haystack => to_display_string(haystack)
                    .to_lowercase()
                    .contains(&to_display_string(&values[1]).to_lowercase()),
            };
            Value::Bool(found)
        }
        "startswith" => {
            arity(2, 2)?;
            Value::Bool(
                to_display_string(&values[0])
                    .to_lowercase()
                    .starts_with(&to_display_string(&values[1]).to_lowercase()),
            )
        }
        "endswith" => {
            arity(2, 2)?;
            Value::Bool(
                to_display_string(&values[0])
                    .to_lowercase()
                    .ends_with(&to_display_string(&values[1]).to_lowercase()),
            )
        }
        "format" => {
            arity(1, usize::MAX)?;
            Value::String(format_template(&to_display_string(&values[0]), &values[1..])?)
        }
        "join" => {
            arity(1, 2)?;
            let separator = values
                .get(1)
                .map(to_display_string)
                .unwrap_or_else(|| ",".to_string());
            match &values[0] {
                Value::Array(items) => Value::String(
                    items
                        .iter()
                        .map(to_display_string)
                        .collect::<Vec<_>>()
                        .join(&separator),
                ),
                other => Value::String(to_display_string(other)),
            }
        }
        "tojson" => {
            arity(1, 1)?;
            Value::String(serde_json::to_string_pretty(&values[0])?)
        }
        "fromjson" => {
            arity(1, 1)?;
            let text = to_display_string(&values[0]);
            serde_json::from_str(&text).map_err(|e| anyhow!("fromJSON: {}", e))?
        }
        _ => bail!("unsupported function {}()", name),
    })
}

fn format_template(template: &str, args: &[Value]) -> Result<String> {
    let mut out = String::new();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut index = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(d) if d.is_ascii_digit() => index.push(d),
                        _ => bail!("format: invalid placeholder in '{}'", template),
                    }
                }
                let position: usize = index
                    .parse()
                    .map_err(|_| anyhow!("format: invalid placeholder in '{}'", template))?;
                let arg = args
                    .get(position)
                    .ok_or_else(|| anyhow!("format: missing argument {}", position))?;
                out.push_str(&to_display_string(arg));
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Null => Some(0.0),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => n.as_f64(),
        Value::String(s) if s.trim().is_empty() => Some(0.0),
        Value::String(s) => {
            let s = s.trim();
            match s.strip_prefix("0x") {
                Some(hex) => i64::from_str_radix(hex, 16).ok().map(|n| n as f64),
                None => s.parse().ok(),
            }
        }
        _ => None,
    }
}

/// `==` semantics: strings compare case-insensitively, mixed primitive types
/// compare as numbers, objects and arrays compare by identity of content.
fn loose_equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::String(a), Value::String(b)) => a.eq_ignore_ascii_case(b),
        (Value::Null, Value::Null) => true,
        (Value::Array(_), _) | (Value::Object(_), _) | (_, Value::Array(_)) | (_, Value::Object(_)) => {
            left == right
        }
        _ => match (number_of(left), number_of(right)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> bool {
    match op {
        CompareOp::Eq => loose_equals(left, right),
        CompareOp::Ne => !loose_equals(left, right),
        _ => {
            let ordering = match (left, right) {
                (Value::String(a), Value::String(b)) => Some(a.to_lowercase().cmp(&b.to_lowercase())),
                _ => match (number_of(left), number_of(right)) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => None,
                },
            };
            let Some(ordering) = ordering else {
                return false;
            };
            match op {
                CompareOp::Lt => ordering.is_lt(),
                CompareOp::Le => ordering.is_le(),
                CompareOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }
        }
    }
}

/// String form used by interpolation: null is empty, containers become JSON.
pub fn to_display_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_default(),
    }
}

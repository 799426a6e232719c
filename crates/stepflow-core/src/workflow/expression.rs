//! Step condition evaluation with JEXL.
//!
//! A condition is a JEXL expression that may embed `{{...}}` markers. Each
//! marker is rewritten to a generated identifier bound in the evaluation
//! context, so referenced values are passed as data and never spliced into
//! the expression text. Markers that cannot be resolved bind to `null`,
//! which lets a condition guard against a skipped producer.

use jexl_eval::error::EvaluationError;
use serde_json::{json, Map, Value};

use super::context::{OutputBag, INPUT_ROOT};
use super::variables::{parse_reference, scan_markers, VariableError};

#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("condition evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid condition syntax: {0}")]
    Syntax(String),

    #[error(transparent)]
    Reference(#[from] VariableError),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

fn str_arg(args: &[Value], index: usize) -> &str {
    args.get(index).and_then(|v| v.as_str()).unwrap_or("")
}

/// JavaScript-like truthiness.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// JEXL evaluator with string, boolean and length transforms registered.
pub struct WorkflowEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl WorkflowEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| Ok(json!(str_arg(args, 0).trim())))
            .with_transform("split", |args: &[Value]| {
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = str_arg(args, 0).split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("not", |args: &[Value]| {
                Ok(json!(!truthy(args.first().unwrap_or(&Value::Null))))
            })
            .with_transform("contains", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).contains(str_arg(args, 1))))
            })
            .with_transform("startsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).starts_with(str_arg(args, 1))))
            })
            .with_transform("endsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).ends_with(str_arg(args, 1))))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate an expression against an object context, coercing the
    /// result with [`truthy`].
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        Ok(truthy(&self.evaluate_value(expression, context)?))
    }

    /// Evaluate an expression and return the raw JSON value.
    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }
        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }

    /// Evaluate a step condition against the run's output bag.
    ///
    /// The context holds `input` plus one binding per marker.
    pub fn evaluate_condition(&self, condition: &str, bag: &OutputBag) -> Result<bool, ExpressionError> {
        let (expression, bindings) = bind_markers(condition, bag)?;
        let mut context = bindings;
        context.insert(INPUT_ROOT.to_string(), bag.input().clone());
        self.evaluate_bool(&expression, &Value::Object(context))
    }

    /// Check that a condition compiles once its markers are rewritten.
    ///
    /// Every marker binds `null`, so only syntax errors are reported; an
    /// evaluation error that depends on real values is not.
    pub fn check_condition(&self, condition: &str) -> Result<(), ExpressionError> {
        let bag = OutputBag::new(json!({}));
        let (expression, bindings) = bind_markers(condition, &bag)?;
        let mut context = bindings;
        context.insert(INPUT_ROOT.to_string(), bag.input().clone());
        match self.evaluator.eval_in_context(&expression, &Value::Object(context)) {
            Err(EvaluationError::ParseError(e)) => Err(ExpressionError::Syntax(e.to_string())),
            _ => Ok(()),
        }
    }
}

impl Default for WorkflowEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WorkflowEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEvaluator").finish_non_exhaustive()
    }
}

/// Identifier for the n-th marker: `vrefa`, `vrefb`, ..., `vrefz`, `vrefba`...
fn binding_name(mut n: usize) -> String {
    let mut suffix = Vec::new();
    loop {
        suffix.push((b'a' + (n % 26) as u8) as char);
        n /= 26;
        if n == 0 {
            break;
        }
    }
    suffix.reverse();
    format!("vref{}", suffix.into_iter().collect::<String>())
}

/// Replace every marker with a binding identifier and resolve its value
/// leniently (missing becomes `null`).
fn bind_markers(condition: &str, bag: &OutputBag) -> Result<(String, Map<String, Value>), ExpressionError> {
    let mut expression = String::with_capacity(condition.len());
    let mut bindings = Map::new();
    let mut last = 0;

    for (n, span) in scan_markers(condition).iter().enumerate() {
        let reference = parse_reference(span.inner(condition))?;
        let name = binding_name(n);
        let value = bag.lookup(&reference).cloned().unwrap_or(Value::Null);
        expression.push_str(&condition[last..span.start]);
        expression.push_str(&name);
        bindings.insert(name, value);
        last = span.end;
    }
    expression.push_str(&condition[last..]);

    Ok((expression, bindings))
}

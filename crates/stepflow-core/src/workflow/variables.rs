//! Variable references inside step parameters.
//!
//! A marker is `{{ path }}` where `path` is a root name followed by `.key`
//! and `[index]` segments, e.g. `{{contact.emails[0]}}`. The root `input`
//! names the trigger data; every other root is some step's `outputAs`.
//!
//! Resolution is strict: any segment that does not exist fails with
//! [`VariableError::Missing`]. A present JSON `null` counts as resolved.

use serde_json::Value;

use super::context::OutputBag;

/// Errors from parsing or resolving variable references.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VariableError {
    #[error("variable '{expression}' referenced by step '{step}' could not be resolved")]
    Missing { expression: String, step: String },

    #[error("malformed variable reference '{{{{{expression}}}}}': {reason}")]
    Malformed { expression: String, reason: String },
}

/// One segment of a reference path after the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// A parsed `{{...}}` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableRef {
    /// The trimmed text between the braces.
    pub expression: String,
    pub root: String,
    pub segments: Vec<PathSegment>,
}

impl VariableRef {
    /// Walk `segments` starting from the root value.
    pub fn walk<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut current = root;
        for segment in &self.segments {
            current = match segment {
                PathSegment::Key(key) => current.as_object()?.get(key)?,
                PathSegment::Index(index) => current.as_array()?.get(*index)?,
            };
        }
        Some(current)
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn malformed(expression: &str, reason: &str) -> VariableError {
    VariableError::Malformed {
        expression: expression.to_string(),
        reason: reason.to_string(),
    }
}

/// Parse the inside of a marker (without braces).
pub fn parse_reference(raw: &str) -> Result<VariableRef, VariableError> {
    let expr = raw.trim();
    if expr.is_empty() {
        return Err(malformed(expr, "empty reference"));
    }

    let chars: Vec<char> = expr.chars().collect();
    let mut pos = 0;

    let read_name = |pos: &mut usize| -> String {
        let start = *pos;
        while *pos < chars.len() && is_name_char(chars[*pos]) {
            *pos += 1;
        }
        chars[start..*pos].iter().collect()
    };

    let root = read_name(&mut pos);
    if root.is_empty() {
        return Err(malformed(expr, "reference must start with a name"));
    }

    let mut segments = Vec::new();
    while pos < chars.len() {
        match chars[pos] {
            '.' => {
                pos += 1;
                let key = read_name(&mut pos);
                if key.is_empty() {
                    return Err(malformed(expr, "expected a key after '.'"));
                }
                segments.push(PathSegment::Key(key));
            }
            '[' => {
                pos += 1;
                let start = pos;
                while pos < chars.len() && chars[pos].is_ascii_digit() {
                    pos += 1;
                }
                if start == pos || pos >= chars.len() || chars[pos] != ']' {
                    return Err(malformed(expr, "index must be a non-negative integer in brackets"));
                }
                let digits: String = chars[start..pos].iter().collect();
                let index = digits
                    .parse::<usize>()
                    .map_err(|_| malformed(expr, "index out of range"))?;
                pos += 1;
                segments.push(PathSegment::Index(index));
            }
            other => {
                return Err(VariableError::Malformed {
                    expression: expr.to_string(),
                    reason: format!("unexpected character '{other}'"),
                });
            }
        }
    }

    Ok(VariableRef {
        expression: expr.to_string(),
        root,
        segments,
    })
}

/// Byte span of one `{{...}}` marker within a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MarkerSpan {
    pub start: usize,
    pub end: usize,
}

impl MarkerSpan {
    pub fn inner<'a>(&self, text: &'a str) -> &'a str {
        &text[self.start + 2..self.end - 2]
    }
}

/// Locate markers. An unterminated `{{` ends the scan and stays literal.
pub(crate) fn scan_markers(text: &str) -> Vec<MarkerSpan> {
    let mut spans = Vec::new();
    let mut offset = 0;
    while let Some(open) = text[offset..].find("{{") {
        let start = offset + open;
        match text[start + 2..].find("}}") {
            Some(close) => {
                let end = start + 2 + close + 2;
                spans.push(MarkerSpan { start, end });
                offset = end;
            }
            None => break,
        }
    }
    spans
}

/// All references appearing in a string.
pub fn references_in_text(text: &str) -> Result<Vec<VariableRef>, VariableError> {
    scan_markers(text)
        .iter()
        .map(|span| parse_reference(span.inner(text)))
        .collect()
}

/// All references in a JSON template, in document order. Object keys are
/// not scanned.
pub fn find_references(template: &Value) -> Result<Vec<VariableRef>, VariableError> {
    let mut refs = Vec::new();
    collect(template, &mut refs)?;
    Ok(refs)
}

fn collect(value: &Value, out: &mut Vec<VariableRef>) -> Result<(), VariableError> {
    match value {
        Value::String(s) => out.extend(references_in_text(s)?),
        Value::Array(items) => {
            for item in items {
                collect(item, out)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect(item, out)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Resolve every marker in `template` against `bag`.
///
/// `step` names the referencing step for error reporting.
pub fn resolve(template: &Value, bag: &OutputBag, step: &str) -> Result<Value, VariableError> {
    match template {
        Value::String(s) => resolve_str(s, bag, step),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve(item, bag, step))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), resolve(item, bag, step)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_str(text: &str, bag: &OutputBag, step: &str) -> Result<Value, VariableError> {
    let spans = scan_markers(text);
    if spans.is_empty() {
        return Ok(Value::String(text.to_string()));
    }

    let lookup = |span: &MarkerSpan| -> Result<Value, VariableError> {
        let reference = parse_reference(span.inner(text))?;
        bag.lookup(&reference)
            .cloned()
            .ok_or_else(|| VariableError::Missing {
                expression: reference.expression.clone(),
                step: step.to_string(),
            })
    };

    // A lone marker keeps the referenced value's JSON type.
    if spans.len() == 1 && spans[0].start == 0 && spans[0].end == text.len() {
        return lookup(&spans[0]);
    }

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for span in &spans {
        out.push_str(&text[last..span.start]);
        match lookup(span)? {
            Value::String(s) => out.push_str(&s),
            other => out.push_str(&other.to_string()),
        }
        last = span.end;
    }
    out.push_str(&text[last..]);
    Ok(Value::String(out))
}

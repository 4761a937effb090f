//! Change filters.
//!
//! A `ChangeFilter` is the opaque predicate a watcher is bound to. The manager
//! never inspects it; stores receive it when a stream opens. The in-memory
//! store compiles it with [`ChangeFilter::compile`], which understands a fixed
//! subset of match operators evaluated against [`ChangeEvent::to_document`].
//!
//! [`ChangeEvent::to_document`]: crate::event::ChangeEvent::to_document

use std::cmp::Ordering;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StreamInitError;

/// Opaque query predicate bound to a watcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeFilter(Value);

impl ChangeFilter {
    /// Wrap a filter document.
    #[must_use]
    pub const fn new(spec: Value) -> Self {
        Self(spec)
    }

    /// A filter that matches every event.
    #[must_use]
    pub fn match_all() -> Self {
        Self(Value::Object(Map::new()))
    }

    /// Parse a filter document from JSON text.
    pub fn from_json_str(s: &str) -> Result<Self, StreamInitError> {
        let spec: Value = serde_json::from_str(s).map_err(|e| invalid(format!("filter is not valid JSON: {e}")))?;
        Ok(Self(spec))
    }

    /// The raw filter document.
    #[must_use]
    pub const fn as_value(&self) -> &Value {
        &self.0
    }

    /// Compile the filter for evaluation.
    pub fn compile(&self) -> Result<CompiledFilter, StreamInitError> {
        let Value::Object(map) = &self.0 else {
            return Err(invalid(format!("filter must be a document, got {}", self.0)));
        };
        Ok(CompiledFilter {
            root: compile_document(map)?,
        })
    }
}

impl Default for ChangeFilter {
    fn default() -> Self {
        Self::match_all()
    }
}

impl From<Value> for ChangeFilter {
    fn from(spec: Value) -> Self {
        Self(spec)
    }
}

/// A filter ready to be evaluated against event documents.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    root: Node,
}

impl CompiledFilter {
    /// Returns true if `doc` satisfies the filter.
    #[must_use]
    pub fn matches(&self, doc: &Value) -> bool {
        self.root.eval(doc)
    }
}

#[derive(Debug, Clone)]
enum Node {
    And(Vec<Node>),
    Or(Vec<Node>),
    Nor(Vec<Node>),
    Field { path: Vec<String>, preds: Vec<Predicate> },
}

#[derive(Debug, Clone)]
enum Predicate {
    Eq(Value),
    Ne(Value),
    Cmp(Ordering, bool, Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Regex(Regex),
}

fn invalid(reason: impl Into<String>) -> StreamInitError {
    StreamInitError::InvalidFilter { reason: reason.into() }
}

fn compile_document(map: &Map<String, Value>) -> Result<Node, StreamInitError> {
    let mut nodes = Vec::with_capacity(map.len());
    for (key, spec) in map {
        let node = match key.as_str() {
            "$and" => Node::And(compile_clauses(key, spec)?),
            "$or" => Node::Or(compile_clauses(key, spec)?),
            "$nor" => Node::Nor(compile_clauses(key, spec)?),
            k if k.starts_with('$') => return Err(invalid(format!("unknown top-level operator '{k}'"))),
            k => Node::Field {
                path: k.split('.').map(str::to_string).collect(),
                preds: compile_field(k, spec)?,
            },
        };
        nodes.push(node);
    }
    Ok(Node::And(nodes))
}

fn compile_clauses(op: &str, spec: &Value) -> Result<Vec<Node>, StreamInitError> {
    let Value::Array(items) = spec else {
        return Err(invalid(format!("'{op}' expects an array")));
    };
    if items.is_empty() {
        return Err(invalid(format!("'{op}' expects a non-empty array")));
    }
    items
        .iter()
        .map(|item| match item {
            Value::Object(m) => compile_document(m),
            other => Err(invalid(format!("'{op}' clauses must be documents, got {other}"))),
        })
        .collect()
}

fn is_operator_doc(spec: &Value) -> bool {
    match spec {
        Value::Object(m) => !m.is_empty() && m.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn compile_field(field: &str, spec: &Value) -> Result<Vec<Predicate>, StreamInitError> {
    if !is_operator_doc(spec) {
        return Ok(vec![Predicate::Eq(spec.clone())]);
    }
    let Value::Object(ops) = spec else {
        return Ok(vec![Predicate::Eq(spec.clone())]);
    };

    let mut preds = Vec::with_capacity(ops.len());
    for (op, arg) in ops {
        let pred = match op.as_str() {
            "$eq" => Predicate::Eq(arg.clone()),
            "$ne" => Predicate::Ne(arg.clone()),
            "$gt" => Predicate::Cmp(Ordering::Greater, false, arg.clone()),
            "$gte" => Predicate::Cmp(Ordering::Greater, true, arg.clone()),
            "$lt" => Predicate::Cmp(Ordering::Less, false, arg.clone()),
            "$lte" => Predicate::Cmp(Ordering::Less, true, arg.clone()),
            "$in" | "$nin" => {
                let Value::Array(values) = arg else {
                    return Err(invalid(format!("'{op}' on '{field}' expects an array")));
                };
                if op == "$in" {
                    Predicate::In(values.clone())
                } else {
                    Predicate::Nin(values.clone())
                }
            }
            "$exists" => match arg {
                Value::Bool(b) => Predicate::Exists(*b),
                other => return Err(invalid(format!("'$exists' on '{field}' expects a bool, got {other}"))),
            },
            "$regex" => {
                let Value::String(pattern) = arg else {
                    return Err(invalid(format!("'$regex' on '{field}' expects a string")));
                };
                let options = ops.get("$options").and_then(Value::as_str).unwrap_or("");
                Predicate::Regex(build_regex(pattern, options)?)
            }
            // Consumed by `$regex`.
            "$options" if ops.contains_key("$regex") => continue,
            other => return Err(invalid(format!("unknown operator '{other}' on '{field}'"))),
        };
        preds.push(pred);
    }
    Ok(preds)
}

fn build_regex(pattern: &str, options: &str) -> Result<Regex, StreamInitError> {
    let mut builder = RegexBuilder::new(pattern);
    for flag in options.chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            other => return Err(invalid(format!("unsupported regex option '{other}'"))),
        };
    }
    builder.build().map_err(|e| invalid(format!("invalid regex '{pattern}': {e}")))
}

fn lookup<'a>(doc: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path {
        current = match current {
            Value::Object(m) => m.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Equality with array fields matching on any element.
fn equals(field: Option<&Value>, expected: &Value) -> bool {
    match field {
        None => expected.is_null(),
        Some(v) if v == expected => true,
        Some(Value::Array(items)) => items.iter().any(|item| item == expected),
        Some(_) => false,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

impl Predicate {
    fn eval(&self, field: Option<&Value>) -> bool {
        match self {
            Self::Eq(expected) => equals(field, expected),
            Self::Ne(expected) => !equals(field, expected),
            Self::Cmp(direction, inclusive, bound) => {
                let Some(value) = field else {
                    return false;
                };
                match compare(value, bound) {
                    Some(Ordering::Equal) => *inclusive,
                    Some(ord) => ord == *direction,
                    None => false,
                }
            }
            Self::In(values) => values.iter().any(|v| equals(field, v)),
            Self::Nin(values) => !values.iter().any(|v| equals(field, v)),
            Self::Exists(expected) => field.is_some() == *expected,
            Self::Regex(re) => matches!(field, Some(Value::String(s)) if re.is_match(s)),
        }
    }
}

impl Node {
    fn eval(&self, doc: &Value) -> bool {
        match self {
            Self::And(nodes) => nodes.iter().all(|n| n.eval(doc)),
            Self::Or(nodes) => nodes.iter().any(|n| n.eval(doc)),
            Self::Nor(nodes) => !nodes.iter().any(|n| n.eval(doc)),
            Self::Field { path, preds } => {
                let field = lookup(doc, path);
                preds.iter().all(|p| p.eval(field))
            }
        }
    }
}

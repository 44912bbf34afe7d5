//! Filter query language
//!
//! Triggers, counters, actions and catalog iteration select records with a
//! small JSON query language:
//!
//! ```json
//! {"Value": {"$gt": 0}, "DestinationIDs": {"$has": ["NAT"]},
//!  "$or": [{"Weight": 10}, {"Blocker": true}]}
//! ```
//!
//! Field operators: `$eq`, `$empty`, `$gt`, `$gte`, `$lt`, `$lte`, `$btw`
//! (inclusive lower, exclusive upper), `$exp`, `$has`, `$in`, `$re`, `$sw`,
//! `$ew` and `$not`. Logical operators: `$and`, `$or`, `$not`. Sibling keys
//! are joined with an implicit `$and`; a bare value means `$eq`. Nested
//! objects without operators address dotted fields (`Balance.Value`).
//!
//! Filters are compiled once into a [`Filter`] and evaluated against any
//! [`Queryable`] record. An empty filter matches everything.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AppError;
use crate::utils::dates::{parse_duration, parse_time};
use crate::utils::StringMap;
use crate::AppResult;

/// A field value exposed to the filter engine
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Str(String),
    Dec(Decimal),
    Bool(bool),
    Time(Option<DateTime<Utc>>),
    Duration(Duration),
    Map(StringMap),
    List(Vec<String>),
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Str(s.to_string())
    }
}

impl From<Decimal> for FieldValue {
    fn from(d: Decimal) -> Self {
        FieldValue::Dec(d)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<&StringMap> for FieldValue {
    fn from(m: &StringMap) -> Self {
        FieldValue::Map(m.clone())
    }
}

/// A record that exposes named fields to filters
pub trait Queryable {
    /// Value of `name`, or `None` when the record has no such field
    fn field(&self, name: &str) -> Option<FieldValue>;
}

impl Queryable for Value {
    fn field(&self, name: &str) -> Option<FieldValue> {
        let mut current = self;
        for part in name.split('.') {
            current = current.as_object()?.get(part)?;
        }
        json_to_field(current)
    }
}

fn json_to_field(v: &Value) -> Option<FieldValue> {
    match v {
        Value::Null => Some(FieldValue::Str(String::new())),
        Value::Bool(b) => Some(FieldValue::Bool(*b)),
        Value::Number(n) => n.to_string().parse().ok().map(FieldValue::Dec),
        Value::String(s) => Some(FieldValue::Str(s.clone())),
        Value::Array(items) => Some(FieldValue::List(
            items
                .iter()
                .map(|i| match i {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
        )),
        Value::Object(obj) => {
            if obj.values().all(Value::is_boolean) {
                Some(FieldValue::Map(
                    obj.iter()
                        .map(|(k, v)| (k.clone(), v.as_bool().unwrap_or(false)))
                        .collect(),
                ))
            } else {
                None
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Op {
    Eq(Value),
    Empty(bool),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    Btw(Value, Value),
    Exp(bool),
    Has(Vec<String>),
    In(Vec<Value>),
    Re(Regex),
    Sw(String),
    Ew(String),
    Not(Vec<Op>),
}

#[derive(Debug, Clone)]
enum Node {
    All,
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
    Cond { field: String, op: Op },
}

/// A compiled filter
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Filter {
    raw: String,
    root: Node,
}

impl Filter {
    /// Compile a filter from its JSON text
    pub fn compile(raw: &str) -> AppResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }
        let value: Value = serde_json::from_str(trimmed)
            .map_err(|e| AppError::Parser(format!("filter {}: {}", trimmed, e)))?;
        let obj = value
            .as_object()
            .ok_or_else(|| AppError::Parser(format!("filter must be an object: {}", trimmed)))?;
        Ok(Self {
            raw: trimmed.to_string(),
            root: parse_object(obj, "")?,
        })
    }

    /// Original filter text
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when the filter matches everything
    pub fn is_empty(&self) -> bool {
        matches!(self.root, Node::All)
    }

    /// Evaluate against a record
    pub fn matches(&self, item: &dyn Queryable) -> bool {
        eval(&self.root, item)
    }
}

impl Default for Filter {
    fn default() -> Self {
        Self {
            raw: String::new(),
            root: Node::All,
        }
    }
}

impl PartialEq for Filter {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Filter({})", self.raw)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for Filter {
    type Error = AppError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Filter::compile(&raw)
    }
}

impl From<Filter> for String {
    fn from(f: Filter) -> Self {
        f.raw
    }
}

fn parse_object(obj: &Map<String, Value>, prefix: &str) -> AppResult<Node> {
    let mut nodes = Vec::with_capacity(obj.len());
    for (key, value) in obj {
        match key.as_str() {
            "$and" | "$or" => {
                let items = value
                    .as_array()
                    .ok_or_else(|| AppError::Parser(format!("{} expects an array", key)))?;
                let children = items
                    .iter()
                    .map(|item| {
                        item.as_object()
                            .ok_or_else(|| {
                                AppError::Parser(format!("{} items must be objects", key))
                            })
                            .and_then(|o| parse_object(o, prefix))
                    })
                    .collect::<AppResult<Vec<_>>>()?;
                nodes.push(if key == "$and" {
                    Node::And(children)
                } else {
                    Node::Or(children)
                });
            }
            "$not" => {
                let inner = value
                    .as_object()
                    .ok_or_else(|| AppError::Parser("$not expects an object".to_string()))?;
                nodes.push(Node::Not(Box::new(parse_object(inner, prefix)?)));
            }
            op if op.starts_with('$') => {
                return Err(AppError::Parser(format!("unexpected operator {}", op)));
            }
            field => {
                let path = if prefix.is_empty() {
                    field.to_string()
                } else {
                    format!("{}.{}", prefix, field)
                };
                match value {
                    Value::Object(inner) if inner.keys().all(|k| k.starts_with('$')) => {
                        for op in parse_ops(inner)? {
                            nodes.push(Node::Cond {
                                field: path.clone(),
                                op,
                            });
                        }
                    }
                    Value::Object(inner) => nodes.push(parse_object(inner, &path)?),
                    other => nodes.push(Node::Cond {
                        field: path,
                        op: Op::Eq(other.clone()),
                    }),
                }
            }
        }
    }
    Ok(match nodes.len() {
        0 => Node::All,
        1 => nodes.remove(0),
        _ => Node::And(nodes),
    })
}

fn parse_ops(obj: &Map<String, Value>) -> AppResult<Vec<Op>> {
    obj.iter().map(|(k, v)| parse_op(k, v)).collect()
}

fn parse_op(key: &str, v: &Value) -> AppResult<Op> {
    let as_bool = |v: &Value| {
        v.as_bool()
            .ok_or_else(|| AppError::Parser(format!("{} expects a boolean", key)))
    };
    let as_str = |v: &Value| {
        v.as_str()
            .map(str::to_string)
            .ok_or_else(|| AppError::Parser(format!("{} expects a string", key)))
    };
    let as_array = |v: &Value| {
        v.as_array()
            .cloned()
            .ok_or_else(|| AppError::Parser(format!("{} expects an array", key)))
    };
    Ok(match key {
        "$eq" => Op::Eq(v.clone()),
        "$empty" => Op::Empty(as_bool(v)?),
        "$gt" => Op::Gt(v.clone()),
        "$gte" => Op::Gte(v.clone()),
        "$lt" => Op::Lt(v.clone()),
        "$lte" => Op::Lte(v.clone()),
        "$btw" => {
            let bounds = as_array(v)?;
            if bounds.len() != 2 {
                return Err(AppError::Parser("$btw expects two bounds".to_string()));
            }
            Op::Btw(bounds[0].clone(), bounds[1].clone())
        }
        "$exp" => Op::Exp(as_bool(v)?),
        "$has" => Op::Has(
            as_array(v)?
                .iter()
                .map(|i| i.as_str().map(str::to_string).unwrap_or_else(|| i.to_string()))
                .collect(),
        ),
        "$in" => Op::In(as_array(v)?),
        "$re" => Op::Re(Regex::new(&as_str(v)?)?),
        "$sw" => Op::Sw(as_str(v)?),
        "$ew" => Op::Ew(as_str(v)?),
        "$not" => {
            let inner = v
                .as_object()
                .ok_or_else(|| AppError::Parser("$not expects an object".to_string()))?;
            Op::Not(parse_ops(inner)?)
        }
        other => return Err(AppError::Parser(format!("unknown operator {}", other))),
    })
}

fn eval(node: &Node, item: &dyn Queryable) -> bool {
    match node {
        Node::All => true,
        Node::And(nodes) => nodes.iter().all(|n| eval(n, item)),
        Node::Or(nodes) => nodes.iter().any(|n| eval(n, item)),
        Node::Not(inner) => !eval(inner, item),
        Node::Cond { field, op } => eval_op(op, item.field(field).as_ref()),
    }
}

fn eval_op(op: &Op, field: Option<&FieldValue>) -> bool {
    if let Op::Not(ops) = op {
        return !ops.iter().all(|o| eval_op(o, field));
    }
    if let Op::Empty(expected) = op {
        return is_empty(field) == *expected;
    }
    let Some(field) = field else {
        return false;
    };
    match op {
        Op::Eq(v) => equals(field, v),
        Op::Gt(v) => compare(field, v) == Some(Ordering::Greater),
        Op::Gte(v) => matches!(
            compare(field, v),
            Some(Ordering::Greater) | Some(Ordering::Equal)
        ),
        Op::Lt(v) => compare(field, v) == Some(Ordering::Less),
        Op::Lte(v) => matches!(
            compare(field, v),
            Some(Ordering::Less) | Some(Ordering::Equal)
        ),
        Op::Btw(low, high) => {
            matches!(
                compare(field, low),
                Some(Ordering::Greater) | Some(Ordering::Equal)
            ) && compare(field, high) == Some(Ordering::Less)
        }
        Op::Exp(expected) => {
            let expired = match field {
                FieldValue::Time(Some(t)) => *t <= Utc::now(),
                _ => false,
            };
            expired == *expected
        }
        Op::Has(keys) => match field {
            FieldValue::Map(m) => keys.iter().all(|k| m.get(k).copied().unwrap_or(false)),
            FieldValue::List(l) => keys.iter().all(|k| l.contains(k)),
            FieldValue::Str(s) => keys.iter().all(|k| k == s),
            _ => false,
        },
        Op::In(values) => match field {
            FieldValue::Map(m) => m
                .iter()
                .filter(|(_, included)| **included)
                .all(|(k, _)| values.iter().any(|v| v.as_str() == Some(k.as_str()))),
            FieldValue::List(l) => l
                .iter()
                .all(|k| values.iter().any(|v| v.as_str() == Some(k.as_str()))),
            scalar => values.iter().any(|v| equals(scalar, v)),
        },
        Op::Re(re) => match field {
            FieldValue::Str(s) => re.is_match(s),
            FieldValue::Map(m) => m.keys().any(|k| re.is_match(k)),
            FieldValue::List(l) => l.iter().any(|k| re.is_match(k)),
            _ => false,
        },
        Op::Sw(p) => matches!(field, FieldValue::Str(s) if s.starts_with(p.as_str())),
        Op::Ew(p) => matches!(field, FieldValue::Str(s) if s.ends_with(p.as_str())),
        Op::Empty(_) | Op::Not(_) => false,
    }
}

fn is_empty(field: Option<&FieldValue>) -> bool {
    match field {
        None => true,
        Some(FieldValue::Str(s)) => s.is_empty(),
        Some(FieldValue::Map(m)) => m.is_empty(),
        Some(FieldValue::List(l)) => l.is_empty(),
        Some(FieldValue::Time(t)) => t.is_none(),
        Some(_) => false,
    }
}

fn equals(field: &FieldValue, v: &Value) -> bool {
    match (field, v) {
        (FieldValue::Map(m), Value::String(s)) => m.get(s).copied().unwrap_or(false),
        (FieldValue::List(l), Value::String(s)) => l.contains(s),
        (FieldValue::Map(m), Value::Array(items)) => {
            let wanted: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
            let have: Vec<&str> = m
                .iter()
                .filter(|(_, inc)| **inc)
                .map(|(k, _)| k.as_str())
                .collect();
            wanted.len() == have.len() && wanted.iter().all(|w| have.contains(w))
        }
        (FieldValue::Time(None), Value::Null) => true,
        (FieldValue::Time(None), Value::String(s)) => s.is_empty(),
        (FieldValue::Bool(b), Value::Bool(e)) => b == e,
        (FieldValue::Bool(b), Value::String(s)) => s.parse::<bool>().map_or(false, |e| *b == e),
        (FieldValue::Str(s), Value::String(e)) => s == e,
        _ => compare(field, v) == Some(Ordering::Equal),
    }
}

fn compare(field: &FieldValue, v: &Value) -> Option<Ordering> {
    match field {
        FieldValue::Dec(d) => Some(d.cmp(&json_decimal(v)?)),
        FieldValue::Str(s) => match v {
            Value::String(e) => Some(s.as_str().cmp(e.as_str())),
            Value::Number(_) => {
                let left: Decimal = s.parse().ok()?;
                Some(left.cmp(&json_decimal(v)?))
            }
            _ => None,
        },
        FieldValue::Bool(b) => v.as_bool().map(|e| b.cmp(&e)),
        FieldValue::Time(Some(t)) => {
            let other = parse_time(v.as_str()?, "UTC").ok()?;
            Some(t.cmp(&other))
        }
        FieldValue::Duration(d) => {
            let other = match v {
                Value::String(s) => parse_duration(s).ok()?,
                Value::Number(_) => {
                    crate::utils::decimal::secs_to_duration(json_decimal(v)?)
                }
                _ => return None,
            };
            Some(d.cmp(&other))
        }
        FieldValue::Time(None) | FieldValue::Map(_) | FieldValue::List(_) => None,
    }
}

fn json_decimal(v: &Value) -> Option<Decimal> {
    match v {
        Value::Number(n) => n.to_string().parse().ok(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

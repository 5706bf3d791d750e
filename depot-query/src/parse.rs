use serde_json::{Map, Value};

use crate::ast::{
    Clause, Filter, Group, GroupOp, Operator, Projection, Query, QueryOptions, SortDir,
};

/// Reserved parameters that shape the query instead of filtering.
const RESERVED: [&str; 5] = ["$sort", "$limit", "$skip", "$fields", "$skipEvents"];

#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    UnknownOperator(String),
    InvalidParameter { name: String, reason: String },
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::UnknownOperator(op) => write!(f, "unknown operator: {op}"),
            ParseError::InvalidParameter { name, reason } => {
                write!(f, "invalid parameter {name}: {reason}")
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// The result of parsing a URL query string: the typed query, the raw
/// parameter object hooks see, and the `$skipEvents` flag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedQuery {
    pub query: Query,
    pub raw: Map<String, Value>,
    pub skip_events: bool,
}

/// Parse a URL query string into a [`ParsedQuery`].
///
/// Rules: bare `k=v` is `(k, $eq, v)` with the value JSON-parsed when it
/// looks like JSON; `$gt[field]=v` is bracket operator syntax; a JSON-object
/// value has its outer `$operators` interpreted; a comma-separated string
/// widens to an `$in` array. `$sort`, `$limit`, `$skip`, `$fields`, and
/// `$skipEvents` are reserved.
pub fn parse_query_string(qs: &str) -> Result<ParsedQuery, ParseError> {
    let mut parsed = ParsedQuery::default();
    for (key, value) in form_urlencoded::parse(qs.as_bytes()) {
        let key = key.into_owned();
        let value = value.into_owned();
        parsed.raw.insert(key.clone(), parse_scalar(&key, &value));

        if RESERVED.contains(&key.as_str()) {
            apply_reserved(&mut parsed, &key, &value)?;
            continue;
        }

        // `$op[field]=v` bracket syntax.
        if let Some((op_token, field)) = split_bracket(&key) {
            let op = Operator::from_token(op_token)
                .ok_or_else(|| ParseError::UnknownOperator(op_token.to_string()))?;
            let value = parse_scalar(field, &value);
            parsed
                .query
                .filter
                .clauses
                .push(Clause::new(field, op, widen_for(op, value)));
            continue;
        }

        if key.starts_with('$') {
            // Top-level combinators arrive as JSON arrays of branch objects.
            if key == "$or" || key == "$and" {
                let branches: Value = serde_json::from_str(&value).map_err(|e| {
                    ParseError::InvalidParameter {
                        name: key.clone(),
                        reason: e.to_string(),
                    }
                })?;
                push_group(&mut parsed.query.filter, &key, &branches)?;
                continue;
            }
            return Err(ParseError::UnknownOperator(key));
        }

        let scalar = parse_scalar(&key, &value);
        match scalar {
            // A JSON-object value carries its own operators: `?age={"$gte":18}`.
            Value::Object(ops) => {
                push_field_object(&mut parsed.query.filter, &key, &ops)?;
            }
            // A comma-separated bare value widens to `$in`.
            Value::Array(items) if !looks_like_json(&value) => {
                parsed
                    .query
                    .filter
                    .clauses
                    .push(Clause::new(&key, Operator::In, Value::Array(items)));
            }
            other => parsed.query.filter.clauses.push(Clause::eq(&key, other)),
        }
    }
    Ok(parsed)
}

fn looks_like_json(raw: &str) -> bool {
    serde_json::from_str::<Value>(raw).is_ok()
}

/// Parse a JSON object in Mongo style (`{field: v | {$op: v}, $or: [...]}`)
/// into a [`Filter`]. Used by internal calls and `$or`/`$and` branches.
pub fn filter_from_json(value: &Value) -> Result<Filter, ParseError> {
    let mut filter = Filter::new();
    let Some(obj) = value.as_object() else {
        return Ok(filter);
    };
    for (key, val) in obj {
        if key == "$or" || key == "$and" {
            push_group(&mut filter, key, val)?;
            continue;
        }
        if key.starts_with('$') {
            return Err(ParseError::UnknownOperator(key.clone()));
        }
        match val {
            Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                push_field_object(&mut filter, key, ops)?;
            }
            other => filter.clauses.push(Clause::eq(key, other.clone())),
        }
    }
    Ok(filter)
}

fn push_group(filter: &mut Filter, key: &str, branches: &Value) -> Result<(), ParseError> {
    let Some(list) = branches.as_array() else {
        return Err(ParseError::InvalidParameter {
            name: key.to_string(),
            reason: "expected an array of clause objects".into(),
        });
    };
    let op = if key == "$or" { GroupOp::Or } else { GroupOp::And };
    let mut parsed = Vec::with_capacity(list.len());
    for branch in list {
        parsed.push(filter_from_json(branch)?);
    }
    filter.groups.push(Group {
        op,
        branches: parsed,
    });
    Ok(())
}

fn push_field_object(
    filter: &mut Filter,
    field: &str,
    ops: &Map<String, Value>,
) -> Result<(), ParseError> {
    for (token, operand) in ops {
        let op = Operator::from_token(token)
            .ok_or_else(|| ParseError::UnknownOperator(token.clone()))?;
        filter
            .clauses
            .push(Clause::new(field, op, operand.clone()));
    }
    Ok(())
}

fn apply_reserved(parsed: &mut ParsedQuery, key: &str, value: &str) -> Result<(), ParseError> {
    let invalid = |reason: &str| ParseError::InvalidParameter {
        name: key.to_string(),
        reason: reason.to_string(),
    };
    match key {
        "$limit" => {
            parsed.query.options.limit =
                Some(value.parse().map_err(|_| invalid("expected an integer"))?);
        }
        "$skip" => {
            parsed.query.options.skip =
                Some(value.parse().map_err(|_| invalid("expected an integer"))?);
        }
        "$sort" => parsed.query.options.sort = parse_sort(value)?,
        "$fields" => parsed.query.options.fields = Some(parse_fields(value)?),
        "$skipEvents" => parsed.skip_events = value == "true" || value == "1",
        _ => {}
    }
    Ok(())
}

/// `$sort` accepts a JSON object (`{"age":-1}`) or a bare field name with an
/// optional `-` prefix for descending.
fn parse_sort(value: &str) -> Result<Vec<(String, SortDir)>, ParseError> {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(value) {
        let mut sort = Vec::with_capacity(map.len());
        for (field, dir) in map {
            let dir = match dir.as_i64().or_else(|| dir.as_f64().map(|f| f as i64)) {
                Some(d) if d < 0 => SortDir::Desc,
                Some(_) => SortDir::Asc,
                None => {
                    return Err(ParseError::InvalidParameter {
                        name: "$sort".into(),
                        reason: format!("direction for {field} must be 1 or -1"),
                    })
                }
            };
            sort.push((field, dir));
        }
        return Ok(sort);
    }
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    Ok(match trimmed.strip_prefix('-') {
        Some(field) => vec![(field.to_string(), SortDir::Desc)],
        None => vec![(trimmed.to_string(), SortDir::Asc)],
    })
}

fn parse_fields(value: &str) -> Result<Projection, ParseError> {
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(value) else {
        return Err(ParseError::InvalidParameter {
            name: "$fields".into(),
            reason: "expected a JSON object of field flags".into(),
        });
    };
    let mut include = std::collections::BTreeSet::new();
    let mut exclude = std::collections::BTreeSet::new();
    for (field, flag) in map {
        match flag.as_i64().or_else(|| flag.as_f64().map(|f| f as i64)) {
            Some(0) => {
                exclude.insert(field);
            }
            Some(_) => {
                include.insert(field);
            }
            None => {
                return Err(ParseError::InvalidParameter {
                    name: "$fields".into(),
                    reason: format!("flag for {field} must be 0 or 1"),
                })
            }
        }
    }
    if !include.is_empty() && !exclude.is_empty() {
        return Err(ParseError::InvalidParameter {
            name: "$fields".into(),
            reason: "cannot mix inclusion and exclusion".into(),
        });
    }
    if include.is_empty() {
        Ok(Projection::Exclude(exclude))
    } else {
        Ok(Projection::Include(include))
    }
}

/// `$op[field]` → `($op, field)`.
fn split_bracket(key: &str) -> Option<(&str, &str)> {
    if !key.starts_with('$') || !key.ends_with(']') {
        return None;
    }
    let open = key.find('[')?;
    Some((&key[..open], &key[open + 1..key.len() - 1]))
}

/// Type a raw parameter value: JSON where it parses, `$in`-widened arrays on
/// commas, string otherwise. `id` values always stay strings.
fn parse_scalar(field: &str, raw: &str) -> Value {
    if field == "id" {
        return Value::String(raw.to_string());
    }
    if let Ok(v) = serde_json::from_str::<Value>(raw) {
        match v {
            Value::Number(_) | Value::Bool(_) | Value::Null | Value::Object(_) | Value::Array(_) => {
                return v
            }
            Value::String(s) => return Value::String(s),
        }
    }
    if raw.contains(',') {
        return Value::Array(
            raw.split(',')
                .map(|part| {
                    serde_json::from_str::<Value>(part.trim())
                        .unwrap_or_else(|_| Value::String(part.trim().to_string()))
                })
                .collect(),
        );
    }
    Value::String(raw.to_string())
}

/// Comma-separated strings widen to arrays only for membership operators.
fn widen_for(op: Operator, value: Value) -> Value {
    match (op, &value) {
        (Operator::In | Operator::Nin, Value::String(s)) if s.contains(',') => Value::Array(
            s.split(',')
                .map(|p| Value::String(p.trim().to_string()))
                .collect(),
        ),
        (Operator::In | Operator::Nin, v) if !v.is_array() => {
            Value::Array(vec![value])
        }
        _ => value,
    }
}

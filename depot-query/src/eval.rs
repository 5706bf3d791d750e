use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::ast::{Filter, GroupOp, Operator, Projection, QueryOptions, SortDir};

/// Look up a possibly dotted field path in a document.
pub fn get_path<'a>(doc: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// The reference evaluator: does `doc` match `filter`?
///
/// Embedded drivers use this directly; SQL drivers are tested against it.
pub fn matches(filter: &Filter, doc: &Map<String, Value>) -> bool {
    for clause in &filter.clauses {
        if !clause_matches(doc, &clause.field, clause.op, &clause.value) {
            return false;
        }
    }
    for group in &filter.groups {
        let hit = match group.op {
            GroupOp::And => group.branches.iter().all(|b| matches(b, doc)),
            GroupOp::Or => group.branches.iter().any(|b| matches(b, doc)),
        };
        if !hit {
            return false;
        }
    }
    true
}

fn clause_matches(doc: &Map<String, Value>, field: &str, op: Operator, operand: &Value) -> bool {
    let actual = get_path(doc, field);
    match op {
        Operator::Exists => {
            let wanted = operand.as_bool().unwrap_or(true);
            actual.is_some() == wanted
        }
        Operator::Eq => actual.map(|v| value_eq(v, operand)).unwrap_or(operand.is_null()),
        Operator::Ne => !actual.map(|v| value_eq(v, operand)).unwrap_or(operand.is_null()),
        Operator::Gt => compare(actual, operand) == Some(Ordering::Greater),
        Operator::Gte => matches!(
            compare(actual, operand),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Operator::Lt => compare(actual, operand) == Some(Ordering::Less),
        Operator::Lte => matches!(
            compare(actual, operand),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Operator::In => membership(actual, operand),
        Operator::Nin => !membership(actual, operand),
        Operator::Regex => regex_matches(actual, operand),
    }
}

/// Equality with document-store array semantics: an array field matches a
/// scalar operand when any element equals it.
fn value_eq(actual: &Value, operand: &Value) -> bool {
    if actual == operand {
        return true;
    }
    match actual {
        Value::Array(items) if !operand.is_array() => items.iter().any(|v| v == operand),
        _ => false,
    }
}

fn membership(actual: Option<&Value>, operand: &Value) -> bool {
    let Some(candidates) = operand.as_array() else {
        return false;
    };
    match actual {
        Some(Value::Array(items)) => items.iter().any(|v| candidates.contains(v)),
        Some(v) => candidates.contains(v),
        None => false,
    }
}

fn regex_matches(actual: Option<&Value>, operand: &Value) -> bool {
    let (Some(Value::String(s)), Some(pattern)) = (actual, operand.as_str()) else {
        return false;
    };
    match regex::Regex::new(pattern) {
        Ok(re) => re.is_match(s),
        Err(_) => false,
    }
}

/// Order two JSON values: numbers numerically, strings (including RFC3339
/// dates) lexicographically, booleans false-before-true. Mixed or missing
/// types do not compare.
pub fn compare(actual: Option<&Value>, operand: &Value) -> Option<Ordering> {
    let actual = actual?;
    match (actual, operand) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Apply sort, skip, and limit to an in-process result set.
pub fn apply_options(mut docs: Vec<Map<String, Value>>, options: &QueryOptions) -> Vec<Map<String, Value>> {
    if !options.sort.is_empty() {
        docs.sort_by(|a, b| {
            for (field, dir) in &options.sort {
                let av = get_path(a, field);
                let bv = get_path(b, field);
                let ord = order_values(av, bv);
                let ord = match dir {
                    SortDir::Asc => ord,
                    SortDir::Desc => ord.reverse(),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }
    let skip = options.skip.unwrap_or(0) as usize;
    let docs: Vec<_> = docs.into_iter().skip(skip).collect();
    match options.limit {
        Some(limit) => docs.into_iter().take(limit as usize).collect(),
        None => docs,
    }
}

/// Total order for sorting: missing values last, then by type bucket.
fn order_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => match (a, b) {
            (Value::Number(x), Value::Number(y)) => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
            (Value::String(x), Value::String(y)) => x.cmp(y),
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            _ => Ordering::Equal,
        },
    }
}

/// Apply a `$fields` projection to one document. The `id` field survives an
/// inclusion projection unless explicitly excluded.
pub fn apply_projection(doc: &mut Map<String, Value>, projection: &Projection) {
    match projection {
        Projection::Include(fields) => {
            let keep: Vec<String> = doc
                .keys()
                .filter(|k| fields.contains(*k) || *k == "id")
                .cloned()
                .collect();
            let mut kept = Map::new();
            for k in keep {
                if let Some(v) = doc.remove(&k) {
                    kept.insert(k, v);
                }
            }
            *doc = kept;
        }
        Projection::Exclude(fields) => {
            for field in fields {
                doc.remove(field);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Clause, Group, SortDir};
    use serde_json::json;

    fn doc(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    fn clause_filter(field: &str, op: Operator, value: Value) -> Filter {
        Filter {
            clauses: vec![Clause::new(field, op, value)],
            groups: vec![],
        }
    }

    #[test]
    fn comparison_operators() {
        let d = doc(json!({"age": 20}));
        assert!(matches(&clause_filter("age", Operator::Gte, json!(20)), &d));
        assert!(matches(&clause_filter("age", Operator::Gt, json!(19)), &d));
        assert!(!matches(&clause_filter("age", Operator::Lt, json!(20)), &d));
        assert!(matches(&clause_filter("age", Operator::Ne, json!(21)), &d));
    }

    #[test]
    fn string_comparison_is_lexicographic() {
        let d = doc(json!({"name": "bob"}));
        assert!(matches(
            &clause_filter("name", Operator::Gt, json!("alice")),
            &d
        ));
    }

    #[test]
    fn membership_operators() {
        let d = doc(json!({"status": "open", "tags": ["a", "b"]}));
        assert!(matches(
            &clause_filter("status", Operator::In, json!(["open", "closed"])),
            &d
        ));
        assert!(matches(
            &clause_filter("tags", Operator::In, json!(["b"])),
            &d
        ));
        assert!(matches(
            &clause_filter("status", Operator::Nin, json!(["closed"])),
            &d
        ));
    }

    #[test]
    fn exists_checks_presence() {
        let d = doc(json!({"a": 1}));
        assert!(matches(&clause_filter("a", Operator::Exists, json!(true)), &d));
        assert!(matches(
            &clause_filter("b", Operator::Exists, json!(false)),
            &d
        ));
        assert!(!matches(
            &clause_filter("b", Operator::Exists, json!(true)),
            &d
        ));
    }

    #[test]
    fn regex_matches_strings() {
        let d = doc(json!({"email": "alice@example.com"}));
        assert!(matches(
            &clause_filter("email", Operator::Regex, json!("@example\\.com$")),
            &d
        ));
        assert!(!matches(
            &clause_filter("email", Operator::Regex, json!("^bob")),
            &d
        ));
    }

    #[test]
    fn array_field_equality_means_contains() {
        let d = doc(json!({"tags": ["x", "y"]}));
        assert!(matches(&clause_filter("tags", Operator::Eq, json!("x")), &d));
        assert!(!matches(&clause_filter("tags", Operator::Eq, json!("z")), &d));
    }

    #[test]
    fn or_groups() {
        let filter = Filter {
            clauses: vec![],
            groups: vec![Group {
                op: GroupOp::Or,
                branches: vec![
                    clause_filter("age", Operator::Eq, json!(10)),
                    clause_filter("age", Operator::Eq, json!(20)),
                ],
            }],
        };
        assert!(matches(&filter, &doc(json!({"age": 10}))));
        assert!(matches(&filter, &doc(json!({"age": 20}))));
        assert!(!matches(&filter, &doc(json!({"age": 30}))));
    }

    #[test]
    fn dotted_paths_reach_nested_fields() {
        let d = doc(json!({"address": {"city": "berlin"}}));
        assert!(matches(
            &clause_filter("address.city", Operator::Eq, json!("berlin")),
            &d
        ));
    }

    #[test]
    fn sort_skip_limit() {
        let docs: Vec<_> = [30, 10, 20]
            .iter()
            .map(|n| doc(json!({"age": n})))
            .collect();
        let options = QueryOptions {
            sort: vec![("age".into(), SortDir::Desc)],
            limit: Some(2),
            skip: Some(1),
            fields: None,
        };
        let out = apply_options(docs, &options);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].get("age"), Some(&json!(20)));
        assert_eq!(out[1].get("age"), Some(&json!(10)));
    }

    #[test]
    fn inclusion_projection_keeps_id() {
        let mut d = doc(json!({"id": "1", "a": 1, "b": 2}));
        apply_projection(
            &mut d,
            &Projection::Include(["a".to_string()].into_iter().collect()),
        );
        assert_eq!(d.len(), 2);
        assert!(d.contains_key("id"));
        assert!(d.contains_key("a"));
    }

    #[test]
    fn exclusion_projection_removes_fields() {
        let mut d = doc(json!({"id": "1", "a": 1, "b": 2}));
        apply_projection(
            &mut d,
            &Projection::Exclude(["b".to_string()].into_iter().collect()),
        );
        assert!(!d.contains_key("b"));
        assert!(d.contains_key("a"));
    }
}

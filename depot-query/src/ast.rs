use std::collections::BTreeSet;

use serde_json::{Map, Value};

/// A leaf comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
    Regex,
    Exists,
}

impl Operator {
    /// Parse a `$`-prefixed operator token.
    pub fn from_token(token: &str) -> Option<Operator> {
        Some(match token {
            "$eq" => Operator::Eq,
            "$ne" => Operator::Ne,
            "$gt" => Operator::Gt,
            "$gte" => Operator::Gte,
            "$lt" => Operator::Lt,
            "$lte" => Operator::Lte,
            "$in" => Operator::In,
            "$nin" => Operator::Nin,
            "$regex" => Operator::Regex,
            "$exists" => Operator::Exists,
            _ => return None,
        })
    }

    pub fn as_token(self) -> &'static str {
        match self {
            Operator::Eq => "$eq",
            Operator::Ne => "$ne",
            Operator::Gt => "$gt",
            Operator::Gte => "$gte",
            Operator::Lt => "$lt",
            Operator::Lte => "$lte",
            Operator::In => "$in",
            Operator::Nin => "$nin",
            Operator::Regex => "$regex",
            Operator::Exists => "$exists",
        }
    }
}

/// One `(field, operator, value)` comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub field: String,
    pub op: Operator,
    pub value: Value,
}

impl Clause {
    pub fn new(field: impl Into<String>, op: Operator, value: Value) -> Self {
        Clause {
            field: field.into(),
            op,
            value,
        }
    }

    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Clause::new(field, Operator::Eq, value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOp {
    And,
    Or,
}

/// A `$and`/`$or` combinator over sub-filters.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub op: GroupOp,
    pub branches: Vec<Filter>,
}

/// A backend-neutral filter: a list of clauses (implicitly AND-ed) plus
/// optional combinator groups, themselves AND-ed with the clause list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub clauses: Vec<Clause>,
    pub groups: Vec<Group>,
}

impl Filter {
    pub fn new() -> Self {
        Filter::default()
    }

    /// A filter matching exactly one document id.
    pub fn by_id(id: &str) -> Self {
        let mut filter = Filter::new();
        filter.clauses.push(Clause::eq("id", Value::String(id.into())));
        filter
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty() && self.groups.is_empty()
    }

    /// Prepend an equality clause; used for ownership scoping.
    pub fn push_eq(&mut self, field: &str, value: Value) {
        self.clauses.insert(0, Clause::eq(field, value));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

/// Response shaping: included or excluded field sets (`$fields`).
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Include(BTreeSet<String>),
    Exclude(BTreeSet<String>),
}

/// Options record carried alongside a filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    pub sort: Vec<(String, SortDir)>,
    pub limit: Option<u64>,
    pub skip: Option<u64>,
    pub fields: Option<Projection>,
}

/// A complete query: filter plus options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filter: Filter,
    pub options: QueryOptions,
}

impl Query {
    pub fn by_id(id: &str) -> Self {
        Query {
            filter: Filter::by_id(id),
            options: QueryOptions::default(),
        }
    }
}

/// The update AST: `$set` assignments and `$unset` removals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub set: Map<String, Value>,
    pub unset: Vec<String>,
}

impl Update {
    pub fn new() -> Self {
        Update::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: Value) -> Self {
        self.set.insert(field.into(), value);
        self
    }

    pub fn unset(mut self, field: impl Into<String>) -> Self {
        self.unset.push(field.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }

    /// Apply this update to a document in place. `$set` runs before `$unset`.
    pub fn apply(&self, doc: &mut Map<String, Value>) {
        for (k, v) in &self.set {
            doc.insert(k.clone(), v.clone());
        }
        for k in &self.unset {
            doc.remove(k);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn update_applies_set_then_unset() {
        let mut doc = json!({"a": 1, "b": 2}).as_object().unwrap().clone();
        let update = Update::new()
            .set("a", json!(10))
            .set("c", json!(3))
            .unset("b");
        update.apply(&mut doc);
        assert_eq!(doc.get("a"), Some(&json!(10)));
        assert_eq!(doc.get("c"), Some(&json!(3)));
        assert!(doc.get("b").is_none());
    }

    #[test]
    fn by_id_builds_a_single_clause() {
        let q = Query::by_id("abc");
        assert_eq!(q.filter.clauses.len(), 1);
        assert_eq!(q.filter.clauses[0], Clause::eq("id", json!("abc")));
    }

    #[test]
    fn operator_tokens_round_trip() {
        for op in [
            Operator::Eq,
            Operator::Ne,
            Operator::Gt,
            Operator::Gte,
            Operator::Lt,
            Operator::Lte,
            Operator::In,
            Operator::Nin,
            Operator::Regex,
            Operator::Exists,
        ] {
            assert_eq!(Operator::from_token(op.as_token()), Some(op));
        }
        assert_eq!(Operator::from_token("$where"), None);
    }
}

use serde_json::Value;

use crate::ast::{Filter, GroupOp, Operator, QueryOptions, SortDir};

/// SQL dialect for placeholder style and JSON extraction syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// SQLite `?` placeholders and `json_extract(data, '$.path')`.
    Sqlite,
    /// Postgres `$n` placeholders and `data #>> '{path}'` with casts.
    Postgres,
}

impl Dialect {
    fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Sqlite => "?".to_string(),
            Dialect::Postgres => format!("${index}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TranslateError {
    /// The backend does not recognize this operator (`$regex` in SQL).
    UnsupportedOperator(String),
    InvalidField(String),
}

impl std::fmt::Display for TranslateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranslateError::UnsupportedOperator(op) => {
                write!(f, "operator not supported by this backend: {op}")
            }
            TranslateError::InvalidField(field) => write!(f, "invalid field name: {field}"),
        }
    }
}

impl std::error::Error for TranslateError {}

/// A translated filter: a WHERE expression (without the keyword, empty when
/// unfiltered) plus positional bind values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlFilter {
    pub expr: String,
    pub binds: Vec<Value>,
}

/// Translate a filter into a WHERE expression for `dialect`.
///
/// The `id` field maps to the primary-key column; every other field is
/// extracted from the JSON `data` column. Field names are validated against
/// a conservative identifier pattern before they are interpolated.
pub fn filter_to_sql(filter: &Filter, dialect: Dialect) -> Result<SqlFilter, TranslateError> {
    let mut out = SqlFilter::default();
    let mut index = 1usize;
    let expr = filter_expr(filter, dialect, &mut out.binds, &mut index)?;
    out.expr = expr;
    Ok(out)
}

fn filter_expr(
    filter: &Filter,
    dialect: Dialect,
    binds: &mut Vec<Value>,
    index: &mut usize,
) -> Result<String, TranslateError> {
    let mut parts = Vec::new();
    for clause in &filter.clauses {
        parts.push(clause_expr(
            &clause.field,
            clause.op,
            &clause.value,
            dialect,
            binds,
            index,
        )?);
    }
    for group in &filter.groups {
        let joiner = match group.op {
            GroupOp::And => " AND ",
            GroupOp::Or => " OR ",
        };
        let mut branches = Vec::with_capacity(group.branches.len());
        for branch in &group.branches {
            let expr = filter_expr(branch, dialect, binds, index)?;
            if !expr.is_empty() {
                branches.push(format!("({expr})"));
            }
        }
        if !branches.is_empty() {
            parts.push(format!("({})", branches.join(joiner)));
        }
    }
    Ok(parts.join(" AND "))
}

fn clause_expr(
    field: &str,
    op: Operator,
    value: &Value,
    dialect: Dialect,
    binds: &mut Vec<Value>,
    index: &mut usize,
) -> Result<String, TranslateError> {
    let column = extract_expr(field, value, dialect)?;
    let mut bind = |value: &Value, binds: &mut Vec<Value>, index: &mut usize| {
        let ph = dialect.placeholder(*index);
        *index += 1;
        binds.push(value.clone());
        ph
    };
    Ok(match op {
        Operator::Eq => {
            if value.is_null() {
                format!("{column} IS NULL")
            } else {
                let ph = bind(value, binds, index);
                format!("{column} = {ph}")
            }
        }
        Operator::Ne => {
            if value.is_null() {
                format!("{column} IS NOT NULL")
            } else {
                let ph = bind(value, binds, index);
                format!("{column} != {ph}")
            }
        }
        Operator::Gt => {
            let ph = bind(value, binds, index);
            format!("{column} > {ph}")
        }
        Operator::Gte => {
            let ph = bind(value, binds, index);
            format!("{column} >= {ph}")
        }
        Operator::Lt => {
            let ph = bind(value, binds, index);
            format!("{column} < {ph}")
        }
        Operator::Lte => {
            let ph = bind(value, binds, index);
            format!("{column} <= {ph}")
        }
        Operator::In | Operator::Nin => {
            let items = value.as_array().cloned().unwrap_or_else(|| vec![value.clone()]);
            let placeholders: Vec<_> = items
                .iter()
                .map(|item| bind(item, binds, index))
                .collect();
            let keyword = if op == Operator::In { "IN" } else { "NOT IN" };
            format!("{column} {keyword} ({})", placeholders.join(", "))
        }
        Operator::Exists => {
            if value.as_bool().unwrap_or(true) {
                format!("{column} IS NOT NULL")
            } else {
                format!("{column} IS NULL")
            }
        }
        Operator::Regex => {
            return Err(TranslateError::UnsupportedOperator("$regex".into()));
        }
    })
}

/// The SQL expression that reads `field` from a row.
fn extract_expr(field: &str, value: &Value, dialect: Dialect) -> Result<String, TranslateError> {
    if !is_valid_field(field) {
        return Err(TranslateError::InvalidField(field.to_string()));
    }
    if field == "id" {
        return Ok("id".to_string());
    }
    Ok(match dialect {
        Dialect::Sqlite => format!("json_extract(data, '$.{field}')"),
        Dialect::Postgres => {
            // `#>>` yields text; cast by operand type, as JSONB comparisons
            // would otherwise always be textual.
            let path = field.split('.').collect::<Vec<_>>().join(",");
            let extracted = format!("(data #>> '{{{path}}}')");
            match value {
                Value::Number(_) => format!("{extracted}::numeric"),
                Value::Bool(_) => format!("{extracted}::boolean"),
                _ => extracted,
            }
        }
    })
}

/// ORDER BY / LIMIT / OFFSET for the options record. Returns an empty string
/// when no shaping applies.
pub fn options_to_sql(options: &QueryOptions, dialect: Dialect) -> Result<String, TranslateError> {
    let mut sql = String::new();
    if !options.sort.is_empty() {
        let mut clauses = Vec::with_capacity(options.sort.len());
        for (field, dir) in &options.sort {
            let column = extract_expr(field, &Value::Null, dialect)?;
            let dir = match dir {
                SortDir::Asc => "ASC",
                SortDir::Desc => "DESC",
            };
            clauses.push(format!("{column} {dir}"));
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(&clauses.join(", "));
    }
    if let Some(limit) = options.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    if let Some(skip) = options.skip {
        if options.limit.is_none() {
            // SQLite requires LIMIT before OFFSET.
            sql.push_str(" LIMIT -1");
        }
        sql.push_str(&format!(" OFFSET {skip}"));
    }
    Ok(sql)
}

fn is_valid_field(field: &str) -> bool {
    !field.is_empty()
        && field.split('.').all(|segment| {
            let mut chars = segment.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

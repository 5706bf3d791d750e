//! # depot-query — backend-neutral query and update ASTs
//!
//! Everything a collection query goes through lives here:
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`ast`] | `Filter` / `Clause` / `Query` / `Update` value types |
//! | [`parse`] | URL query strings and Mongo-style JSON objects → AST |
//! | [`eval`] | The reference in-process evaluator (also the embedded drivers' engine) |
//! | [`sql`] | AST → dialect-specific SQL over a JSON `data` column |
//!
//! The AST is value-typed; drivers that cannot express an operator refuse it
//! with a deterministic [`sql::TranslateError::UnsupportedOperator`] rather
//! than approximating.

pub mod ast;
pub mod eval;
pub mod parse;
pub mod sql;

pub use ast::{
    Clause, Filter, Group, GroupOp, Operator, Projection, Query, QueryOptions, SortDir, Update,
};
pub use parse::{filter_from_json, parse_query_string, ParseError, ParsedQuery};

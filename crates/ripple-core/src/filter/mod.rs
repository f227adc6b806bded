//! Filter and watch-projection compilation.
//!
//! User predicates arrive in one of two shapes: *query form* (field to
//! value with `$`-prefixed operators, the familiar document-query dialect)
//! or *expression form* (a raw SQL predicate over the `doc` column, SQL
//! being this store's expression language). Query form is parsed into a
//! tagged
//! AST and compiled into a parameterised SQL fragment; anything the
//! compiler does not support fails fast at registration with a precise
//! message, never at runtime.
//!
//! The parser and compiler are pure: no I/O, no store handles.

mod compile;
mod parse;
mod projection;

pub use compile::compiled_sql;
pub use parse::{parse_filter, CompareOp, Expr, FieldPath};
pub use projection::{compile_projection, Projection};

use ripple_db::sql::Sql;
use thiserror::Error;

/// Errors raised while compiling a filter or projection. These are
/// configuration errors: they surface at registration time and never reach
/// the runtime loops.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("unsupported operator {operator:?} at {path:?}")]
    UnsupportedOperator { operator: String, path: String },

    #[error("invalid filter shape at {path:?}: {reason}")]
    InvalidShape { path: String, reason: String },

    #[error("invalid field path {0:?}")]
    InvalidPath(String),

    #[error("unsupported regex options {0:?} (only \"i\" is available)")]
    InvalidRegexOptions(String),

    #[error("unsupported $type alias {0:?}")]
    UnsupportedType(String),

    #[error("exclusion projections are not supported (key {0:?})")]
    ExclusionProjection(String),

    #[error("projection key {0:?} conflicts with a nested key")]
    ProjectionConflict(String),

    #[error("raw SQL expression rejected: {0}")]
    UnsafeExpression(String),
}

/// A compiled predicate: the parsed AST plus its rendering.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    pub expr: Expr,
}

impl CompiledFilter {
    /// Compile a predicate from either input shape.
    pub fn compile(input: &serde_json::Value) -> Result<Self, FilterError> {
        Ok(Self {
            expr: parse_filter(input)?,
        })
    }

    /// Render as a SQL fragment evaluated against `{alias}.doc`.
    ///
    /// Raw expression-form predicates reference the bare `doc` column and
    /// rely on it being unambiguous in the enclosing statement (tasks
    /// tables have no `doc` column).
    pub fn to_sql(&self, alias: &str) -> Sql {
        compiled_sql(&self.expr, alias)
    }
}

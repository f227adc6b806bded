//! Composable SQL fragments.
//!
//! Compiled filter predicates and watch projections are built away from the
//! statements that embed them, so fragments carry `?` placeholders that are
//! renumbered to `$n` when the final statement is assembled. Fragment text
//! never contains a literal `?` (jsonb existence checks use the
//! `jsonb_exists` function form rather than the `?` operator).

use serde_json::Value;
use sqlx::postgres::PgArguments;
use sqlx::query::{Query, QueryAs};
use sqlx::Postgres;

/// A typed bind parameter carried by a [`Sql`] fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Json(Value),
    Text(String),
    TextArray(Vec<String>),
    Int(i64),
    Float(f64),
    Bool(bool),
}

/// A SQL fragment with positional `?` placeholders and its parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sql {
    pub text: String,
    pub params: Vec<SqlParam>,
}

impl Sql {
    /// A fragment with no parameters.
    pub fn raw(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: Vec::new(),
        }
    }

    /// Rewrite the fragment's `?` placeholders to `$n`, numbering from
    /// `start` (1-based). Returns the rewritten text.
    pub fn numbered(&self, start: usize) -> String {
        let mut out = String::with_capacity(self.text.len() + self.params.len() * 2);
        let mut n = start;
        for ch in self.text.chars() {
            if ch == '?' {
                out.push('$');
                out.push_str(&n.to_string());
                n += 1;
            } else {
                out.push(ch);
            }
        }
        out
    }

    /// Number of placeholders in the fragment.
    pub fn placeholder_count(&self) -> usize {
        self.text.chars().filter(|c| *c == '?').count()
    }
}

/// Bind a slice of [`SqlParam`]s onto a query, in order.
pub fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [SqlParam],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            SqlParam::Json(v) => query.bind(v),
            SqlParam::Text(s) => query.bind(s),
            SqlParam::TextArray(a) => query.bind(a),
            SqlParam::Int(i) => query.bind(i),
            SqlParam::Float(f) => query.bind(f),
            SqlParam::Bool(b) => query.bind(b),
        };
    }
    query
}

/// Bind a slice of [`SqlParam`]s onto a typed query, in order.
pub fn bind_params_as<'q, T>(
    mut query: QueryAs<'q, Postgres, T, PgArguments>,
    params: &'q [SqlParam],
) -> QueryAs<'q, Postgres, T, PgArguments> {
    for param in params {
        query = match param {
            SqlParam::Json(v) => query.bind(v),
            SqlParam::Text(s) => query.bind(s),
            SqlParam::TextArray(a) => query.bind(a),
            SqlParam::Int(i) => query.bind(i),
            SqlParam::Float(f) => query.bind(f),
            SqlParam::Bool(b) => query.bind(b),
        };
    }
    query
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renumbers_from_offset() {
        let sql = Sql {
            text: "a = ?::jsonb AND b > ?".to_owned(),
            params: vec![SqlParam::Json(json!(1)), SqlParam::Int(2)],
        };
        assert_eq!(sql.numbered(1), "a = $1::jsonb AND b > $2");
        assert_eq!(sql.numbered(4), "a = $4::jsonb AND b > $5");
        assert_eq!(sql.placeholder_count(), 2);
    }

    #[test]
    fn raw_has_no_params() {
        let sql = Sql::raw("TRUE");
        assert_eq!(sql.numbered(7), "TRUE");
        assert_eq!(sql.placeholder_count(), 0);
    }
}

//! AST → SQL fragment rendering.
//!
//! Fragments use `?` placeholders (renumbered at statement assembly) and
//! never contain a literal `?` otherwise: jsonb existence checks use the
//! `jsonb_exists` function form instead of the `?` operator.

use ripple_db::sql::{Sql, SqlParam};
use serde_json::Value;

use super::parse::{CompareOp, Expr, FieldPath};

/// Render an expression against `{alias}.doc`.
pub fn compiled_sql(expr: &Expr, alias: &str) -> Sql {
    let mut out = Sql::default();
    render(expr, alias, &mut out);
    if out.text.is_empty() {
        out.text = "TRUE".to_owned();
    }
    out
}

/// JSONB accessor for a path: `->` for single segments, `#>` for dotted
/// paths. Segments are validated at parse time, so embedding them as text
/// literals is safe.
fn jsonb_accessor(alias: &str, path: &FieldPath) -> String {
    let segments = path.segments();
    if segments.len() == 1 {
        format!("{alias}.doc -> '{}'", segments[0])
    } else {
        format!("{alias}.doc #> '{{{}}}'", segments.join(","))
    }
}

/// Text accessor (`->>` / `#>>`) for operators that compare strings.
fn text_accessor(alias: &str, path: &FieldPath) -> String {
    let segments = path.segments();
    if segments.len() == 1 {
        format!("{alias}.doc ->> '{}'", segments[0])
    } else {
        format!("{alias}.doc #>> '{{{}}}'", segments.join(","))
    }
}

fn render(expr: &Expr, alias: &str, out: &mut Sql) {
    match expr {
        Expr::And(branches) => render_joined(branches, " AND ", "TRUE", alias, out),
        Expr::Or(branches) => render_joined(branches, " OR ", "FALSE", alias, out),
        Expr::Nor(branches) => {
            out.text.push_str("NOT ");
            render_joined(branches, " OR ", "FALSE", alias, out);
        }
        Expr::Not(inner) => {
            out.text.push_str("NOT ");
            render_grouped(inner, alias, out);
        }
        Expr::Compare { path, op, value } => render_compare(path, *op, value, alias, out),
        Expr::In {
            path,
            values,
            negated,
        } => render_in(path, values, *negated, alias, out),
        Expr::Exists { path, expected } => {
            let check = if path.segments().len() == 1 {
                format!("jsonb_exists({alias}.doc, '{}')", path.segments()[0])
            } else {
                format!("{} IS NOT NULL", jsonb_accessor(alias, path))
            };
            if *expected {
                out.text.push_str(&check);
            } else {
                out.text.push_str("NOT (");
                out.text.push_str(&check);
                out.text.push(')');
            }
        }
        Expr::Regex {
            path,
            pattern,
            case_insensitive,
        } => {
            let op = if *case_insensitive { "~*" } else { "~" };
            out.text
                .push_str(&format!("{} {op} ?", text_accessor(alias, path)));
            out.params.push(SqlParam::Text(pattern.clone()));
        }
        Expr::TypeOf { path, type_name } => {
            out.text.push_str(&format!(
                "jsonb_typeof({}) = ?",
                jsonb_accessor(alias, path)
            ));
            out.params.push(SqlParam::Text((*type_name).to_owned()));
        }
        Expr::Size { path, size } => {
            out.text.push_str(&format!(
                "jsonb_array_length({}) = ?",
                jsonb_accessor(alias, path)
            ));
            out.params.push(SqlParam::Int(*size));
        }
        Expr::Raw(raw) => {
            out.text.push('(');
            out.text.push_str(raw);
            out.text.push(')');
        }
    }
}

fn render_joined(branches: &[Expr], sep: &str, empty: &str, alias: &str, out: &mut Sql) {
    if branches.is_empty() {
        out.text.push_str(empty);
        return;
    }
    out.text.push('(');
    for (i, branch) in branches.iter().enumerate() {
        if i > 0 {
            out.text.push_str(sep);
        }
        render_grouped(branch, alias, out);
    }
    out.text.push(')');
}

fn render_grouped(expr: &Expr, alias: &str, out: &mut Sql) {
    out.text.push('(');
    render(expr, alias, out);
    out.text.push(')');
}

fn render_compare(path: &FieldPath, op: CompareOp, value: &Value, alias: &str, out: &mut Sql) {
    let accessor = jsonb_accessor(alias, path);

    // Equality with null matches missing fields as well as explicit nulls,
    // matching the query dialect's semantics.
    if value.is_null() && matches!(op, CompareOp::Eq | CompareOp::Ne) {
        let text = format!("({accessor} IS NULL OR {accessor} = 'null'::jsonb)");
        if op == CompareOp::Eq {
            out.text.push_str(&text);
        } else {
            out.text.push_str(&format!("NOT {text}"));
        }
        return;
    }

    let sql_op = match op {
        CompareOp::Eq => "=",
        // DISTINCT FROM so a missing field satisfies $ne.
        CompareOp::Ne => "IS DISTINCT FROM",
        CompareOp::Gt => ">",
        CompareOp::Gte => ">=",
        CompareOp::Lt => "<",
        CompareOp::Lte => "<=",
    };
    out.text.push_str(&format!("{accessor} {sql_op} ?"));
    out.params.push(SqlParam::Json(value.clone()));
}

fn render_in(path: &FieldPath, values: &[Value], negated: bool, alias: &str, out: &mut Sql) {
    let accessor = jsonb_accessor(alias, path);

    if values.is_empty() {
        // $in [] matches nothing; $nin [] matches everything.
        out.text.push_str(if negated { "TRUE" } else { "FALSE" });
        return;
    }

    let contains_null = values.iter().any(Value::is_null);
    let non_null: Vec<&Value> = values.iter().filter(|v| !v.is_null()).collect();

    let mut membership = String::new();
    if !non_null.is_empty() {
        membership.push_str(&format!("{accessor} IN ("));
        for (i, value) in non_null.iter().enumerate() {
            if i > 0 {
                membership.push_str(", ");
            }
            membership.push('?');
            out.params.push(SqlParam::Json((*value).clone()));
        }
        membership.push(')');
    }
    if contains_null {
        let null_clause = format!("({accessor} IS NULL OR {accessor} = 'null'::jsonb)");
        if membership.is_empty() {
            membership = null_clause;
        } else {
            membership = format!("({membership} OR {null_clause})");
        }
    }

    if negated {
        out.text.push_str(&format!(
            "NOT COALESCE({membership}, FALSE)"
        ));
    } else {
        out.text.push_str(&membership);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::CompiledFilter;
    use super::*;

    fn sql_for(filter: serde_json::Value) -> Sql {
        CompiledFilter::compile(&filter).unwrap().to_sql("s")
    }

    #[test]
    fn literal_equality_binds_jsonb() {
        let sql = sql_for(json!({"status": "A"}));
        assert_eq!(sql.text, "s.doc -> 'status' = ?");
        assert_eq!(sql.params, vec![SqlParam::Json(json!("A"))]);
    }

    #[test]
    fn dotted_path_uses_path_accessor() {
        let sql = sql_for(json!({"a.b": 1}));
        assert_eq!(sql.text, "s.doc #> '{a,b}' = ?");
    }

    #[test]
    fn in_expands_placeholders() {
        let sql = sql_for(json!({"status": {"$in": ["A", "B"]}}));
        assert_eq!(sql.text, "s.doc -> 'status' IN (?, ?)");
        assert_eq!(sql.params.len(), 2);
    }

    #[test]
    fn nin_matches_missing_fields() {
        let sql = sql_for(json!({"status": {"$nin": ["A"]}}));
        assert!(sql.text.starts_with("NOT COALESCE"));
    }

    #[test]
    fn exists_uses_function_form() {
        let sql = sql_for(json!({"flag": {"$exists": true}}));
        assert_eq!(sql.text, "jsonb_exists(s.doc, 'flag')");
        assert!(sql.params.is_empty());

        let sql = sql_for(json!({"a.b": {"$exists": false}}));
        assert_eq!(sql.text, "NOT (s.doc #> '{a,b}' IS NOT NULL)");
    }

    #[test]
    fn null_equality_covers_missing() {
        let sql = sql_for(json!({"gone": null}));
        assert_eq!(
            sql.text,
            "(s.doc -> 'gone' IS NULL OR s.doc -> 'gone' = 'null'::jsonb)"
        );
    }

    #[test]
    fn no_stray_question_marks() {
        // Every `?` in compiled text must be a placeholder; the param count
        // must match exactly or renumbering would corrupt statements.
        let sql = sql_for(json!({
            "$and": [
                {"a": {"$exists": true}},
                {"b": {"$regex": "x?y"}},
                {"c": {"$in": [1, 2, 3]}}
            ]
        }));
        assert_eq!(sql.placeholder_count(), sql.params.len());
    }

    #[test]
    fn logical_nesting_parenthesized() {
        let sql = sql_for(json!({"$nor": [{"a": 1}, {"b": 2}]}));
        assert!(sql.text.starts_with("NOT ("));
        assert_eq!(sql.params.len(), 2);
    }

    #[test]
    fn raw_expression_passes_through() {
        let sql = sql_for(json!({"$sql": "(doc->>'n')::int > 3"}));
        assert_eq!(sql.text, "((doc->>'n')::int > 3)");
        assert!(sql.params.is_empty());
    }

    #[test]
    fn empty_filter_is_true() {
        let sql = sql_for(json!({}));
        assert_eq!(sql.text, "TRUE");
    }
}

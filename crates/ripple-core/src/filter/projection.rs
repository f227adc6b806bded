//! Watch-projection compiler.
//!
//! A projection maps output keys (possibly dotted) to either `1`/`true`
//! (include that path from the source document) or a computed path
//! reference (`"$other.path"`). The compiled form is a
//! `jsonb_build_object(…)` expression producing a canonical object; the
//! planner stores its value as `last_observed` and the worker's optimistic
//! lock guard recomputes and compares it.

use std::collections::BTreeMap;

use ripple_db::sql::Sql;
use serde_json::Value;

use super::parse::FieldPath;
use super::FilterError;

/// One node of the un-flattened projection tree.
#[derive(Debug, Clone, PartialEq)]
enum Node {
    /// Include the source value at this path.
    Include(FieldPath),
    /// Nested object of further keys.
    Branch(BTreeMap<String, Node>),
}

/// A compiled watch projection.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    /// `None` is the ROOT sentinel: the whole document.
    tree: Option<BTreeMap<String, Node>>,
}

/// Compile a projection mapping.
///
/// Dotted keys un-flatten to nested objects; `0`/`false` values are
/// rejected (exclusion projections are unsupported); a computed value must
/// be a `"$path"` reference; an empty mapping watches the whole document.
pub fn compile_projection(input: &Value) -> Result<Projection, FilterError> {
    let Value::Object(map) = input else {
        return Err(FilterError::InvalidShape {
            path: String::new(),
            reason: format!("projection must be an object, got {input}"),
        });
    };

    if map.is_empty() {
        return Ok(Projection { tree: None });
    }

    let mut tree: BTreeMap<String, Node> = BTreeMap::new();
    for (key, value) in map {
        let output_path = FieldPath::parse(key)?;
        let node = match value {
            Value::Number(n) if n.as_i64() == Some(1) => Node::Include(output_path.clone()),
            Value::Bool(true) => Node::Include(output_path.clone()),
            Value::Number(n) if n.as_i64() == Some(0) => {
                return Err(FilterError::ExclusionProjection(key.clone()));
            }
            Value::Bool(false) => {
                return Err(FilterError::ExclusionProjection(key.clone()));
            }
            Value::String(reference) if reference.starts_with('$') => {
                Node::Include(FieldPath::parse(&reference[1..])?)
            }
            other => {
                return Err(FilterError::InvalidShape {
                    path: key.clone(),
                    reason: format!(
                        "projection values must be 1/true or a \"$path\" reference, got {other}"
                    ),
                });
            }
        };
        insert_node(&mut tree, output_path.segments(), node, key)?;
    }

    Ok(Projection { tree: Some(tree) })
}

fn insert_node(
    tree: &mut BTreeMap<String, Node>,
    segments: &[String],
    node: Node,
    full_key: &str,
) -> Result<(), FilterError> {
    let (head, rest) = segments.split_first().expect("paths are non-empty");

    if rest.is_empty() {
        if tree.contains_key(head) {
            return Err(FilterError::ProjectionConflict(full_key.to_owned()));
        }
        tree.insert(head.clone(), node);
        return Ok(());
    }

    match tree
        .entry(head.clone())
        .or_insert_with(|| Node::Branch(BTreeMap::new()))
    {
        Node::Branch(children) => insert_node(children, rest, node, full_key),
        Node::Include(_) => Err(FilterError::ProjectionConflict(full_key.to_owned())),
    }
}

impl Projection {
    /// Whether this is the ROOT sentinel (whole document).
    pub fn is_root(&self) -> bool {
        self.tree.is_none()
    }

    /// Render as a SQL expression producing the canonical object from
    /// `{alias}.doc`.
    pub fn to_sql(&self, alias: &str) -> Sql {
        match &self.tree {
            None => Sql::raw(format!("{alias}.doc")),
            Some(tree) => Sql::raw(render_branch(tree, alias)),
        }
    }
}

fn render_branch(tree: &BTreeMap<String, Node>, alias: &str) -> String {
    let mut out = String::from("jsonb_build_object(");
    for (i, (key, node)) in tree.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&format!("'{key}', "));
        match node {
            Node::Include(path) => out.push_str(&source_accessor(alias, path)),
            Node::Branch(children) => out.push_str(&render_branch(children, alias)),
        }
    }
    out.push(')');
    out
}

fn source_accessor(alias: &str, path: &FieldPath) -> String {
    let segments = path.segments();
    if segments.len() == 1 {
        format!("{alias}.doc -> '{}'", segments[0])
    } else {
        format!("{alias}.doc #> '{{{}}}'", segments.join(","))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn empty_projection_is_root() {
        let projection = compile_projection(&json!({})).unwrap();
        assert!(projection.is_root());
        assert_eq!(projection.to_sql("s").text, "s.doc");
    }

    #[test]
    fn simple_include() {
        let projection = compile_projection(&json!({"v": 1})).unwrap();
        assert_eq!(
            projection.to_sql("s").text,
            "jsonb_build_object('v', s.doc -> 'v')"
        );
    }

    #[test]
    fn dotted_keys_unflatten() {
        let projection = compile_projection(&json!({"a.b": 1, "a.c": true})).unwrap();
        assert_eq!(
            projection.to_sql("s").text,
            "jsonb_build_object('a', jsonb_build_object(\
             'b', s.doc #> '{a,b}', 'c', s.doc #> '{a,c}'))"
        );
    }

    #[test]
    fn computed_path_reference() {
        let projection = compile_projection(&json!({"total": "$order.total"})).unwrap();
        assert_eq!(
            projection.to_sql("s").text,
            "jsonb_build_object('total', s.doc #> '{order,total}')"
        );
    }

    #[test]
    fn exclusion_rejected() {
        assert!(matches!(
            compile_projection(&json!({"v": 0})),
            Err(FilterError::ExclusionProjection(_))
        ));
        assert!(matches!(
            compile_projection(&json!({"v": false})),
            Err(FilterError::ExclusionProjection(_))
        ));
    }

    #[test]
    fn conflicting_keys_rejected() {
        assert!(matches!(
            compile_projection(&json!({"a": 1, "a.b": 1})),
            Err(FilterError::ProjectionConflict(_))
        ));
    }

    #[test]
    fn deterministic_key_order() {
        // BTreeMap ordering makes the canonical object stable regardless of
        // input key order, so snapshot comparisons are reliable.
        let a = compile_projection(&json!({"b": 1, "a": 1})).unwrap();
        let b = compile_projection(&json!({"a": 1, "b": 1})).unwrap();
        assert_eq!(a.to_sql("s").text, b.to_sql("s").text);
    }
}

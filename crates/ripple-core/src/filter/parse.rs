//! Query-form parser: `serde_json::Value` into the tagged [`Expr`] AST.

use serde_json::{Map, Value};

use super::FilterError;

/// A dotted field path, split into validated segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn parse(raw: &str) -> Result<Self, FilterError> {
        if raw.is_empty() {
            return Err(FilterError::InvalidPath(raw.to_owned()));
        }
        let segments: Vec<String> = raw.split('.').map(str::to_owned).collect();
        for segment in &segments {
            if segment.is_empty()
                || !segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(FilterError::InvalidPath(raw.to_owned()));
            }
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn dotted(&self) -> String {
        self.segments.join(".")
    }
}

/// Comparison operators on one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// The filter AST.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Nor(Vec<Expr>),
    Not(Box<Expr>),
    Compare {
        path: FieldPath,
        op: CompareOp,
        value: Value,
    },
    In {
        path: FieldPath,
        values: Vec<Value>,
        negated: bool,
    },
    Exists {
        path: FieldPath,
        expected: bool,
    },
    Regex {
        path: FieldPath,
        pattern: String,
        case_insensitive: bool,
    },
    TypeOf {
        path: FieldPath,
        type_name: &'static str,
    },
    Size {
        path: FieldPath,
        size: i64,
    },
    /// Expression form: a validated raw SQL predicate over `doc`.
    Raw(String),
}

/// Parse a filter from either input shape.
///
/// Detection heuristic: an object with any top-level key that is not
/// `$`-prefixed is query form; an all-`$` object is expression form (with
/// `$expr` unwrapped); a bare string is a raw SQL predicate. An empty
/// object matches everything.
pub fn parse_filter(input: &Value) -> Result<Expr, FilterError> {
    match input {
        Value::String(raw) => parse_raw_sql(raw),
        Value::Object(map) => {
            if map.is_empty() {
                return Ok(Expr::And(Vec::new()));
            }
            let all_operator_keys = map.keys().all(|k| k.starts_with('$'));
            if all_operator_keys && map.keys().any(|k| k == "$expr" || k == "$sql") {
                parse_expression_form(map)
            } else {
                parse_query_object(map, "")
            }
        }
        other => Err(FilterError::InvalidShape {
            path: String::new(),
            reason: format!("expected an object or string, got {other}"),
        }),
    }
}

/// Expression form: `{"$sql": "<predicate>"}`, optionally wrapped in
/// `{"$expr": …}`.
fn parse_expression_form(map: &Map<String, Value>) -> Result<Expr, FilterError> {
    if map.len() != 1 {
        return Err(FilterError::InvalidShape {
            path: String::new(),
            reason: "expression form takes exactly one key".to_owned(),
        });
    }
    let (key, value) = map.iter().next().unwrap();
    match (key.as_str(), value) {
        ("$expr", inner) => parse_filter(inner),
        ("$sql", Value::String(raw)) => parse_raw_sql(raw),
        ("$sql", other) => Err(FilterError::InvalidShape {
            path: "$sql".to_owned(),
            reason: format!("expected a string, got {other}"),
        }),
        (op, _) => Err(FilterError::UnsupportedOperator {
            operator: op.to_owned(),
            path: String::new(),
        }),
    }
}

/// Light validation of a raw SQL predicate: it must reference the `doc`
/// column and must not smuggle in additional statements or comments.
fn parse_raw_sql(raw: &str) -> Result<Expr, FilterError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(FilterError::UnsafeExpression("empty expression".to_owned()));
    }
    if !trimmed.contains("doc") {
        return Err(FilterError::UnsafeExpression(
            "expression must reference the doc column".to_owned(),
        ));
    }
    for forbidden in [";", "--", "/*"] {
        if trimmed.contains(forbidden) {
            return Err(FilterError::UnsafeExpression(format!(
                "expression contains {forbidden:?}"
            )));
        }
    }
    Ok(Expr::Raw(trimmed.to_owned()))
}

/// Parse one level of a query-form object. `context` is the dotted path
/// for error messages.
fn parse_query_object(map: &Map<String, Value>, context: &str) -> Result<Expr, FilterError> {
    let mut clauses = Vec::with_capacity(map.len());

    for (key, value) in map {
        if let Some(operator) = key.strip_prefix('$') {
            match operator {
                "and" | "or" | "nor" => {
                    let branches = logical_branches(key, value, context)?;
                    clauses.push(match operator {
                        "and" => Expr::And(branches),
                        "or" => Expr::Or(branches),
                        _ => Expr::Nor(branches),
                    });
                }
                "expr" => clauses.push(parse_filter(value)?),
                _ => {
                    return Err(FilterError::UnsupportedOperator {
                        operator: key.clone(),
                        path: context.to_owned(),
                    });
                }
            }
        } else {
            let path = FieldPath::parse(key)?;
            clauses.push(parse_field(path, value)?);
        }
    }

    Ok(match clauses.len() {
        1 => clauses.pop().unwrap(),
        _ => Expr::And(clauses),
    })
}

fn logical_branches(
    key: &str,
    value: &Value,
    context: &str,
) -> Result<Vec<Expr>, FilterError> {
    let Value::Array(items) = value else {
        return Err(FilterError::InvalidShape {
            path: format!("{context}{key}"),
            reason: "logical operators take an array of filters".to_owned(),
        });
    };
    items
        .iter()
        .map(|item| match item {
            Value::Object(map) => parse_query_object(map, context),
            other => Err(FilterError::InvalidShape {
                path: format!("{context}{key}"),
                reason: format!("expected an object branch, got {other}"),
            }),
        })
        .collect()
}

/// Parse a field's value: an operator spec when every key is `$`-prefixed,
/// a literal equality otherwise.
fn parse_field(path: FieldPath, value: &Value) -> Result<Expr, FilterError> {
    match value {
        Value::Object(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) => {
            parse_operator_spec(path, map)
        }
        literal => Ok(Expr::Compare {
            path,
            op: CompareOp::Eq,
            value: literal.clone(),
        }),
    }
}

fn parse_operator_spec(path: FieldPath, map: &Map<String, Value>) -> Result<Expr, FilterError> {
    // $options modifies the sibling $regex and is consumed with it.
    let regex_options = match map.get("$options") {
        None => None,
        Some(Value::String(opts)) => {
            if !opts.chars().all(|c| c == 'i') {
                return Err(FilterError::InvalidRegexOptions(opts.clone()));
            }
            if !map.contains_key("$regex") {
                return Err(FilterError::InvalidShape {
                    path: path.dotted(),
                    reason: "$options requires a sibling $regex".to_owned(),
                });
            }
            Some(opts.contains('i'))
        }
        Some(other) => {
            return Err(FilterError::InvalidShape {
                path: path.dotted(),
                reason: format!("$options must be a string, got {other}"),
            });
        }
    };

    let mut clauses = Vec::with_capacity(map.len());

    for (key, value) in map {
        let clause = match key.as_str() {
            "$options" => continue,
            "$eq" => compare(&path, CompareOp::Eq, value),
            "$ne" => compare(&path, CompareOp::Ne, value),
            "$gt" => compare(&path, CompareOp::Gt, value),
            "$gte" => compare(&path, CompareOp::Gte, value),
            "$lt" => compare(&path, CompareOp::Lt, value),
            "$lte" => compare(&path, CompareOp::Lte, value),
            "$in" => in_list(&path, value, false)?,
            "$nin" => in_list(&path, value, true)?,
            "$exists" => Expr::Exists {
                path: path.clone(),
                expected: value.as_bool().ok_or_else(|| FilterError::InvalidShape {
                    path: path.dotted(),
                    reason: "$exists takes a boolean".to_owned(),
                })?,
            },
            "$regex" => {
                let Value::String(pattern) = value else {
                    return Err(FilterError::InvalidShape {
                        path: path.dotted(),
                        reason: "$regex takes a string pattern".to_owned(),
                    });
                };
                Expr::Regex {
                    path: path.clone(),
                    pattern: pattern.clone(),
                    case_insensitive: regex_options.unwrap_or(false),
                }
            }
            "$type" => Expr::TypeOf {
                path: path.clone(),
                type_name: jsonb_type_name(value, &path)?,
            },
            "$size" => Expr::Size {
                path: path.clone(),
                size: value.as_i64().ok_or_else(|| FilterError::InvalidShape {
                    path: path.dotted(),
                    reason: "$size takes an integer".to_owned(),
                })?,
            },
            "$not" => {
                let Value::Object(inner) = value else {
                    return Err(FilterError::InvalidShape {
                        path: path.dotted(),
                        reason: "$not takes an operator object".to_owned(),
                    });
                };
                Expr::Not(Box::new(parse_operator_spec(path.clone(), inner)?))
            }
            other => {
                return Err(FilterError::UnsupportedOperator {
                    operator: other.to_owned(),
                    path: path.dotted(),
                });
            }
        };
        clauses.push(clause);
    }

    Ok(match clauses.len() {
        1 => clauses.pop().unwrap(),
        _ => Expr::And(clauses),
    })
}

fn compare(path: &FieldPath, op: CompareOp, value: &Value) -> Expr {
    Expr::Compare {
        path: path.clone(),
        op,
        value: value.clone(),
    }
}

fn in_list(path: &FieldPath, value: &Value, negated: bool) -> Result<Expr, FilterError> {
    let Value::Array(values) = value else {
        return Err(FilterError::InvalidShape {
            path: path.dotted(),
            reason: "$in/$nin take an array".to_owned(),
        });
    };
    Ok(Expr::In {
        path: path.clone(),
        values: values.clone(),
        negated,
    })
}

/// Map a `$type` alias to a `jsonb_typeof` result.
fn jsonb_type_name(value: &Value, path: &FieldPath) -> Result<&'static str, FilterError> {
    let Value::String(alias) = value else {
        return Err(FilterError::InvalidShape {
            path: path.dotted(),
            reason: "$type takes a string alias".to_owned(),
        });
    };
    match alias.as_str() {
        "string" => Ok("string"),
        "object" => Ok("object"),
        "array" => Ok("array"),
        "bool" | "boolean" => Ok("boolean"),
        "null" => Ok("null"),
        "number" | "int" | "long" | "double" | "decimal" => Ok("number"),
        other => Err(FilterError::UnsupportedType(other.to_owned())),
    }
}

//! MongoDB-style filter compiler.
//!
//! Translates a portable operator tree into SQLite predicates and
//! vector-store-native filter terms, with one validation pass that
//! rejects malformed input before any store is touched. The same tree
//! also evaluates in memory, and the two interpretations agree: a row
//! passes the compiled SQL iff `matches` accepts its record.

use crate::error::{Error, Result};
use crate::store::MessageRecord;
use serde_json::Value;

/// Columns the vector store indexes natively; everything else defers to
/// the relational post-filter.
const NATIVE_FIELDS: &[&str] = &["confidence", "timestamp", "sender", "channel"];

/// A validated filter tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    root: Clause,
}

#[derive(Debug, Clone, PartialEq)]
enum Clause {
    And(Vec<Clause>),
    Or(Vec<Clause>),
    Not(Box<Clause>),
    Predicate { path: String, op: Op },
}

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Contains(Value),
    All(Vec<Value>),
    Size(u64),
    Exists(bool),
}

/// Compiled relational predicate: SQL fragment plus ordered binds.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlPredicate {
    pub sql: String,
    pub binds: Vec<Value>,
}

/// Compiled vector-native filter. `complete` is false when clauses were
/// deferred to the relational post-filter.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeFilter {
    pub expr: Option<String>,
    pub complete: bool,
}

impl Filter {
    /// Parse and validate an operator tree. Unknown operators, argument
    /// type mismatches and empty logical groups fail with BadRequest
    /// naming the offending path.
    pub fn parse(value: &Value) -> Result<Self> {
        let object = value.as_object().ok_or_else(|| {
            Error::bad_request("filter root must be an object".to_string())
        })?;
        Ok(Self {
            root: parse_object(object, "")?,
        })
    }

    /// Compile to a SQLite predicate over the `messages` table (aliased
    /// `m`). Nested fields compile through `json_extract` on the
    /// metadata column.
    pub fn to_sql(&self) -> SqlPredicate {
        let mut binds = Vec::new();
        let sql = compile_sql(&self.root, &mut binds);
        SqlPredicate { sql, binds }
    }

    /// Compile the natively-expressible conjuncts (equality, range, in,
    /// over indexed columns) to the vector store's filter syntax.
    /// Anything else is left for the relational post-filter.
    pub fn to_native(&self) -> NativeFilter {
        let conjuncts: Vec<&Clause> = match &self.root {
            Clause::And(clauses) => clauses.iter().collect(),
            other => vec![other],
        };

        let mut native = Vec::new();
        let mut complete = true;
        for clause in conjuncts {
            match compile_native(clause) {
                Some(expr) => native.push(expr),
                None => complete = false,
            }
        }

        NativeFilter {
            expr: if native.is_empty() {
                None
            } else {
                Some(native.join(" AND "))
            },
            complete,
        }
    }

    /// Evaluate the filter against a message record in memory.
    pub fn matches(&self, record: &MessageRecord) -> bool {
        eval(&self.root, record)
    }
}

// ── Parsing ──────────────────────────────────────────────────────────

fn parse_object(object: &serde_json::Map<String, Value>, path: &str) -> Result<Clause> {
    let has_operator = object.keys().any(|key| key.starts_with('$'));
    let has_field = object.keys().any(|key| !key.starts_with('$'));
    if has_operator && has_field {
        return Err(Error::bad_request(format!(
            "cannot mix field names and operators at '{}'",
            display_path(path)
        )));
    }

    let mut clauses = Vec::new();
    for (key, value) in object {
        let child_path = join_path(path, key);
        if let Some(operator) = key.strip_prefix('$') {
            clauses.push(parse_logical(operator, value, &child_path)?);
        } else {
            clauses.push(parse_field(key, value, &child_path)?);
        }
    }

    Ok(match clauses.len() {
        1 => clauses.into_iter().next().expect("one clause"),
        _ => Clause::And(clauses),
    })
}

fn parse_logical(operator: &str, value: &Value, path: &str) -> Result<Clause> {
    match operator {
        "and" | "or" => {
            let items = value.as_array().ok_or_else(|| {
                Error::bad_request(format!("'${operator}' at '{path}' takes an array of clauses"))
            })?;
            if items.is_empty() {
                return Err(Error::bad_request(format!(
                    "'${operator}' at '{path}' must not be empty"
                )));
            }
            let mut clauses = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                let child_path = format!("{path}[{index}]");
                let object = item.as_object().ok_or_else(|| {
                    Error::bad_request(format!("clause at '{child_path}' must be an object"))
                })?;
                clauses.push(parse_object(object, &child_path)?);
            }
            Ok(if operator == "and" {
                Clause::And(clauses)
            } else {
                Clause::Or(clauses)
            })
        }
        "not" => {
            let object = value.as_object().ok_or_else(|| {
                Error::bad_request(format!("'$not' at '{path}' takes a single clause object"))
            })?;
            Ok(Clause::Not(Box::new(parse_object(object, path)?)))
        }
        other => Err(Error::bad_request(format!(
            "unknown operator '${other}' at '{}'",
            display_path(path)
        ))),
    }
}

fn parse_field(field: &str, value: &Value, path: &str) -> Result<Clause> {
    match value {
        Value::Object(operators) if operators.keys().any(|key| key.starts_with('$')) => {
            if operators.keys().any(|key| !key.starts_with('$')) {
                return Err(Error::bad_request(format!(
                    "cannot mix field names and operators at '{path}'"
                )));
            }
            let mut clauses = Vec::with_capacity(operators.len());
            for (key, argument) in operators {
                let operator = key.trim_start_matches('$');
                let child_path = join_path(path, key);
                clauses.push(Clause::Predicate {
                    path: field.to_string(),
                    op: parse_operator(operator, argument, &child_path)?,
                });
            }
            Ok(match clauses.len() {
                1 => clauses.into_iter().next().expect("one clause"),
                _ => Clause::And(clauses),
            })
        }
        // Bare `{field: value}` is sugar for `$eq`.
        other => Ok(Clause::Predicate {
            path: field.to_string(),
            op: Op::Eq(other.clone()),
        }),
    }
}

fn parse_operator(operator: &str, argument: &Value, path: &str) -> Result<Op> {
    let array_argument = || -> Result<Vec<Value>> {
        argument
            .as_array()
            .cloned()
            .ok_or_else(|| Error::bad_request(format!("'${operator}' at '{path}' takes an array")))
    };

    match operator {
        "eq" => Ok(Op::Eq(argument.clone())),
        "ne" => Ok(Op::Ne(argument.clone())),
        "gt" => Ok(Op::Gt(argument.clone())),
        "gte" => Ok(Op::Gte(argument.clone())),
        "lt" => Ok(Op::Lt(argument.clone())),
        "lte" => Ok(Op::Lte(argument.clone())),
        "in" => Ok(Op::In(array_argument()?)),
        "nin" => Ok(Op::Nin(array_argument()?)),
        "contains" => Ok(Op::Contains(argument.clone())),
        "all" => Ok(Op::All(array_argument()?)),
        "size" => argument
            .as_u64()
            .map(Op::Size)
            .ok_or_else(|| {
                Error::bad_request(format!(
                    "'$size' at '{path}' takes a non-negative integer"
                ))
            }),
        "exists" => argument
            .as_bool()
            .map(Op::Exists)
            .ok_or_else(|| Error::bad_request(format!("'$exists' at '{path}' takes a boolean"))),
        // `$null: true` is the inverse of `$exists: true`.
        "null" => argument
            .as_bool()
            .map(|null| Op::Exists(!null))
            .ok_or_else(|| Error::bad_request(format!("'$null' at '{path}' takes a boolean"))),
        other => Err(Error::bad_request(format!(
            "unknown operator '${other}' at '{}'",
            display_path(path)
        ))),
    }
}

fn join_path(path: &str, segment: &str) -> String {
    if path.is_empty() {
        segment.to_string()
    } else {
        format!("{path}.{segment}")
    }
}

fn display_path(path: &str) -> &str {
    if path.is_empty() { "<root>" } else { path }
}

// ── SQL compilation ──────────────────────────────────────────────────

fn compile_sql(clause: &Clause, binds: &mut Vec<Value>) -> String {
    match clause {
        Clause::And(clauses) if clauses.is_empty() => "1".to_string(),
        Clause::And(clauses) => {
            let parts: Vec<String> = clauses
                .iter()
                .map(|clause| compile_sql(clause, binds))
                .collect();
            format!("({})", parts.join(" AND "))
        }
        Clause::Or(clauses) => {
            let parts: Vec<String> = clauses
                .iter()
                .map(|clause| compile_sql(clause, binds))
                .collect();
            format!("({})", parts.join(" OR "))
        }
        Clause::Not(inner) => format!("NOT {}", compile_sql(inner, binds)),
        Clause::Predicate { path, op } => compile_predicate(path, op, binds),
    }
}

/// The SQL expression addressing a field, and whether it needs a typeof
/// guard (json_extract results are dynamically typed).
fn field_expr(path: &str) -> (String, bool) {
    match path {
        "confidence" => ("m.confidence".to_string(), false),
        "timestamp" => (crate::store::schema::TS_READ.to_string(), false),
        "sender" => ("m.sender_name".to_string(), false),
        "channel" => ("m.channel_id".to_string(), false),
        "tags" => ("m.tags".to_string(), false),
        nested => (
            format!("json_extract(m.metadata, '$.{}')", escape_json_path(nested)),
            true,
        ),
    }
}

/// The json_each source for array operators on a field.
fn array_source(path: &str) -> String {
    match path {
        "tags" => "json_each(m.tags)".to_string(),
        nested => format!(
            "json_each(m.metadata, '$.{}')",
            escape_json_path(nested)
        ),
    }
}

fn escape_json_path(path: &str) -> String {
    path.replace('\'', "''")
}

/// Every compiled predicate is two-valued (never SQL NULL) so that
/// `$not` and `$or` compose the way the in-memory evaluation does.
fn compile_predicate(path: &str, op: &Op, binds: &mut Vec<Value>) -> String {
    let (expr, dynamic) = field_expr(path);
    match op {
        Op::Eq(Value::Null) => format!("{expr} IS NULL"),
        Op::Eq(value) => {
            binds.push(value.clone());
            format!("COALESCE({expr} = {}, 0)", rhs_placeholder(value))
        }
        Op::Ne(Value::Null) => format!("{expr} IS NOT NULL"),
        Op::Ne(value) => {
            binds.push(value.clone());
            format!("({expr} IS NULL OR {expr} <> {})", rhs_placeholder(value))
        }
        Op::Gt(value) => compile_ordering(&expr, ">", value, dynamic, binds),
        Op::Gte(value) => compile_ordering(&expr, ">=", value, dynamic, binds),
        Op::Lt(value) => compile_ordering(&expr, "<", value, dynamic, binds),
        Op::Lte(value) => compile_ordering(&expr, "<=", value, dynamic, binds),
        Op::In(values) => compile_in(&expr, values, false, binds),
        Op::Nin(values) => compile_in(&expr, values, true, binds),
        Op::Contains(value) => {
            binds.push(value.clone());
            format!(
                "COALESCE({} AND EXISTS (SELECT 1 FROM {} WHERE json_each.value = {}), 0)",
                array_guard(path),
                array_source(path),
                rhs_placeholder(value)
            )
        }
        Op::All(values) => {
            if values.is_empty() {
                return format!("COALESCE({}, 0)", array_guard(path));
            }
            let parts: Vec<String> = values
                .iter()
                .map(|value| {
                    binds.push(value.clone());
                    format!(
                        "EXISTS (SELECT 1 FROM {} WHERE json_each.value = {})",
                        array_source(path),
                        rhs_placeholder(value)
                    )
                })
                .collect();
            format!(
                "COALESCE({} AND {}, 0)",
                array_guard(path),
                parts.join(" AND ")
            )
        }
        Op::Size(length) => {
            binds.push(Value::from(*length));
            match path {
                "tags" => {
                    "COALESCE(m.tags IS NOT NULL AND json_array_length(m.tags) = ?, 0)".to_string()
                }
                nested => format!(
                    "COALESCE(json_type(m.metadata, '$.{p}') = 'array' \
                     AND json_array_length(m.metadata, '$.{p}') = ?, 0)",
                    p = escape_json_path(nested)
                ),
            }
        }
        // Direct null checks; never a parse of the extracted value.
        Op::Exists(true) => format!("{expr} IS NOT NULL"),
        Op::Exists(false) => format!("{expr} IS NULL"),
    }
}

/// Guard ensuring array operators only match actual arrays. `json_each`
/// would happily iterate a scalar as a single element.
fn array_guard(path: &str) -> String {
    match path {
        "tags" => "m.tags IS NOT NULL".to_string(),
        nested => format!(
            "json_type(m.metadata, '$.{}') = 'array'",
            escape_json_path(nested)
        ),
    }
}

/// Ordering comparisons guard dynamically-typed extracts so a number
/// never compares against a text value through SQLite's type ordering.
fn compile_ordering(
    expr: &str,
    operator: &str,
    value: &Value,
    dynamic: bool,
    binds: &mut Vec<Value>,
) -> String {
    binds.push(value.clone());
    if !dynamic {
        return format!("COALESCE({expr} {operator} ?, 0)");
    }
    match value {
        Value::Number(_) => {
            format!("(typeof({expr}) IN ('integer', 'real') AND {expr} {operator} ?)")
        }
        Value::String(_) => format!("(typeof({expr}) = 'text' AND {expr} {operator} ?)"),
        _ => format!("COALESCE({expr} {operator} ?, 0)"),
    }
}

fn compile_in(expr: &str, values: &[Value], negate: bool, binds: &mut Vec<Value>) -> String {
    let has_null = values.iter().any(Value::is_null);
    let non_null: Vec<&Value> = values.iter().filter(|value| !value.is_null()).collect();

    let list = if non_null.is_empty() {
        None
    } else {
        let placeholders: Vec<String> = non_null
            .iter()
            .map(|value| {
                binds.push((*value).clone());
                rhs_placeholder(value).to_string()
            })
            .collect();
        Some(format!("{expr} IN ({})", placeholders.join(", ")))
    };

    match (negate, has_null, list) {
        (false, false, Some(list)) => format!("COALESCE({list}, 0)"),
        (false, true, Some(list)) => format!("({expr} IS NULL OR {list})"),
        (false, true, None) => format!("{expr} IS NULL"),
        (false, false, None) => "0".to_string(),
        (true, false, Some(list)) => format!("({expr} IS NULL OR NOT ({list}))"),
        (true, true, Some(list)) => format!("({expr} IS NOT NULL AND NOT ({list}))"),
        (true, true, None) => format!("{expr} IS NOT NULL"),
        (true, false, None) => "1".to_string(),
    }
}

/// Arrays and objects bind as JSON text and normalize through json();
/// scalars bind directly.
fn rhs_placeholder(value: &Value) -> &'static str {
    match value {
        Value::Array(_) | Value::Object(_) => "json(?)",
        _ => "?",
    }
}

// ── Vector-native compilation ────────────────────────────────────────

fn compile_native(clause: &Clause) -> Option<String> {
    let Clause::Predicate { path, op } = clause else {
        return None;
    };
    if !NATIVE_FIELDS.contains(&path.as_str()) {
        return None;
    }

    match op {
        Op::Eq(value) => native_scalar(value).map(|rhs| format!("{path} = {rhs}")),
        Op::Gt(value) => native_scalar(value).map(|rhs| format!("{path} > {rhs}")),
        Op::Gte(value) => native_scalar(value).map(|rhs| format!("{path} >= {rhs}")),
        Op::Lt(value) => native_scalar(value).map(|rhs| format!("{path} < {rhs}")),
        Op::Lte(value) => native_scalar(value).map(|rhs| format!("{path} <= {rhs}")),
        Op::In(values) => {
            let rendered: Option<Vec<String>> = values.iter().map(native_scalar).collect();
            rendered.map(|items| format!("{path} IN ({})", items.join(", ")))
        }
        _ => None,
    }
}

fn native_scalar(value: &Value) -> Option<String> {
    match value {
        Value::Number(number) => Some(number.to_string()),
        Value::String(text) => Some(format!("'{}'", text.replace('\'', "''"))),
        Value::Bool(flag) => Some(if *flag { "true" } else { "false" }.to_string()),
        _ => None,
    }
}

// ── In-memory evaluation ─────────────────────────────────────────────

fn eval(clause: &Clause, record: &MessageRecord) -> bool {
    match clause {
        Clause::And(clauses) => clauses.iter().all(|clause| eval(clause, record)),
        Clause::Or(clauses) => clauses.iter().any(|clause| eval(clause, record)),
        Clause::Not(inner) => !eval(inner, record),
        Clause::Predicate { path, op } => eval_predicate(path, op, record),
    }
}

/// Resolve a field path against the record; missing and JSON null both
/// resolve to None, matching json_extract's NULL.
fn resolve(path: &str, record: &MessageRecord) -> Option<Value> {
    let value = match path {
        "confidence" => record.confidence.map(Value::from),
        "timestamp" => Some(Value::from(record.timestamp)),
        "sender" => Some(Value::String(record.sender.name.clone())),
        "channel" => Some(Value::String(record.channel_id.clone())),
        "tags" => {
            if record.tags.is_empty() {
                None
            } else {
                Some(Value::Array(
                    record.tags.iter().cloned().map(Value::String).collect(),
                ))
            }
        }
        nested => {
            let mut current = record.metadata.as_ref()?;
            for segment in nested.split('.') {
                current = current.as_object()?.get(segment)?;
            }
            Some(current.clone())
        }
    };
    value.filter(|value| !value.is_null())
}

fn eval_predicate(path: &str, op: &Op, record: &MessageRecord) -> bool {
    let value = resolve(path, record);
    match op {
        Op::Eq(Value::Null) => value.is_none(),
        Op::Eq(expected) => value.as_ref().is_some_and(|value| eq_values(value, expected)),
        Op::Ne(Value::Null) => value.is_some(),
        Op::Ne(expected) => !value.as_ref().is_some_and(|value| eq_values(value, expected)),
        Op::Gt(rhs) => compare(value.as_ref(), rhs).is_some_and(std::cmp::Ordering::is_gt),
        Op::Gte(rhs) => compare(value.as_ref(), rhs).is_some_and(std::cmp::Ordering::is_ge),
        Op::Lt(rhs) => compare(value.as_ref(), rhs).is_some_and(std::cmp::Ordering::is_lt),
        Op::Lte(rhs) => compare(value.as_ref(), rhs).is_some_and(std::cmp::Ordering::is_le),
        Op::In(values) => match &value {
            Some(value) => values.iter().any(|candidate| eq_values(value, candidate)),
            None => values.iter().any(Value::is_null),
        },
        Op::Nin(values) => match &value {
            Some(value) => !values.iter().any(|candidate| eq_values(value, candidate)),
            None => !values.iter().any(Value::is_null),
        },
        Op::Contains(expected) => value
            .as_ref()
            .and_then(Value::as_array)
            .is_some_and(|items| items.iter().any(|item| eq_values(item, expected))),
        Op::All(expected) => value
            .as_ref()
            .and_then(Value::as_array)
            .is_some_and(|items| {
                expected
                    .iter()
                    .all(|needle| items.iter().any(|item| eq_values(item, needle)))
            }),
        Op::Size(length) => value
            .as_ref()
            .and_then(Value::as_array)
            .is_some_and(|items| items.len() as u64 == *length),
        Op::Exists(expected) => value.is_some() == *expected,
    }
}

/// Equality with numeric normalization: 1 and 1.0 are equal, and JSON
/// booleans compare as 1/0, matching SQLite's json_extract results.
fn eq_values(a: &Value, b: &Value) -> bool {
    match (numeric(a), numeric(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::Bool(flag) => Some(f64::from(u8::from(*flag))),
        _ => None,
    }
}

fn compare(value: Option<&Value>, rhs: &Value) -> Option<std::cmp::Ordering> {
    let value = value?;
    match (value, rhs) {
        (Value::Number(_), Value::Number(_)) => value.as_f64()?.partial_cmp(&rhs.as_f64()?),
        (Value::String(left), Value::String(right)) => Some(left.cmp(right)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::ids::AgentKey;
    use serde_json::json;

    fn record(metadata: Value, confidence: Option<f64>, tags: &[&str]) -> MessageRecord {
        MessageRecord {
            id: 1,
            channel_id: "global:dev".into(),
            sender: AgentKey::global("alice"),
            content: "hello".into(),
            timestamp: 1_700_000_000.0,
            confidence,
            metadata: if metadata.is_null() { None } else { Some(metadata) },
            tags: tags.iter().map(|tag| tag.to_string()).collect(),
            session_context: None,
            thread_id: None,
        }
    }

    #[test]
    fn bare_field_is_eq_sugar() {
        let filter = Filter::parse(&json!({"kind": "decision"})).expect("filter should parse");
        assert!(filter.matches(&record(json!({"kind": "decision"}), None, &[])));
        assert!(!filter.matches(&record(json!({"kind": "note"}), None, &[])));
    }

    #[test]
    fn unknown_operator_names_the_path() {
        let error = Filter::parse(&json!({"breadcrumbs": {"$near": 3}}))
            .expect_err("unknown operator must fail");
        assert_eq!(error.kind(), ErrorKind::BadRequest);
        assert!(error.to_string().contains("$near"));
        assert!(error.to_string().contains("breadcrumbs"));
    }

    #[test]
    fn argument_type_mismatches_are_rejected() {
        for bad in [
            json!({"x": {"$in": 3}}),
            json!({"x": {"$size": "five"}}),
            json!({"x": {"$exists": "yes"}}),
            json!({"$and": []}),
            json!({"$or": []}),
        ] {
            let error = Filter::parse(&bad).expect_err("invalid filter must fail");
            assert_eq!(error.kind(), ErrorKind::BadRequest);
        }
    }

    #[test]
    fn mixing_fields_and_operators_is_rejected() {
        let error = Filter::parse(&json!({"$or": [{"a": 1}], "b": 2}))
            .expect_err("mixed level must fail");
        assert_eq!(error.kind(), ErrorKind::BadRequest);
    }

    #[test]
    fn nested_paths_and_logic_evaluate() {
        let filter = Filter::parse(&json!({
            "$or": [
                {"breadcrumbs.decisions": {"$contains": "jwt"}},
                {"confidence": {"$gte": 0.9}}
            ]
        }))
        .expect("filter should parse");

        assert!(filter.matches(&record(
            json!({"breadcrumbs": {"decisions": ["jwt", "oauth"]}}),
            Some(0.2),
            &[],
        )));
        assert!(filter.matches(&record(json!({}), Some(0.95), &[])));
        assert!(!filter.matches(&record(json!({}), Some(0.2), &[])));
    }

    #[test]
    fn exists_distinguishes_null_and_absent_consistently() {
        let present = Filter::parse(&json!({"owner": {"$exists": true}})).unwrap();
        let absent = Filter::parse(&json!({"owner": {"$exists": false}})).unwrap();
        let null_like = Filter::parse(&json!({"owner": {"$null": true}})).unwrap();

        let with_owner = record(json!({"owner": "alice"}), None, &[]);
        let with_null = record(json!({"owner": null}), None, &[]);
        let without = record(json!({}), None, &[]);

        assert!(present.matches(&with_owner));
        assert!(!present.matches(&with_null));
        assert!(!present.matches(&without));
        assert!(absent.matches(&with_null));
        assert!(absent.matches(&without));
        assert!(null_like.matches(&without));
    }

    #[test]
    fn native_compilation_splits_residual() {
        let filter = Filter::parse(&json!({
            "confidence": {"$gte": 0.7},
            "sender": {"$in": ["alice", "bob"]},
            "breadcrumbs.topic": "auth"
        }))
        .expect("filter should parse");

        let native = filter.to_native();
        let expr = native.expr.expect("native expr should exist");
        assert!(expr.contains("confidence >= 0.7"));
        assert!(expr.contains("sender IN ('alice', 'bob')"));
        assert!(!expr.contains("breadcrumbs"));
        assert!(!native.complete);

        let fully = Filter::parse(&json!({"confidence": {"$lt": 0.5}})).unwrap();
        assert!(fully.to_native().complete);
    }

    #[test]
    fn native_strings_escape_quotes() {
        let filter = Filter::parse(&json!({"sender": "o'brien"})).unwrap();
        assert_eq!(
            filter.to_native().expr.as_deref(),
            Some("sender = 'o''brien'")
        );
    }

    /// Property: the SQL compilation accepts a row iff the in-memory
    /// evaluation accepts its record.
    #[tokio::test]
    async fn sql_and_memory_evaluation_agree() {
        use crate::store::Store;
        use crate::store::channels::NewChannel;
        use crate::store::types::{
            AccessPolicy, Capabilities, ChannelScope, MemberSource, NewMessage, RegisterAgent,
        };

        let store = Store::open_in_memory().await.expect("store should open");
        let alice = AgentKey::global("alice");
        let agent = store
            .register_agent(RegisterAgent::new(alice.clone()))
            .await
            .unwrap();
        store
            .create_channel(NewChannel {
                id: "global:dev".into(),
                scope: ChannelScope::Global,
                access: AccessPolicy::Open,
                project_id: None,
                name: "dev".into(),
                description: String::new(),
                is_default: false,
                owner_agent_id: None,
            })
            .await
            .unwrap();
        store
            .add_member("global:dev", agent.id, Capabilities::joiner(), MemberSource::SelfJoin, "self", false)
            .await
            .unwrap();

        let corpus = [
            (json!({"kind": "decision", "refs": ["jwt", "oauth"], "depth": 2}), Some(0.9)),
            (json!({"kind": "note", "refs": [], "depth": "2"}), Some(0.4)),
            (json!({"kind": null, "extra": {"deep": {"leaf": 5}}}), None),
            (Value::Null, Some(0.7)),
        ];
        let mut records = Vec::new();
        for (metadata, confidence) in corpus {
            let record = store
                .insert_message(
                    "global:dev",
                    &alice,
                    NewMessage {
                        content: "probe".into(),
                        confidence,
                        metadata: if metadata.is_null() { None } else { Some(metadata) },
                        tags: vec!["t1".into()],
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            records.push(record);
        }

        let filters = [
            json!({"kind": "decision"}),
            json!({"kind": {"$ne": "decision"}}),
            json!({"depth": {"$gt": 1}}),
            json!({"depth": {"$lte": 2}}),
            json!({"refs": {"$contains": "jwt"}}),
            json!({"refs": {"$all": ["jwt", "oauth"]}}),
            json!({"refs": {"$size": 2}}),
            json!({"kind": {"$exists": true}}),
            json!({"kind": {"$null": true}}),
            json!({"extra.deep.leaf": {"$gte": 5}}),
            json!({"confidence": {"$gte": 0.7}}),
            json!({"kind": {"$in": ["decision", "note"]}}),
            json!({"kind": {"$nin": ["note"]}}),
            json!({"$or": [{"depth": 2}, {"confidence": {"$lt": 0.5}}]}),
            json!({"$not": {"kind": "note"}}),
            json!({"tags": {"$contains": "t1"}}),
        ];

        let all_ids: Vec<i64> = records.iter().map(|record| record.id).collect();
        let channels = vec!["global:dev".to_string()];
        for raw in filters {
            let filter = Filter::parse(&raw).expect("filter should parse");
            let predicate = filter.to_sql();
            let via_sql = store
                .messages_by_ids(&all_ids, &channels, Some(&predicate), None, None)
                .await
                .expect("sql filter should run");
            let sql_ids: std::collections::HashSet<i64> =
                via_sql.iter().map(|record| record.id).collect();

            for record in &records {
                assert_eq!(
                    filter.matches(record),
                    sql_ids.contains(&record.id),
                    "divergence for filter {raw} on record {} ({:?})",
                    record.id,
                    record.metadata,
                );
            }
        }
    }
}

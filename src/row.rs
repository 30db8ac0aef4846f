// Row adapter - order-preserving, name-addressable query results
//
// Every query helper in this crate materializes rows into `Row` values so
// that reconciliation failures can carry their diagnostic payload around
// without holding a statement open. Mutation is name-based only: the
// position-to-name mapping is not guaranteed stable once computed columns
// have been appended, so no positional assignment API exists.

use std::fmt;

use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::ToSql;
use serde::{Deserialize, Serialize};

use crate::db::Db;
use crate::error::{Error, Result};

// ============================================================================
// VALUE
// ============================================================================

/// A single field value, tagged with its SQLite storage class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub(crate) fn from_sql_ref(v: ValueRef<'_>) -> Value {
        match v {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(r) => Value::Real(r),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        use rusqlite::types::Value as SqlValue;
        Ok(ToSqlOutput::Owned(match self {
            Value::Null => SqlValue::Null,
            Value::Integer(i) => SqlValue::Integer(*i),
            Value::Real(r) => SqlValue::Real(*r),
            Value::Text(t) => SqlValue::Text(t.clone()),
            Value::Blob(b) => SqlValue::Blob(b.clone()),
        }))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Real(r) => write!(f, "{}", r),
            Value::Text(t) => write!(f, "{}", t),
            Value::Blob(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

// ============================================================================
// ROW
// ============================================================================

/// One materialized query result row: an ordered list of named fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Row { columns, values }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Column names, in result order.
    pub fn fields(&self) -> &[String] {
        &self.columns
    }

    /// Positional lookup.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Name-based lookup.
    pub fn get_named(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == name)
            .map(|i| &self.values[i])
    }

    /// Typed accessor: integer field by name.
    pub fn int(&self, name: &str) -> Option<i64> {
        self.get_named(name).and_then(Value::as_int)
    }

    /// Typed accessor: text field by name.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.get_named(name).and_then(Value::as_text)
    }

    /// Set a field by name, appending a new trailing column if the name is
    /// not present yet. This is the only mutation path: fields cannot be
    /// assigned by position.
    pub fn set(&mut self, name: &str, value: Value) {
        match self.columns.iter().position(|c| c == name) {
            Some(i) => self.values[i] = value,
            None => {
                self.columns.push(name.to_string());
                self.values.push(value);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }
}

/// Field-wise comparison by name; column order does not matter.
impl PartialEq for Row {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|(name, value)| other.get_named(name) == Some(value))
    }
}

/// Positional comparison against a plain sequence; arity must match.
impl PartialEq<[Value]> for Row {
    fn eq(&self, other: &[Value]) -> bool {
        self.values.as_slice() == other
    }
}

impl PartialEq<Vec<Value>> for Row {
    fn eq(&self, other: &Vec<Value>) -> bool {
        &self.values == other
    }
}

// ============================================================================
// DIAGNOSTIC RENDERING
// ============================================================================

fn escaped(v: &Value) -> String {
    v.to_string().replace('\n', "\\n")
}

/// Render a batch of rows as an aligned, pipe-delimited text table.
/// Returns `None` for an empty batch. All rows are assumed to share the
/// column layout of the first one (true for any single query's results).
pub fn render(rows: &[Row]) -> Option<String> {
    let first = rows.first()?;
    let mut widths: Vec<usize> = first.fields().iter().map(|k| k.len()).collect();
    for row in rows {
        for (i, v) in row.values.iter().enumerate() {
            if let Some(w) = widths.get_mut(i) {
                *w = (*w).max(escaped(v).len());
            }
        }
    }
    let mut out = String::new();
    for (k, w) in first.fields().iter().zip(&widths) {
        out.push_str(&format!("{:<width$} | ", k, width = *w));
    }
    out.push('\n');
    for row in rows {
        for (v, w) in row.values.iter().zip(&widths) {
            out.push_str(&format!("{:<width$} | ", escaped(v), width = *w));
        }
        out.push('\n');
    }
    Some(out)
}

/// Dump a whole table under a banner, for operator diagnostics. The table
/// name must be a bare identifier since it is interpolated into the query.
pub fn show_table(db: &Db, table: &str) -> Result<String> {
    if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::BadTableName(table.to_string()));
    }
    let rows = db.all(&format!("SELECT * FROM {}", table), [])?;
    let mut out = format!("{:=^80}\n", table);
    if let Some(body) = render(&rows) {
        out.push_str(&body);
    }
    Ok(out)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_row() -> Row {
        Row::new(
            vec!["a".to_string(), "b".to_string()],
            vec![Value::Integer(1), Value::Integer(2)],
        )
    }

    #[test]
    fn test_lookup_by_name_and_position() {
        let row = test_row();
        assert_eq!(row.get_named("a"), Some(&Value::Integer(1)));
        assert_eq!(row.int("b"), Some(2));
        assert_eq!(row.get(1), Some(&Value::Integer(2)));
        assert_eq!(row.get(2), None);
        assert_eq!(row.get_named("c"), None);
    }

    #[test]
    fn test_named_mutation_and_append() {
        let mut row = test_row();
        row.set("a", Value::Integer(99));
        assert_eq!(row.int("a"), Some(99));

        // Unknown names append a new trailing column
        row.set("note", Value::from("checked"));
        assert_eq!(row.len(), 3);
        assert_eq!(row.text("note"), Some("checked"));
        assert_eq!(row.get(2), Some(&Value::Text("checked".to_string())));
    }

    #[test]
    fn test_equality_field_wise() {
        let row = test_row();
        let reordered = Row::new(
            vec!["b".to_string(), "a".to_string()],
            vec![Value::Integer(2), Value::Integer(1)],
        );
        assert_eq!(row, reordered);

        let different = Row::new(
            vec!["a".to_string(), "b".to_string()],
            vec![Value::Integer(1), Value::Integer(3)],
        );
        assert_ne!(row, different);
    }

    #[test]
    fn test_equality_positional_sequence() {
        let row = test_row();
        assert_eq!(row, vec![Value::Integer(1), Value::Integer(2)]);
        // Arity mismatch is never equal
        assert_ne!(row, vec![Value::Integer(1)]);
    }

    #[test]
    fn test_serde_round_trip_keeps_names_and_values() {
        let mut row = test_row();
        row.set("label", Value::from("x"));
        let json = serde_json::to_string(&row).unwrap();
        let restored: Row = serde_json::from_str(&json).unwrap();
        assert_eq!(row, restored);
        assert_eq!(restored.fields(), row.fields());
    }

    #[test]
    fn test_render_alignment_and_escaping() {
        let rows = vec![
            Row::new(
                vec!["id".to_string(), "status".to_string()],
                vec![Value::Integer(1), Value::Text("multi\nline".to_string())],
            ),
            Row::new(
                vec!["id".to_string(), "status".to_string()],
                vec![Value::Integer(12345), Value::Text("ok".to_string())],
            ),
        ];
        let out = render(&rows).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("id    | "));
        assert!(lines[1].contains("multi\\nline"));
        // Every line is padded to the same width
        assert_eq!(lines[0].len(), lines[1].len());
        assert_eq!(lines[1].len(), lines[2].len());
    }

    #[test]
    fn test_render_empty_batch() {
        assert!(render(&[]).is_none());
    }

    #[test]
    fn test_show_table_rejects_weird_names() {
        let db = Db::open_in_memory().unwrap();
        let err = show_table(&db, "tips; DROP TABLE tips").unwrap_err();
        assert!(matches!(err, Error::BadTableName(_)));
    }

    #[test]
    fn test_show_table_banner() {
        let db = Db::open_in_memory().unwrap();
        db.run("CREATE TABLE widgets (id INTEGER, name TEXT)", [])
            .unwrap();
        db.run("INSERT INTO widgets VALUES (1, 'sprocket')", [])
            .unwrap();
        let out = show_table(&db, "widgets").unwrap();
        assert!(out.starts_with("====="));
        assert!(out.contains("widgets"));
        assert!(out.contains("sprocket"));
    }
}

//! Statement execution with JSON-shaped result rows

use crate::errors::{statement_error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, Statement};
use serde_json::{Number, Value as JsonValue};

/// One result row keyed by column name
pub type Record = serde_json::Map<String, JsonValue>;

const NAMED_PREFIXES: [char; 3] = [':', '@', '$'];

/// Statement parameters
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Params {
    #[default]
    None,
    /// Bound to `?`/`?N` placeholders in order
    Positional(Vec<Value>),
    /// Bound by name; a bare name matches `:name`, `@name` or `$name`
    Named(Vec<(String, Value)>),
}

impl Params {
    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Params::Positional(values.into_iter().map(Into::into).collect())
    }

    pub fn named<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Params::Named(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self {
        Params::Positional(values)
    }
}

/// Prepare, bind and step `sql`, collecting every row
///
/// The prepared statement is finalized when it goes out of scope, including
/// when binding or stepping fails.
pub fn execute(conn: &Connection, op: &str, sql: &str, params: &Params) -> Result<Vec<Record>> {
    let mut stmt = conn.prepare(sql).map_err(|e| statement_error(op, sql, e))?;
    bind(&mut stmt, params).map_err(|e| statement_error(op, sql, e))?;

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.raw_query();
    let mut records = Vec::new();
    while let Some(row) = rows.next().map_err(|e| statement_error(op, sql, e))? {
        let mut record = Record::new();
        for (idx, name) in columns.iter().enumerate() {
            let value = row.get_ref(idx).map_err(|e| statement_error(op, sql, e))?;
            record.insert(name.clone(), to_json(value));
        }
        records.push(record);
    }
    Ok(records)
}

/// Run one or more statements, discarding any rows
pub fn run(conn: &Connection, sql: &str) -> Result<()> {
    conn.execute_batch(sql)
        .map_err(|e| statement_error("run", sql, e))
}

fn bind(stmt: &mut Statement<'_>, params: &Params) -> rusqlite::Result<()> {
    let expected = stmt.parameter_count();
    match params {
        Params::None => {
            if expected != 0 {
                return Err(rusqlite::Error::InvalidParameterCount(0, expected));
            }
        }
        Params::Positional(values) => {
            if values.len() != expected {
                return Err(rusqlite::Error::InvalidParameterCount(
                    values.len(),
                    expected,
                ));
            }
            for (idx, value) in values.iter().enumerate() {
                stmt.raw_bind_parameter(idx + 1, value)?;
            }
        }
        Params::Named(pairs) => {
            for (name, value) in pairs {
                let idx = named_index(stmt, name)?
                    .ok_or_else(|| rusqlite::Error::InvalidParameterName(name.clone()))?;
                stmt.raw_bind_parameter(idx, value)?;
            }
        }
    }
    Ok(())
}

fn named_index(stmt: &Statement<'_>, name: &str) -> rusqlite::Result<Option<usize>> {
    if name.starts_with(NAMED_PREFIXES) {
        return stmt.parameter_index(name);
    }
    for prefix in NAMED_PREFIXES {
        if let Some(idx) = stmt.parameter_index(&format!("{}{}", prefix, name))? {
            return Ok(Some(idx));
        }
    }
    Ok(None)
}

fn to_json(value: ValueRef<'_>) -> JsonValue {
    match value {
        ValueRef::Null => JsonValue::Null,
        ValueRef::Integer(i) => JsonValue::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        ValueRef::Text(t) => JsonValue::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => JsonValue::String(STANDARD.encode(b)),
    }
}

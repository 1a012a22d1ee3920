//! Execution Result - normalized rows returned by the executor

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

/// Placeholder written over values of sensitive columns.
pub const REDACTED: &str = "[REDACTED]";

pub type Row = HashMap<String, Value>;

/// Normalized result of running one compiled statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Column names in select-list order
    pub columns: Vec<String>,

    /// Rows keyed by column name, values already JSON-normalized
    pub rows: Vec<Row>,

    /// Number of rows returned
    pub row_count: usize,

    /// Wall time spent in the executor, retries included
    pub duration_ms: u64,

    /// Success status
    pub success: bool,

    /// Fault kind when the statement failed
    pub error_class: Option<String>,
}

impl ExecutionResult {
    /// Create a successful result
    pub fn success(columns: Vec<String>, rows: Vec<Row>, duration_ms: u64) -> Self {
        let row_count = rows.len();
        Self {
            columns,
            rows,
            row_count,
            duration_ms,
            success: true,
            error_class: None,
        }
    }

    /// Create an error result
    pub fn failure(error_class: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            duration_ms,
            success: false,
            error_class: Some(error_class.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    /// Overwrite values of the given columns. Returns how many values were
    /// replaced.
    pub fn redact_columns(&mut self, sensitive: &BTreeSet<String>) -> usize {
        let mut redacted = 0;
        for row in &mut self.rows {
            for (column, value) in row.iter_mut() {
                if sensitive.contains(&column.to_lowercase()) && !value.is_null() {
                    *value = Value::String(REDACTED.to_string());
                    redacted += 1;
                }
            }
        }
        redacted
    }

    /// Render rows as a JSON array, in column order.
    pub fn to_json(&self) -> Value {
        let rows: Vec<Value> = self
            .rows
            .iter()
            .map(|row| {
                let mut object = serde_json::Map::new();
                for column in &self.columns {
                    object.insert(column.clone(), row.get(column).cloned().unwrap_or(Value::Null));
                }
                Value::Object(object)
            })
            .collect();
        serde_json::json!({
            "columns": self.columns,
            "rows": rows,
            "row_count": self.row_count,
        })
    }
}

/// Convert a float into a JSON number, `null` when not finite.
pub fn float_value(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

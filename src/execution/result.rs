//! Query Result - result and error values shared by all execution engines

use crate::spatial::Srid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Longest text shown for a single sample value in a schema description.
pub const SAMPLE_TEXT_LIMIT: usize = 160;

/// Rows returned by one executed statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Output column names, unique and in statement order
    pub columns: Vec<String>,

    /// Row tuples, each the same length as `columns`
    pub rows: Vec<Vec<Value>>,

    /// True when the row cap was reached
    pub truncated: bool,

    /// Wall-clock execution time in milliseconds
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl ExecutionResult {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns,
            rows,
            truncated: false,
            elapsed_ms: 0,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    Timeout,
    Engine,
    Connection,
    ResultShape,
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionErrorKind::Timeout => write!(f, "timeout"),
            ExecutionErrorKind::Engine => write!(f, "engine"),
            ExecutionErrorKind::Connection => write!(f, "connection"),
            ExecutionErrorKind::ResultShape => write!(f, "result_shape"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind} error: {message}")]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
}

impl ExecutionError {
    pub fn timeout(limit: Duration) -> Self {
        Self {
            kind: ExecutionErrorKind::Timeout,
            message: format!("statement exceeded the {} ms time limit and was cancelled", limit.as_millis()),
        }
    }

    pub fn engine(message: impl Into<String>) -> Self {
        Self { kind: ExecutionErrorKind::Engine, message: message.into() }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self { kind: ExecutionErrorKind::Connection, message: message.into() }
    }

    pub fn result_shape(message: impl Into<String>) -> Self {
        Self { kind: ExecutionErrorKind::ResultShape, message: message.into() }
    }
}

/// Bounds for a single execution.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub timeout: Duration,
    pub max_rows: usize,
    /// Render geometry columns as GeoJSON text
    pub geometry_as_text: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_rows: 500,
            geometry_as_text: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            description: None,
        }
    }

    pub fn is_geometry(&self) -> bool {
        let ty = self.data_type.to_lowercase();
        self.name.eq_ignore_ascii_case("geometry") || ty.contains("geometry") || ty.contains("geography")
    }
}

/// What the synthesizer is told about a relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationSchema {
    pub relation: String,
    pub columns: Vec<ColumnInfo>,
    /// At most three rows, geometry rendered as text
    pub sample_rows: Vec<Vec<Value>>,
    /// Reference system recorded when the relation was loaded
    #[serde(default)]
    pub srid: Option<Srid>,
}

impl RelationSchema {
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn geometry_column(&self) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.is_geometry())
    }

    pub fn has_bbox_columns(&self) -> bool {
        let names = self.column_names();
        ["min_lon", "min_lat", "max_lon", "max_lat"]
            .iter()
            .all(|wanted| names.iter().any(|n| n.eq_ignore_ascii_case(wanted)))
    }
}

/// Shorten long text values so sample rows stay prompt-sized.
pub fn clip_sample_value(value: Value) -> Value {
    match value {
        Value::String(s) if s.chars().count() > SAMPLE_TEXT_LIMIT => {
            let clipped: String = s.chars().take(SAMPLE_TEXT_LIMIT).collect();
            Value::String(format!("{}...", clipped))
        }
        other => other,
    }
}

/// Convert a float to JSON, mapping NaN and infinities to null.
pub fn float_to_json(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_serializes_kind_in_snake_case() {
        let err = ExecutionError::result_shape("duplicate column count");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "result_shape");
        assert_eq!(err.to_string(), "result_shape error: duplicate column count");
    }

    #[test]
    fn test_schema_helpers() {
        let schema = RelationSchema {
            relation: "buildings".to_string(),
            columns: vec![
                ColumnInfo::new("gml_id", "TEXT"),
                ColumnInfo::new("geometry", "GEOMETRY"),
                ColumnInfo::new("min_lon", "REAL"),
                ColumnInfo::new("min_lat", "REAL"),
                ColumnInfo::new("max_lon", "REAL"),
                ColumnInfo::new("max_lat", "REAL"),
            ],
            sample_rows: Vec::new(),
            srid: None,
        };
        assert_eq!(schema.geometry_column().map(|c| c.name.as_str()), Some("geometry"));
        assert!(schema.has_bbox_columns());
    }

    #[test]
    fn test_clip_and_float_conversion() {
        let long = Value::String("x".repeat(SAMPLE_TEXT_LIMIT + 10));
        match clip_sample_value(long) {
            Value::String(s) => assert_eq!(s.len(), SAMPLE_TEXT_LIMIT + 3),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(float_to_json(f64::NAN), Value::Null);
        assert_eq!(float_to_json(1.5), serde_json::json!(1.5));
    }
}

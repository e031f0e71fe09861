//! CSV and Parquet reader built on polars.
//!
//! A string column named `geometry` (any case) is taken to hold GeoJSON text.

use crate::dataset::TableData;
use crate::error::{GeoSqlError, Result};
use crate::execution::result::float_to_json;
use polars::prelude::*;
use serde_json::Value;
use std::path::Path;
use tracing::debug;

pub fn read_tabular(path: &Path) -> Result<TableData> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    let df = match extension.as_str() {
        "csv" => LazyCsvReader::new(path)
            .with_infer_schema_length(Some(1000))
            .finish()
            .map_err(|e| GeoSqlError::Load(format!("Failed to read CSV {}: {}", path.display(), e)))?
            .collect()
            .map_err(|e| GeoSqlError::Polars(format!("Failed to collect: {}", e)))?,
        "parquet" => LazyFrame::scan_parquet(path, ScanArgsParquet::default())
            .map_err(|e| GeoSqlError::Load(format!("Failed to scan parquet {}: {}", path.display(), e)))?
            .collect()
            .map_err(|e| GeoSqlError::Polars(format!("Failed to collect: {}", e)))?,
        other => {
            return Err(GeoSqlError::Load(format!(
                "unsupported tabular format {:?}; expected .csv or .parquet",
                other
            )))
        }
    };
    dataframe_to_table(&df)
}

pub fn dataframe_to_table(df: &DataFrame) -> Result<TableData> {
    let columns: Vec<String> = df.get_column_names().iter().map(|s| s.to_string()).collect();
    if columns.is_empty() {
        return Err(GeoSqlError::Load("tabular source has no columns".to_string()));
    }

    let geometry_column = df.get_columns().iter().position(|series| {
        series.name().eq_ignore_ascii_case("geometry") && matches!(series.dtype(), DataType::String)
    });

    let series = df.get_columns();
    let mut rows = Vec::with_capacity(df.height());
    for row_idx in 0..df.height() {
        let mut row = Vec::with_capacity(series.len());
        for s in series {
            let value = s
                .get(row_idx)
                .map_err(|e| GeoSqlError::Polars(format!("Failed to get value: {}", e)))?;
            row.push(any_value_to_json(value));
        }
        rows.push(row);
    }
    debug!("Read {} rows x {} columns", rows.len(), columns.len());

    Ok(TableData {
        columns,
        rows,
        geometry_column,
        source_srid: None,
    })
}

fn any_value_to_json(value: AnyValue<'_>) -> Value {
    match value {
        AnyValue::Null => Value::Null,
        AnyValue::Boolean(b) => Value::Bool(b),
        AnyValue::String(s) => Value::String(s.to_string()),
        AnyValue::Int8(i) => Value::from(i),
        AnyValue::Int16(i) => Value::from(i),
        AnyValue::Int32(i) => Value::from(i),
        AnyValue::Int64(i) => Value::from(i),
        AnyValue::UInt8(u) => Value::from(u),
        AnyValue::UInt16(u) => Value::from(u),
        AnyValue::UInt32(u) => Value::from(u),
        AnyValue::UInt64(u) => Value::from(u),
        AnyValue::Float32(f) => float_to_json(f as f64),
        AnyValue::Float64(f) => float_to_json(f),
        other => Value::String(other.to_string()),
    }
}

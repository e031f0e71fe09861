//! GeoJSON FeatureCollection reader.

use crate::dataset::TableData;
use crate::error::{GeoSqlError, Result};
use crate::spatial::{Envelope, Srid};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

pub const GEOMETRY_COLUMN: &str = "geometry";

lazy_static! {
    static ref EPSG_CODE: Regex = Regex::new(r"(?i)EPSG:{1,2}(\d+)").unwrap();
}

/// Decode a FeatureCollection: properties become columns in first-seen order
/// and each geometry is kept as GeoJSON text in a trailing `geometry` column.
pub fn read_feature_collection(path: &Path) -> Result<TableData> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| GeoSqlError::Load(format!("cannot read {}: {}", path.display(), e)))?;
    let doc: Value = serde_json::from_str(&text)
        .map_err(|e| GeoSqlError::Load(format!("{} is not valid JSON: {}", path.display(), e)))?;
    parse_feature_collection(&doc)
}

pub fn parse_feature_collection(doc: &Value) -> Result<TableData> {
    if doc.get("type").and_then(Value::as_str) != Some("FeatureCollection") {
        return Err(GeoSqlError::Load("GeoJSON source must be a FeatureCollection".to_string()));
    }
    let features = doc
        .get("features")
        .and_then(Value::as_array)
        .ok_or_else(|| GeoSqlError::Load("FeatureCollection has no features array".to_string()))?;

    let mut columns: Vec<String> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut shadowed = false;
    for feature in features {
        if let Some(props) = feature.get("properties").and_then(Value::as_object) {
            for key in props.keys() {
                if key == GEOMETRY_COLUMN {
                    shadowed = true;
                    continue;
                }
                if !index.contains_key(key) {
                    index.insert(key.clone(), columns.len());
                    columns.push(key.clone());
                }
            }
        }
    }
    if shadowed {
        warn!("Dropping property named {:?}; it collides with the geometry column", GEOMETRY_COLUMN);
    }

    let geometry_idx = columns.len();
    let mut rows = Vec::with_capacity(features.len());
    for feature in features {
        let mut row = vec![Value::Null; geometry_idx + 1];
        if let Some(props) = feature.get("properties").and_then(Value::as_object) {
            for (key, value) in props {
                if let Some(&idx) = index.get(key) {
                    row[idx] = value.clone();
                }
            }
        }
        row[geometry_idx] = match feature.get("geometry") {
            Some(Value::Null) | None => Value::Null,
            Some(geometry) => Value::String(geometry.to_string()),
        };
        rows.push(row);
    }
    columns.push(GEOMETRY_COLUMN.to_string());

    let source_srid = Some(declared_srid(doc).unwrap_or(Srid::WGS84));
    debug!("Decoded {} features with {} columns ({:?})", rows.len(), columns.len(), source_srid);

    Ok(TableData {
        columns,
        rows,
        geometry_column: Some(geometry_idx),
        source_srid,
    })
}

/// SRID from the legacy `crs` member; RFC 7946 documents carry none.
fn declared_srid(doc: &Value) -> Option<Srid> {
    let name = doc.get("crs")?.get("properties")?.get("name")?.as_str()?;
    if name.contains("CRS84") {
        return Some(Srid::WGS84);
    }
    EPSG_CODE
        .captures(name)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .map(Srid)
}

/// Envelope of every coordinate in a GeoJSON geometry.
pub fn geometry_envelope(geometry: &Value) -> Option<Envelope> {
    let mut envelope: Option<Envelope> = None;
    if let Some(coordinates) = geometry.get("coordinates") {
        collect_positions(coordinates, &mut envelope);
    }
    if let Some(members) = geometry.get("geometries").and_then(Value::as_array) {
        for member in members {
            if let Some(env) = geometry_envelope(member) {
                match envelope.as_mut() {
                    Some(acc) => {
                        acc.expand(env.min_x, env.min_y);
                        acc.expand(env.max_x, env.max_y);
                    }
                    None => envelope = Some(env),
                }
            }
        }
    }
    envelope
}

fn collect_positions(value: &Value, envelope: &mut Option<Envelope>) {
    let Some(items) = value.as_array() else {
        return;
    };
    if let (Some(x), Some(y)) = (
        items.first().and_then(Value::as_f64),
        items.get(1).and_then(Value::as_f64),
    ) {
        match envelope.as_mut() {
            Some(env) => env.expand(x, y),
            None => *envelope = Some(Envelope::of_point(x, y)),
        }
        return;
    }
    for item in items {
        collect_positions(item, envelope);
    }
}

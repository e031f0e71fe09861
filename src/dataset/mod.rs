//! Dataset Loader
//!
//! Exposes an external geospatial source as a named relation. File sources
//! are decoded in process and copied into an embedded database; relational
//! sources are wrapped in place with a view or a copied table. Every load is
//! create-or-replace inside one transaction.

pub mod geojson;
pub mod tabular;

use crate::config::AppConfig;
use crate::error::{GeoSqlError, Result};
use crate::execution::{
    DatabaseHandle, PostgresEngine, PostgresLoad, SqliteEngine, SqliteLoad, SqliteSource, RELATION_CATALOG,
};
use crate::spatial::Srid;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Derived envelope columns, in SQL order.
pub const BBOX_COLUMNS: [&str; 4] = ["min_lon", "min_lat", "max_lon", "max_lat"];

lazy_static! {
    static ref PLAIN_IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

pub fn is_plain_identifier(name: &str) -> bool {
    PLAIN_IDENTIFIER.is_match(name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    FileTabular,
    FileGeospatial,
    EmbeddedAnalyticalDb,
    RelationalDb,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaterializationMode {
    #[default]
    View,
    Table,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub source_type: SourceType,
    pub path: String,
    pub db: DatabaseHandle,
    pub relation: String,
    pub mode: MaterializationMode,
    pub srid: Option<Srid>,
    pub add_bbox_columns: bool,
    /// Table to read inside an embedded or relational source
    pub source_relation: Option<String>,
}

impl DatasetDescriptor {
    pub fn check(&self) -> Result<()> {
        if !is_plain_identifier(&self.relation) {
            return Err(GeoSqlError::InvalidRequest(format!(
                "relation name {:?} must match [A-Za-z_][A-Za-z0-9_]*",
                self.relation
            )));
        }
        if self.relation.eq_ignore_ascii_case(RELATION_CATALOG) {
            return Err(GeoSqlError::InvalidRequest(format!("{} is reserved", RELATION_CATALOG)));
        }
        if self.path.trim().is_empty() {
            return Err(GeoSqlError::InvalidRequest("path must not be empty".to_string()));
        }
        if self.add_bbox_columns && self.srid.is_none() {
            return Err(GeoSqlError::InvalidRequest(
                "srid is required when add_bbox_columns is set".to_string(),
            ));
        }
        if let Some(source) = &self.source_relation {
            if !source.split('.').all(is_plain_identifier) {
                return Err(GeoSqlError::InvalidRequest(format!(
                    "source_relation {:?} must be [schema.]table",
                    source
                )));
            }
        }
        Ok(())
    }
}

/// A materialized relation, ready to be described and queried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationContext {
    pub db: DatabaseHandle,
    pub relation: String,
    pub row_count: u64,
    pub kind: MaterializationMode,
    pub srid: Option<Srid>,
}

/// Rows decoded from a file source.
#[derive(Debug, Clone, PartialEq)]
pub struct TableData {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// Index of the column holding GeoJSON geometry text
    pub geometry_column: Option<usize>,
    /// Reference system declared by the source, if any
    pub source_srid: Option<Srid>,
}

impl TableData {
    /// SQLite declared type for each column, inferred from the non-null values.
    pub fn column_types(&self) -> Vec<&'static str> {
        (0..self.columns.len())
            .map(|idx| {
                if self.geometry_column == Some(idx) {
                    return "GEOMETRY";
                }
                let mut widest = 0u8; // 0 = no values, 1 = integer, 2 = real, 3 = text
                for value in self.rows.iter().filter_map(|row| row.get(idx)) {
                    let rank = match value {
                        Value::Null => 0,
                        Value::Bool(_) => 1,
                        Value::Number(n) if n.is_i64() => 1,
                        Value::Number(_) => 2,
                        _ => 3,
                    };
                    widest = widest.max(rank);
                }
                match widest {
                    1 => "INTEGER",
                    2 => "REAL",
                    _ => "TEXT",
                }
            })
            .collect()
    }
}

pub struct DatasetLoader<'a> {
    config: &'a AppConfig,
}

impl<'a> DatasetLoader<'a> {
    pub fn new(config: &'a AppConfig) -> Self {
        Self { config }
    }

    /// Create or replace the descriptor's relation.
    pub async fn load(&self, descriptor: &DatasetDescriptor) -> Result<RelationContext> {
        descriptor.check()?;
        info!(
            "Loading {:?} source {} as {} ({:?}) into {}",
            descriptor.source_type, descriptor.path, descriptor.relation, descriptor.mode, descriptor.db
        );

        match (&descriptor.db, descriptor.source_type) {
            (DatabaseHandle::Postgres(url), SourceType::RelationalDb) => self.load_relational(url, descriptor).await,
            (DatabaseHandle::Postgres(_), other) => Err(GeoSqlError::Load(format!(
                "{:?} sources are materialized into an embedded database; use a file db_path",
                other
            ))),
            (DatabaseHandle::Sqlite(_), SourceType::RelationalDb) => Err(GeoSqlError::Load(
                "relational-db sources need a postgres:// db_path".to_string(),
            )),
            (DatabaseHandle::Sqlite(db_path), source_type) => {
                self.load_embedded(db_path, source_type, descriptor).await
            }
        }
    }

    async fn load_relational(&self, url: &str, descriptor: &DatasetDescriptor) -> Result<RelationContext> {
        let source = descriptor
            .source_relation
            .clone()
            .unwrap_or_else(|| descriptor.path.trim().to_string());
        if !source.split('.').all(is_plain_identifier) {
            return Err(GeoSqlError::Load(format!("{:?} is not a [schema.]table name", source)));
        }

        let engine = PostgresEngine::connect(url, &self.config.postgres)
            .await
            .map_err(|e| GeoSqlError::Load(format!("cannot connect to relational store: {}", e)))?;
        let load = PostgresLoad {
            relation: descriptor.relation.clone(),
            source,
            mode: descriptor.mode,
            bbox_srid: if descriptor.add_bbox_columns { descriptor.srid } else { None },
            srid: descriptor.srid,
        };
        let rows = engine.materialize(&load).await?;
        Ok(RelationContext {
            db: descriptor.db.clone(),
            relation: descriptor.relation.clone(),
            row_count: rows,
            kind: descriptor.mode,
            srid: descriptor.srid,
        })
    }

    async fn load_embedded(
        &self,
        db_path: &Path,
        source_type: SourceType,
        descriptor: &DatasetDescriptor,
    ) -> Result<RelationContext> {
        let path = PathBuf::from(descriptor.path.trim());
        std::fs::metadata(&path)
            .map_err(|e| GeoSqlError::Load(format!("cannot read {}: {}", path.display(), e)))?;

        let (source, srid) = match source_type {
            SourceType::FileGeospatial | SourceType::FileTabular => {
                let read_path = path.clone();
                let data = tokio::task::spawn_blocking(move || match source_type {
                    SourceType::FileGeospatial => geojson::read_feature_collection(&read_path),
                    _ => tabular::read_tabular(&read_path),
                })
                .await
                .map_err(|e| GeoSqlError::Load(format!("reader task failed: {}", e)))??;

                if descriptor.add_bbox_columns {
                    if data.geometry_column.is_none() {
                        return Err(GeoSqlError::Schema(format!(
                            "bbox columns requested but {} has no geometry column",
                            path.display()
                        )));
                    }
                    if let (Some(source), Some(requested)) = (data.source_srid, descriptor.srid) {
                        if source != requested {
                            return Err(GeoSqlError::Load(format!(
                                "source geometry is {} but {} was requested; the embedded engine does not reproject",
                                source, requested
                            )));
                        }
                    }
                }
                let srid = data.source_srid.or(descriptor.srid);
                (SqliteSource::Rows(data), srid)
            }
            SourceType::EmbeddedAnalyticalDb => (
                SqliteSource::Attached {
                    path: path.clone(),
                    table: descriptor.source_relation.clone(),
                },
                descriptor.srid,
            ),
            SourceType::RelationalDb => {
                return Err(GeoSqlError::Load("relational-db sources need a postgres:// db_path".to_string()))
            }
        };

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.exists() {
                warn!("Creating database directory {}", parent.display());
                std::fs::create_dir_all(parent)?;
            }
        }

        let engine = SqliteEngine::new(db_path.to_path_buf());
        let load = SqliteLoad {
            relation: descriptor.relation.clone(),
            mode: descriptor.mode,
            add_bbox: descriptor.add_bbox_columns,
            srid,
            source,
        };
        let rows = tokio::task::spawn_blocking(move || engine.materialize(&load))
            .await
            .map_err(|e| GeoSqlError::Load(format!("materialize task failed: {}", e)))??;

        Ok(RelationContext {
            db: descriptor.db.clone(),
            relation: descriptor.relation.clone(),
            row_count: rows,
            kind: descriptor.mode,
            srid,
        })
    }
}

//! Execution Engine Trait - Core contract for all execution engines
//!
//! An engine owns the connection details for one database handle. It can
//! describe a relation for prompting and run a single validated statement
//! under a timeout.

use crate::error::{GeoSqlError, Result};
use crate::execution::result::{ExecuteOptions, ExecutionError, ExecutionResult, RelationSchema};
use crate::validator::SqlDialect;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Table recording the SRID each relation was loaded with.
pub const RELATION_CATALOG: &str = "geosql_relations";

/// Where a relation lives.
///
/// Serialized as the `db_path` string: connection URLs select the relational
/// engine, anything else is an embedded database file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DatabaseHandle {
    Sqlite(PathBuf),
    Postgres(String),
}

impl DatabaseHandle {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(GeoSqlError::InvalidRequest("db_path must not be empty".to_string()));
        }
        if raw.starts_with("postgres://") || raw.starts_with("postgresql://") {
            Ok(DatabaseHandle::Postgres(raw.to_string()))
        } else {
            Ok(DatabaseHandle::Sqlite(PathBuf::from(raw)))
        }
    }

    pub fn is_relational(&self) -> bool {
        matches!(self, DatabaseHandle::Postgres(_))
    }
}

impl fmt::Display for DatabaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseHandle::Sqlite(path) => write!(f, "{}", path.display()),
            DatabaseHandle::Postgres(url) => write!(f, "{}", url),
        }
    }
}

impl TryFrom<String> for DatabaseHandle {
    type Error = GeoSqlError;

    fn try_from(raw: String) -> Result<Self> {
        DatabaseHandle::parse(&raw)
    }
}

impl From<DatabaseHandle> for String {
    fn from(handle: DatabaseHandle) -> Self {
        handle.to_string()
    }
}

/// Execution engine trait - all engines must implement this
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Engine name (e.g., "sqlite", "postgres")
    fn name(&self) -> &'static str;

    /// Dialect used to validate statements for this engine
    fn dialect(&self) -> SqlDialect;

    /// Columns, types and up to three sample rows of `relation`
    async fn describe_relation(&self, relation: &str) -> Result<RelationSchema>;

    /// Run one validated statement in a read-only context.
    ///
    /// Engines stop reading after `options.max_rows` rows and abort the
    /// statement in the database when `options.timeout` elapses.
    async fn run_query(
        &self,
        sql: &str,
        options: &ExecuteOptions,
    ) -> std::result::Result<ExecutionResult, ExecutionError>;

    /// Check if engine is available/healthy
    async fn health_check(&self) -> Result<bool>;
}

/// Quote an identifier for either engine.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

//! Execution engines and the bounded query executor.

pub mod engine;
pub mod executor;
pub mod postgres_engine;
pub mod result;
pub mod sqlite_engine;

pub use engine::{quote_ident, DatabaseHandle, ExecutionEngine, RELATION_CATALOG};
pub use executor::QueryExecutor;
pub use postgres_engine::{PostgresEngine, PostgresLoad};
pub use result::{
    ColumnInfo, ExecuteOptions, ExecutionError, ExecutionErrorKind, ExecutionResult, RelationSchema,
};
pub use sqlite_engine::{SqliteEngine, SqliteLoad, SqliteSource};

use crate::config::AppConfig;
use crate::error::Result;
use std::sync::Arc;

/// Engine for `handle`. Relational handles open a small connection pool.
pub async fn open_engine(handle: &DatabaseHandle, config: &AppConfig) -> Result<Arc<dyn ExecutionEngine>> {
    match handle {
        DatabaseHandle::Sqlite(path) => Ok(Arc::new(SqliteEngine::new(path.clone()))),
        DatabaseHandle::Postgres(url) => Ok(Arc::new(PostgresEngine::connect(url, &config.postgres).await?)),
    }
}

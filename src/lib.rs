pub mod api;
pub mod config;
pub mod dataset;
pub mod error;
pub mod execution;
pub mod execution_loop;
pub mod glossary;
pub mod llm;
pub mod spatial;
pub mod synthesizer;
pub mod validator;

pub use api::{GeoSqlService, ToolRequest, ToolResponse};
pub use config::AppConfig;
pub use dataset::{DatasetDescriptor, DatasetLoader, MaterializationMode, RelationContext, SourceType};
pub use error::{GeoSqlError, Result};
pub use execution::{DatabaseHandle, ExecutionEngine, ExecutionResult, QueryExecutor};
pub use execution_loop::{LoopOutcome, QueryAttempt, RetryController, RetryPolicy};
pub use llm::{CompletionProvider, LlmClient};
pub use spatial::{SpatialFilter, Srid};
pub use synthesizer::QuerySynthesizer;
pub use validator::{QueryValidator, SqlDialect};

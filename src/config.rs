//! Session Configuration
//!
//! Everything the core needs from the environment is read once into an
//! [`AppConfig`] at session start and passed by reference to constructors.

use crate::error::{GeoSqlError, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Primary and fallback names for the completion credential.
pub const API_KEY_VARS: [&str; 2] = ["OPENAI_API_KEY", "OPEN_AI_API_KEY"];

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub postgres: PostgresConfig,
    pub llm: LlmConfig,
    pub limits: QueryLimits,
    /// Embedded database file used when a request omits `db_path`
    pub default_db_path: PathBuf,
    pub default_relation: String,
    pub glossary_path: Option<PathBuf>,
    pub extra_denied_functions: Vec<String>,
    pub extra_allowed_functions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct QueryLimits {
    pub default_max_rows: usize,
    pub hard_max_rows: usize,
    pub default_retries: u32,
    pub max_retries: u32,
    pub statement_timeout: Duration,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            default_max_rows: 500,
            hard_max_rows: 10_000,
            default_retries: 2,
            max_retries: 5,
            statement_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 5432,
            database: "postgres".to_string(),
            user: "postgres".to_string(),
            password: None,
            max_connections: 4,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            postgres: PostgresConfig::default(),
            llm: LlmConfig::default(),
            limits: QueryLimits::default(),
            default_db_path: PathBuf::from("geo.db"),
            default_relation: "places".to_string(),
            glossary_path: None,
            extra_denied_functions: Vec::new(),
            extra_allowed_functions: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Build from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars().collect())
    }

    /// Build from an explicit variable map (used by tests and by `from_env`).
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| vars.get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = AppConfig::default();

        let postgres = PostgresConfig {
            url: get("DATABASE_URL"),
            host: get("POSTGRES_HOST").unwrap_or(defaults.postgres.host),
            port: parse_var(&vars, "POSTGRES_PORT")?.unwrap_or(defaults.postgres.port),
            database: get("POSTGRES_DB").unwrap_or(defaults.postgres.database),
            user: get("POSTGRES_USER").unwrap_or(defaults.postgres.user),
            password: get("POSTGRES_PASSWORD"),
            ..defaults.postgres
        };

        let llm = LlmConfig {
            api_key: API_KEY_VARS.iter().find_map(|name| get(name)),
            model: get("OPENAI_MODEL").unwrap_or(defaults.llm.model),
            base_url: get("OPENAI_BASE_URL").unwrap_or(defaults.llm.base_url),
            ..defaults.llm
        };

        let mut limits = defaults.limits;
        if let Some(v) = parse_var(&vars, "GEOSQL_DEFAULT_MAX_ROWS")? {
            limits.default_max_rows = v;
        }
        if let Some(v) = parse_var(&vars, "GEOSQL_HARD_MAX_ROWS")? {
            limits.hard_max_rows = v;
        }
        if let Some(v) = parse_var(&vars, "GEOSQL_DEFAULT_RETRIES")? {
            limits.default_retries = v;
        }
        if let Some(v) = parse_var(&vars, "GEOSQL_MAX_RETRIES")? {
            limits.max_retries = v;
        }
        if let Some(ms) = parse_var::<u64>(&vars, "GEOSQL_STATEMENT_TIMEOUT_MS")? {
            limits.statement_timeout = Duration::from_millis(ms);
        }

        let config = Self {
            postgres,
            llm,
            limits,
            default_db_path: get("GEOSQL_DB_PATH").map(PathBuf::from).unwrap_or(defaults.default_db_path),
            default_relation: get("GEOSQL_DEFAULT_RELATION").unwrap_or(defaults.default_relation),
            glossary_path: get("GEOSQL_GLOSSARY").map(PathBuf::from),
            extra_denied_functions: split_list(get("GEOSQL_DENY_FUNCTIONS")),
            extra_allowed_functions: split_list(get("GEOSQL_ALLOW_FUNCTIONS")),
        };
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        let limits = &self.limits;
        if limits.default_max_rows == 0 || limits.hard_max_rows == 0 {
            return Err(GeoSqlError::Config("row limits must be positive".to_string()));
        }
        if limits.default_max_rows > limits.hard_max_rows {
            return Err(GeoSqlError::Config(format!(
                "default max rows {} exceeds hard max rows {}",
                limits.default_max_rows, limits.hard_max_rows
            )));
        }
        if limits.default_retries > limits.max_retries {
            return Err(GeoSqlError::Config(format!(
                "default retries {} exceeds max retries {}",
                limits.default_retries, limits.max_retries
            )));
        }
        if limits.statement_timeout.is_zero() {
            return Err(GeoSqlError::Config("statement timeout must be positive".to_string()));
        }
        Ok(())
    }

    /// Connection URL for the relational store, either given verbatim or assembled.
    pub fn postgres_url(&self) -> String {
        let pg = &self.postgres;
        if let Some(url) = &pg.url {
            return url.clone();
        }
        match &pg.password {
            Some(password) => format!(
                "postgres://{}:{}@{}:{}/{}",
                pg.user, password, pg.host, pg.port, pg.database
            ),
            None => format!("postgres://{}@{}:{}/{}", pg.user, pg.host, pg.port, pg.database),
        }
    }
}

fn parse_var<T: std::str::FromStr>(vars: &HashMap<String, String>, key: &str) -> Result<Option<T>> {
    match vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| GeoSqlError::Config(format!("{} has an invalid value: {}", key, raw))),
    }
}

fn split_list(raw: Option<String>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(|item| item.trim().to_lowercase())
            .filter(|item| !item.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

//! Query Validator
//!
//! Safety gate between the synthesizer and the engine. A candidate statement
//! is accepted only if it is a single read-only query built from allowed
//! functions; the accepted text always carries a `LIMIT` no larger than the
//! caller's row cap. Validation is purely syntactic and never touches a
//! database.

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{
    visit_expressions, visit_relations, Expr, ObjectName, Query, SetExpr, Statement, TableFactor, Value, Visit,
    Visitor,
};
use sqlparser::dialect::{Dialect, GenericDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::collections::HashSet;
use std::fmt;
use std::ops::ControlFlow;
use thiserror::Error;
use tracing::debug;

/// SQL dialect of the engine a statement is validated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    Sqlite,
    Postgres,
    Generic,
}

impl SqlDialect {
    fn parser_dialect(&self) -> Box<dyn Dialect> {
        match self {
            SqlDialect::Sqlite => Box::new(SQLiteDialect {}),
            SqlDialect::Postgres => Box::new(PostgreSqlDialect {}),
            SqlDialect::Generic => Box::new(GenericDialect {}),
        }
    }
}

impl fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlDialect::Sqlite => write!(f, "SQLite"),
            SqlDialect::Postgres => write!(f, "PostgreSQL/PostGIS"),
            SqlDialect::Generic => write!(f, "ANSI SQL"),
        }
    }
}

lazy_static! {
    /// Keywords that never appear in a read-only query.
    pub static ref FORBIDDEN_KEYWORDS: HashSet<&'static str> = [
        "INSERT", "UPDATE", "DELETE", "MERGE", "UPSERT",
        "DROP", "ALTER", "CREATE", "TRUNCATE", "GRANT", "REVOKE", "COPY",
        "ATTACH", "DETACH", "PRAGMA", "VACUUM", "ANALYZE", "REINDEX",
        "EXECUTE", "EXEC", "CALL", "DO",
        "BEGIN", "COMMIT", "ROLLBACK", "SAVEPOINT", "LOCK",
        "SET", "RESET", "LOAD", "INSTALL", "EXPORT", "IMPORT",
        "LISTEN", "NOTIFY", "PREPARE", "DEALLOCATE", "DISCARD",
        "REFRESH", "CLUSTER", "COMMENT", "INTO",
    ]
    .into_iter()
    .collect();

    /// Functions with file, network, process or session side effects.
    static ref DENIED_FUNCTIONS: HashSet<&'static str> = [
        "pg_read_file", "pg_read_binary_file", "pg_ls_dir", "pg_stat_file",
        "pg_sleep", "pg_sleep_for", "pg_sleep_until",
        "pg_terminate_backend", "pg_cancel_backend", "pg_reload_conf", "pg_rotate_logfile",
        "set_config", "current_setting", "query_to_xml", "table_to_xml", "database_to_xml",
        "load_extension", "readfile", "writefile", "edit", "fts3_tokenizer", "zipfile",
        "sqlite_compileoption_get", "sqlite_compileoption_used",
        "st_read", "st_readosm", "st_write", "read_csv", "read_csv_auto", "read_parquet",
        "read_json", "read_json_auto", "read_text", "read_blob", "glob",
        "copy", "sleep", "system", "shell", "getenv",
    ]
    .into_iter()
    .collect();

    static ref DENIED_PREFIXES: Vec<&'static str> = vec![
        "pg_read_", "pg_ls_", "pg_file", "pg_stat_", "pg_sleep", "pg_logical_",
        "pg_advisory_", "pg_try_advisory_", "pg_create_", "pg_drop_", "pg_promote",
        "lo_", "dblink", "http", "sqlar_", "readfile", "writefile", "read_", "pragma_",
    ];

    /// Scalar, aggregate and window functions a read-only analytic query may use.
    static ref ALLOWED_FUNCTIONS: HashSet<&'static str> = [
        // aggregates
        "count", "sum", "avg", "min", "max", "total", "group_concat", "string_agg", "array_agg",
        "stddev", "stddev_pop", "stddev_samp", "variance", "var_pop", "var_samp",
        "bool_and", "bool_or", "every", "median", "mode", "percentile_cont", "percentile_disc",
        "corr", "covar_pop", "covar_samp", "json_group_array", "json_agg", "jsonb_agg",
        // window
        "row_number", "rank", "dense_rank", "percent_rank", "cume_dist", "ntile",
        "lag", "lead", "first_value", "last_value", "nth_value",
        // numeric
        "abs", "round", "ceil", "ceiling", "floor", "trunc", "power", "pow", "sqrt", "exp",
        "ln", "log", "log10", "log2", "mod", "sign", "pi", "degrees", "radians",
        "sin", "cos", "tan", "asin", "acos", "atan", "atan2", "random", "width_bucket",
        // string
        "lower", "upper", "length", "char_length", "character_length", "octet_length",
        "substr", "substring", "trim", "ltrim", "rtrim", "btrim", "replace", "concat",
        "concat_ws", "instr", "strpos", "left", "right", "lpad", "rpad", "reverse",
        "split_part", "initcap", "printf", "format", "quote", "unicode", "char",
        "regexp_replace", "regexp_match", "regexp_matches", "like", "starts_with",
        // conditional
        "coalesce", "nullif", "ifnull", "iif", "greatest", "least", "typeof",
        // date / time
        "date", "time", "datetime", "julianday", "unixepoch", "strftime", "date_trunc",
        "date_part", "age", "now", "current_date", "current_time", "current_timestamp",
        "localtime", "localtimestamp", "to_char", "to_date", "to_timestamp", "make_date",
        "extract",
        // json
        "json", "json_extract", "json_array_length", "json_type", "json_valid",
        "jsonb_extract_path_text", "json_extract_path_text",
        // geometry helpers outside the st_ namespace
        "box2d", "box3d", "geometrytype", "postgis_version",
    ]
    .into_iter()
    .collect();

    static ref ALLOWED_PREFIXES: Vec<&'static str> = vec!["st_"];

    static ref SYSTEM_RELATION_PREFIXES: Vec<&'static str> = vec![
        "pg_", "information_schema", "sqlite_", "geometry_columns", "spatial_ref_sys", "geosql_relations",
    ];
}

/// Why a candidate statement was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum RejectionReason {
    Empty,
    MultipleStatements,
    NotReadOnly(String),
    ForbiddenKeyword(String),
    ForbiddenFunction(String),
    UnlistedFunction(String),
    ForbiddenRelation(String),
    Unparseable(String),
    Unsupported(String),
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::Empty => write!(f, "empty statement"),
            RejectionReason::MultipleStatements => {
                write!(f, "multiple statements; submit exactly one SELECT without ';' chaining")
            }
            RejectionReason::NotReadOnly(lead) => {
                write!(f, "statement starts with '{}'; only SELECT or WITH ... SELECT is allowed", lead)
            }
            RejectionReason::ForbiddenKeyword(kw) => write!(f, "forbidden keyword {}", kw),
            RejectionReason::ForbiddenFunction(name) => write!(f, "forbidden function {}", name),
            RejectionReason::UnlistedFunction(name) => write!(f, "function {} is not on the allow list", name),
            RejectionReason::ForbiddenRelation(name) => write!(f, "relation {} is a system catalog", name),
            RejectionReason::Unparseable(msg) => write!(f, "SQL syntax error: {}", msg),
            RejectionReason::Unsupported(what) => write!(f, "unsupported construct: {}", what),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("query rejected: {}", join_reasons(.reasons))]
pub struct ValidationError {
    pub reasons: Vec<RejectionReason>,
}

fn join_reasons(reasons: &[RejectionReason]) -> String {
    reasons.iter().map(|r| r.to_string()).collect::<Vec<_>>().join("; ")
}

impl ValidationError {
    fn single(reason: RejectionReason) -> Self {
        Self { reasons: vec![reason] }
    }
}

/// Configurable function policy.
#[derive(Debug, Clone, Default)]
pub struct FunctionPolicy {
    extra_denied: HashSet<String>,
    extra_allowed: HashSet<String>,
}

impl FunctionPolicy {
    pub fn new(extra_denied: &[String], extra_allowed: &[String]) -> Self {
        Self {
            extra_denied: extra_denied.iter().map(|s| s.to_lowercase()).collect(),
            extra_allowed: extra_allowed.iter().map(|s| s.to_lowercase()).collect(),
        }
    }

    /// The denylist wins over every allow rule.
    pub fn check(&self, name: &str) -> Option<RejectionReason> {
        let lower = name.to_lowercase();
        if DENIED_FUNCTIONS.contains(lower.as_str())
            || self.extra_denied.contains(&lower)
            || DENIED_PREFIXES.iter().any(|p| lower.starts_with(p))
        {
            return Some(RejectionReason::ForbiddenFunction(lower));
        }
        if ALLOWED_FUNCTIONS.contains(lower.as_str())
            || self.extra_allowed.contains(&lower)
            || ALLOWED_PREFIXES.iter().any(|p| lower.starts_with(p))
        {
            return None;
        }
        Some(RejectionReason::UnlistedFunction(lower))
    }
}

pub struct QueryValidator {
    dialect: SqlDialect,
    policy: FunctionPolicy,
}

impl QueryValidator {
    pub fn new(dialect: SqlDialect, policy: FunctionPolicy) -> Self {
        Self { dialect, policy }
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    /// Accept `sql` and return the text to execute, or every reason it was refused.
    pub fn validate(&self, sql: &str, max_rows: usize) -> Result<String, ValidationError> {
        let trimmed = sql.trim();
        if trimmed.is_empty() || trimmed == ";" {
            return Err(ValidationError::single(RejectionReason::Empty));
        }
        let dialect = self.dialect.parser_dialect();

        let mut reasons = self.scan_tokens(dialect.as_ref(), trimmed);
        if !reasons.is_empty() {
            debug!("Rejected at token scan: {:?}", reasons);
            return Err(ValidationError { reasons });
        }

        let mut statements = match Parser::parse_sql(dialect.as_ref(), trimmed) {
            Ok(statements) => statements,
            Err(e) => {
                return Err(ValidationError::single(RejectionReason::Unparseable(e.to_string())));
            }
        };
        if statements.len() != 1 {
            return Err(ValidationError::single(if statements.is_empty() {
                RejectionReason::Empty
            } else {
                RejectionReason::MultipleStatements
            }));
        }
        let mut statement = statements.remove(0);

        let query = match &statement {
            Statement::Query(query) => query,
            other => {
                let lead = other.to_string().split_whitespace().next().unwrap_or_default().to_uppercase();
                return Err(ValidationError::single(RejectionReason::NotReadOnly(lead)));
            }
        };

        check_query_shape(query, &mut reasons);
        self.check_functions(&statement, &mut reasons);
        self.check_relations(&statement, &mut reasons);
        if !reasons.is_empty() {
            return Err(ValidationError { reasons });
        }

        if let Statement::Query(query) = &mut statement {
            cap_limit(query, max_rows)?;
        }
        Ok(statement.to_string())
    }

    /// Token-level checks catch chaining and forbidden keywords even in text
    /// the parser would refuse.
    fn scan_tokens(&self, dialect: &dyn Dialect, sql: &str) -> Vec<RejectionReason> {
        let tokens = match Tokenizer::new(dialect, sql).tokenize() {
            Ok(tokens) => tokens,
            Err(e) => return vec![RejectionReason::Unparseable(e.to_string())],
        };
        let significant: Vec<&Token> = tokens
            .iter()
            .filter(|t| !matches!(t, Token::Whitespace(_)))
            .collect();

        let mut reasons = Vec::new();
        match significant.first() {
            Some(Token::Word(w)) if w.quote_style.is_none() => {
                let lead = w.value.to_uppercase();
                if lead != "SELECT" && lead != "WITH" {
                    reasons.push(RejectionReason::NotReadOnly(lead));
                }
            }
            Some(other) => reasons.push(RejectionReason::NotReadOnly(other.to_string())),
            None => return vec![RejectionReason::Empty],
        }

        let last = significant.len() - 1;
        if significant
            .iter()
            .enumerate()
            .any(|(i, t)| matches!(t, Token::SemiColon) && i != last)
        {
            reasons.push(RejectionReason::MultipleStatements);
        }

        let mut seen = HashSet::new();
        for token in &significant {
            if let Token::Word(w) = token {
                if w.quote_style.is_some() {
                    continue;
                }
                let upper = w.value.to_uppercase();
                if FORBIDDEN_KEYWORDS.contains(upper.as_str()) && seen.insert(upper.clone()) {
                    reasons.push(RejectionReason::ForbiddenKeyword(upper));
                }
            }
        }
        reasons
    }

    fn check_functions(&self, statement: &Statement, reasons: &mut Vec<RejectionReason>) {
        let _ = visit_expressions(statement, |expr| {
            if let Expr::Function(func) = expr {
                if let Some(reason) = self.policy.check(&last_ident(&func.name)) {
                    push_unique(reasons, reason);
                }
            }
            ControlFlow::<()>::Continue(())
        });
    }

    fn check_relations(&self, statement: &Statement, reasons: &mut Vec<RejectionReason>) {
        let _ = visit_relations(statement, |relation| {
            let system = relation.0.iter().any(|ident| {
                let part = ident.value.to_lowercase();
                SYSTEM_RELATION_PREFIXES.iter().any(|p| part.starts_with(p))
            });
            if system {
                let full = relation.to_string().to_lowercase().replace('"', "");
                push_unique(reasons, RejectionReason::ForbiddenRelation(full));
            }
            ControlFlow::<()>::Continue(())
        });

        let mut sources = TableFunctionCheck { policy: &self.policy, reasons };
        let _ = statement.visit(&mut sources);
    }
}

/// Applies the function policy to table-valued functions in `FROM`, which
/// never surface as expressions.
struct TableFunctionCheck<'a> {
    policy: &'a FunctionPolicy,
    reasons: &'a mut Vec<RejectionReason>,
}

impl Visitor for TableFunctionCheck<'_> {
    type Break = ();

    fn pre_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<()> {
        let name = match factor {
            TableFactor::Table { name, args: Some(_), .. } => Some(last_ident(name)),
            TableFactor::Function { name, .. } => Some(last_ident(name)),
            TableFactor::UNNEST { .. } => Some("unnest".to_string()),
            _ => None,
        };
        if let Some(reason) = name.and_then(|n| self.policy.check(&n)) {
            push_unique(self.reasons, reason);
        }
        ControlFlow::Continue(())
    }
}

fn last_ident(name: &ObjectName) -> String {
    name.0.last().map(|ident| ident.value.clone()).unwrap_or_default()
}

fn push_unique(reasons: &mut Vec<RejectionReason>, reason: RejectionReason) {
    if !reasons.contains(&reason) {
        reasons.push(reason);
    }
}

fn check_query_shape(query: &Query, reasons: &mut Vec<RejectionReason>) {
    if !query.locks.is_empty() {
        reasons.push(RejectionReason::Unsupported("row locking clause".to_string()));
    }
    if query.fetch.is_some() {
        reasons.push(RejectionReason::Unsupported("FETCH clause; use LIMIT".to_string()));
    }
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            check_query_shape(&cte.query, reasons);
        }
    }
    check_set_expr(&query.body, reasons);
}

fn check_set_expr(body: &SetExpr, reasons: &mut Vec<RejectionReason>) {
    match body {
        SetExpr::Select(select) => {
            if select.into.is_some() {
                reasons.push(RejectionReason::Unsupported("SELECT INTO".to_string()));
            }
            if select.top.is_some() {
                reasons.push(RejectionReason::Unsupported("TOP; use LIMIT".to_string()));
            }
        }
        SetExpr::Query(inner) => check_query_shape(inner, reasons),
        SetExpr::SetOperation { left, right, .. } => {
            check_set_expr(left, reasons);
            check_set_expr(right, reasons);
        }
        SetExpr::Values(_) => {
            reasons.push(RejectionReason::Unsupported("bare VALUES".to_string()));
        }
        _ => reasons.push(RejectionReason::Unsupported("non-query statement body".to_string())),
    }
}

/// Inject or tighten the top-level `LIMIT` so that it never exceeds `max_rows`.
fn cap_limit(query: &mut Query, max_rows: usize) -> Result<(), ValidationError> {
    let replace = match &query.limit {
        None => true,
        Some(Expr::Value(Value::Number(n, _))) => match n.parse::<u64>() {
            Ok(existing) => existing as u128 > max_rows as u128,
            Err(_) => {
                return Err(ValidationError::single(RejectionReason::Unsupported(format!(
                    "LIMIT {} is not a whole number",
                    n
                ))))
            }
        },
        Some(other) => {
            return Err(ValidationError::single(RejectionReason::Unsupported(format!(
                "non-literal LIMIT {}",
                other
            ))))
        }
    };
    if replace {
        query.limit = Some(Expr::Value(Value::Number(max_rows.to_string(), false)));
    }
    Ok(())
}

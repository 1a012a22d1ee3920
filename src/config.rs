//! Pipeline configuration
//!
//! Settings are read from the environment (after `.env` is loaded by the
//! binary). Every knob has a default so a bare environment still produces a
//! working pipeline; malformed values are rejected rather than ignored.

use crate::error::ConfigError;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

/// Connection settings for the storage engine.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub pool_size: u32,
    pub acquire_timeout: Duration,
    pub schema: String,
}

/// Settings for the external SQL generator.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

/// Per-statement execution limits and retry policy.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub statement_timeout: Duration,
    pub idle_transaction_timeout: Duration,
    /// Pool checkout budget, part of the executor's outer deadline.
    pub acquire_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            statement_timeout: Duration::from_secs(10),
            idle_transaction_timeout: Duration::from_secs(15),
            acquire_timeout: Duration::from_secs(5),
            max_attempts: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            ttl: Duration::from_secs(300),
        }
    }
}

/// Knobs for the safety compiler.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    pub tenant_column: String,
    pub default_row_limit: u32,
    pub max_row_limit: u32,
    /// FROM items a statement may name before it counts as complex.
    /// Complex statements are never patched with an injected tenant filter.
    pub max_simple_tables: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            tenant_column: "tenant_id".to_string(),
            default_row_limit: 100,
            max_row_limit: 1000,
            max_simple_tables: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub ttl: Duration,
    pub tenant_tables: BTreeSet<String>,
    pub core_tables: Vec<String>,
    pub sensitive_fragments: Vec<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            tenant_tables: ["accounts", "transactions"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            core_tables: vec!["accounts".to_string(), "transactions".to_string()],
            sensitive_fragments: [
                "account_number",
                "routing",
                "access_token",
                "ssn",
                "password",
                "secret",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database: DatabaseConfig,
    pub generator: GeneratorConfig,
    pub executor: ExecutorConfig,
    pub cache: CacheConfig,
    pub compiler: CompilerConfig,
    pub catalog: CatalogConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: None,
                pool_size: 5,
                acquire_timeout: Duration::from_secs(5),
                schema: "public".to_string(),
            },
            generator: GeneratorConfig {
                api_key: None,
                model: "gpt-4o-mini".to_string(),
                base_url: "https://api.openai.com/v1".to_string(),
                timeout: Duration::from_secs(30),
                temperature: 0.0,
                max_output_tokens: 800,
            },
            executor: ExecutorConfig::default(),
            cache: CacheConfig::default(),
            compiler: CompilerConfig::default(),
            catalog: CatalogConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Build configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        config.database.url = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty());
        if let Some(size) = parse::<u32, _>(&lookup, "FINQUERY_POOL_SIZE")? {
            if size == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "FINQUERY_POOL_SIZE".to_string(),
                    value: size.to_string(),
                });
            }
            config.database.pool_size = size;
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "FINQUERY_POOL_ACQUIRE_TIMEOUT_MS")? {
            config.database.acquire_timeout = Duration::from_millis(ms);
            config.executor.acquire_timeout = Duration::from_millis(ms);
        }
        if let Some(schema) = lookup("FINQUERY_DB_SCHEMA") {
            config.database.schema = schema;
        }

        config.generator.api_key = lookup("OPENAI_API_KEY").filter(|v| !v.trim().is_empty());
        if let Some(model) = lookup("OPENAI_MODEL") {
            config.generator.model = model;
        }
        if let Some(url) = lookup("OPENAI_BASE_URL") {
            config.generator.base_url = url;
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "FINQUERY_GENERATION_TIMEOUT_MS")? {
            config.generator.timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = parse::<u64, _>(&lookup, "FINQUERY_STATEMENT_TIMEOUT_MS")? {
            config.executor.statement_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "FINQUERY_IDLE_TX_TIMEOUT_MS")? {
            config.executor.idle_transaction_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parse::<u32, _>(&lookup, "FINQUERY_EXEC_MAX_ATTEMPTS")? {
            config.executor.max_attempts = n.max(1);
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "FINQUERY_BACKOFF_BASE_MS")? {
            config.executor.backoff_base = Duration::from_millis(ms);
        }

        if let Some(n) = parse::<usize, _>(&lookup, "FINQUERY_CACHE_CAPACITY")? {
            config.cache.capacity = n.max(1);
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "FINQUERY_CACHE_TTL_SECS")? {
            config.cache.ttl = Duration::from_secs(secs);
        }

        if let Some(secs) = parse::<u64, _>(&lookup, "FINQUERY_CATALOG_TTL_SECS")? {
            config.catalog.ttl = Duration::from_secs(secs);
        }
        if let Some(tables) = lookup("FINQUERY_TENANT_TABLES") {
            config.catalog.tenant_tables = split_list(&tables).into_iter().collect();
        }

        if let Some(column) = lookup("FINQUERY_TENANT_COLUMN") {
            if !is_identifier(&column) {
                return Err(ConfigError::InvalidValue {
                    key: "FINQUERY_TENANT_COLUMN".to_string(),
                    value: column,
                });
            }
            config.compiler.tenant_column = column;
        }
        if let Some(n) = parse::<u32, _>(&lookup, "FINQUERY_DEFAULT_ROW_LIMIT")? {
            config.compiler.default_row_limit = n.max(1);
        }
        if let Some(n) = parse::<u32, _>(&lookup, "FINQUERY_MAX_ROW_LIMIT")? {
            config.compiler.max_row_limit = n.max(1);
        }
        config.compiler.default_row_limit = config
            .compiler
            .default_row_limit
            .min(config.compiler.max_row_limit);

        Ok(config)
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database
            .url
            .as_deref()
            .ok_or_else(|| ConfigError::Missing("DATABASE_URL".to_string()))
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

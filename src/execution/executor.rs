//! Executor
//!
//! Runs compiled statements against a `StorageEngine` inside a read-only,
//! time-bounded transaction. Transient infrastructure faults are retried
//! with exponential backoff; everything else surfaces immediately.

use crate::compiler::{verify_placeholders, CompiledQuery, TenantScope};
use crate::config::ExecutorConfig;
use crate::error::ExecutionFault;
use crate::execution::error_classifier::{FaultClass, FaultClassifier, StorageError};
use crate::execution::result::{ExecutionResult, Row};
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Session limits applied to every statement transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatementLimits {
    pub statement_timeout: Duration,
    pub idle_transaction_timeout: Duration,
}

/// Rows fetched by a storage engine, already normalized to JSON values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedRows {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

/// A backing store that can run one parameterized read statement.
///
/// Implementations must run the statement in a read-only transaction that
/// is never committed, honour `limits`, and discard (not reuse) a
/// connection that failed at the transport level.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    async fn fetch_read_only(
        &self,
        sql: &str,
        params: &[String],
        limits: &StatementLimits,
    ) -> Result<FetchedRows, StorageError>;
}

/// Slack on top of the statement and pool checkout timeouts before the executor
/// gives up waiting on its own.
const DEADLINE_GRACE: Duration = Duration::from_secs(2);

pub struct Executor {
    storage: Arc<dyn StorageEngine>,
    config: ExecutorConfig,
    classifier: FaultClassifier,
}

impl Executor {
    pub fn new(storage: Arc<dyn StorageEngine>, config: ExecutorConfig) -> Self {
        Self {
            storage,
            config,
            classifier: FaultClassifier::new(),
        }
    }

    fn limits(&self) -> StatementLimits {
        StatementLimits {
            statement_timeout: self.config.statement_timeout,
            idle_transaction_timeout: self.config.idle_transaction_timeout,
        }
    }

    /// Execute a compiled statement for `tenant_id`.
    pub async fn run(&self, query: &CompiledQuery, tenant_id: &str) -> Result<ExecutionResult, ExecutionFault> {
        self.check_before_execution(query, tenant_id)?;

        let started = Instant::now();
        let limits = self.limits();
        let max_attempts = self.config.max_attempts.max(1);
        let deadline = limits.statement_timeout + self.config.acquire_timeout + DEADLINE_GRACE;
        let mut attempt = 1;

        loop {
            debug!("Executing (attempt {}/{}): {}", attempt, max_attempts, query.sql);
            let outcome = tokio::time::timeout(
                deadline,
                self.storage.fetch_read_only(&query.sql, &query.params, &limits),
            )
            .await;

            let err = match outcome {
                Ok(Ok(fetched)) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    info!("✅ Query returned {} rows in {}ms", fetched.rows.len(), duration_ms);
                    return Ok(ExecutionResult::success(fetched.columns, fetched.rows, duration_ms));
                }
                Ok(Err(err)) => err,
                Err(_) => {
                    warn!("Statement exceeded executor deadline of {:?}", deadline);
                    return Err(ExecutionFault::StatementTimeout(format!(
                        "no response within {}ms",
                        deadline.as_millis()
                    )));
                }
            };

            let class = self.classifier.classify(&err);
            if class.is_retryable() && attempt < max_attempts {
                let delay = self.backoff(attempt);
                warn!(
                    "🔄 Transient storage fault (attempt {}/{}), retrying in {:?}: {}",
                    attempt, max_attempts, delay, err
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            return Err(match class {
                FaultClass::Transient => {
                    error!("Storage still failing after {} attempts: {}", attempt, err);
                    ExecutionFault::TransientInfra {
                        attempts: attempt,
                        message: err.to_string(),
                    }
                }
                FaultClass::Timeout => ExecutionFault::StatementTimeout(err.to_string()),
                FaultClass::PermissionDenied => ExecutionFault::PermissionDenied(err.to_string()),
                FaultClass::PoolExhausted => ExecutionFault::PoolExhausted(err.to_string()),
                FaultClass::InvalidStatement => ExecutionFault::InvalidStatement(err.to_string()),
                FaultClass::Other => ExecutionFault::Other(err.to_string()),
            });
        }
    }

    /// Last line of defence: the statement must still be parameterized the
    /// way the compiler left it.
    fn check_before_execution(&self, query: &CompiledQuery, tenant_id: &str) -> Result<(), ExecutionFault> {
        if verify_placeholders(&query.sql, query.params.len()).is_err() {
            error!("Refusing to execute statement with unbound placeholders: {}", query.sql);
            return Err(ExecutionFault::SafetyViolation(
                "placeholder count does not match parameters".to_string(),
            ));
        }
        if query.scope == TenantScope::Bound && !query.params.iter().any(|p| p == tenant_id) {
            error!("Refusing to execute statement not bound to the requesting tenant");
            return Err(ExecutionFault::SafetyViolation(
                "statement is not bound to the requesting tenant".to_string(),
            ));
        }
        Ok(())
    }

    /// Exponential backoff with jitter: base * 2^(attempt-1), capped.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base;
        let exp = base.saturating_mul(1u32 << (attempt - 1).min(16));
        let capped = exp.min(self.config.backoff_max);
        let jitter_ms = (base.as_millis() as u64 / 2).max(1);
        capped + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct ScriptedStorage {
        responses: Mutex<Vec<Result<FetchedRows, StorageError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedStorage {
        fn new(mut responses: Vec<Result<FetchedRows, StorageError>>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl StorageEngine for ScriptedStorage {
        async fn fetch_read_only(
            &self,
            _sql: &str,
            _params: &[String],
            _limits: &StatementLimits,
        ) -> Result<FetchedRows, StorageError> {
            *self.calls.lock().unwrap() += 1;
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(FetchedRows::default()))
        }
    }

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
            ..ExecutorConfig::default()
        }
    }

    fn bound_query() -> CompiledQuery {
        CompiledQuery {
            sql: "SELECT name FROM accounts WHERE tenant_id = $1 LIMIT 100".to_string(),
            params: vec!["u1".to_string()],
            row_limit: 100,
            scope: TenantScope::Bound,
            tables: vec!["accounts".to_string()],
        }
    }

    fn one_row() -> FetchedRows {
        FetchedRows {
            columns: vec!["name".to_string()],
            rows: vec![[("name".to_string(), json!("Checking"))].into_iter().collect()],
        }
    }

    #[tokio::test]
    async fn test_transient_fault_is_retried() {
        let storage = Arc::new(ScriptedStorage::new(vec![
            Err(StorageError::connection("connection reset by peer")),
            Ok(one_row()),
        ]));
        let executor = Executor::new(storage.clone(), fast_config());
        let result = executor.run(&bound_query(), "u1").await.unwrap();
        assert_eq!(result.row_count, 1);
        assert_eq!(storage.calls(), 2);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let storage = Arc::new(ScriptedStorage::new(vec![
            Err(StorageError::database(Some("57P01"), "terminating connection")),
            Err(StorageError::database(Some("57P01"), "terminating connection")),
            Err(StorageError::database(Some("57P01"), "terminating connection")),
            Ok(one_row()),
        ]));
        let executor = Executor::new(storage.clone(), fast_config());
        let err = executor.run(&bound_query(), "u1").await.unwrap_err();
        assert!(matches!(err, ExecutionFault::TransientInfra { attempts: 3, .. }));
        assert_eq!(storage.calls(), 3);
    }

    #[tokio::test]
    async fn test_non_transient_faults_are_not_retried() {
        let storage = Arc::new(ScriptedStorage::new(vec![Err(StorageError::database(
            Some("42703"),
            "column \"balance\" does not exist",
        ))]));
        let executor = Executor::new(storage.clone(), fast_config());
        let err = executor.run(&bound_query(), "u1").await.unwrap_err();
        assert!(matches!(err, ExecutionFault::InvalidStatement(_)));
        assert_eq!(storage.calls(), 1);
    }

    #[tokio::test]
    async fn test_statement_bound_to_other_tenant_is_refused() {
        let storage = Arc::new(ScriptedStorage::new(vec![Ok(one_row())]));
        let executor = Executor::new(storage.clone(), fast_config());
        let err = executor.run(&bound_query(), "u2").await.unwrap_err();
        assert!(matches!(err, ExecutionFault::SafetyViolation(_)));
        assert_eq!(storage.calls(), 0);
    }

    #[tokio::test]
    async fn test_unbound_placeholder_is_refused() {
        let storage = Arc::new(ScriptedStorage::new(vec![]));
        let executor = Executor::new(storage.clone(), fast_config());
        let mut query = bound_query();
        query.params.clear();
        query.scope = TenantScope::Global;
        let err = executor.run(&query, "u1").await.unwrap_err();
        assert!(matches!(err, ExecutionFault::SafetyViolation(_)));
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let executor = Executor::new(
            Arc::new(ScriptedStorage::new(vec![])),
            ExecutorConfig {
                backoff_base: Duration::from_millis(100),
                backoff_max: Duration::from_millis(250),
                ..ExecutorConfig::default()
            },
        );
        let first = executor.backoff(1);
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(150));
        let third = executor.backoff(3);
        assert!(third >= Duration::from_millis(250) && third < Duration::from_millis(300));
    }
}

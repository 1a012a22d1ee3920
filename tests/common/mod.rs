//! Shared fakes for the integration tests: a scripted generator, an
//! in-memory storage engine and a scripted validator, all wired around the
//! built-in minimal schema.

#![allow(dead_code)]

use async_trait::async_trait;
use finquery::config::{CatalogConfig, ExecutorConfig, PipelineConfig};
use finquery::execution::{FetchedRows, Row, StatementLimits, StorageError};
use finquery::schema::fallback::minimal_schema;
use finquery::schema::{CatalogSnapshot, SchemaCatalog, SnapshotOrigin, StaticCatalogSource};
use finquery::validation::{ResultValidator, TenantContext, ValidationVerdict};
use finquery::{
    ExecutionResult, Executor, GenerationFault, GenerationRequest, RegenerationController, RoutingPolicy,
    SqlGenerator, StorageEngine,
};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TENANT: &str = "u1";

pub fn catalog() -> Arc<SchemaCatalog> {
    let raw = minimal_schema("tenant_id");
    let config = CatalogConfig::default();
    let snapshot = CatalogSnapshot::build(raw.clone(), &config, "tenant_id", SnapshotOrigin::Live)
        .expect("minimal schema builds");
    Arc::new(SchemaCatalog::with_snapshot(
        Arc::new(StaticCatalogSource::new(raw)),
        config,
        "tenant_id",
        snapshot,
    ))
}

/// Defaults with millisecond-scale timeouts so failure paths finish fast.
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.generator.timeout = Duration::from_millis(200);
    config.executor = ExecutorConfig {
        statement_timeout: Duration::from_millis(500),
        idle_transaction_timeout: Duration::from_millis(500),
        acquire_timeout: Duration::from_millis(100),
        max_attempts: 3,
        backoff_base: Duration::from_millis(2),
        backoff_max: Duration::from_millis(10),
    };
    config
}

pub fn fenced(sql: &str) -> String {
    format!("Here is the query:\n```sql\n{}\n```", sql)
}

pub fn row(pairs: &[(&str, Value)]) -> Row {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

pub fn rows(columns: &[&str], rows: Vec<Row>) -> FetchedRows {
    FetchedRows {
        columns: columns.iter().map(|c| c.to_string()).collect(),
        rows,
    }
}

/// Replays canned drafts in order; repeats the last one when exhausted.
pub struct ScriptedGenerator {
    drafts: Mutex<VecDeque<Result<String, GenerationFault>>>,
    last: Mutex<Option<Result<String, GenerationFault>>>,
    requests: Mutex<Vec<GenerationRequest>>,
    delay: Option<Duration>,
}

impl ScriptedGenerator {
    pub fn new(drafts: Vec<Result<String, GenerationFault>>) -> Self {
        Self {
            drafts: Mutex::new(drafts.into_iter().collect()),
            last: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn sql(drafts: &[&str]) -> Self {
        Self::new(drafts.iter().map(|d| Ok(fenced(d))).collect())
    }

    pub fn slow(delay: Duration, draft: &str) -> Self {
        Self {
            delay: Some(delay),
            ..Self::sql(&[draft])
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SqlGenerator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationFault> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.drafts.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        match next {
            Some(draft) => {
                *last = Some(draft.clone());
                draft
            }
            None => last.clone().unwrap_or(Err(GenerationFault::EmptyResponse)),
        }
    }
}

/// In-memory storage: scripted responses first, then a default result.
pub struct MemoryStorage {
    scripted: Mutex<VecDeque<Result<FetchedRows, StorageError>>>,
    default: FetchedRows,
    executed: Mutex<Vec<(String, Vec<String>)>>,
}

impl MemoryStorage {
    pub fn returning(default: FetchedRows) -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            default,
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn then(self, response: Result<FetchedRows, StorageError>) -> Self {
        self.scripted.lock().unwrap().push_back(response);
        self
    }

    pub fn executed(&self) -> Vec<(String, Vec<String>)> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl StorageEngine for MemoryStorage {
    async fn fetch_read_only(
        &self,
        sql: &str,
        params: &[String],
        _limits: &StatementLimits,
    ) -> Result<FetchedRows, StorageError> {
        self.executed
            .lock()
            .unwrap()
            .push((sql.to_string(), params.to_vec()));
        match self.scripted.lock().unwrap().pop_front() {
            Some(response) => response,
            None => Ok(self.default.clone()),
        }
    }
}

/// Returns canned verdicts in order, then `valid`.
pub struct ScriptedValidator {
    verdicts: Mutex<VecDeque<ValidationVerdict>>,
    seen: Mutex<Vec<ExecutionResult>>,
}

impl ScriptedValidator {
    pub fn new(verdicts: Vec<ValidationVerdict>) -> Self {
        Self {
            verdicts: Mutex::new(verdicts.into_iter().collect()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn accepting() -> Self {
        Self::new(Vec::new())
    }

    pub fn seen(&self) -> Vec<ExecutionResult> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultValidator for ScriptedValidator {
    async fn validate(
        &self,
        _question: &str,
        result: &ExecutionResult,
        _tenant: &TenantContext,
        _policy: &RoutingPolicy,
    ) -> ValidationVerdict {
        self.seen.lock().unwrap().push(result.clone());
        self.verdicts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(ValidationVerdict::valid)
    }
}

/// A controller plus handles on its fakes.
pub struct Harness {
    pub controller: RegenerationController,
    pub generator: Arc<ScriptedGenerator>,
    pub storage: Arc<MemoryStorage>,
    pub validator: Arc<ScriptedValidator>,
}

pub fn harness(generator: ScriptedGenerator, storage: MemoryStorage, validator: ScriptedValidator) -> Harness {
    harness_with(test_config(), generator, storage, validator)
}

pub fn harness_with(
    config: PipelineConfig,
    generator: ScriptedGenerator,
    storage: MemoryStorage,
    validator: ScriptedValidator,
) -> Harness {
    let generator = Arc::new(generator);
    let storage = Arc::new(storage);
    let validator = Arc::new(validator);
    let executor = Arc::new(Executor::new(storage.clone(), config.executor.clone()));
    let controller = RegenerationController::new(
        &config,
        catalog(),
        generator.clone(),
        executor,
        validator.clone(),
    );
    Harness {
        controller,
        generator,
        storage,
        validator,
    }
}

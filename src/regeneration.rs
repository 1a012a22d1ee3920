//! Regeneration Controller
//!
//! Drives one question through generate -> compile -> execute -> validate,
//! with at most one regeneration when a fault or the validator says a fresh
//! draft could help.
//!
//! States: `Draft(1) -> Compiled -> Executed -> Validated -> Accepted`, or a
//! fault branch back to `Draft(2)`, and finally `Accepted` or `Failed`.

use crate::cache::{CacheKey, ResultCache};
use crate::compiler::{Attempt, CompiledQuery, DraftQuery, SafetyCompiler};
use crate::config::{GeneratorConfig, PipelineConfig};
use crate::entity::{CandidateSource, EntityResolver};
use crate::error::{CompileFault, ExecutionFault, GenerationFault};
use crate::execution::{ExecutionResult, Executor};
use crate::llm::{GenerationRequest, SqlGenerator};
use crate::policy::RoutingPolicy;
use crate::prompt::{keywords_from_question, PromptContext, PromptContextBuilder, ResolvedEntities};
use crate::query_log::{ExecutionLog, ExecutionRecord, RunOutcome};
use crate::schema::SchemaCatalog;
use crate::validation::{ResultValidator, TenantContext, ValidationVerdict, VerdictStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A question from one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionRequest {
    pub question: String,
    pub tenant_id: String,
    #[serde(default)]
    pub policy: RoutingPolicy,
}

impl QuestionRequest {
    pub fn new(question: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            tenant_id: tenant_id.into(),
            policy: RoutingPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RoutingPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// One step of a run, recorded in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum PipelineState {
    Draft(u8),
    CacheHit,
    Compiled,
    Executed,
    Validated(VerdictStatus),
    GenerationFault(String),
    CompileFault(String),
    ExecFault(String),
    Accepted,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Draft(n) => write!(f, "Draft({})", n),
            PipelineState::CacheHit => write!(f, "CacheHit"),
            PipelineState::Compiled => write!(f, "Compiled"),
            PipelineState::Executed => write!(f, "Executed"),
            PipelineState::Validated(status) => write!(f, "Validated({:?})", status),
            PipelineState::GenerationFault(kind) => write!(f, "GenerationFault({})", kind),
            PipelineState::CompileFault(kind) => write!(f, "CompileFault({})", kind),
            PipelineState::ExecFault(kind) => write!(f, "ExecFault({})", kind),
            PipelineState::Accepted => write!(f, "Accepted"),
            PipelineState::Failed => write!(f, "Failed"),
        }
    }
}

/// Why a question could not be answered safely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum UnanswerableReason {
    /// Every draft was refused by the safety compiler.
    UnsafeStatement(String),
    /// The generator could not be reached or returned nothing.
    GenerationUnavailable(String),
    /// The database refused or failed the statement.
    ExecutionFailed(String),
    /// The rows were judged not to answer the question.
    ValidationRejected(String),
    /// A safety invariant inside the pipeline broke.
    InternalInvariant(String),
}

impl fmt::Display for UnanswerableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnanswerableReason::UnsafeStatement(d) => write!(f, "unsafe statement: {}", d),
            UnanswerableReason::GenerationUnavailable(d) => write!(f, "generation unavailable: {}", d),
            UnanswerableReason::ExecutionFailed(d) => write!(f, "execution failed: {}", d),
            UnanswerableReason::ValidationRejected(d) => write!(f, "validation rejected: {}", d),
            UnanswerableReason::InternalInvariant(d) => write!(f, "internal invariant: {}", d),
        }
    }
}

/// Final outcome of a question.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Answer {
    Answered {
        result: ExecutionResult,
        /// `None` when the rows came from the cache.
        sql: Option<String>,
        verdict: ValidationVerdict,
        attempts: u8,
        trace: Vec<PipelineState>,
    },
    /// The statement ran safely and matched nothing.
    NoMatchingData {
        columns: Vec<String>,
        sql: Option<String>,
        attempts: u8,
        trace: Vec<PipelineState>,
    },
    Unanswerable {
        reason: UnanswerableReason,
        attempts: u8,
        trace: Vec<PipelineState>,
    },
}

impl Answer {
    pub fn attempts(&self) -> u8 {
        match self {
            Answer::Answered { attempts, .. }
            | Answer::NoMatchingData { attempts, .. }
            | Answer::Unanswerable { attempts, .. } => *attempts,
        }
    }

    pub fn trace(&self) -> &[PipelineState] {
        match self {
            Answer::Answered { trace, .. }
            | Answer::NoMatchingData { trace, .. }
            | Answer::Unanswerable { trace, .. } => trace,
        }
    }

    pub fn is_answered(&self) -> bool {
        matches!(self, Answer::Answered { .. })
    }

    fn outcome(&self) -> RunOutcome {
        match self {
            Answer::Answered { .. } => RunOutcome::Answered,
            Answer::NoMatchingData { .. } => RunOutcome::NoMatchingData,
            Answer::Unanswerable { .. } => RunOutcome::Unanswerable,
        }
    }
}

/// Why an attempt stopped short, and how a next draft could fix it.
struct StepFailure {
    reason: UnanswerableReason,
    amendment: Option<String>,
}

/// Rows produced by one attempt.
struct StepOutput {
    result: ExecutionResult,
    sql: Option<String>,
}

#[derive(Debug, Clone)]
struct GenerationSettings {
    timeout: Duration,
    temperature: f32,
    max_output_tokens: u32,
}

impl From<&GeneratorConfig> for GenerationSettings {
    fn from(config: &GeneratorConfig) -> Self {
        Self {
            timeout: config.timeout,
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
        }
    }
}

pub struct RegenerationController {
    catalog: Arc<SchemaCatalog>,
    prompt_builder: PromptContextBuilder,
    generator: Arc<dyn SqlGenerator>,
    compiler: SafetyCompiler,
    executor: Arc<Executor>,
    validator: Arc<dyn ResultValidator>,
    cache: Arc<ResultCache>,
    log: Arc<ExecutionLog>,
    entities: Option<(Arc<dyn EntityResolver>, Arc<dyn CandidateSource>)>,
    generation: GenerationSettings,
}

impl RegenerationController {
    pub fn new(
        config: &PipelineConfig,
        catalog: Arc<SchemaCatalog>,
        generator: Arc<dyn SqlGenerator>,
        executor: Arc<Executor>,
        validator: Arc<dyn ResultValidator>,
    ) -> Self {
        Self {
            prompt_builder: PromptContextBuilder::new(6000, 10, &config.compiler.tenant_column),
            compiler: SafetyCompiler::new(Arc::clone(&catalog), config.compiler.clone()),
            catalog,
            generator,
            executor,
            validator,
            cache: Arc::new(ResultCache::new(config.cache.clone())),
            log: Arc::new(ExecutionLog::default()),
            entities: None,
            generation: GenerationSettings::from(&config.generator),
        }
    }

    pub fn with_cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_log(mut self, log: Arc<ExecutionLog>) -> Self {
        self.log = log;
        self
    }

    pub fn with_entity_resolution(
        mut self,
        resolver: Arc<dyn EntityResolver>,
        source: Arc<dyn CandidateSource>,
    ) -> Self {
        self.entities = Some((resolver, source));
        self
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn log(&self) -> &Arc<ExecutionLog> {
        &self.log
    }

    /// Build the attempt-1 prompt for a request.
    pub async fn prepare_context(&self, request: &QuestionRequest) -> PromptContext {
        self.catalog.refresh_if_stale().await;

        let mut keywords = keywords_from_question(&request.question);
        keywords.extend(request.policy.data_sources.iter().cloned());
        let schema_text = self.catalog.subset_for(&keywords);
        let entities = self.resolve_entities(request).await;

        self.prompt_builder.build(
            &request.question,
            &request.tenant_id,
            &entities,
            &request.policy,
            &schema_text,
        )
    }

    /// Answer one question.
    pub async fn answer(&self, request: &QuestionRequest) -> Answer {
        let started = Instant::now();
        let mut trace = Vec::new();

        if request.tenant_id.trim().is_empty() {
            trace.push(PipelineState::Failed);
            let answer = Answer::Unanswerable {
                reason: UnanswerableReason::UnsafeStatement("no tenant id supplied".to_string()),
                attempts: 0,
                trace,
            };
            return self.finish(request, answer, None, false, started);
        }

        info!("🔍 Answering question for tenant {}: {}", request.tenant_id, request.question);
        let context = self.prepare_context(request).await;
        let cache_key = CacheKey::new(&request.question, &request.tenant_id, &context.fingerprint);
        let tenant = TenantContext {
            tenant_id: request.tenant_id.clone(),
            row_limit: self.compiler_row_limit(),
        };

        let mut attempt = Attempt::first();
        let mut prompt = context.clone();
        let mut last_sql: Option<String> = None;
        let mut cache_hit = false;

        loop {
            trace.push(PipelineState::Draft(attempt.number()));

            let cached = if attempt.is_first() {
                self.cache.get(&cache_key)
            } else {
                None
            };
            let step = match cached {
                Some(result) => {
                    trace.push(PipelineState::CacheHit);
                    cache_hit = true;
                    Ok(StepOutput { result, sql: None })
                }
                None => self.attempt(&prompt, request, attempt, &cache_key, &mut trace).await,
            };

            let failure = match step {
                Ok(output) => {
                    if output.sql.is_some() {
                        last_sql = output.sql.clone();
                    }
                    let verdict = self
                        .validator
                        .validate(&request.question, &output.result, &tenant, &request.policy)
                        .await;
                    trace.push(PipelineState::Validated(verdict.status));

                    if let (Some(hint), Some(next)) = (verdict.hint(), attempt.next()) {
                        info!("🔄 Validator asked for a regeneration: {}", hint);
                        prompt = context.amended(hint);
                        attempt = next;
                        continue;
                    }

                    if verdict.status.is_acceptable() {
                        trace.push(PipelineState::Accepted);
                        let answer = if output.result.is_empty() {
                            Answer::NoMatchingData {
                                columns: output.result.columns,
                                sql: output.sql,
                                attempts: attempt.number(),
                                trace,
                            }
                        } else {
                            Answer::Answered {
                                result: output.result,
                                sql: output.sql,
                                verdict,
                                attempts: attempt.number(),
                                trace,
                            }
                        };
                        return self.finish(request, answer, last_sql, cache_hit, started);
                    }

                    let issues: Vec<String> = verdict.issues.iter().map(|i| i.description.clone()).collect();
                    StepFailure {
                        reason: UnanswerableReason::ValidationRejected(issues.join("; ")),
                        amendment: None,
                    }
                }
                Err(failure) => failure,
            };

            match (failure.amendment, attempt.next()) {
                (Some(amendment), Some(next)) => {
                    info!("🔄 Regenerating (attempt {}): {}", next, amendment);
                    prompt = context.amended(&amendment);
                    attempt = next;
                }
                _ => {
                    trace.push(PipelineState::Failed);
                    warn!("Could not answer safely after {} attempt(s): {}", attempt.number(), failure.reason);
                    let answer = Answer::Unanswerable {
                        reason: failure.reason,
                        attempts: attempt.number(),
                        trace,
                    };
                    return self.finish(request, answer, last_sql, cache_hit, started);
                }
            }
        }
    }

    /// Generate, compile and execute one draft.
    async fn attempt(
        &self,
        prompt: &PromptContext,
        request: &QuestionRequest,
        attempt: Attempt,
        cache_key: &CacheKey,
        trace: &mut Vec<PipelineState>,
    ) -> Result<StepOutput, StepFailure> {
        let text = match self.generate(prompt).await {
            Ok(text) => text,
            Err(fault) => {
                warn!("Generation failed on attempt {}: {}", attempt, fault);
                trace.push(PipelineState::GenerationFault(fault.to_string()));
                return Err(StepFailure {
                    amendment: Some(
                        "Return only one SQL SELECT statement in a ```sql code block.".to_string(),
                    ),
                    reason: UnanswerableReason::GenerationUnavailable(fault.to_string()),
                });
            }
        };

        let draft = DraftQuery::new(text, &request.question, &request.tenant_id, attempt);
        let compiled = match self.compiler.compile(&draft) {
            Ok(compiled) => compiled,
            Err(fault) => {
                trace.push(PipelineState::CompileFault(fault.kind().to_string()));
                return Err(self.compile_failure(fault, &request.tenant_id));
            }
        };
        trace.push(PipelineState::Compiled);

        let mut result = match self.executor.run(&compiled, &request.tenant_id).await {
            Ok(result) => result,
            Err(fault) => {
                trace.push(PipelineState::ExecFault(fault.kind().to_string()));
                return Err(execution_failure(fault));
            }
        };
        trace.push(PipelineState::Executed);

        let redacted = result.redact_columns(&self.sensitive_columns(&compiled, &result));
        if redacted > 0 {
            debug!("Redacted {} sensitive values", redacted);
        }
        self.cache.put(cache_key.clone(), result.clone());

        Ok(StepOutput {
            result,
            sql: Some(compiled.sql),
        })
    }

    /// Call the generator in its own task so dropping this future does not
    /// abort a request that is already in flight.
    async fn generate(&self, prompt: &PromptContext) -> Result<String, GenerationFault> {
        let generator = Arc::clone(&self.generator);
        let request = GenerationRequest {
            system_context: prompt.system.clone(),
            user_prompt: prompt.user.clone(),
            temperature: self.generation.temperature,
            max_output_tokens: self.generation.max_output_tokens,
        };
        let handle = tokio::spawn(async move { generator.generate(&request).await });

        match tokio::time::timeout(self.generation.timeout, handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_error)) => Err(GenerationFault::Transport(format!(
                "generation task failed: {}",
                join_error
            ))),
            Err(_) => Err(GenerationFault::Timeout(self.generation.timeout.as_millis() as u64)),
        }
    }

    fn compile_failure(&self, fault: CompileFault, tenant_id: &str) -> StepFailure {
        if !fault.is_regenerable() {
            error!("Compiler invariant violated, not regenerating: {}", fault);
            return StepFailure {
                reason: UnanswerableReason::InternalInvariant(fault.to_string()),
                amendment: None,
            };
        }

        let column = self.catalog.tenant_column();
        let fix = match &fault {
            CompileFault::MissingTenantScope(_) => format!(
                "Filter every tenant-scoped table, including each joined table, CTE and subquery, with {} = '{}'.",
                column,
                tenant_id.replace('\'', "''")
            ),
            CompileFault::UnsafeTenantPredicate(_) => format!(
                "Compare {} only with = '{}'; no other operator or value.",
                column,
                tenant_id.replace('\'', "''")
            ),
            CompileFault::MultipleStatements(_) => "Return exactly one statement with no trailing statements.".to_string(),
            CompileFault::UnsupportedVerb(_) => "Only read data with SELECT; never modify data or schema.".to_string(),
            CompileFault::StrayPlaceholder(_) => "Write literal values; do not use $ placeholders or dollar quoting.".to_string(),
            CompileFault::EmptyDraft => "Return the SQL statement in a ```sql code block.".to_string(),
            CompileFault::ParameterMismatch { .. } => String::new(),
        };
        StepFailure {
            amendment: Some(format!("The statement was rejected ({}). {}", fault, fix)),
            reason: UnanswerableReason::UnsafeStatement(fault.to_string()),
        }
    }

    fn sensitive_columns(&self, compiled: &CompiledQuery, result: &ExecutionResult) -> BTreeSet<String> {
        let snapshot = self.catalog.snapshot();
        let mut sensitive: BTreeSet<String> = compiled
            .tables
            .iter()
            .flat_map(|t| snapshot.sensitive_columns_in(t))
            .map(|c| c.to_lowercase())
            .collect();
        sensitive.extend(
            result
                .columns
                .iter()
                .filter(|c| snapshot.is_sensitive_column(c))
                .map(|c| c.to_lowercase()),
        );
        sensitive
    }

    fn compiler_row_limit(&self) -> u32 {
        self.compiler.default_row_limit()
    }

    async fn resolve_entities(&self, request: &QuestionRequest) -> ResolvedEntities {
        let Some((resolver, source)) = &self.entities else {
            return ResolvedEntities::new();
        };
        match source.candidate_sets(&request.tenant_id).await {
            Ok(candidates) => resolver.resolve(&request.question, &candidates).await,
            Err(e) => {
                warn!("Entity candidates unavailable, continuing without: {}", e);
                ResolvedEntities::new()
            }
        }
    }

    fn finish(
        &self,
        request: &QuestionRequest,
        answer: Answer,
        sql: Option<String>,
        cache_hit: bool,
        started: Instant,
    ) -> Answer {
        let (row_count, fault) = match &answer {
            Answer::Answered { result, .. } => (result.row_count, None),
            Answer::NoMatchingData { .. } => (0, None),
            Answer::Unanswerable { reason, .. } => (0, Some(reason.to_string())),
        };
        let trace: Vec<String> = answer.trace().iter().map(|s| s.to_string()).collect();
        debug!("Trace: {}", trace.join(" -> "));

        self.log.record(ExecutionRecord {
            id: Uuid::new_v4(),
            tenant_id: request.tenant_id.clone(),
            question: request.question.clone(),
            sql,
            attempts: answer.attempts(),
            cache_hit,
            row_count,
            duration_ms: started.elapsed().as_millis() as u64,
            outcome: answer.outcome(),
            fault,
            recorded_at: Utc::now(),
        });
        answer
    }
}

fn execution_failure(fault: ExecutionFault) -> StepFailure {
    let amendment = match &fault {
        ExecutionFault::InvalidStatement(msg) => Some(format!(
            "The database rejected the statement: {}. Use only tables and columns from the schema.",
            msg
        )),
        _ => None,
    };
    let reason = match &fault {
        ExecutionFault::SafetyViolation(msg) => UnanswerableReason::InternalInvariant(msg.clone()),
        other => UnanswerableReason::ExecutionFailed(other.to_string()),
    };
    StepFailure { reason, amendment }
}

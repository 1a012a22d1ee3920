//! finquery: natural-language questions over personal financial data,
//! answered through a tenant-safe SQL pipeline.
//!
//! PromptContextBuilder -> generator -> SafetyCompiler -> Executor ->
//! ResultCache -> validator, driven by the RegenerationController.

pub mod cache;
pub mod compiler;
pub mod config;
pub mod db;
pub mod entity;
pub mod error;
pub mod execution;
pub mod llm;
pub mod policy;
pub mod prompt;
pub mod query_log;
pub mod regeneration;
pub mod schema;
pub mod validation;

pub use cache::{CacheKey, CacheStats, ResultCache};
pub use compiler::{Attempt, CompiledQuery, DraftQuery, SafetyCompiler, TenantScope, MAX_ATTEMPTS};
pub use config::PipelineConfig;
pub use error::{CatalogLoadError, CompileFault, ConfigError, ExecutionFault, GenerationFault, PipelineError, Result};
pub use execution::{ExecutionResult, Executor, StorageEngine};
pub use llm::{GenerationRequest, LlmClient, SqlGenerator};
pub use policy::{QueryIntent, RoutingPolicy, TimeWindow};
pub use prompt::{PromptContext, PromptContextBuilder};
pub use query_log::ExecutionLog;
pub use regeneration::{Answer, PipelineState, QuestionRequest, RegenerationController, UnanswerableReason};
pub use schema::{CatalogSnapshot, SchemaCatalog};
pub use validation::{ResultValidator, ValidationVerdict, VerdictStatus};

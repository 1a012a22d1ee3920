use thiserror::Error;

/// Faults raised while talking to the external SQL generator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationFault {
    #[error("Generation timed out after {0}ms")]
    Timeout(u64),

    #[error("Generation transport error: {0}")]
    Transport(String),

    #[error("Generator returned an empty response")]
    EmptyResponse,
}

/// Reasons the safety compiler refuses a draft.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileFault {
    #[error("Draft is empty")]
    EmptyDraft,

    #[error("Unsupported verb: {0}")]
    UnsupportedVerb(String),

    #[error("Multiple statements submitted: {0}")]
    MultipleStatements(String),

    #[error("Missing tenant scope: {0}")]
    MissingTenantScope(String),

    #[error("Unsafe tenant predicate: {0}")]
    UnsafeTenantPredicate(String),

    #[error("Stray placeholder in draft: {0}")]
    StrayPlaceholder(String),

    #[error("Placeholder/parameter mismatch: {placeholders} placeholders, {parameters} parameters")]
    ParameterMismatch { placeholders: usize, parameters: usize },
}

impl CompileFault {
    /// Whether a fresh draft could plausibly fix this fault.
    ///
    /// `ParameterMismatch` is a compiler bug, not a generator mistake.
    pub fn is_regenerable(&self) -> bool {
        !matches!(self, CompileFault::ParameterMismatch { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CompileFault::EmptyDraft => "EmptyDraft",
            CompileFault::UnsupportedVerb(_) => "UnsupportedVerb",
            CompileFault::MultipleStatements(_) => "MultipleStatements",
            CompileFault::MissingTenantScope(_) => "MissingTenantScope",
            CompileFault::UnsafeTenantPredicate(_) => "UnsafeTenantPredicate",
            CompileFault::StrayPlaceholder(_) => "StrayPlaceholder",
            CompileFault::ParameterMismatch { .. } => "ParameterMismatch",
        }
    }
}

/// Faults raised while executing a compiled statement.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionFault {
    #[error("Transient infrastructure failure after {attempts} attempts: {message}")]
    TransientInfra { attempts: u32, message: String },

    #[error("Statement timed out: {0}")]
    StatementTimeout(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Connection pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Invalid statement: {0}")]
    InvalidStatement(String),

    #[error("Safety violation: {0}")]
    SafetyViolation(String),

    #[error("Execution error: {0}")]
    Other(String),
}

impl ExecutionFault {
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionFault::TransientInfra { .. } => "TransientInfra",
            ExecutionFault::StatementTimeout(_) => "StatementTimeout",
            ExecutionFault::PermissionDenied(_) => "PermissionDenied",
            ExecutionFault::PoolExhausted(_) => "PoolExhausted",
            ExecutionFault::InvalidStatement(_) => "InvalidStatement",
            ExecutionFault::SafetyViolation(_) => "SafetyViolation",
            ExecutionFault::Other(_) => "Other",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogLoadError {
    #[error("Catalog source unavailable: {0}")]
    Source(String),

    #[error("Catalog is empty")]
    Empty,

    #[error("Tenant-filtered table '{0}' is not present in the catalog")]
    UnknownTenantTable(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    #[error("Missing required setting: {0}")]
    Missing(String),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Generation(#[from] GenerationFault),

    #[error(transparent)]
    Compile(#[from] CompileFault),

    #[error(transparent)]
    Execution(#[from] ExecutionFault),

    #[error(transparent)]
    Catalog(#[from] CatalogLoadError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

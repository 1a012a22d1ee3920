//! Safety Compiler
//!
//! The security boundary of the pipeline: turns generator draft text into a
//! parameterized, tenant-scoped, row-limited read statement, or refuses it
//! with a named fault. Nothing reaches the executor without passing here.

pub mod extract;
pub mod lexer;
pub mod rewrite;
pub mod scope;
pub mod shape;

use crate::config::CompilerConfig;
use crate::error::CompileFault;
use crate::schema::SchemaCatalog;
use regex::Regex;
use rewrite::TenantPatterns;
use scope::TenantCoverage;
use serde::{Deserialize, Serialize};
use shape::StatementShape;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Verbs that never appear in a statement we are willing to run.
pub const DISALLOWED_VERBS: &[&str] = &[
    "DROP", "DELETE", "INSERT", "UPDATE", "ALTER", "CREATE", "TRUNCATE", "GRANT", "REVOKE", "COPY",
    "MERGE", "INTO",
];

/// Maximum attempts per question: the original draft plus one regeneration.
pub const MAX_ATTEMPTS: u8 = 2;

lazy_static::lazy_static! {
    static ref DISALLOWED: Regex = Regex::new(&format!(
        r"(?i)\b({})\b",
        DISALLOWED_VERBS.join("|")
    ))
    .unwrap();
}

/// Attempt number of a draft, never above `MAX_ATTEMPTS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Attempt(u8);

impl Attempt {
    pub fn first() -> Self {
        Attempt(1)
    }

    pub fn next(self) -> Option<Self> {
        if self.0 < MAX_ATTEMPTS {
            Some(Attempt(self.0 + 1))
        } else {
            None
        }
    }

    pub fn number(self) -> u8 {
        self.0
    }

    pub fn is_first(self) -> bool {
        self.0 == 1
    }
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.0, MAX_ATTEMPTS)
    }
}

/// Unvalidated generator output plus where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftQuery {
    pub text: String,
    pub question: String,
    pub tenant_id: String,
    pub attempt: Attempt,
}

impl DraftQuery {
    pub fn new(text: impl Into<String>, question: impl Into<String>, tenant_id: impl Into<String>, attempt: Attempt) -> Self {
        Self {
            text: text.into(),
            question: question.into(),
            tenant_id: tenant_id.into(),
            attempt,
        }
    }
}

/// How a compiled statement is restricted to the caller's rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TenantScope {
    /// The tenant id is bound as a parameter at least once.
    Bound,
    /// Only reference tables (or no table at all) are read.
    Global,
}

/// A statement that passed every safety check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<String>,
    pub row_limit: u32,
    pub scope: TenantScope,
    pub tables: Vec<String>,
}

impl CompiledQuery {
    pub fn placeholder_count(&self) -> usize {
        lexer::placeholders(&self.sql).len()
    }
}

pub struct SafetyCompiler {
    catalog: Arc<SchemaCatalog>,
    config: CompilerConfig,
    tenant: TenantPatterns,
}

impl SafetyCompiler {
    pub fn new(catalog: Arc<SchemaCatalog>, config: CompilerConfig) -> Self {
        let tenant = TenantPatterns::new(&config.tenant_column);
        Self { catalog, config, tenant }
    }

    pub fn default_row_limit(&self) -> u32 {
        self.config.default_row_limit
    }

    /// Compile a draft for its tenant.
    pub fn compile(&self, draft: &DraftQuery) -> Result<CompiledQuery, CompileFault> {
        let tenant_id = draft.tenant_id.trim();
        if tenant_id.is_empty() {
            return Err(CompileFault::MissingTenantScope("no tenant id supplied".to_string()));
        }

        // 1. isolate exactly one read statement
        let statement = extract::extract_statement(&draft.text)?;

        // 2. disallowed verbs anywhere
        if let Some(m) = DISALLOWED.find(&statement) {
            return Err(CompileFault::UnsupportedVerb(m.as_str().to_uppercase()));
        }

        // 3. the binding layer owns every `$`
        if lexer::mask_literals(&statement).contains('$') {
            return Err(CompileFault::StrayPlaceholder(
                "draft contains '$' outside string literals".to_string(),
            ));
        }

        // 4. tenant literals become bound parameters
        let mut params = Vec::new();
        let (mut sql, replaced) = self.tenant.bind_literals(&statement, tenant_id, &mut params);
        for value in replaced.iter().filter(|v| v.as_str() != tenant_id) {
            warn!(
                "Draft scoped to tenant literal '{}' for tenant '{}'; rebound to caller",
                value, tenant_id
            );
        }
        if let Some(predicate) = self.tenant.find_unsafe_predicate(&sql) {
            return Err(CompileFault::UnsafeTenantPredicate(predicate));
        }

        // 5. every query block filters each tenant table it reads
        let shape = StatementShape::analyze(&sql);
        let snapshot = self.catalog.snapshot();
        let coverage =
            TenantCoverage::analyze(&sql, &self.tenant, &snapshot).map_err(CompileFault::MissingTenantScope)?;
        let scope = if coverage.is_complete() {
            if params.is_empty() {
                TenantScope::Global
            } else {
                TenantScope::Bound
            }
        } else if coverage.blocks == 1 && !shape.is_complex(self.config.max_simple_tables) {
            sql = rewrite::inject_scope(&sql, self.tenant.column(), params.len() + 1);
            params.push(tenant_id.to_string());
            sql = rewrite::renumber_placeholders(&sql);
            let rechecked =
                TenantCoverage::analyze(&sql, &self.tenant, &snapshot).map_err(CompileFault::MissingTenantScope)?;
            if !rechecked.is_complete() {
                return Err(self.missing_scope(&rechecked.uncovered));
            }
            TenantScope::Bound
        } else {
            return Err(self.missing_scope(&coverage.uncovered));
        };

        // 6. ordering and limit
        if shape.is_plain_projection() {
            if let Some(column) = shape
                .primary_table()
                .and_then(|t| snapshot.default_order_column(t))
                .filter(|c| shape.projects_column(c))
            {
                sql = rewrite::apply_default_order(&sql, column);
            }
        }
        let (sql, row_limit) =
            rewrite::apply_row_limit(&sql, self.config.default_row_limit, self.config.max_row_limit);

        // 7. placeholders must be exactly $1..$n for n parameters
        verify_placeholders(&sql, params.len())?;

        debug!("Compiled draft {} into: {}", draft.attempt, sql);
        Ok(CompiledQuery {
            sql,
            params,
            row_limit,
            scope,
            tables: shape.from_tables,
        })
    }

    fn missing_scope(&self, tables: &[String]) -> CompileFault {
        CompileFault::MissingTenantScope(format!(
            "no top-level {} filter for {}",
            self.tenant.column(),
            tables.join(", ")
        ))
    }
}

/// Placeholders must number `$1..$n` in order of appearance, each once.
pub fn verify_placeholders(sql: &str, parameters: usize) -> Result<(), CompileFault> {
    let found = lexer::placeholders(sql);
    let in_order = found.iter().enumerate().all(|(i, &n)| n as usize == i + 1);
    if found.len() != parameters || !in_order {
        error!(
            "Compiler invariant violated: {} placeholders for {} parameters in: {}",
            found.len(),
            parameters,
            sql
        );
        return Err(CompileFault::ParameterMismatch {
            placeholders: found.len(),
            parameters,
        });
    }
    Ok(())
}

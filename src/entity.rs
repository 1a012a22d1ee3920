//! Entity resolution
//!
//! Maps loose mentions in a question ("trader joes", "amex") to the exact
//! merchant, account and category strings stored for the tenant, so the
//! generator can use `=` instead of pattern matching.

use crate::compiler::{CompiledQuery, TenantScope};
use crate::error::ExecutionFault;
use crate::execution::Executor;
use crate::prompt::ResolvedEntities;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use strsim::jaro_winkler;
use tracing::{debug, warn};

/// Exact values known for a tenant, per category.
pub type CandidateSets = BTreeMap<String, Vec<String>>;

#[async_trait]
pub trait EntityResolver: Send + Sync {
    async fn resolve(&self, question: &str, candidates: &CandidateSets) -> ResolvedEntities;
}

/// Loads a tenant's candidate sets from storage.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn candidate_sets(&self, tenant_id: &str) -> Result<CandidateSets, ExecutionFault>;
}

/// Fuzzy resolver for entity names with spelling variations
pub struct FuzzyEntityResolver {
    /// Similarity threshold (0.0-1.0) for considering two strings as matches
    pub similarity_threshold: f64,
    /// Maximum matches kept per category
    pub max_matches: usize,
}

impl Default for FuzzyEntityResolver {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
            max_matches: 5,
        }
    }
}

impl FuzzyEntityResolver {
    pub fn new(threshold: f64) -> Self {
        Self {
            similarity_threshold: threshold,
            ..Self::default()
        }
    }

    /// Lowercase, drop punctuation and collapse whitespace.
    pub fn normalize_string(s: &str) -> String {
        s.to_lowercase()
            .chars()
            .filter(|c| c.is_alphanumeric() || c.is_whitespace())
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Best similarity of `candidate` against any word window of the question.
    pub fn similarity(&self, question: &str, candidate: &str) -> f64 {
        let candidate = Self::normalize_string(candidate);
        if candidate.is_empty() {
            return 0.0;
        }
        let words: Vec<&str> = question.split_whitespace().collect();
        let width = candidate.split_whitespace().count().max(1);

        let mut best: f64 = 0.0;
        for size in width.saturating_sub(1).max(1)..=width + 1 {
            for window in words.windows(size.min(words.len()).max(1)) {
                let phrase = window.join(" ");
                let score = jaro_winkler(&phrase, &candidate);
                // Squashed spellings ("traderjoes") should still match.
                let squashed = jaro_winkler(&phrase.replace(' ', ""), &candidate.replace(' ', ""));
                best = best.max(score).max(squashed);
            }
        }
        best
    }
}

#[async_trait]
impl EntityResolver for FuzzyEntityResolver {
    async fn resolve(&self, question: &str, candidates: &CandidateSets) -> ResolvedEntities {
        let normalized = Self::normalize_string(question);
        let mut resolved = ResolvedEntities::new();

        for (category, values) in candidates {
            let mut scored: Vec<(f64, &String)> = values
                .iter()
                .map(|v| (self.similarity(&normalized, v), v))
                .filter(|(score, _)| *score >= self.similarity_threshold)
                .collect();
            scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
            let matches: Vec<String> = scored
                .into_iter()
                .take(self.max_matches)
                .map(|(_, v)| v.clone())
                .collect();
            if !matches.is_empty() {
                debug!("Resolved {} candidates for {}: {:?}", matches.len(), category, matches);
                resolved.insert(category.clone(), matches);
            }
        }
        resolved
    }
}

/// Reads distinct names through the executor, so the lookups get the same
/// read-only, time-bounded, tenant-bound treatment as answers.
pub struct StorageCandidateSource {
    executor: Arc<Executor>,
    tenant_column: String,
    per_category_limit: u32,
}

impl StorageCandidateSource {
    pub fn new(executor: Arc<Executor>, tenant_column: &str) -> Self {
        Self {
            executor,
            tenant_column: tenant_column.to_string(),
            per_category_limit: 500,
        }
    }

    fn lookup(&self, column: &str, table: &str, tenant_id: &str) -> CompiledQuery {
        CompiledQuery {
            sql: format!(
                "SELECT DISTINCT {col} AS value FROM {table} WHERE {tenant} = $1 AND {col} IS NOT NULL LIMIT {limit}",
                col = column,
                table = table,
                tenant = self.tenant_column,
                limit = self.per_category_limit
            ),
            params: vec![tenant_id.to_string()],
            row_limit: self.per_category_limit,
            scope: TenantScope::Bound,
            tables: vec![table.to_string()],
        }
    }
}

#[async_trait]
impl CandidateSource for StorageCandidateSource {
    async fn candidate_sets(&self, tenant_id: &str) -> Result<CandidateSets, ExecutionFault> {
        let lookups = [
            ("merchant", "merchant_name", "transactions"),
            ("category", "category", "transactions"),
            ("account", "name", "accounts"),
        ];

        let mut sets = CandidateSets::new();
        for (category, column, table) in lookups {
            let result = match self.executor.run(&self.lookup(column, table, tenant_id), tenant_id).await {
                Ok(result) => result,
                Err(ExecutionFault::InvalidStatement(e)) => {
                    warn!("Skipping {} candidates: {}", category, e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let values: Vec<String> = result
                .rows
                .iter()
                .filter_map(|row| row.get("value").and_then(|v| v.as_str()).map(str::to_string))
                .collect();
            sets.insert(category.to_string(), values);
        }
        Ok(sets)
    }
}

//! Prompt Context Builder
//!
//! Pure assembly of generator prompts: schema subset, entity candidates and
//! policy-derived SQL requirements. No I/O; the same inputs always produce
//! the same text and fingerprint.

use crate::policy::{QueryIntent, RoutingPolicy};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

/// Resolved exact-value candidates per category (merchant, account, category).
pub type ResolvedEntities = BTreeMap<String, Vec<String>>;

const SYSTEM_PREAMBLE: &str = r#"You translate questions about a user's personal finances into a single PostgreSQL SELECT statement.

Rules:
- Return exactly one read-only statement (SELECT or WITH ... SELECT) inside a ```sql code block.
- Never modify data or schema.
- Do not use $1-style placeholders or dollar quoting; write literal values.
- Prefer exact match (=) over pattern match (ILIKE) whenever a candidate value below fits."#;

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "from", "with", "what", "how", "much", "many", "did", "does", "was",
    "were", "are", "this", "that", "last", "my", "me", "show", "list", "give", "all", "in", "on",
    "of", "to", "a", "an", "is", "i", "spend", "spent", "have", "has", "each", "per", "by", "any",
    "which", "when", "where", "who", "your", "our",
];

/// Prompt text for one generation call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptContext {
    pub system: String,
    pub user: String,
    /// SHA-256 of everything except the question itself.
    pub fingerprint: String,
}

impl PromptContext {
    /// Prompt for a regeneration: the original plus an imperative correction.
    pub fn amended(&self, instruction: &str) -> Self {
        Self {
            system: self.system.clone(),
            user: format!(
                "{}\n\nYour previous SQL was rejected. You MUST fix the following and return a corrected statement:\n{}",
                self.user,
                instruction.trim()
            ),
            fingerprint: self.fingerprint.clone(),
        }
    }
}

pub struct PromptContextBuilder {
    max_schema_chars: usize,
    max_candidates: usize,
    tenant_column: String,
}

impl Default for PromptContextBuilder {
    fn default() -> Self {
        Self::new(6000, 10, "tenant_id")
    }
}

impl PromptContextBuilder {
    pub fn new(max_schema_chars: usize, max_candidates: usize, tenant_column: &str) -> Self {
        Self {
            max_schema_chars,
            max_candidates,
            tenant_column: tenant_column.to_string(),
        }
    }

    pub fn build(
        &self,
        question: &str,
        tenant_id: &str,
        entities: &ResolvedEntities,
        policy: &RoutingPolicy,
        schema_text: &str,
    ) -> PromptContext {
        let mut system = String::from(SYSTEM_PREAMBLE);

        system.push_str("\n\n## Schema\n");
        system.push_str(&self.bounded_schema(schema_text));

        let candidates = self.candidate_section(entities);
        if !candidates.is_empty() {
            system.push_str("\n\n## Known values (use these exact strings)\n");
            system.push_str(&candidates);
        }

        system.push_str("\n\n## Requirements\n");
        for requirement in self.requirements(tenant_id, policy) {
            let _ = writeln!(system, "- {}", requirement);
        }
        let system = system.trim_end().to_string();

        let fingerprint = hex::encode(Sha256::digest(system.as_bytes()));
        PromptContext {
            system,
            user: format!("Question: {}", question.trim()),
            fingerprint,
        }
    }

    /// Whole table definitions only, up to the character budget.
    fn bounded_schema(&self, schema_text: &str) -> String {
        let mut out = String::new();
        let mut omitted = 0;
        for block in schema_text.split("\n\n").map(str::trim).filter(|b| !b.is_empty()) {
            let needed = if out.is_empty() { block.len() } else { block.len() + 2 };
            if out.len() + needed > self.max_schema_chars {
                omitted += 1;
                continue;
            }
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(block);
        }
        if omitted > 0 {
            let _ = write!(out, "\n\n-- {} more table(s) omitted", omitted);
        }
        out
    }

    fn candidate_section(&self, entities: &ResolvedEntities) -> String {
        let mut out = String::new();
        for (category, values) in entities {
            let quoted: Vec<String> = values
                .iter()
                .filter(|v| !v.trim().is_empty())
                .take(self.max_candidates)
                .map(|v| format!("'{}'", escape_literal(v)))
                .collect();
            if quoted.is_empty() {
                continue;
            }
            let _ = writeln!(out, "{}: {}", category, quoted.join(", "));
        }
        out.trim_end().to_string()
    }

    fn requirements(&self, tenant_id: &str, policy: &RoutingPolicy) -> Vec<String> {
        let mut reqs = vec![format!(
            "Restrict every tenant-scoped table with {} = '{}'.",
            self.tenant_column,
            escape_literal(tenant_id)
        )];

        match policy.intent {
            QueryIntent::Spending => reqs.push(
                "Expenses are negative amounts: compute totals as SUM(-amount) WHERE amount < 0.".to_string(),
            ),
            QueryIntent::Income => reqs.push(
                "Income is positive amounts: compute totals as SUM(amount) WHERE amount > 0.".to_string(),
            ),
            QueryIntent::Balance => reqs.push(
                "Balances come from accounts.current_balance; do not sum transactions for balances.".to_string(),
            ),
            QueryIntent::Transactions | QueryIntent::General => {}
        }

        if !policy.include_pending {
            reqs.push("Exclude pending transactions (pending = false) unless the question asks for them.".to_string());
        }
        if policy.monthly {
            reqs.push("Bucket by month with DATE_TRUNC('month', date).".to_string());
        }
        if let Some(window) = policy.time_window {
            reqs.push(format!(
                "Only include rows with date >= '{}' AND date <= '{}'.",
                window.start, window.end
            ));
        }
        if !policy.data_sources.is_empty() {
            let sources: BTreeSet<&str> = policy.data_sources.iter().map(|s| s.as_str()).collect();
            reqs.push(format!(
                "Answer from these tables: {}.",
                sources.into_iter().collect::<Vec<_>>().join(", ")
            ));
        }
        for filter in &policy.filters {
            reqs.push(format!("Apply filter: {}", filter));
        }
        reqs
    }
}

fn escape_literal(s: &str) -> String {
    s.replace('\'', "''")
}

/// Catalog keywords for a question: stop words dropped, naive singular form.
pub fn keywords_from_question(question: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    question
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| w.len() >= 3 && !STOP_WORDS.contains(w))
        .map(singularize)
        .filter(|w| seen.insert(w.clone()))
        .collect()
}

fn singularize(word: &str) -> String {
    if let Some(stem) = word.strip_suffix("ies") {
        format!("{}y", stem)
    } else if word.ends_with("ss") || word.len() <= 3 {
        word.to_string()
    } else if let Some(stem) = word.strip_suffix('s') {
        stem.to_string()
    } else {
        word.to_string()
    }
}

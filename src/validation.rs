//! Result validation
//!
//! A validator looks at the rows an answer is built from and decides whether
//! they plausibly answer the question. A non-empty regeneration hint asks the
//! controller for one more draft.

use crate::execution::ExecutionResult;
use crate::policy::{QueryIntent, RoutingPolicy};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Valid,
    Warning,
    Invalid,
    Error,
}

impl VerdictStatus {
    /// Acceptable as a final answer.
    pub fn is_acceptable(self) -> bool {
        matches!(self, VerdictStatus::Valid | VerdictStatus::Warning)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub kind: String,
    pub description: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub status: VerdictStatus,
    pub issues: Vec<ValidationIssue>,
    pub regeneration_hint: Option<String>,
}

impl ValidationVerdict {
    pub fn valid() -> Self {
        Self {
            status: VerdictStatus::Valid,
            issues: Vec::new(),
            regeneration_hint: None,
        }
    }

    /// The hint, if it carries any text.
    pub fn hint(&self) -> Option<&str> {
        self.regeneration_hint
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
    }
}

/// Who is asking, for validators that need it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    pub tenant_id: String,
    pub row_limit: u32,
}

#[async_trait]
pub trait ResultValidator: Send + Sync {
    async fn validate(
        &self,
        question: &str,
        result: &ExecutionResult,
        tenant: &TenantContext,
        policy: &RoutingPolicy,
    ) -> ValidationVerdict;
}

/// Accepts everything.
pub struct AcceptAllValidator;

#[async_trait]
impl ResultValidator for AcceptAllValidator {
    async fn validate(
        &self,
        _question: &str,
        _result: &ExecutionResult,
        _tenant: &TenantContext,
        _policy: &RoutingPolicy,
    ) -> ValidationVerdict {
        ValidationVerdict::valid()
    }
}

/// Rule-based checks that catch the usual generator mistakes.
pub struct HeuristicValidator;

impl HeuristicValidator {
    fn numeric_cells(result: &ExecutionResult) -> Vec<f64> {
        result
            .rows
            .iter()
            .flat_map(|row| row.values())
            .filter_map(Value::as_f64)
            .collect()
    }

    fn all_null_single_row(result: &ExecutionResult) -> bool {
        result.row_count == 1 && result.rows[0].values().all(Value::is_null)
    }
}

#[async_trait]
impl ResultValidator for HeuristicValidator {
    async fn validate(
        &self,
        _question: &str,
        result: &ExecutionResult,
        tenant: &TenantContext,
        policy: &RoutingPolicy,
    ) -> ValidationVerdict {
        let mut issues = Vec::new();
        let mut hints = Vec::new();

        if Self::all_null_single_row(result) {
            issues.push(ValidationIssue {
                kind: "null_aggregate".to_string(),
                description: "Aggregate returned only NULL values".to_string(),
                severity: Severity::Medium,
            });
        }

        if policy.intent == QueryIntent::Spending
            && result.row_count <= 12
            && Self::numeric_cells(result).iter().any(|v| *v < 0.0)
        {
            issues.push(ValidationIssue {
                kind: "sign_convention".to_string(),
                description: "Spending totals came back negative".to_string(),
                severity: Severity::High,
            });
            hints.push("Expenses must be reported as positive numbers: use SUM(-amount) with amount < 0.");
        }

        if result.row_count as u32 >= tenant.row_limit && tenant.row_limit > 0 {
            issues.push(ValidationIssue {
                kind: "truncated".to_string(),
                description: format!("Result hit the row limit of {}", tenant.row_limit),
                severity: Severity::Low,
            });
        }

        let status = if issues.iter().any(|i| i.severity == Severity::High) {
            VerdictStatus::Invalid
        } else if issues.is_empty() {
            VerdictStatus::Valid
        } else {
            VerdictStatus::Warning
        };

        ValidationVerdict {
            status,
            issues,
            regeneration_hint: if hints.is_empty() { None } else { Some(hints.join(" ")) },
        }
    }
}

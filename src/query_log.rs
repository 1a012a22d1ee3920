//! Execution log
//!
//! In-memory record of pipeline runs. Created at startup, handed to the
//! controller, and summarized on shutdown; nothing here is global, so tests
//! build their own instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Answered,
    NoMatchingData,
    Unanswerable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub tenant_id: String,
    pub question: String,
    /// Final compiled statement, if compilation succeeded on some attempt.
    pub sql: Option<String>,
    pub attempts: u8,
    pub cache_hit: bool,
    pub row_count: usize,
    pub duration_ms: u64,
    pub outcome: RunOutcome,
    pub fault: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LogSummary {
    pub total: usize,
    pub answered: usize,
    pub no_data: usize,
    pub unanswerable: usize,
    pub cache_hits: usize,
    pub regenerated: usize,
}

pub struct ExecutionLog {
    capacity: usize,
    records: Mutex<VecDeque<ExecutionRecord>>,
}

impl ExecutionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::new()),
        }
    }

    /// Append a record, dropping the oldest when full.
    pub fn record(&self, record: ExecutionRecord) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Most recent records first.
    pub fn recent(&self, n: usize) -> Vec<ExecutionRecord> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.iter().rev().take(n).cloned().collect()
    }

    pub fn for_tenant(&self, tenant_id: &str) -> Vec<ExecutionRecord> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records
            .iter()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    pub fn summary(&self) -> LogSummary {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut summary = LogSummary {
            total: records.len(),
            ..LogSummary::default()
        };
        for r in records.iter() {
            match r.outcome {
                RunOutcome::Answered => summary.answered += 1,
                RunOutcome::NoMatchingData => summary.no_data += 1,
                RunOutcome::Unanswerable => summary.unanswerable += 1,
            }
            if r.cache_hit {
                summary.cache_hits += 1;
            }
            if r.attempts > 1 {
                summary.regenerated += 1;
            }
        }
        summary
    }

    /// Log a summary and clear the records.
    pub fn shutdown(&self) -> LogSummary {
        let summary = self.summary();
        info!(
            "Execution log closing: {} runs ({} answered, {} no data, {} unanswerable, {} cache hits, {} regenerated)",
            summary.total,
            summary.answered,
            summary.no_data,
            summary.unanswerable,
            summary.cache_hits,
            summary.regenerated
        );
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        summary
    }
}

impl Default for ExecutionLog {
    fn default() -> Self {
        Self::new(1000)
    }
}

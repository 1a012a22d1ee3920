//! Routing policy - what the upstream router decided about a question
//!
//! The router itself lives outside this crate; the pipeline only consumes its
//! decision when shaping prompts and judging results.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    Spending,
    Income,
    Balance,
    Transactions,
    #[default]
    General,
}

impl fmt::Display for QueryIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryIntent::Spending => write!(f, "spending"),
            QueryIntent::Income => write!(f, "income"),
            QueryIntent::Balance => write!(f, "balance"),
            QueryIntent::Transactions => write!(f, "transactions"),
            QueryIntent::General => write!(f, "general"),
        }
    }
}

/// Inclusive date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl TimeWindow {
    /// Build a window, swapping the bounds if they arrive reversed.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self { start: end, end: start }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingPolicy {
    pub intent: QueryIntent,
    /// Tables the router expects the answer to come from.
    pub data_sources: Vec<String>,
    pub time_window: Option<TimeWindow>,
    /// Extra plain-language filters, passed to the generator as requirements.
    pub filters: Vec<String>,
    pub include_pending: bool,
    /// Group results by calendar month.
    pub monthly: bool,
}

impl RoutingPolicy {
    pub fn for_intent(intent: QueryIntent) -> Self {
        Self {
            intent,
            ..Self::default()
        }
    }

    pub fn with_time_window(mut self, window: TimeWindow) -> Self {
        self.time_window = Some(window);
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filters.push(filter.into());
        self
    }

    pub fn monthly(mut self) -> Self {
        self.monthly = true;
        self
    }
}

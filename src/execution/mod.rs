//! Execution layer
//!
//! Read-only execution of compiled statements with bounded retries.

pub mod error_classifier;
pub mod executor;
pub mod postgres;
pub mod result;

pub use error_classifier::{FaultClass, FaultClassifier, StorageError, StorageErrorKind};
pub use executor::{Executor, FetchedRows, StatementLimits, StorageEngine};
pub use postgres::PgStorage;
pub use result::{ExecutionResult, Row, REDACTED};

//! Database module for PostgreSQL connectivity
//!
//! Pool construction only; statement execution lives in `execution`, schema
//! introspection in `schema`.

pub mod connection;

pub use connection::{init_pool, DbPool};

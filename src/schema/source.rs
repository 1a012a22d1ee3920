//! Catalog sources
//!
//! Where raw table metadata comes from: the live database's
//! `information_schema`, or a fixed in-memory definition.

use crate::error::CatalogLoadError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
}

impl ColumnDescriptor {
    pub fn new(name: &str, data_type: &str, nullable: bool) -> Self {
        Self {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable,
            default: None,
        }
    }

    pub fn with_default(mut self, default: &str) -> Self {
        self.default = Some(default.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub target_table: String,
    pub target_column: String,
}

/// Unannotated schema as read from a source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawSchema {
    pub columns: BTreeMap<String, Vec<ColumnDescriptor>>,
    pub foreign_keys: BTreeMap<String, Vec<ForeignKey>>,
}

impl RawSchema {
    pub fn with_table(mut self, table: &str, columns: Vec<ColumnDescriptor>) -> Self {
        self.columns.insert(table.to_lowercase(), columns);
        self
    }

    pub fn with_foreign_key(mut self, table: &str, column: &str, target_table: &str, target_column: &str) -> Self {
        self.foreign_keys
            .entry(table.to_lowercase())
            .or_default()
            .push(ForeignKey {
                column: column.to_string(),
                target_table: target_table.to_lowercase(),
                target_column: target_column.to_string(),
            });
        self
    }
}

#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn load(&self) -> Result<RawSchema, CatalogLoadError>;
}

/// Reads table metadata from PostgreSQL's `information_schema`.
pub struct PgCatalogSource {
    pool: PgPool,
    schema: String,
}

impl PgCatalogSource {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    async fn load_columns(&self) -> Result<BTreeMap<String, Vec<ColumnDescriptor>>, CatalogLoadError> {
        let rows = sqlx::query(
            r#"
            SELECT table_name::text AS table_name,
                   column_name::text AS column_name,
                   data_type::text AS data_type,
                   is_nullable::text AS is_nullable,
                   column_default::text AS column_default
            FROM information_schema.columns
            WHERE table_schema = $1
            ORDER BY table_name, ordinal_position
            "#,
        )
        .bind(&self.schema)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CatalogLoadError::Source(format!("Failed to load columns: {}", e)))?;

        let mut columns: BTreeMap<String, Vec<ColumnDescriptor>> = BTreeMap::new();
        for row in rows {
            let table: String = row
                .try_get("table_name")
                .map_err(|e| CatalogLoadError::Source(e.to_string()))?;
            let nullable: String = row
                .try_get("is_nullable")
                .map_err(|e| CatalogLoadError::Source(e.to_string()))?;
            columns
                .entry(table.to_lowercase())
                .or_default()
                .push(ColumnDescriptor {
                    name: row
                        .try_get("column_name")
                        .map_err(|e| CatalogLoadError::Source(e.to_string()))?,
                    data_type: row
                        .try_get("data_type")
                        .map_err(|e| CatalogLoadError::Source(e.to_string()))?,
                    nullable: nullable.eq_ignore_ascii_case("YES"),
                    default: row.try_get::<Option<String>, _>("column_default").ok().flatten(),
                });
        }
        Ok(columns)
    }

    async fn load_foreign_keys(&self) -> Result<BTreeMap<String, Vec<ForeignKey>>, CatalogLoadError> {
        let rows = sqlx::query(
            r#"
            SELECT kcu.table_name::text AS table_name,
                   kcu.column_name::text AS column_name,
                   ccu.table_name::text AS target_table,
                   ccu.column_name::text AS target_column
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
              ON tc.constraint_name = kcu.constraint_name
             AND tc.table_schema = kcu.table_schema
            JOIN information_schema.constraint_column_usage ccu
              ON ccu.constraint_name = tc.constraint_name
             AND ccu.table_schema = tc.table_schema
            WHERE tc.constraint_type = 'FOREIGN KEY'
              AND tc.table_schema = $1
            ORDER BY kcu.table_name, kcu.column_name
            "#,
        )
        .bind(&self.schema)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CatalogLoadError::Source(format!("Failed to load foreign keys: {}", e)))?;

        let mut edges: BTreeMap<String, Vec<ForeignKey>> = BTreeMap::new();
        for row in rows {
            let table: String = row
                .try_get("table_name")
                .map_err(|e| CatalogLoadError::Source(e.to_string()))?;
            let target_table: String = row
                .try_get("target_table")
                .map_err(|e| CatalogLoadError::Source(e.to_string()))?;
            edges.entry(table.to_lowercase()).or_default().push(ForeignKey {
                column: row
                    .try_get("column_name")
                    .map_err(|e| CatalogLoadError::Source(e.to_string()))?,
                target_table: target_table.to_lowercase(),
                target_column: row
                    .try_get("target_column")
                    .map_err(|e| CatalogLoadError::Source(e.to_string()))?,
            });
        }
        Ok(edges)
    }
}

#[async_trait]
impl CatalogSource for PgCatalogSource {
    async fn load(&self) -> Result<RawSchema, CatalogLoadError> {
        let columns = self.load_columns().await?;
        let foreign_keys = self.load_foreign_keys().await?;
        debug!(
            "Loaded {} tables and {} foreign-key groups from schema '{}'",
            columns.len(),
            foreign_keys.len(),
            self.schema
        );
        Ok(RawSchema { columns, foreign_keys })
    }
}

/// Serves a fixed schema; used offline and in tests.
pub struct StaticCatalogSource {
    schema: RawSchema,
}

impl StaticCatalogSource {
    pub fn new(schema: RawSchema) -> Self {
        Self { schema }
    }
}

#[async_trait]
impl CatalogSource for StaticCatalogSource {
    async fn load(&self) -> Result<RawSchema, CatalogLoadError> {
        if self.schema.columns.is_empty() {
            return Err(CatalogLoadError::Empty);
        }
        Ok(self.schema.clone())
    }
}

//! Schema Catalog
//!
//! Holds an immutable `CatalogSnapshot` behind an `Arc` that is swapped
//! atomically on refresh. Readers clone the `Arc` and never observe a
//! half-built catalog.

use crate::config::CatalogConfig;
use crate::error::CatalogLoadError;
use crate::schema::fallback::minimal_schema;
use crate::schema::source::{CatalogSource, ColumnDescriptor, ForeignKey, RawSchema};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// How often a fallback catalog retries the live source, at most.
const FALLBACK_RETRY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotOrigin {
    Live,
    Fallback,
}

/// Immutable, annotated view of the schema.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    columns: BTreeMap<String, Vec<ColumnDescriptor>>,
    foreign_keys: BTreeMap<String, Vec<ForeignKey>>,
    tenant_filtered: BTreeSet<String>,
    sensitive_fragments: Vec<String>,
    order_columns: BTreeMap<String, String>,
    core_tables: Vec<String>,
    tenant_column: String,
    origin: SnapshotOrigin,
    loaded_at: Instant,
}

impl CatalogSnapshot {
    /// Annotate a raw schema.
    ///
    /// Tenant-filtered tables are the configured names plus every table that
    /// carries the tenant column. A configured name missing from the schema
    /// fails the build.
    pub fn build(
        raw: RawSchema,
        config: &CatalogConfig,
        tenant_column: &str,
        origin: SnapshotOrigin,
    ) -> Result<Self, CatalogLoadError> {
        if raw.columns.is_empty() {
            return Err(CatalogLoadError::Empty);
        }

        let mut tenant_filtered = BTreeSet::new();
        for table in &config.tenant_tables {
            let table = table.to_lowercase();
            if !raw.columns.contains_key(&table) {
                return Err(CatalogLoadError::UnknownTenantTable(table));
            }
            tenant_filtered.insert(table);
        }
        for (table, columns) in &raw.columns {
            if columns.iter().any(|c| c.name.eq_ignore_ascii_case(tenant_column)) {
                tenant_filtered.insert(table.clone());
            }
        }

        let order_columns = raw
            .columns
            .iter()
            .filter_map(|(table, columns)| order_column_for(columns).map(|c| (table.clone(), c)))
            .collect();

        Ok(Self {
            columns: raw.columns,
            foreign_keys: raw.foreign_keys,
            tenant_filtered,
            sensitive_fragments: config
                .sensitive_fragments
                .iter()
                .map(|f| f.to_lowercase())
                .collect(),
            order_columns,
            core_tables: config.core_tables.iter().map(|t| t.to_lowercase()).collect(),
            tenant_column: tenant_column.to_string(),
            origin,
            loaded_at: Instant::now(),
        })
    }

    pub fn origin(&self) -> SnapshotOrigin {
        self.origin
    }

    pub fn age(&self) -> Duration {
        self.loaded_at.elapsed()
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(|s| s.as_str())
    }

    pub fn table_exists(&self, table: &str) -> bool {
        self.columns.contains_key(&table.to_lowercase())
    }

    pub fn columns(&self, table: &str) -> Option<&[ColumnDescriptor]> {
        self.columns.get(&table.to_lowercase()).map(|c| c.as_slice())
    }

    pub fn foreign_keys(&self, table: &str) -> &[ForeignKey] {
        self.foreign_keys
            .get(&table.to_lowercase())
            .map(|f| f.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_tenant_filtered(&self, table: &str) -> bool {
        self.tenant_filtered.contains(&table.to_lowercase())
    }

    pub fn is_sensitive_column(&self, column: &str) -> bool {
        let column = column.to_lowercase();
        self.sensitive_fragments.iter().any(|f| column.contains(f.as_str()))
    }

    pub fn sensitive_columns_in(&self, table: &str) -> BTreeSet<String> {
        self.columns(table)
            .unwrap_or(&[])
            .iter()
            .filter(|c| self.is_sensitive_column(&c.name))
            .map(|c| c.name.clone())
            .collect()
    }

    /// Column a plain projection of `table` may be ordered by, newest first.
    pub fn default_order_column(&self, table: &str) -> Option<&str> {
        self.order_columns.get(&table.to_lowercase()).map(|s| s.as_str())
    }

    /// Render definitions of tables matching any keyword, plus the core set.
    pub fn subset_for(&self, keywords: &[String]) -> String {
        let keywords: Vec<String> = keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();

        let selected: Vec<&String> = self
            .columns
            .iter()
            .filter(|(table, columns)| {
                self.core_tables.contains(table)
                    || keywords.iter().any(|k| {
                        table.contains(k.as_str())
                            || columns.iter().any(|c| c.name.to_lowercase().contains(k.as_str()))
                    })
            })
            .map(|(table, _)| table)
            .collect();

        let mut out = String::new();
        for table in selected {
            self.render_table(table, &mut out);
            out.push('\n');
        }
        out.trim_end().to_string()
    }

    fn render_table(&self, table: &str, out: &mut String) {
        if self.is_tenant_filtered(table) {
            let _ = writeln!(
                out,
                "TABLE {}  -- tenant-scoped: always filter by {}",
                table, self.tenant_column
            );
        } else {
            let _ = writeln!(out, "TABLE {}", table);
        }
        for column in self.columns.get(table).into_iter().flatten() {
            if self.is_sensitive_column(&column.name) {
                continue;
            }
            let _ = write!(out, "  {} {}", column.name, column.data_type);
            if !column.nullable {
                out.push_str(" NOT NULL");
            }
            if let Some(ref default) = column.default {
                let _ = write!(out, " DEFAULT {}", default);
            }
            out.push('\n');
        }
        for fk in self.foreign_keys(table) {
            let _ = writeln!(
                out,
                "  FOREIGN KEY {} -> {}.{}",
                fk.column, fk.target_table, fk.target_column
            );
        }
    }
}

fn order_column_for(columns: &[ColumnDescriptor]) -> Option<String> {
    if let Some(c) = columns.iter().find(|c| c.name.eq_ignore_ascii_case("date")) {
        return Some(c.name.clone());
    }
    columns
        .iter()
        .find(|c| {
            let ty = c.data_type.to_lowercase();
            ty == "date" || ty.starts_with("timestamp")
        })
        .map(|c| c.name.clone())
}

/// Shared, read-mostly schema catalog.
pub struct SchemaCatalog {
    source: Arc<dyn CatalogSource>,
    config: CatalogConfig,
    tenant_column: String,
    current: RwLock<Arc<CatalogSnapshot>>,
    checked_at: Mutex<Instant>,
    invalidated: AtomicBool,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl SchemaCatalog {
    /// Load the catalog, degrading to the built-in minimal schema when the
    /// source is unavailable.
    pub async fn initialize(
        source: Arc<dyn CatalogSource>,
        config: CatalogConfig,
        tenant_column: &str,
    ) -> Self {
        let snapshot = match load_snapshot(source.as_ref(), &config, tenant_column).await {
            Ok(snapshot) => {
                info!("✅ Schema catalog loaded ({} tables)", snapshot.columns.len());
                snapshot
            }
            Err(e) => {
                warn!("Schema catalog unavailable, using minimal built-in schema: {}", e);
                fallback_snapshot(&config, tenant_column)
            }
        };
        Self::with_snapshot(source, config, tenant_column, snapshot)
    }

    pub fn with_snapshot(
        source: Arc<dyn CatalogSource>,
        config: CatalogConfig,
        tenant_column: &str,
        snapshot: CatalogSnapshot,
    ) -> Self {
        Self {
            source,
            config,
            tenant_column: tenant_column.to_string(),
            current: RwLock::new(Arc::new(snapshot)),
            checked_at: Mutex::new(Instant::now()),
            invalidated: AtomicBool::new(false),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Read a fresh snapshot from the source without installing it.
    pub async fn load(&self) -> Result<CatalogSnapshot, CatalogLoadError> {
        load_snapshot(self.source.as_ref(), &self.config, &self.tenant_column).await
    }

    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn tenant_column(&self) -> &str {
        &self.tenant_column
    }

    pub fn subset_for(&self, keywords: &[String]) -> String {
        self.snapshot().subset_for(keywords)
    }

    pub fn is_tenant_filtered(&self, table: &str) -> bool {
        self.snapshot().is_tenant_filtered(table)
    }

    pub fn sensitive_columns_in(&self, table: &str) -> BTreeSet<String> {
        self.snapshot().sensitive_columns_in(table)
    }

    /// Force the next `refresh_if_stale` to reload.
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
    }

    fn is_stale(&self) -> bool {
        if self.invalidated.load(Ordering::SeqCst) {
            return true;
        }
        let ttl = match self.snapshot().origin() {
            SnapshotOrigin::Live => self.config.ttl,
            SnapshotOrigin::Fallback => self.config.ttl.min(FALLBACK_RETRY),
        };
        self.checked_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
            > ttl
    }

    /// Reload when the snapshot is older than the TTL or was invalidated.
    ///
    /// Returns whether a new snapshot was installed. A failed reload keeps
    /// the current snapshot and restarts the staleness clock. Concurrent
    /// callers do not stack loads: only the first one reloads.
    pub async fn refresh_if_stale(&self) -> bool {
        if !self.is_stale() {
            return false;
        }
        let _guard = match self.refresh_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        if !self.is_stale() {
            return false;
        }

        let outcome = self.load().await;
        *self.checked_at.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
        self.invalidated.store(false, Ordering::SeqCst);

        match outcome {
            Ok(snapshot) => {
                info!("🔄 Schema catalog refreshed ({} tables)", snapshot.columns.len());
                *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
                true
            }
            Err(e) => {
                warn!("Schema catalog refresh failed, keeping current snapshot: {}", e);
                false
            }
        }
    }
}

async fn load_snapshot(
    source: &dyn CatalogSource,
    config: &CatalogConfig,
    tenant_column: &str,
) -> Result<CatalogSnapshot, CatalogLoadError> {
    let raw = source.load().await?;
    CatalogSnapshot::build(raw, config, tenant_column, SnapshotOrigin::Live)
}

fn fallback_snapshot(config: &CatalogConfig, tenant_column: &str) -> CatalogSnapshot {
    let raw = minimal_schema(tenant_column);
    // Configured tables outside the minimal schema cannot be honoured here.
    let mut fallback_config = config.clone();
    fallback_config
        .tenant_tables
        .retain(|t| raw.columns.contains_key(&t.to_lowercase()));
    match CatalogSnapshot::build(raw.clone(), &fallback_config, tenant_column, SnapshotOrigin::Fallback) {
        Ok(snapshot) => snapshot,
        Err(_) => CatalogSnapshot {
            columns: raw.columns,
            foreign_keys: raw.foreign_keys,
            tenant_filtered: ["accounts", "transactions"].iter().map(|s| s.to_string()).collect(),
            sensitive_fragments: Vec::new(),
            order_columns: BTreeMap::new(),
            core_tables: Vec::new(),
            tenant_column: tenant_column.to_string(),
            origin: SnapshotOrigin::Fallback,
            loaded_at: Instant::now(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::source::StaticCatalogSource;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    fn test_schema() -> RawSchema {
        minimal_schema("tenant_id").with_table(
            "plaid_items",
            vec![
                ColumnDescriptor::new("id", "uuid", false),
                ColumnDescriptor::new("tenant_id", "text", false),
                ColumnDescriptor::new("access_token", "text", false),
                ColumnDescriptor::new("institution", "text", true),
            ],
        )
    }

    struct FailingSource;

    #[async_trait]
    impl CatalogSource for FailingSource {
        async fn load(&self) -> Result<RawSchema, CatalogLoadError> {
            Err(CatalogLoadError::Source("connection refused".to_string()))
        }
    }

    struct CountingSource {
        loads: AtomicUsize,
    }

    #[async_trait]
    impl CatalogSource for CountingSource {
        async fn load(&self) -> Result<RawSchema, CatalogLoadError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(test_schema())
        }
    }

    #[test]
    fn test_tenant_tables_must_exist() {
        let mut config = CatalogConfig::default();
        config.tenant_tables.insert("budgets".to_string());
        let err = CatalogSnapshot::build(test_schema(), &config, "tenant_id", SnapshotOrigin::Live)
            .unwrap_err();
        assert_eq!(err, CatalogLoadError::UnknownTenantTable("budgets".to_string()));
    }

    #[test]
    fn test_tables_with_tenant_column_are_filtered() {
        let snapshot = CatalogSnapshot::build(
            test_schema(),
            &CatalogConfig::default(),
            "tenant_id",
            SnapshotOrigin::Live,
        )
        .unwrap();
        assert!(snapshot.is_tenant_filtered("plaid_items"));
        assert!(snapshot.is_tenant_filtered("Transactions"));
        assert!(!snapshot.is_tenant_filtered("categories"));
    }

    #[test]
    fn test_sensitive_columns_hidden_from_subset() {
        let snapshot = CatalogSnapshot::build(
            test_schema(),
            &CatalogConfig::default(),
            "tenant_id",
            SnapshotOrigin::Live,
        )
        .unwrap();
        let sensitive = snapshot.sensitive_columns_in("plaid_items");
        assert!(sensitive.contains("access_token"));

        let text = snapshot.subset_for(&["institution".to_string()]);
        assert!(text.contains("TABLE plaid_items"));
        assert!(text.contains("institution"));
        assert!(!text.contains("access_token"));
    }

    #[test]
    fn test_subset_always_includes_core_tables() {
        let snapshot = CatalogSnapshot::build(
            test_schema(),
            &CatalogConfig::default(),
            "tenant_id",
            SnapshotOrigin::Live,
        )
        .unwrap();
        let text = snapshot.subset_for(&[]);
        assert!(text.contains("TABLE accounts"));
        assert!(text.contains("TABLE transactions"));
        assert!(!text.contains("TABLE categories"));
        assert!(text.contains("FOREIGN KEY account_id -> accounts.id"));
    }

    #[test]
    fn test_default_order_column_prefers_date() {
        let snapshot = CatalogSnapshot::build(
            test_schema(),
            &CatalogConfig::default(),
            "tenant_id",
            SnapshotOrigin::Live,
        )
        .unwrap();
        assert_eq!(snapshot.default_order_column("transactions"), Some("date"));
        assert_eq!(snapshot.default_order_column("accounts"), Some("created_at"));
        assert_eq!(snapshot.default_order_column("categories"), None);
    }

    #[tokio::test]
    async fn test_initialize_falls_back_on_load_failure() {
        let catalog =
            SchemaCatalog::initialize(Arc::new(FailingSource), CatalogConfig::default(), "tenant_id").await;
        let snapshot = catalog.snapshot();
        assert_eq!(snapshot.origin(), SnapshotOrigin::Fallback);
        assert!(snapshot.table_exists("transactions"));
        assert!(catalog.is_tenant_filtered("accounts"));
    }

    #[tokio::test]
    async fn test_refresh_only_when_stale_or_invalidated() {
        let source = Arc::new(CountingSource {
            loads: AtomicUsize::new(0),
        });
        let catalog = SchemaCatalog::initialize(
            source.clone(),
            CatalogConfig::default(),
            "tenant_id",
        )
        .await;
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);

        assert!(!catalog.refresh_if_stale().await);
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);

        catalog.invalidate();
        assert!(catalog.refresh_if_stale().await);
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
        assert!(!catalog.refresh_if_stale().await);
    }

    #[tokio::test]
    async fn test_refresh_after_ttl() {
        let mut config = CatalogConfig::default();
        config.ttl = Duration::from_millis(10);
        let catalog = SchemaCatalog::initialize(
            Arc::new(StaticCatalogSource::new(test_schema())),
            config,
            "tenant_id",
        )
        .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(catalog.refresh_if_stale().await);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_snapshot() {
        let snapshot = CatalogSnapshot::build(
            test_schema(),
            &CatalogConfig::default(),
            "tenant_id",
            SnapshotOrigin::Live,
        )
        .unwrap();
        let catalog = SchemaCatalog::with_snapshot(
            Arc::new(FailingSource),
            CatalogConfig::default(),
            "tenant_id",
            snapshot,
        );
        catalog.invalidate();
        assert!(!catalog.refresh_if_stale().await);
        assert_eq!(catalog.snapshot().origin(), SnapshotOrigin::Live);
        assert!(catalog.snapshot().table_exists("plaid_items"));
    }
}

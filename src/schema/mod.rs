//! Schema catalog
//!
//! Table/column/relationship metadata plus the tenant-safety annotations the
//! compiler and prompt builder depend on.

pub mod catalog;
pub mod fallback;
pub mod source;

pub use catalog::{CatalogSnapshot, SchemaCatalog, SnapshotOrigin};
pub use source::{CatalogSource, ColumnDescriptor, ForeignKey, PgCatalogSource, RawSchema, StaticCatalogSource};

//! Minimal built-in schema
//!
//! Installed when the live catalog cannot be read, so the pipeline keeps
//! answering questions about the tables it cannot function without.

use crate::schema::source::{ColumnDescriptor, RawSchema};

pub fn minimal_schema(tenant_column: &str) -> RawSchema {
    RawSchema::default()
        .with_table(
            "accounts",
            vec![
                ColumnDescriptor::new("id", "uuid", false),
                ColumnDescriptor::new(tenant_column, "text", false),
                ColumnDescriptor::new("name", "text", false),
                ColumnDescriptor::new("type", "text", false),
                ColumnDescriptor::new("subtype", "text", true),
                ColumnDescriptor::new("institution_name", "text", true),
                ColumnDescriptor::new("current_balance", "numeric", true),
                ColumnDescriptor::new("available_balance", "numeric", true),
                ColumnDescriptor::new("currency", "text", false).with_default("'USD'"),
                ColumnDescriptor::new("created_at", "timestamp with time zone", false)
                    .with_default("now()"),
            ],
        )
        .with_table(
            "transactions",
            vec![
                ColumnDescriptor::new("id", "uuid", false),
                ColumnDescriptor::new(tenant_column, "text", false),
                ColumnDescriptor::new("account_id", "uuid", false),
                ColumnDescriptor::new("date", "date", false),
                ColumnDescriptor::new("amount", "numeric", false),
                ColumnDescriptor::new("name", "text", false),
                ColumnDescriptor::new("merchant_name", "text", true),
                ColumnDescriptor::new("category", "text", true),
                ColumnDescriptor::new("pending", "boolean", false).with_default("false"),
            ],
        )
        .with_table(
            "categories",
            vec![
                ColumnDescriptor::new("id", "integer", false),
                ColumnDescriptor::new("name", "text", false),
                ColumnDescriptor::new("parent", "text", true),
            ],
        )
        .with_foreign_key("transactions", "account_id", "accounts", "id")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_schema_has_core_tables() {
        let schema = minimal_schema("tenant_id");
        assert!(schema.columns.contains_key("accounts"));
        assert!(schema.columns.contains_key("transactions"));
        assert_eq!(schema.foreign_keys["transactions"][0].target_table, "accounts");
    }
}

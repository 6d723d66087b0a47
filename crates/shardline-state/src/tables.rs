//! redb table definitions for the table record store.

use redb::TableDefinition;

/// Per-table persistent records keyed by table id.
pub const TABLES: TableDefinition<&str, &[u8]> = TableDefinition::new("tables");

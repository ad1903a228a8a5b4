// ============================================================================
// Undo Log
// ============================================================================
//
// Writes inside a transaction are applied to the shared tables immediately.
// Each one records a Change holding what is needed to reverse it; rollback
// replays the log backwards, commit discards it.
//
// ============================================================================

use unitwork_core::Value;

/// A single reversible write.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Change {
    /// A row was inserted at `rowid`.
    InsertRow { table: String, rowid: u64 },

    /// The row at `rowid` was overwritten; `old_row` is its previous content.
    UpdateRow {
        table: String,
        rowid: u64,
        old_row: Vec<Value>,
    },

    /// The row at `rowid` was removed.
    DeleteRow {
        table: String,
        rowid: u64,
        old_row: Vec<Value>,
    },

    /// A table was created.
    CreateTable { name: String },
}

impl Change {
    pub(crate) fn table_name(&self) -> &str {
        match self {
            Change::InsertRow { table, .. }
            | Change::UpdateRow { table, .. }
            | Change::DeleteRow { table, .. } => table,
            Change::CreateTable { name } => name,
        }
    }
}

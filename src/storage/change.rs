// ============================================================================
// Transaction Change Tracking
// ============================================================================
//
// Each Change is a reversible row operation. A transaction applies changes to
// its locked tables immediately and keeps them as an undo log; commit writes
// the same list to the WAL as redo, rollback replays it backwards as undo.
//
// ============================================================================

use super::catalog::TableKind;
use super::table::{InstanceTable, RecordTable, RowId};
use crate::core::{Instance, UsageRecord};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    InsertInstance {
        table: String,
        row_id: RowId,
        row: Instance,
    },
    UpdateInstance {
        table: String,
        row_id: RowId,
        old_row: Instance,
        new_row: Instance,
    },
    InsertRecord {
        table: String,
        row_id: RowId,
        row: UsageRecord,
    },
    DeleteRecord {
        table: String,
        row_id: RowId,
        old_row: UsageRecord,
    },
}

impl Change {
    pub fn table_name(&self) -> &str {
        match self {
            Change::InsertInstance { table, .. } => table,
            Change::UpdateInstance { table, .. } => table,
            Change::InsertRecord { table, .. } => table,
            Change::DeleteRecord { table, .. } => table,
        }
    }

    pub fn kind(&self) -> TableKind {
        match self {
            Change::InsertInstance { .. } | Change::UpdateInstance { .. } => TableKind::Instance,
            Change::InsertRecord { .. } | Change::DeleteRecord { .. } => TableKind::Record,
        }
    }
}

/// Forward and backward application of changes to a table.
///
/// Changes addressed to the other table kind are ignored.
pub trait Replay {
    fn redo(&mut self, change: &Change);
    fn undo(&mut self, change: &Change);
}

impl Replay for InstanceTable {
    fn redo(&mut self, change: &Change) {
        match change {
            Change::InsertInstance { row_id, row, .. } => self.restore(*row_id, row.clone()),
            Change::UpdateInstance {
                row_id, new_row, ..
            } => {
                self.update(*row_id, new_row.clone());
            }
            _ => {}
        }
    }

    fn undo(&mut self, change: &Change) {
        match change {
            Change::InsertInstance { row_id, .. } => {
                self.delete(*row_id);
            }
            Change::UpdateInstance {
                row_id, old_row, ..
            } => {
                self.update(*row_id, old_row.clone());
            }
            _ => {}
        }
    }
}

impl Replay for RecordTable {
    fn redo(&mut self, change: &Change) {
        match change {
            Change::InsertRecord { row_id, row, .. } => self.restore(*row_id, row.clone()),
            Change::DeleteRecord { row_id, .. } => {
                self.delete(*row_id);
            }
            _ => {}
        }
    }

    fn undo(&mut self, change: &Change) {
        match change {
            Change::InsertRecord { row_id, .. } => {
                self.delete(*row_id);
            }
            Change::DeleteRecord {
                row_id, old_row, ..
            } => self.restore(*row_id, old_row.clone()),
            _ => {}
        }
    }
}

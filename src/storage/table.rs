use crate::core::{Instance, UsageRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type RowId = u64;

/// Rows keyed by a surrogate id that is never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table<R> {
    name: String,
    rows: BTreeMap<RowId, R>,
    next_row_id: RowId,
}

pub type InstanceTable = Table<Instance>;
pub type RecordTable = Table<UsageRecord>;

impl<R: Clone> Table<R> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: BTreeMap::new(),
            next_row_id: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn insert(&mut self, row: R) -> RowId {
        let id = self.next_row_id;
        self.next_row_id += 1;
        self.rows.insert(id, row);
        id
    }

    /// Put a row back under a known id (undo of a delete, WAL replay).
    pub fn restore(&mut self, id: RowId, row: R) {
        self.next_row_id = self.next_row_id.max(id + 1);
        self.rows.insert(id, row);
    }

    /// Replace a row, returning the previous version.
    pub fn update(&mut self, id: RowId, row: R) -> Option<R> {
        let slot = self.rows.get_mut(&id)?;
        Some(std::mem::replace(slot, row))
    }

    pub fn delete(&mut self, id: RowId) -> Option<R> {
        self.rows.remove(&id)
    }

    pub fn get(&self, id: RowId) -> Option<&R> {
        self.rows.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (RowId, &R)> {
        self.rows.iter().map(|(id, row)| (*id, row))
    }

    pub fn scan_with_ids<F>(&self, mut predicate: F) -> Vec<(RowId, R)>
    where
        F: FnMut(&R) -> bool,
    {
        self.rows
            .iter()
            .filter(|(_, row)| predicate(row))
            .map(|(id, row)| (*id, row.clone()))
            .collect()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

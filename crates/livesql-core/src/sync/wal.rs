//! Write-ahead buffer for client rows.

use indexmap::IndexMap;
use std::cmp::Ordering;

use super::{compare_synced, SyncParams};
use crate::db::Row;

/// Collects incoming client rows and hands them out in batches.
///
/// Only the newest version of each row is kept, so rapid edits to the same
/// row collapse into one write.
#[derive(Debug, Clone)]
pub struct WriteAheadBuffer {
    params: SyncParams,
    pending: IndexMap<String, Row>,
    sending: bool,
}

impl WriteAheadBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new(params: SyncParams) -> Self {
        Self {
            params,
            pending: IndexMap::new(),
            sending: false,
        }
    }

    /// Buffers rows, keeping the newest version per identity.
    pub fn add(&mut self, rows: impl IntoIterator<Item = Row>) {
        for row in rows {
            let key = self.params.row_key(&row);
            match self.pending.get(&key) {
                Some(existing)
                    if compare_synced(self.params.synced(existing), self.params.synced(&row))
                        == Ordering::Greater => {}
                _ => {
                    self.pending.insert(key, row);
                }
            }
        }
    }

    /// Takes up to `max` rows, oldest first, and marks a send in progress.
    pub fn take_batch(&mut self, max: usize) -> Vec<Row> {
        let count = max.min(self.pending.len());
        let batch: Vec<Row> = self.pending.drain(..count).map(|(_, row)| row).collect();
        if !batch.is_empty() {
            self.sending = true;
        }
        batch
    }

    /// Ends the send started by [`Self::take_batch`].
    pub fn finish_send(&mut self) {
        self.sending = false;
    }

    /// Whether a batch is being written.
    #[must_use]
    pub fn is_sending(&self) -> bool {
        self.sending
    }

    /// Buffered rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Whether rows are buffered or being written.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.sending || !self.pending.is_empty()
    }
}

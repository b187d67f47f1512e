//! Sync session: one per (client, table, filter).

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::task::JoinHandle;

use super::{
    compare_synced, find_watermark, ChangeSet, SyncParams, SyncRange, SyncReplica, SyncSource,
    WriteAheadBuffer, DELETED_FLAG,
};
use crate::db::Row;
use crate::error::{Error, Result};
use crate::pubsub::ChangeListener;

/// Counters of one sync pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncOutcome {
    /// The pass did not run because another was in flight or the
    /// write-ahead buffer was draining; a retry was scheduled.
    pub skipped: bool,
    /// Version the pass started from.
    pub watermark: Option<Value>,
    /// Client rows read.
    pub pulled: usize,
    /// Client rows written to the server.
    pub written: usize,
    /// Server rows deleted on client request.
    pub deleted: usize,
    /// Server rows sent to the client.
    pub pushed: usize,
}

struct SessionState {
    is_syncing: bool,
    watermark: Option<Value>,
    wal: WriteAheadBuffer,
    scheduled: Option<JoinHandle<()>>,
    flush: Option<JoinHandle<()>>,
}

/// Reconciles one server table (through a [`SyncSource`]) with one client
/// replica.
///
/// Passes never overlap: a pass requested while another runs, or while
/// buffered client rows are still being written, is deferred by the retry
/// delay instead of waiting.
pub struct SyncSession {
    table: String,
    channel: String,
    params: SyncParams,
    source: Arc<dyn SyncSource>,
    replica: Arc<dyn SyncReplica>,
    state: Mutex<SessionState>,
    closed: AtomicBool,
    throttle: Duration,
    wal_delay: Duration,
    retry_delay: Duration,
    this: Weak<Self>,
}

impl fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncSession")
            .field("table", &self.table)
            .field("channel", &self.channel)
            .field("params", &self.params)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Timing of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionTiming {
    /// Delay between a change notification and the pass it triggers.
    pub throttle: Duration,
    /// Delay between write-ahead buffer flushes.
    pub wal_delay: Duration,
    /// Delay before retrying a deferred pass.
    pub retry_delay: Duration,
}

impl SyncSession {
    /// Creates a session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for unusable parameters.
    pub fn new(
        table: impl Into<String>,
        channel: impl Into<String>,
        params: SyncParams,
        source: Arc<dyn SyncSource>,
        replica: Arc<dyn SyncReplica>,
        timing: SessionTiming,
    ) -> Result<Arc<Self>> {
        params.validate()?;
        Ok(Arc::new_cyclic(|this| Self {
            table: table.into(),
            channel: channel.into(),
            state: Mutex::new(SessionState {
                is_syncing: false,
                watermark: None,
                wal: WriteAheadBuffer::new(params.clone()),
                scheduled: None,
                flush: None,
            }),
            params,
            source,
            replica,
            closed: AtomicBool::new(false),
            throttle: timing.throttle,
            wal_delay: timing.wal_delay,
            retry_delay: timing.retry_delay,
            this: this.clone(),
        }))
    }

    /// Table being synced.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Channel of the session.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Session parameters.
    #[must_use]
    pub fn params(&self) -> &SyncParams {
        &self.params
    }

    /// Watermark of the last completed pass.
    #[must_use]
    pub fn watermark(&self) -> Option<Value> {
        self.state.lock().watermark.clone()
    }

    /// Whether a pass is running.
    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.state.lock().is_syncing
    }

    /// Whether the session was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops the session and cancels pending work.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.state.lock();
        for task in [state.scheduled.take(), state.flush.take()].into_iter().flatten() {
            task.abort();
        }
        tracing::debug!(table = %self.table, channel = %self.channel, "sync session closed");
    }

    /// Runs one pass now, or defers it when the session is busy.
    ///
    /// # Errors
    ///
    /// [`Error::Closed`] after [`Self::close`], otherwise errors of either
    /// side; a failed pass leaves the watermark unchanged.
    pub async fn run_pass(&self) -> Result<SyncOutcome> {
        if self.is_closed() {
            return Err(Error::Closed(format!("sync session {} is closed", self.channel)));
        }
        {
            let mut state = self.state.lock();
            if state.is_syncing || state.wal.is_draining() {
                tracing::trace!(channel = %self.channel, "sync busy, deferring pass");
                self.schedule_pass(&mut state, self.retry_delay);
                return Ok(SyncOutcome {
                    skipped: true,
                    ..SyncOutcome::default()
                });
            }
            state.is_syncing = true;
        }

        let result = self.pass().await;
        let mut state = self.state.lock();
        state.is_syncing = false;
        match result {
            Ok(outcome) => {
                state.watermark.clone_from(&outcome.watermark);
                tracing::debug!(
                    table = %self.table,
                    channel = %self.channel,
                    pulled = outcome.pulled,
                    written = outcome.written,
                    deleted = outcome.deleted,
                    pushed = outcome.pushed,
                    "sync pass done"
                );
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!(table = %self.table, channel = %self.channel, error = %e, "sync pass failed");
                Err(e)
            }
        }
    }

    async fn pass(&self) -> Result<SyncOutcome> {
        let watermark = find_watermark(self.source.as_ref(), self.replica.as_ref(), &self.params).await?;
        let mut outcome = SyncOutcome {
            watermark: watermark.clone(),
            ..SyncOutcome::default()
        };
        let limit = self.params.batch_size;

        // Client to server.
        let mut client_versions: FxHashMap<String, Option<Value>> = FxHashMap::default();
        let mut offset = 0u64;
        loop {
            let range = SyncRange {
                from_synced: watermark.clone(),
                offset,
                limit,
            };
            let batch = self.replica.pull(&range).await?;
            let received = batch.len();
            outcome.pulled += received;
            for row in &batch {
                client_versions.insert(self.params.row_key(row), self.params.synced(row).cloned());
            }
            let changes = self.plan_writes(batch).await?;
            outcome.written += changes.inserts.len() + changes.updates.len();
            outcome.deleted += changes.deletes.len();
            if !changes.is_empty() {
                self.source.apply(changes).await?;
            }
            if received < limit {
                break;
            }
            offset += received as u64;
        }

        // Server to client.
        let mut offset = 0u64;
        loop {
            let range = SyncRange {
                from_synced: watermark.clone(),
                offset,
                limit,
            };
            let rows = self.source.fetch(&range).await?;
            let received = rows.len();
            let missing: Vec<Row> = rows
                .into_iter()
                .filter(|row| match client_versions.get(&self.params.row_key(row)) {
                    Some(client) => {
                        compare_synced(client.as_ref(), self.params.synced(row)) == CmpOrdering::Less
                    }
                    None => true,
                })
                .collect();
            if !missing.is_empty() {
                outcome.pushed += missing.len();
                self.replica.push(missing).await?;
            }
            if received < limit {
                break;
            }
            offset += received as u64;
        }
        Ok(outcome)
    }

    // Client rows the server lacks, holds older, or must delete.
    async fn plan_writes(&self, rows: Vec<Row>) -> Result<ChangeSet> {
        let mut changes = ChangeSet::default();
        if rows.is_empty() {
            return Ok(changes);
        }
        let ids: Vec<Row> = rows.iter().map(|r| self.params.ids_of(r)).collect();
        let existing: FxHashMap<String, Row> = self
            .source
            .fetch_by_ids(&ids)
            .await?
            .into_iter()
            .map(|row| (self.params.row_key(&row), row))
            .collect();

        for mut row in rows {
            let key = self.params.row_key(&row);
            let deleted = row.remove(DELETED_FLAG).and_then(|v| v.as_bool()) == Some(true);
            if deleted {
                if !self.params.allow_delete {
                    tracing::debug!(table = %self.table, row = %key, "client delete ignored");
                } else if existing.contains_key(&key) {
                    changes.deletes.push(self.params.ids_of(&row));
                }
                continue;
            }
            match existing.get(&key) {
                None => changes.inserts.push(row),
                Some(server)
                    if compare_synced(self.params.synced(&row), self.params.synced(server))
                        == CmpOrdering::Greater =>
                {
                    changes.updates.push(row);
                }
                Some(_) => {}
            }
        }
        Ok(changes)
    }

    /// Starts a pass in the background.
    pub fn request_sync(&self) {
        if self.is_closed() {
            return;
        }
        let Some(session) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = session.run_pass().await {
                tracing::warn!(channel = %session.channel, error = %e, "background sync pass failed");
            }
        });
    }

    // One deferred pass at a time; later requests coalesce into it.
    fn schedule_pass(&self, state: &mut SessionState, delay: Duration) {
        if self.is_closed() || state.scheduled.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let this = self.this.clone();
        state.scheduled = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(session) = this.upgrade() {
                session.state.lock().scheduled = None;
                session.request_sync();
            }
        }));
    }

    /// Buffers client rows; they are written in throttled batches and a
    /// pass follows once the buffer is empty.
    pub fn receive(&self, rows: Vec<Row>) {
        if self.is_closed() || rows.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        state.wal.add(rows);
        if state.flush.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let this = self.this.clone();
        let delay = self.wal_delay;
        state.flush = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(session) = this.upgrade() {
                session.flush().await;
            }
        }));
    }

    async fn flush(&self) {
        let mut first = true;
        loop {
            if !first {
                tokio::time::sleep(self.wal_delay).await;
            }
            first = false;
            if self.is_closed() {
                return;
            }
            let batch = {
                let mut state = self.state.lock();
                let batch = state.wal.take_batch(self.params.batch_size);
                if batch.is_empty() {
                    state.flush = None;
                    break;
                }
                batch
            };
            let written = batch.len();
            let result = match self.plan_writes(batch).await {
                Ok(changes) if changes.is_empty() => Ok(()),
                Ok(changes) => self.source.apply(changes).await,
                Err(e) => Err(e),
            };
            self.state.lock().wal.finish_send();
            match result {
                Ok(()) => tracing::trace!(channel = %self.channel, rows = written, "buffered rows written"),
                Err(e) => tracing::warn!(channel = %self.channel, error = %e, "buffered rows dropped"),
            }
        }
        self.request_sync();
    }
}

impl ChangeListener for SyncSession {
    fn on_change(&self) {
        if self.throttle.is_zero() {
            self.request_sync();
        } else {
            let mut state = self.state.lock();
            self.schedule_pass(&mut state, self.throttle);
        }
    }

    fn on_close(&self) {
        self.close();
    }
}

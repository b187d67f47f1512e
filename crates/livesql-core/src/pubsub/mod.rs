//! Change notifications over LISTEN/NOTIFY.
//!
//! Each process registers itself as an app instance in the trigger catalog
//! and LISTENs on `<channel_prefix><app_id>`. Subscriptions and sync
//! sessions register the (table, condition) pairs they care about; the
//! shared trigger function notifies the app with the catalog ids of the
//! conditions matched by a statement, and the manager fans the notification
//! out to every local subscriber of those ids.
//!
//! A trigger whose last local reference goes away has its catalog row
//! deleted in the background; rows missed that way age out through the
//! heartbeat's pruning.
//!
//! A trigger reporting an error (usually a condition broken by a schema
//! change) wipes all of this app's catalog rows and closes every
//! subscription after telling its subscriber.

pub mod catalog;
pub mod notification;
mod subscription;
pub mod throttle;

pub use notification::TriggerNotification;
pub use subscription::{
    LiveQuery, LocalCallback, SubscriptionEvent, SubscriptionHandle, SubscriptionRequest,
    SubscriptionSink, TriggerKey,
};
pub use throttle::{Throttle, ThrottleAction, ThrottleState};

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use self::catalog::{
    install_sql, returned_id, with_catalog_lock, DROP_TRIGGERS_SQL, HEARTBEAT_SQL,
    PRUNE_APPS_SQL, PRUNE_TRIGGERS_SQL, REGISTER_APP_SQL, STALE_CHECK_SQL, TOUCH_TRIGGERS_SQL,
    UPSERT_TRIGGER_SQL, WIPE_APP_SQL,
};
use self::subscription::SubscriptionEntry;
use crate::config::PubSubConfig;
use crate::db::{DbClient, Notification, NotificationSource};
use crate::error::{Error, Result};

/// Woken when a change matches one of its triggers.
pub trait ChangeListener: Send + Sync {
    /// A matching statement committed.
    fn on_change(&self);

    /// The listener was removed by a disconnect or a catalog wipe.
    fn on_close(&self) {}
}

/// Channel name of a subscription or sync session.
///
/// `livesql.<table>.<hash>.<kind>` where the hash covers `parts`.
#[must_use]
pub fn channel_name(table: &str, kind: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hex::encode(hasher.finalize());
    format!("livesql.{table}.{}.{kind}", &digest[..16])
}

#[derive(Debug)]
struct TriggerEntry {
    catalog_id: i64,
    refs: usize,
    related_view: Option<String>,
}

struct SyncEntry {
    trigger_keys: Vec<TriggerKey>,
    socket_id: Option<String>,
    listener: Arc<dyn ChangeListener>,
}

#[derive(Default)]
struct Registry {
    triggers: FxHashMap<TriggerKey, TriggerEntry>,
    by_catalog_id: FxHashMap<i64, TriggerKey>,
    subscriptions: IndexMap<u64, Arc<SubscriptionEntry>>,
    syncs: IndexMap<u64, SyncEntry>,
}

impl Registry {
    /// Drops one reference per key. Returns the catalog ids left unreferenced.
    fn release(&mut self, keys: &[TriggerKey]) -> Vec<i64> {
        let mut released = Vec::new();
        for key in keys {
            let remove = match self.triggers.get_mut(key) {
                Some(entry) => {
                    entry.refs = entry.refs.saturating_sub(1);
                    entry.refs == 0
                }
                None => false,
            };
            if remove {
                if let Some(entry) = self.triggers.remove(key) {
                    self.by_catalog_id.remove(&entry.catalog_id);
                    released.push(entry.catalog_id);
                    tracing::debug!(table = %key.table, condition = %key.condition, "trigger released");
                }
            }
        }
        released
    }
}

/// Handle of a sync session registration.
#[derive(Clone)]
pub struct SyncRegistration {
    id: u64,
    manager: Weak<PubSubManager>,
}

impl fmt::Debug for SyncRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncRegistration").field("id", &self.id).finish()
    }
}

impl SyncRegistration {
    /// Removes the registration.
    pub fn remove(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.remove_sync(self.id);
        }
    }
}

/// Subscription and sync dispatcher of one app instance.
pub struct PubSubManager {
    db: Arc<dyn DbClient>,
    config: PubSubConfig,
    app_id: String,
    application_name: String,
    registry: Mutex<Registry>,
    // Serializes this instance's catalog writes with the registry updates
    // that follow them.
    catalog_gate: tokio::sync::Mutex<()>,
    this: Weak<Self>,
    next_id: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl fmt::Debug for PubSubManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("PubSubManager")
            .field("app_id", &self.app_id)
            .field("triggers", &registry.triggers.len())
            .field("subscriptions", &registry.subscriptions.len())
            .field("syncs", &registry.syncs.len())
            .finish_non_exhaustive()
    }
}

impl PubSubManager {
    /// Installs the catalog, registers this instance, starts listening and
    /// starts the heartbeat.
    ///
    /// # Errors
    ///
    /// Database errors from the install, the registration or the LISTEN.
    pub async fn start(
        db: Arc<dyn DbClient>,
        source: Arc<dyn NotificationSource>,
        config: PubSubConfig,
        schema: &str,
        application_name: &str,
    ) -> Result<Arc<Self>> {
        let app_id = uuid::Uuid::new_v4().simple().to_string();

        let ddl = install_sql(schema, &config.channel_prefix)?;
        let tx = db.begin().await?;
        match tx.batch_execute(&ddl).await {
            Ok(()) => tx.commit().await?,
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::error!(error = %rollback, "catalog install rollback failed");
                }
                return Err(e);
            }
        }

        let manager = Arc::new_cyclic(|this| Self {
            db,
            config,
            app_id,
            application_name: application_name.to_string(),
            registry: Mutex::new(Registry::default()),
            catalog_gate: tokio::sync::Mutex::new(()),
            this: this.clone(),
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        manager.register_app().await?;

        let receiver = source.listen(&manager.listen_channel()).await?;
        let listener = tokio::spawn(listen_loop(Arc::downgrade(&manager), receiver));
        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::downgrade(&manager),
            manager.config.heartbeat(),
        ));
        manager.tasks.lock().extend([listener, heartbeat]);

        tracing::info!(app_id = %manager.app_id, channel = %manager.listen_channel(), "pubsub started");
        Ok(manager)
    }

    /// Identifier of this app instance.
    #[must_use]
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// LISTEN channel of this app instance.
    #[must_use]
    pub fn listen_channel(&self) -> String {
        format!("{}{}", self.config.channel_prefix, self.app_id)
    }

    /// Active subscription count.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.registry.lock().subscriptions.len()
    }

    /// Active sync registration count.
    #[must_use]
    pub fn sync_count(&self) -> usize {
        self.registry.lock().syncs.len()
    }

    /// Registered (table, condition) pairs.
    #[must_use]
    pub fn trigger_keys(&self) -> Vec<TriggerKey> {
        let mut keys: Vec<_> = self.registry.lock().triggers.keys().cloned().collect();
        keys.sort();
        keys
    }

    async fn register_app(&self) -> Result<()> {
        self.db
            .execute(
                REGISTER_APP_SQL,
                &[
                    Value::from(self.app_id.as_str()),
                    Value::from(self.application_name.as_str()),
                    Value::from(self.config.heartbeat_ms),
                ],
            )
            .await?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed("pubsub manager is shut down".into()))
        } else {
            Ok(())
        }
    }

    // Adds a reference to a known trigger.
    fn reference(&self, key: &TriggerKey) -> bool {
        match self.registry.lock().triggers.get_mut(key) {
            Some(entry) => {
                entry.refs += 1;
                true
            }
            None => false,
        }
    }

    // Registers or references every trigger, upserting unknown ones.
    async fn acquire(&self, triggers: &[(TriggerKey, Option<String>)]) -> Result<()> {
        for (key, view) in triggers {
            if self.reference(key) {
                continue;
            }
            let _gate = self.catalog_gate.lock().await;
            if self.reference(key) {
                continue;
            }
            let catalog_id = self.upsert_trigger(key, view.as_deref()).await?;
            let mut registry = self.registry.lock();
            registry.by_catalog_id.insert(catalog_id, key.clone());
            registry
                .triggers
                .entry(key.clone())
                .or_insert_with(|| TriggerEntry {
                    catalog_id,
                    refs: 0,
                    related_view: view.clone(),
                })
                .refs += 1;
            tracing::debug!(table = %key.table, condition = %key.condition, catalog_id, "trigger registered");
        }
        Ok(())
    }

    async fn upsert_trigger(&self, key: &TriggerKey, view: Option<&str>) -> Result<i64> {
        let params = vec![
            Value::from(self.app_id.as_str()),
            Value::from(key.table.as_str()),
            Value::from(key.condition.as_str()),
            view.map_or(Value::Null, Value::from),
        ];
        with_catalog_lock(self.db.as_ref(), &self.config, move |tx| {
            let params = params.clone();
            Box::pin(async move {
                let rows = tx.query(UPSERT_TRIGGER_SQL, &params).await?;
                returned_id(&rows)
            })
        })
        .await
    }

    /// Registers a subscription. Local subscribers are ready at once; socket
    /// subscribers receive data after [`Self::mark_ready`].
    ///
    /// # Errors
    ///
    /// Catalog errors while registering the triggers.
    pub async fn add_subscription(
        self: &Arc<Self>,
        request: SubscriptionRequest,
    ) -> Result<SubscriptionHandle> {
        self.ensure_open()?;
        if request.triggers.is_empty() {
            return Err(Error::Validation(format!(
                "table '{}' has no base table to watch",
                request.table
            )));
        }
        self.acquire(&request.triggers).await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let local = matches!(request.sink, SubscriptionSink::Local(_));
        let entry = Arc::new(SubscriptionEntry::new(id, request));
        let handle = SubscriptionHandle {
            id,
            channel: entry.channel.clone(),
            manager: Arc::downgrade(self),
        };
        self.registry.lock().subscriptions.insert(id, Arc::clone(&entry));
        tracing::debug!(
            table = %entry.table,
            channel = %entry.channel,
            socket_id = entry.socket_id().unwrap_or("local"),
            "subscription added"
        );
        if local {
            entry.mark_ready();
        }
        Ok(handle)
    }

    /// Starts the initial push of the socket subscriptions on `channel`.
    pub fn mark_ready(&self, socket_id: &str, channel: &str) {
        let entries: Vec<_> = self
            .registry
            .lock()
            .subscriptions
            .values()
            .filter(|e| e.channel == channel && e.socket_id() == Some(socket_id))
            .cloned()
            .collect();
        for entry in entries {
            entry.mark_ready();
        }
    }

    pub(crate) fn remove_subscription(&self, id: u64) {
        let released = {
            let mut registry = self.registry.lock();
            let Some(entry) = registry.subscriptions.shift_remove(&id) else {
                return;
            };
            entry.close();
            tracing::debug!(channel = %entry.channel, "subscription removed");
            registry.release(&entry.trigger_keys)
        };
        self.drop_released(released);
    }

    /// Registers a sync session's interest in `triggers`.
    ///
    /// # Errors
    ///
    /// Catalog errors while registering the triggers.
    pub async fn add_sync(
        self: &Arc<Self>,
        triggers: Vec<(TriggerKey, Option<String>)>,
        socket_id: Option<String>,
        listener: Arc<dyn ChangeListener>,
    ) -> Result<SyncRegistration> {
        self.ensure_open()?;
        self.acquire(&triggers).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.lock().syncs.insert(
            id,
            SyncEntry {
                trigger_keys: triggers.into_iter().map(|(key, _)| key).collect(),
                socket_id,
                listener,
            },
        );
        Ok(SyncRegistration {
            id,
            manager: Arc::downgrade(self),
        })
    }

    pub(crate) fn remove_sync(&self, id: u64) {
        let released = {
            let mut registry = self.registry.lock();
            match registry.syncs.shift_remove(&id) {
                Some(entry) => registry.release(&entry.trigger_keys),
                None => return,
            }
        };
        self.drop_released(released);
    }

    /// Removes every subscription and sync session owned by `socket_id`.
    ///
    /// Runs under a single registry lock so no delivery can start for the
    /// socket once this returns.
    pub fn on_socket_disconnect(&self, socket_id: &str) {
        let (closed_syncs, released) = {
            let mut registry = self.registry.lock();
            let mut released = Vec::new();
            let subs: Vec<u64> = registry
                .subscriptions
                .iter()
                .filter(|(_, e)| e.socket_id() == Some(socket_id))
                .map(|(id, _)| *id)
                .collect();
            for id in subs {
                if let Some(entry) = registry.subscriptions.shift_remove(&id) {
                    entry.close();
                    released.extend(registry.release(&entry.trigger_keys));
                }
            }
            let syncs: Vec<u64> = registry
                .syncs
                .iter()
                .filter(|(_, e)| e.socket_id.as_deref() == Some(socket_id))
                .map(|(id, _)| *id)
                .collect();
            let mut closed = Vec::with_capacity(syncs.len());
            for id in syncs {
                if let Some(entry) = registry.syncs.shift_remove(&id) {
                    released.extend(registry.release(&entry.trigger_keys));
                    closed.push(entry.listener);
                }
            }
            (closed, released)
        };
        for listener in closed_syncs {
            listener.on_close();
        }
        self.drop_released(released);
        tracing::debug!(socket_id = %socket_id, "socket state removed");
    }

    // Deletes the catalog rows of released triggers from a background task.
    fn drop_released(&self, ids: Vec<i64>) {
        if ids.is_empty() || self.closed.load(Ordering::Acquire) {
            return;
        }
        let Some(manager) = self.this.upgrade() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(count = ids.len(), "no runtime, released triggers left to pruning");
            return;
        };
        runtime.spawn(async move {
            if let Err(e) = manager.delete_triggers(ids).await {
                tracing::warn!(error = %e, "deleting released triggers failed, left to pruning");
            }
        });
    }

    async fn delete_triggers(&self, ids: Vec<i64>) -> Result<()> {
        let _gate = self.catalog_gate.lock().await;
        // A trigger may have been registered again since its release.
        let ids: Vec<Value> = {
            let registry = self.registry.lock();
            ids.into_iter()
                .filter(|id| !registry.by_catalog_id.contains_key(id))
                .map(Value::from)
                .collect()
        };
        if ids.is_empty() {
            return Ok(());
        }
        let count = ids.len();
        let params = vec![
            Value::from(self.app_id.as_str()),
            Value::from(crate::sql::pg_array_literal(&ids)?),
        ];
        with_catalog_lock(self.db.as_ref(), &self.config, move |tx| {
            let params = params.clone();
            Box::pin(async move {
                tx.execute(DROP_TRIGGERS_SQL, &params).await?;
                Ok(())
            })
        })
        .await?;
        tracing::debug!(count, "released triggers deleted");
        Ok(())
    }

    /// Routes a raw notification.
    pub fn handle_notification(self: &Arc<Self>, payload: &str) {
        let parsed = match TriggerNotification::parse(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unexpected notification");
                return;
            }
        };
        match parsed {
            TriggerNotification::DataChanged {
                table,
                op,
                condition_ids,
            } => self.dispatch(&table, &op, &condition_ids),
            TriggerNotification::Error { table, op, message } => {
                tracing::warn!(table = %table, op = %op, message = %message, "trigger error, wiping app triggers");
                let manager = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = manager.wipe(&table, &message).await {
                        tracing::error!(error = %e, "trigger wipe failed");
                    }
                });
            }
        }
    }

    fn dispatch(&self, table: &str, op: &str, condition_ids: &[i64]) {
        let (subs, syncs) = {
            let registry = self.registry.lock();
            let keys: Vec<&TriggerKey> = condition_ids
                .iter()
                .filter_map(|id| registry.by_catalog_id.get(id))
                .collect();
            if keys.is_empty() {
                tracing::debug!(table = %table, ?condition_ids, "no local trigger for notification");
                return;
            }
            let subs: Vec<_> = registry
                .subscriptions
                .values()
                .filter(|s| s.trigger_keys.iter().any(|k| keys.contains(&k)))
                .cloned()
                .collect();
            let syncs: Vec<_> = registry
                .syncs
                .values()
                .filter(|s| s.trigger_keys.iter().any(|k| keys.contains(&k)))
                .map(|s| Arc::clone(&s.listener))
                .collect();
            (subs, syncs)
        };
        tracing::trace!(table = %table, op = %op, subscriptions = subs.len(), syncs = syncs.len(), "dispatching change");
        for listener in syncs {
            listener.on_change();
        }
        for sub in subs {
            sub.notify();
        }
    }

    async fn wipe(&self, table: &str, message: &str) -> Result<()> {
        let app_id = self.app_id.clone();
        with_catalog_lock(self.db.as_ref(), &self.config, move |tx| {
            let app_id = app_id.clone();
            Box::pin(async move {
                tx.execute(WIPE_APP_SQL, &[Value::from(app_id)]).await?;
                Ok(())
            })
        })
        .await?;

        let (subs, syncs) = {
            let mut registry = self.registry.lock();
            registry.triggers.clear();
            registry.by_catalog_id.clear();
            let subs: Vec<_> = registry.subscriptions.drain(..).map(|(_, s)| s).collect();
            let syncs: Vec<_> = registry.syncs.drain(..).map(|(_, s)| s.listener).collect();
            (subs, syncs)
        };
        let error = Error::Internal(format!(
            "change tracking on '{table}' failed and was reset: {message}"
        ))
        .to_payload();
        for sub in subs {
            sub.push_error(error.clone());
            sub.close();
        }
        for listener in syncs {
            listener.on_close();
        }
        Ok(())
    }

    /// Refreshes this instance's liveness, re-registers it if it was
    /// pruned, and prunes stale apps and triggers.
    ///
    /// # Errors
    ///
    /// Database and catalog lock errors.
    pub async fn heartbeat(&self) -> Result<()> {
        let app_id = Value::from(self.app_id.as_str());
        let updated = self.db.execute(HEARTBEAT_SQL, &[app_id.clone()]).await?;
        if updated == 0 {
            tracing::warn!(app_id = %self.app_id, "app row was pruned, registering again");
            self.register_app().await?;
            self.reregister_triggers().await?;
        }

        let ids: Vec<Value> = {
            let registry = self.registry.lock();
            let mut ids: Vec<i64> = registry.triggers.values().map(|t| t.catalog_id).collect();
            ids.sort_unstable();
            ids.into_iter().map(Value::from).collect()
        };
        if !ids.is_empty() {
            let array = crate::sql::pg_array_literal(&ids)?;
            self.db
                .execute(TOUCH_TRIGGERS_SQL, &[app_id, Value::from(array)])
                .await?;
        }

        let stale_ms = Value::from(
            u64::try_from(self.config.stale_after().as_millis()).unwrap_or(u64::MAX),
        );
        let rows = self.db.query(STALE_CHECK_SQL, &[stale_ms.clone()]).await?;
        let stale = rows
            .first()
            .and_then(|r| r.get("stale"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if stale {
            with_catalog_lock(self.db.as_ref(), &self.config, move |tx| {
                let stale_ms = stale_ms.clone();
                Box::pin(async move {
                    let apps = tx.execute(PRUNE_APPS_SQL, &[stale_ms.clone()]).await?;
                    let triggers = tx.execute(PRUNE_TRIGGERS_SQL, &[stale_ms]).await?;
                    tracing::debug!(apps, triggers, "pruned stale catalog rows");
                    Ok(())
                })
            })
            .await?;
        }
        Ok(())
    }

    async fn reregister_triggers(&self) -> Result<()> {
        let _gate = self.catalog_gate.lock().await;
        let keys: Vec<(TriggerKey, Option<String>)> = self
            .registry
            .lock()
            .triggers
            .iter()
            .map(|(k, e)| (k.clone(), e.related_view.clone()))
            .collect();
        for (key, view) in keys {
            let catalog_id = self.upsert_trigger(&key, view.as_deref()).await?;
            let mut registry = self.registry.lock();
            let previous = match registry.triggers.get_mut(&key) {
                Some(entry) => std::mem::replace(&mut entry.catalog_id, catalog_id),
                None => continue,
            };
            registry.by_catalog_id.remove(&previous);
            registry.by_catalog_id.insert(catalog_id, key);
        }
        Ok(())
    }

    /// Stops the background tasks and closes every subscription.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let mut registry = self.registry.lock();
        for (_, sub) in registry.subscriptions.drain(..) {
            sub.close();
        }
        for (_, sync) in registry.syncs.drain(..) {
            sync.listener.on_close();
        }
        registry.triggers.clear();
        registry.by_catalog_id.clear();
        tracing::info!(app_id = %self.app_id, "pubsub stopped");
    }
}

impl Drop for PubSubManager {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn listen_loop(manager: Weak<PubSubManager>, mut receiver: mpsc::UnboundedReceiver<Notification>) {
    while let Some(notification) = receiver.recv().await {
        let Some(manager) = manager.upgrade() else {
            return;
        };
        manager.handle_notification(&notification.payload);
    }
    tracing::warn!("notification stream closed");
}

async fn heartbeat_loop(manager: Weak<PubSubManager>, period: std::time::Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(manager) = manager.upgrade() else {
            return;
        };
        if let Err(e) = manager.heartbeat().await {
            tracing::error!(app_id = %manager.app_id, error = %e, "heartbeat failed");
        }
    }
}

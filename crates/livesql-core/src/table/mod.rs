//! The `Dbo` database object and its per-table handles.
//!
//! A [`Dbo`] bundles the database client, the introspected schema and join
//! graph (swapped atomically on refresh), the configuration, the caller's
//! [`Access`] and, once enabled, the pub/sub manager. It is cheap to clone;
//! [`Dbo::with_access`] derives a handle for a permissioned caller and
//! [`Dbo::transaction`] one bound to a single transaction.

mod handle;
mod live;

pub use handle::{FindParams, TableHandle};
pub use live::{SubscribeParams, SyncHandshake, SyncOptions, TableSyncSource};

use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;
use dashmap::DashMap;

use crate::config::LiveSqlConfig;
use crate::db::{DbClient, DbTransaction, NotificationSource, Row};
use crate::error::{Error, Result};
use crate::joins::{Join, JoinGraph};
use crate::pubsub::{PubSubManager, SyncRegistration};
use crate::query::QueryContext;
use crate::rules::Access;
use crate::schema::{introspect, Schema};
use crate::sync::SyncSession;

struct SessionEntry {
    socket_id: Option<String>,
    session: Arc<SyncSession>,
    registration: Option<SyncRegistration>,
}

struct DboShared {
    db: Arc<dyn DbClient>,
    schema: ArcSwap<Schema>,
    joins: ArcSwap<JoinGraph>,
    join_config: Option<Vec<Join>>,
    config: LiveSqlConfig,
    pubsub: OnceLock<Arc<PubSubManager>>,
    sessions: DashMap<String, SessionEntry>,
}

/// Entry point of every table operation.
#[derive(Clone)]
pub struct Dbo {
    shared: Arc<DboShared>,
    client: Arc<dyn DbClient>,
    tx: Option<Arc<dyn DbTransaction>>,
    access: Access,
}

impl fmt::Debug for Dbo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dbo")
            .field("tables", &self.shared.schema.load().len())
            .field("in_transaction", &self.tx.is_some())
            .field("access", &self.access)
            .finish_non_exhaustive()
    }
}

impl Dbo {
    /// Creates a trusted `Dbo` over an already known schema.
    #[must_use]
    pub fn new(db: Arc<dyn DbClient>, schema: Schema, joins: JoinGraph, config: LiveSqlConfig) -> Self {
        let shared = Arc::new(DboShared {
            db: Arc::clone(&db),
            schema: ArcSwap::from_pointee(schema),
            joins: ArcSwap::from_pointee(joins),
            join_config: None,
            config,
            pubsub: OnceLock::new(),
            sessions: DashMap::new(),
        });
        Self {
            shared,
            client: db,
            tx: None,
            access: Access::Trusted,
        }
    }

    /// Introspects the configured schema. Joins come from `joins` when
    /// given, otherwise from foreign keys.
    ///
    /// # Errors
    ///
    /// Database errors and invalid join definitions.
    pub async fn introspect(
        db: Arc<dyn DbClient>,
        config: LiveSqlConfig,
        joins: Option<Vec<Join>>,
    ) -> Result<Self> {
        let schema = introspect(db.as_ref(), &config.database.schema).await?;
        let graph = build_graph(&schema, joins.as_deref())?;
        tracing::info!(
            schema = %config.database.schema,
            tables = schema.len(),
            joins = graph.joins().len(),
            "schema introspected"
        );
        let mut dbo = Self::new(Arc::clone(&db), schema, graph, config);
        if let Some(shared) = Arc::get_mut(&mut dbo.shared) {
            shared.join_config = joins;
        }
        Ok(dbo)
    }

    /// Connects to PostgreSQL, introspects the schema and enables pub/sub.
    ///
    /// # Errors
    ///
    /// Connection, introspection and catalog errors.
    #[cfg(feature = "postgres")]
    pub async fn connect(config: LiveSqlConfig) -> Result<Self> {
        let pg = crate::db::PgDatabase::connect(
            &config.database.url,
            &config.database.application_name,
        )
        .await?;
        let pg = Arc::new(pg);
        let dbo = Self::introspect(pg.clone(), config, None).await?;
        dbo.enable_pubsub(pg).await?;
        Ok(dbo)
    }

    /// Re-reads the schema and swaps schema and join graph together.
    ///
    /// # Errors
    ///
    /// Database errors and joins that no longer match the schema.
    pub async fn refresh_schema(&self) -> Result<()> {
        let schema = introspect(self.shared.db.as_ref(), &self.shared.config.database.schema).await?;
        let graph = build_graph(&schema, self.shared.join_config.as_deref())?;
        self.shared.schema.store(Arc::new(schema));
        self.shared.joins.store(Arc::new(graph));
        tracing::info!("schema refreshed");
        Ok(())
    }

    /// Same database and state, different caller.
    #[must_use]
    pub fn with_access(&self, access: Access) -> Self {
        Self {
            access,
            ..self.clone()
        }
    }

    /// Caller authorization.
    #[must_use]
    pub fn access(&self) -> &Access {
        &self.access
    }

    /// Current schema.
    #[must_use]
    pub fn schema(&self) -> Arc<Schema> {
        self.shared.schema.load_full()
    }

    /// Current join graph.
    #[must_use]
    pub fn joins(&self) -> Arc<JoinGraph> {
        self.shared.joins.load_full()
    }

    /// Configuration.
    #[must_use]
    pub fn config(&self) -> &LiveSqlConfig {
        &self.shared.config
    }

    /// Handle on one table or view.
    #[must_use]
    pub fn table(&self, name: &str) -> TableHandle {
        TableHandle::new(self.clone(), name)
    }

    /// Whether this handle runs inside a transaction.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// Runs `f` against a `Dbo` bound to one transaction: committed when
    /// `f` succeeds, rolled back otherwise. Inside a transaction `f` simply
    /// runs in the enclosing one.
    ///
    /// # Errors
    ///
    /// The error returned by `f`, or a database error on begin/commit.
    pub async fn transaction<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Dbo) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.tx.is_some() {
            return f(self.clone()).await;
        }
        let tx = self.shared.db.begin().await?;
        let bound = Self {
            shared: Arc::clone(&self.shared),
            client: Arc::clone(&tx).as_client(),
            tx: Some(Arc::clone(&tx)),
            access: self.access.clone(),
        };
        match f(bound).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::error!(error = %rollback, "transaction rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Starts change notifications. Idempotent.
    ///
    /// # Errors
    ///
    /// Catalog install and LISTEN errors.
    pub async fn enable_pubsub(&self, source: Arc<dyn NotificationSource>) -> Result<Arc<PubSubManager>> {
        if let Some(manager) = self.shared.pubsub.get() {
            return Ok(Arc::clone(manager));
        }
        let manager = PubSubManager::start(
            Arc::clone(&self.shared.db),
            source,
            self.shared.config.pubsub.clone(),
            &self.shared.config.database.schema,
            &self.shared.config.database.application_name,
        )
        .await?;
        match self.shared.pubsub.set(Arc::clone(&manager)) {
            Ok(()) => Ok(manager),
            Err(_) => {
                // Lost a concurrent start; keep the first manager.
                manager.shutdown();
                self.shared
                    .pubsub
                    .get()
                    .cloned()
                    .ok_or_else(|| Error::Internal("pubsub manager vanished".into()))
            }
        }
    }

    /// The pub/sub manager, once enabled.
    #[must_use]
    pub fn pubsub(&self) -> Option<&Arc<PubSubManager>> {
        self.shared.pubsub.get()
    }

    pub(crate) fn require_pubsub(&self) -> Result<Arc<PubSubManager>> {
        self.shared
            .pubsub
            .get()
            .cloned()
            .ok_or_else(|| Error::Validation("change notifications are not enabled".into()))
    }

    /// A socket client is ready to receive on `channel`: subscriptions push
    /// their initial data and sync sessions start their first pass.
    pub fn mark_ready(&self, socket_id: &str, channel: &str) {
        if let Some(manager) = self.pubsub() {
            manager.mark_ready(socket_id, channel);
        }
        if let Some(entry) = self.shared.sessions.get(channel) {
            if entry.socket_id.as_deref() == Some(socket_id) {
                entry.session.request_sync();
            }
        }
    }

    /// Rows pushed by a sync client on `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] for unknown or closed sessions.
    pub fn on_sync_data(&self, channel: &str, rows: Vec<Row>) -> Result<()> {
        let entry = self
            .shared
            .sessions
            .get(channel)
            .ok_or_else(|| Error::Closed(format!("no sync session on channel {channel}")))?;
        if entry.session.is_closed() {
            return Err(Error::Closed(format!("sync session {channel} is closed")));
        }
        entry.session.receive(rows);
        Ok(())
    }

    /// Removes everything `socket_id` owns.
    pub fn on_socket_disconnect(&self, socket_id: &str) {
        if let Some(manager) = self.pubsub() {
            manager.on_socket_disconnect(socket_id);
        }
        self.shared.sessions.retain(|_, entry| {
            if entry.socket_id.as_deref() == Some(socket_id) {
                entry.session.close();
                false
            } else {
                true
            }
        });
    }

    /// Stops pub/sub and every sync session.
    pub fn shutdown(&self) {
        if let Some(manager) = self.pubsub() {
            manager.shutdown();
        }
        for entry in self.shared.sessions.iter() {
            if let Some(registration) = &entry.registration {
                registration.remove();
            }
            entry.session.close();
        }
        self.shared.sessions.clear();
    }

    pub(crate) fn register_session(
        &self,
        session: Arc<SyncSession>,
        socket_id: Option<String>,
        registration: Option<SyncRegistration>,
    ) {
        let channel = session.channel().to_string();
        if let Some((_, previous)) = self.shared.sessions.remove(&channel) {
            if let Some(registration) = previous.registration {
                registration.remove();
            }
            previous.session.close();
        }
        self.shared.sessions.insert(
            channel,
            SessionEntry {
                socket_id,
                session,
                registration,
            },
        );
    }

    pub(crate) fn client(&self) -> &dyn DbClient {
        self.client.as_ref()
    }

    pub(crate) fn tx(&self) -> Option<&Arc<dyn DbTransaction>> {
        self.tx.as_ref()
    }

    // Outside of any transaction, for work that outlives the caller.
    pub(crate) fn detached(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            client: Arc::clone(&self.shared.db),
            tx: None,
            access: self.access.clone(),
        }
    }

    pub(crate) fn query_context<'a>(&'a self, schema: &'a Schema, joins: &'a JoinGraph) -> QueryContext<'a> {
        QueryContext {
            schema,
            joins,
            access: &self.access,
            config: &self.shared.config.query,
            params: None,
        }
    }
}

fn build_graph(schema: &Schema, joins: Option<&[Join]>) -> Result<JoinGraph> {
    match joins {
        Some(joins) => JoinGraph::new(joins.to_vec(), schema),
        None => Ok(JoinGraph::from_foreign_keys(schema)),
    }
}

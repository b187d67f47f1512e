//! Subscriptions and sync sessions of a table handle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::handle::{FindParams, TableHandle};
use crate::db::Row;
use crate::error::{Error, Result};
use crate::filter::and_filters;
use crate::mutation::{DeleteParams, InsertParams, UpdateParams};
use crate::pubsub::{
    channel_name, LiveQuery, LocalCallback, SubscriptionHandle, SubscriptionRequest,
    SubscriptionSink, TriggerKey,
};
use crate::query::{build_filter, build_query};
use crate::rules::Command;
use crate::sync::{
    ChangeSet, SessionTiming, SocketReplica, SyncInfo, SyncParams, SyncRange, SyncReplica,
    SyncSession, SyncSource,
};

/// Options of `subscribe`: a find request plus a push throttle.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscribeParams {
    /// Query re-run on every push.
    #[serde(flatten)]
    pub find: FindParams,
    /// Minimum delay between pushes in milliseconds.
    pub throttle: Option<u64>,
}

/// Options of a trusted `sync`; a sync rule replaces them for permissioned
/// callers.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    /// Columns identifying a row.
    pub id_fields: Vec<String>,
    /// Column holding the row version.
    pub synced_field: String,
    /// Whether client deletions are applied.
    pub allow_delete: bool,
    /// Rows per batch.
    pub batch_size: Option<usize>,
    /// Minimum delay between notification-driven passes in milliseconds.
    pub throttle: Option<u64>,
}

/// Reply to a socket client's sync request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncHandshake {
    /// Channel the session talks on.
    #[serde(rename = "channelName")]
    pub channel_name: String,
    /// Columns identifying a row.
    pub id_fields: Vec<String>,
    /// Column holding the row version.
    pub synced_field: String,
}

struct FindQuery {
    table: TableHandle,
    filter: Value,
    params: FindParams,
}

#[async_trait]
impl LiveQuery for FindQuery {
    async fn run(&self) -> Result<Vec<Row>> {
        self.table.find(&self.filter, &self.params).await
    }
}

impl TableHandle {
    /// Watches the rows matching `filter`.
    ///
    /// Data goes to `on_data` when given, otherwise to the caller's socket
    /// on the returned channel once the client marks it ready.
    ///
    /// # Errors
    ///
    /// Everything `find` rejects, views without base tables, callers with
    /// neither callback nor socket, and catalog errors.
    pub async fn subscribe(
        &self,
        filter: &Value,
        params: &SubscribeParams,
        on_data: Option<LocalCallback>,
    ) -> Result<SubscriptionHandle> {
        self.subscribe_inner(filter, params, on_data)
            .await
            .map_err(|e| e.within(self.name(), "subscribe"))
    }

    async fn subscribe_inner(
        &self,
        filter: &Value,
        params: &SubscribeParams,
        on_data: Option<LocalCallback>,
    ) -> Result<SubscriptionHandle> {
        let dbo = self.dbo();
        let manager = dbo.require_pubsub()?;
        let sink = match (on_data, dbo.access().socket()) {
            (Some(callback), _) => SubscriptionSink::Local(callback),
            (None, Some(socket)) => SubscriptionSink::Socket(Arc::clone(socket)),
            (None, None) => {
                return Err(Error::Validation(
                    "subscribe needs a data callback or a socket client".into(),
                ))
            }
        };

        let schema = dbo.schema();
        let joins = dbo.joins();
        let ctx = dbo.query_context(&schema, &joins);
        build_query(ctx, self.name(), &params.find.to_request(filter)).await?;
        let triggers = self.trigger_keys(filter).await?;

        let permit = ctx.access.permit(self.name(), Command::Select).await?;
        let requested = params.throttle.unwrap_or(dbo.config().pubsub.default_throttle_ms);
        let floor = permit.subscribe().and_then(|r| r.throttle_ms).unwrap_or(0);
        let throttle = Duration::from_millis(requested.max(floor));

        let identity = json!({
            "filter": filter,
            "select": params.find.select,
            "orderBy": params.find.order_by,
            "limit": params.find.limit,
            "offset": params.find.offset,
        })
        .to_string();
        let channel = channel_name(self.name(), "sub", &[&identity]);

        let query = Arc::new(FindQuery {
            table: dbo.detached().table(self.name()),
            filter: filter.clone(),
            params: FindParams {
                expect_one: false,
                ..params.find.clone()
            },
        });
        manager
            .add_subscription(SubscriptionRequest {
                table: self.name().to_string(),
                triggers,
                channel,
                sink,
                query,
                throttle,
            })
            .await
    }

    // Base tables with the condition their triggers evaluate. A view maps
    // to every parent table, unconditionally.
    async fn trigger_keys(&self, filter: &Value) -> Result<Vec<(TriggerKey, Option<String>)>> {
        let dbo = self.dbo();
        let schema = dbo.schema();
        let joins = dbo.joins();
        let info = schema.require(self.name())?;
        if info.is_view {
            if info.parent_tables.is_empty() {
                return Err(Error::Validation(format!(
                    "view '{}' has no known base tables and cannot be watched",
                    info.name
                )));
            }
            return Ok(info
                .parent_tables
                .iter()
                .map(|parent| (TriggerKey::new(parent.as_str(), "TRUE"), Some(info.name.clone())))
                .collect());
        }

        let ctx = dbo.query_context(&schema, &joins);
        let permit = ctx.access.permit(self.name(), Command::Select).await?;
        let rule = permit.select(self.name())?;
        let allowed = permit.select_fields(info)?;
        let filter_allowed = match rule.and_then(|r| r.filter_fields.as_ref()) {
            Some(fields) => fields.resolve(info)?,
            None => allowed,
        };
        let compiled = build_filter(
            ctx,
            info,
            filter,
            &filter_allowed,
            rule.and_then(|r| r.forced_filter.as_ref()),
            &[],
        )
        .await?;
        tracing::debug!(table = %info.name, condition = %compiled.condition(), "trigger condition");
        Ok(vec![(TriggerKey::new(info.name.as_str(), compiled.condition()), None)])
    }

    /// Starts a sync session with the caller's socket client.
    ///
    /// The first pass runs once the client marks the returned channel ready.
    ///
    /// # Errors
    ///
    /// Missing sync permission or socket, unusable sync parameters, and
    /// catalog errors.
    pub async fn sync(&self, filter: &Value, options: &SyncOptions) -> Result<SyncHandshake> {
        self.sync_socket(filter, options)
            .await
            .map_err(|e| e.within(self.name(), "sync"))
    }

    async fn sync_socket(&self, filter: &Value, options: &SyncOptions) -> Result<SyncHandshake> {
        let socket = self
            .dbo()
            .access()
            .socket()
            .cloned()
            .ok_or_else(|| Error::Validation("sync requires a socket client".into()))?;
        let socket_id = socket.id().to_string();
        let (params, throttle) = self.sync_params(options).await?;
        let channel = channel_name(
            self.name(),
            "sync",
            &[&socket_id, &filter.to_string(), &params.id_fields.join(","), &params.synced_field],
        );
        let replica = Arc::new(SocketReplica::new(socket, channel.clone()));
        let session = self
            .start_session(filter, params, throttle, channel, replica, Some(socket_id))
            .await?;
        Ok(SyncHandshake {
            channel_name: session.channel().to_string(),
            id_fields: session.params().id_fields.clone(),
            synced_field: session.params().synced_field.clone(),
        })
    }

    /// Starts a sync session with an in-process replica.
    ///
    /// Passes run on change notifications and on [`SyncSession::run_pass`].
    ///
    /// # Errors
    ///
    /// Same as [`Self::sync`], socket aside.
    pub async fn sync_with(
        &self,
        filter: &Value,
        options: &SyncOptions,
        replica: Arc<dyn SyncReplica>,
    ) -> Result<Arc<SyncSession>> {
        async {
            let (params, throttle) = self.sync_params(options).await?;
            let channel = channel_name(
                self.name(),
                "sync",
                &["local", &filter.to_string(), &params.id_fields.join(","), &params.synced_field],
            );
            self.start_session(filter, params, throttle, channel, replica, None)
                .await
        }
        .await
        .map_err(|e| e.within(self.name(), "sync"))
    }

    async fn sync_params(&self, options: &SyncOptions) -> Result<(SyncParams, Duration)> {
        let dbo = self.dbo();
        let schema = dbo.schema();
        let info = schema.require(self.name())?;
        if info.is_view {
            return Err(Error::Validation(format!("view '{}' cannot be synced", info.name)));
        }
        let permit = dbo.access().permit(self.name(), Command::Sync).await?;
        let default_batch = dbo.config().sync.batch_size;
        let (params, throttle_ms) = match permit.sync(self.name())? {
            Some(rule) => (
                SyncParams {
                    id_fields: rule.id_fields.clone(),
                    synced_field: rule.synced_field.clone(),
                    allow_delete: rule.allow_delete,
                    batch_size: rule.batch_size.unwrap_or(default_batch),
                },
                rule.throttle_ms,
            ),
            None => (
                SyncParams {
                    id_fields: options.id_fields.clone(),
                    synced_field: options.synced_field.clone(),
                    allow_delete: options.allow_delete,
                    batch_size: options.batch_size.unwrap_or(default_batch),
                },
                options.throttle,
            ),
        };
        params.validate()?;
        for field in params.id_fields.iter().chain([&params.synced_field]) {
            if !info.has_column(field) {
                return Err(Error::Validation(format!(
                    "sync field '{field}' does not exist in table '{}'",
                    info.name
                )));
            }
        }
        let throttle = throttle_ms.unwrap_or(dbo.config().pubsub.default_throttle_ms);
        Ok((params, Duration::from_millis(throttle)))
    }

    async fn start_session(
        &self,
        filter: &Value,
        params: SyncParams,
        throttle: Duration,
        channel: String,
        replica: Arc<dyn SyncReplica>,
        socket_id: Option<String>,
    ) -> Result<Arc<SyncSession>> {
        let dbo = self.dbo();
        let first_page = FindParams {
            limit: Some(1),
            ..FindParams::default()
        };
        self.find(filter, &first_page).await?;

        let source = Arc::new(TableSyncSource::new(
            dbo.detached().table(self.name()),
            filter.clone(),
            params.clone(),
        ));
        let timing = SessionTiming {
            throttle,
            wal_delay: Duration::from_millis(dbo.config().sync.wal_throttle_ms),
            retry_delay: Duration::from_millis(dbo.config().sync.retry_delay_ms),
        };
        let session = SyncSession::new(self.name(), channel, params, source, replica, timing)?;

        let registration = match dbo.pubsub() {
            Some(manager) => {
                let triggers = self.trigger_keys(filter).await?;
                let listener = Arc::clone(&session);
                Some(manager.add_sync(triggers, socket_id.clone(), listener).await?)
            }
            None => None,
        };
        tracing::debug!(
            table = %self.name(),
            channel = %session.channel(),
            socket_id = socket_id.as_deref().unwrap_or("local"),
            "sync session started"
        );
        dbo.register_session(Arc::clone(&session), socket_id, registration);
        Ok(session)
    }
}

/// Server side of a sync session: the rows of one table matching a filter,
/// read and written with the permissions of the session's caller.
#[derive(Debug, Clone)]
pub struct TableSyncSource {
    table: TableHandle,
    filter: Value,
    params: SyncParams,
}

impl TableSyncSource {
    /// Source over the rows of `table` matching `filter`.
    #[must_use]
    pub fn new(table: TableHandle, filter: Value, params: SyncParams) -> Self {
        Self {
            table,
            filter,
            params,
        }
    }

    fn order(&self, asc: bool) -> Value {
        let keys: Vec<Value> = std::iter::once(&self.params.synced_field)
            .chain(&self.params.id_fields)
            .map(|key| json!({ "key": key, "asc": asc }))
            .collect();
        Value::Array(keys)
    }

    fn range_filter(&self, from_synced: Option<&Value>) -> Value {
        match from_synced {
            Some(from) => {
                let bound = json!({ self.params.synced_field.as_str(): { "$gte": from } });
                and_filters(&self.filter, Some(&bound))
            }
            None => self.filter.clone(),
        }
    }

    fn ids_filter(rows: &[Row]) -> Value {
        json!({ "$or": rows.iter().cloned().map(Value::Object).collect::<Vec<_>>() })
    }
}

#[async_trait]
impl SyncSource for TableSyncSource {
    async fn info(&self, from_synced: Option<&Value>, end_offset: Option<u64>) -> Result<SyncInfo> {
        let filter = self.range_filter(from_synced);
        let count = self.table.count(&filter).await?;
        if count == 0 {
            return Ok(SyncInfo::default());
        }
        let first_params = FindParams {
            order_by: Some(self.order(true)),
            ..FindParams::default()
        };
        let first = self.table.find_one(&filter, &first_params).await?;
        let last = match end_offset {
            Some(offset) => {
                let params = FindParams {
                    offset: Some(offset),
                    ..first_params
                };
                self.table.find_one(&filter, &params).await?
            }
            None => {
                let params = FindParams {
                    order_by: Some(self.order(false)),
                    ..FindParams::default()
                };
                self.table.find_one(&filter, &params).await?
            }
        };
        Ok(SyncInfo { first, last, count })
    }

    async fn fetch(&self, range: &SyncRange) -> Result<Vec<Row>> {
        let params = FindParams {
            order_by: Some(self.order(true)),
            limit: Some(range.limit as u64),
            offset: Some(range.offset),
            ..FindParams::default()
        };
        self.table
            .find(&self.range_filter(range.from_synced.as_ref()), &params)
            .await
    }

    async fn fetch_by_ids(&self, ids: &[Row]) -> Result<Vec<Row>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let params = FindParams {
            limit: Some(ids.len() as u64),
            ..FindParams::default()
        };
        self.table.find(&Self::ids_filter(ids), &params).await
    }

    async fn apply(&self, changes: ChangeSet) -> Result<()> {
        let name = self.table.name().to_string();
        let id_fields = self.params.id_fields.clone();
        self.table
            .dbo()
            .transaction(|tx| async move {
                let table = tx.table(&name);
                if !changes.deletes.is_empty() {
                    table
                        .delete(&Self::ids_filter(&changes.deletes), &DeleteParams::default())
                        .await?;
                }
                if !changes.inserts.is_empty() {
                    let rows = Value::Array(changes.inserts.into_iter().map(Value::Object).collect());
                    table.insert(&rows, &InsertParams::default()).await?;
                }
                let single = UpdateParams {
                    multi: false,
                    ..UpdateParams::default()
                };
                for mut row in changes.updates {
                    let ids: Row = id_fields
                        .iter()
                        .map(|f| (f.clone(), row.remove(f).unwrap_or(Value::Null)))
                        .collect();
                    table
                        .update(&Value::Object(ids), &Value::Object(row), &single)
                        .await?;
                }
                Ok(())
            })
            .await
    }
}

//! Table rules: the per-operation policy supplied by the host application.
//!
//! In trusted mode no rule is consulted and everything is allowed. In
//! permissioned mode a missing rule, or a missing operation section of a
//! rule, denies the operation.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::db::{DbTransaction, Row};
use crate::error::{Error, Result};
use crate::schema::TableInfo;
use crate::socket::ClientSocket;

/// Column allow-list.
///
/// Parsed from `"*"` (all), `""` / `[]` (none), `["a", "b"]` (include) or
/// `{a: 1, b: 1}` / `{a: 0}` (include / exclude, never mixed).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FieldFilter {
    /// Every column.
    #[default]
    All,
    /// No column.
    None,
    /// Only these columns.
    Include(Vec<String>),
    /// Every column except these.
    Exclude(Vec<String>),
}

impl FieldFilter {
    /// Parses the JSON forms listed on the type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] on mixed include/exclude objects or
    /// non-string entries.
    pub fn parse(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) if s == "*" => Ok(Self::All),
            Value::String(s) if s.is_empty() => Ok(Self::None),
            Value::String(s) => Ok(Self::Include(vec![s.clone()])),
            Value::Null => Ok(Self::None),
            Value::Array(items) if items.is_empty() => Ok(Self::None),
            Value::Array(items) => items
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        Error::Validation(format!("field list entries must be strings, got {v}"))
                    })
                })
                .collect::<Result<Vec<_>>>()
                .map(Self::Include),
            Value::Object(map) => {
                let mut include = Vec::new();
                let mut exclude = Vec::new();
                for (key, v) in map {
                    match v {
                        Value::Bool(true) => include.push(key.clone()),
                        Value::Bool(false) => exclude.push(key.clone()),
                        Value::Number(n) if n.as_i64() == Some(1) => include.push(key.clone()),
                        Value::Number(n) if n.as_i64() == Some(0) => exclude.push(key.clone()),
                        other => {
                            return Err(Error::Validation(format!(
                                "field '{key}' must be 1/true or 0/false, got {other}"
                            )))
                        }
                    }
                }
                match (include.is_empty(), exclude.is_empty()) {
                    (false, false) => Err(Error::Validation(
                        "cannot mix included and excluded fields".into(),
                    )),
                    (true, false) => Ok(Self::Exclude(exclude)),
                    (false, true) => Ok(Self::Include(include)),
                    (true, true) => Ok(Self::None),
                }
            }
            other => Err(Error::Validation(format!("invalid field list: {other}"))),
        }
    }

    /// Whether `name` passes the filter.
    #[must_use]
    pub fn allows(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::None => false,
            Self::Include(list) => list.iter().any(|f| f == name),
            Self::Exclude(list) => !list.iter().any(|f| f == name),
        }
    }

    /// Allowed column names of `table`, in column order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the filter names a column that does
    /// not exist.
    pub fn resolve(&self, table: &TableInfo) -> Result<Vec<String>> {
        if let Self::Include(list) | Self::Exclude(list) = self {
            if let Some(missing) = list.iter().find(|f| !table.has_column(f)) {
                return Err(Error::Validation(format!(
                    "field '{missing}' does not exist in table '{}'",
                    table.name
                )));
            }
        }
        Ok(table
            .column_names()
            .filter(|c| self.allows(c))
            .map(str::to_string)
            .collect())
    }
}

impl<'de> Deserialize<'de> for FieldFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::parse(&value).map_err(serde::de::Error::custom)
    }
}

/// Operation a rule is requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// `find`, `count`, `size`.
    Select,
    /// `insert`.
    Insert,
    /// `update`.
    Update,
    /// `delete`.
    Delete,
    /// `subscribe`.
    Subscribe,
    /// `sync`.
    Sync,
}

impl Command {
    /// Lowercase command name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Subscribe => "subscribe",
            Self::Sync => "sync",
        }
    }
}

/// Async row hook: may rewrite the row or reject it.
pub type RowHook = Arc<dyn Fn(Row) -> BoxFuture<'static, Result<Row>> + Send + Sync>;

/// Hook run inside the mutation's transaction, after the statement.
pub type PostValidateHook =
    Arc<dyn Fn(Row, Arc<dyn DbTransaction>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Select policy.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SelectRule {
    /// Columns that may be selected.
    pub fields: FieldFilter,
    /// Columns that may be filtered on (defaults to `fields`).
    pub filter_fields: Option<FieldFilter>,
    /// Columns that may be ordered by (defaults to `fields`).
    pub order_by_fields: Option<FieldFilter>,
    /// Filter ANDed into every request.
    pub forced_filter: Option<Value>,
    /// Largest LIMIT a request may ask for.
    pub max_limit: Option<u64>,
}

/// Insert policy.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InsertRule {
    /// Columns a client may write.
    pub fields: FieldFilter,
    /// Values merged over every inserted row.
    pub forced_data: Option<Row>,
    /// Columns that may be returned (defaults to the select fields).
    pub returning_fields: Option<FieldFilter>,
    /// Runs on each raw payload row, before field checks and forced data.
    #[serde(skip)]
    pub pre_validate: Option<RowHook>,
    /// Runs on each row before the statement is built.
    #[serde(skip)]
    pub validate: Option<RowHook>,
    /// Runs on each inserted row inside the insert transaction.
    #[serde(skip)]
    pub post_validate: Option<PostValidateHook>,
}

/// Update policy.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateRule {
    /// Columns a client may change.
    pub fields: FieldFilter,
    /// Columns that may be filtered on (defaults to `fields`).
    pub filter_fields: Option<FieldFilter>,
    /// Filter ANDed into every request.
    pub forced_filter: Option<Value>,
    /// Values merged over the update data.
    pub forced_data: Option<Row>,
    /// Columns that may be returned (defaults to the select fields).
    pub returning_fields: Option<FieldFilter>,
    /// Runs on the raw update data, before field checks and forced data.
    #[serde(skip)]
    pub pre_validate: Option<RowHook>,
    /// Runs on the update data before the statement is built.
    #[serde(skip)]
    pub validate: Option<RowHook>,
    /// Runs on each updated row inside the update transaction.
    #[serde(skip)]
    pub post_validate: Option<PostValidateHook>,
}

/// Delete policy.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeleteRule {
    /// Columns that may be filtered on.
    pub filter_fields: FieldFilter,
    /// Filter ANDed into every request.
    pub forced_filter: Option<Value>,
    /// Columns that may be returned (defaults to the select fields).
    pub returning_fields: Option<FieldFilter>,
}

/// Sync policy.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncRule {
    /// Columns identifying a row.
    pub id_fields: Vec<String>,
    /// Column holding the last modification timestamp.
    pub synced_field: String,
    /// Whether client deletions are applied.
    pub allow_delete: bool,
    /// Minimum delay between sync passes.
    pub throttle_ms: Option<u64>,
    /// Rows per batch.
    pub batch_size: Option<usize>,
}

/// Subscribe policy.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SubscribeRule {
    /// Minimum delay between pushes.
    pub throttle_ms: Option<u64>,
}

/// Full policy for one table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TableRule {
    /// `find`/`count`/`size` policy.
    pub select: Option<SelectRule>,
    /// `insert` policy.
    pub insert: Option<InsertRule>,
    /// `update` policy.
    pub update: Option<UpdateRule>,
    /// `delete` policy.
    pub delete: Option<DeleteRule>,
    /// `sync` policy.
    pub sync: Option<SyncRule>,
    /// `subscribe` policy.
    pub subscribe: Option<SubscribeRule>,
}

impl fmt::Debug for InsertRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InsertRule")
            .field("fields", &self.fields)
            .field("forced_data", &self.forced_data)
            .field("returning_fields", &self.returning_fields)
            .field("pre_validate", &self.pre_validate.is_some())
            .field("validate", &self.validate.is_some())
            .field("post_validate", &self.post_validate.is_some())
            .finish()
    }
}

impl fmt::Debug for UpdateRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateRule")
            .field("fields", &self.fields)
            .field("filter_fields", &self.filter_fields)
            .field("forced_filter", &self.forced_filter)
            .field("forced_data", &self.forced_data)
            .field("returning_fields", &self.returning_fields)
            .field("pre_validate", &self.pre_validate.is_some())
            .field("validate", &self.validate.is_some())
            .field("post_validate", &self.post_validate.is_some())
            .finish()
    }
}

/// Supplies table rules for a requesting principal.
#[async_trait]
pub trait RuleProvider: Send + Sync {
    /// Rule for `table`, or `None` when the principal has no access.
    async fn table_rule(
        &self,
        table: &str,
        command: Command,
        principal: &Value,
    ) -> Result<Option<TableRule>>;
}

/// Fixed rules, independent of the principal.
#[derive(Debug, Clone, Default)]
pub struct StaticRules {
    rules: BTreeMap<String, TableRule>,
}

impl StaticRules {
    /// Creates an empty rule set (denies everything).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the rule for `table`.
    #[must_use]
    pub fn table(mut self, table: impl Into<String>, rule: TableRule) -> Self {
        self.rules.insert(table.into(), rule);
        self
    }

    /// Parses `{table: rule}` JSON (hooks cannot be expressed and stay unset).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if a rule is malformed.
    pub fn from_json(value: &Value) -> Result<Self> {
        let rules: BTreeMap<String, TableRule> = serde_json::from_value(value.clone())
            .map_err(|e| Error::Validation(format!("invalid table rules: {e}")))?;
        Ok(Self { rules })
    }
}

#[async_trait]
impl RuleProvider for StaticRules {
    async fn table_rule(
        &self,
        table: &str,
        _command: Command,
        _principal: &Value,
    ) -> Result<Option<TableRule>> {
        Ok(self.rules.get(table).cloned())
    }
}

/// Rule lookup context of a permissioned request.
#[derive(Clone)]
pub struct RequestScope {
    /// Rule source.
    pub rules: Arc<dyn RuleProvider>,
    /// Authenticated principal, passed through to the provider.
    pub principal: Value,
    /// Requesting socket, if the request came over one.
    pub socket: Option<Arc<dyn ClientSocket>>,
}

impl fmt::Debug for RequestScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestScope")
            .field("principal", &self.principal)
            .field("socket", &self.socket.as_ref().map(|s| s.id().to_string()))
            .finish_non_exhaustive()
    }
}

/// How a request is authorized.
#[derive(Clone, Debug, Default)]
pub enum Access {
    /// Local, fully trusted caller.
    #[default]
    Trusted,
    /// Rules apply; a missing rule denies.
    Permissioned(RequestScope),
}

impl Access {
    /// Permissioned access through fixed rules, without a socket.
    #[must_use]
    pub fn with_rules(rules: impl RuleProvider + 'static, principal: Value) -> Self {
        Self::Permissioned(RequestScope {
            rules: Arc::new(rules),
            principal,
            socket: None,
        })
    }

    /// Permissioned access for a socket client.
    #[must_use]
    pub fn for_socket(
        rules: Arc<dyn RuleProvider>,
        principal: Value,
        socket: Arc<dyn ClientSocket>,
    ) -> Self {
        Self::Permissioned(RequestScope {
            rules,
            principal,
            socket: Some(socket),
        })
    }

    /// Requesting socket, if any.
    #[must_use]
    pub fn socket(&self) -> Option<&Arc<dyn ClientSocket>> {
        match self {
            Self::Trusted => None,
            Self::Permissioned(scope) => scope.socket.as_ref(),
        }
    }

    /// Looks up the permit for `table` and `command`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] when no rule exists in permissioned mode.
    pub async fn permit(&self, table: &str, command: Command) -> Result<Permit> {
        match self {
            Self::Trusted => Ok(Permit::Unrestricted),
            Self::Permissioned(scope) => {
                match scope.rules.table_rule(table, command, &scope.principal).await? {
                    Some(rule) => Ok(Permit::Restricted(Arc::new(rule))),
                    None => Err(denied(table, command)),
                }
            }
        }
    }
}

/// Outcome of a rule lookup.
#[derive(Clone, Debug)]
pub enum Permit {
    /// Trusted caller.
    Unrestricted,
    /// Rule-bound caller.
    Restricted(Arc<TableRule>),
}

fn denied(table: &str, command: Command) -> Error {
    Error::Forbidden(format!(
        "{} not allowed on table '{table}'",
        command.as_str()
    ))
}

impl Permit {
    /// Whether the caller is trusted.
    #[must_use]
    pub fn is_unrestricted(&self) -> bool {
        matches!(self, Self::Unrestricted)
    }

    /// Select section, `None` when unrestricted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] if the rule has no select section.
    pub fn select(&self, table: &str) -> Result<Option<&SelectRule>> {
        match self {
            Self::Unrestricted => Ok(None),
            Self::Restricted(rule) => rule
                .select
                .as_ref()
                .map(Some)
                .ok_or_else(|| denied(table, Command::Select)),
        }
    }

    /// Insert section, `None` when unrestricted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] if the rule has no insert section.
    pub fn insert(&self, table: &str) -> Result<Option<&InsertRule>> {
        match self {
            Self::Unrestricted => Ok(None),
            Self::Restricted(rule) => rule
                .insert
                .as_ref()
                .map(Some)
                .ok_or_else(|| denied(table, Command::Insert)),
        }
    }

    /// Update section, `None` when unrestricted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] if the rule has no update section.
    pub fn update(&self, table: &str) -> Result<Option<&UpdateRule>> {
        match self {
            Self::Unrestricted => Ok(None),
            Self::Restricted(rule) => rule
                .update
                .as_ref()
                .map(Some)
                .ok_or_else(|| denied(table, Command::Update)),
        }
    }

    /// Delete section, `None` when unrestricted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] if the rule has no delete section.
    pub fn delete(&self, table: &str) -> Result<Option<&DeleteRule>> {
        match self {
            Self::Unrestricted => Ok(None),
            Self::Restricted(rule) => rule
                .delete
                .as_ref()
                .map(Some)
                .ok_or_else(|| denied(table, Command::Delete)),
        }
    }

    /// Sync section, `None` when unrestricted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] if the rule has no sync section.
    pub fn sync(&self, table: &str) -> Result<Option<&SyncRule>> {
        match self {
            Self::Unrestricted => Ok(None),
            Self::Restricted(rule) => rule
                .sync
                .as_ref()
                .map(Some)
                .ok_or_else(|| denied(table, Command::Sync)),
        }
    }

    /// Subscribe section. Unlike the other sections it is optional: a
    /// select permission is enough to subscribe.
    #[must_use]
    pub fn subscribe(&self) -> Option<&SubscribeRule> {
        match self {
            Self::Unrestricted => None,
            Self::Restricted(rule) => rule.subscribe.as_ref(),
        }
    }

    /// The sync rule regardless of the command being run, used to fill
    /// `synced_field` on writes.
    #[must_use]
    pub fn sync_rule(&self) -> Option<&SyncRule> {
        match self {
            Self::Unrestricted => None,
            Self::Restricted(rule) => rule.sync.as_ref(),
        }
    }

    /// Allowed select columns of `table`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] without select permission.
    pub fn select_fields(&self, table: &TableInfo) -> Result<Vec<String>> {
        match self.select(&table.name)? {
            None => Ok(table.column_names().map(str::to_string).collect()),
            Some(rule) => rule.fields.resolve(table),
        }
    }
}

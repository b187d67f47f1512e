//! # `LiveSQL` Core
//!
//! Real-time data access layer over PostgreSQL.
//!
//! A client describes what it wants as JSON (filter, select, order), and
//! this crate turns it into one permission-checked SQL statement, keeps
//! subscribers up to date through LISTEN/NOTIFY and reconciles client-held
//! replicas with the server through a two-way sync protocol.
//!
//! ## Features
//!
//! - **Filter Parser**: MongoDB-style filters compiled to deterministic SQL
//! - **Nested joins**: joined rows aggregated as JSON arrays in one statement
//! - **Rules**: per-table allow-lists, forced filters and forced data
//! - **Subscriptions**: throttled pushes driven by statement-level triggers
//! - **Sync**: watermark bisection, batched upserts and a write-ahead buffer
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use livesql_core::{Dbo, FindParams, LiveSqlConfig};
//! use serde_json::json;
//!
//! let dbo = Dbo::connect(LiveSqlConfig::load()?).await?;
//!
//! let rows = dbo
//!     .table("items")
//!     .find(&json!({ "status": "open" }), &FindParams {
//!         select: json!({ "name": 1, "owner": "*" }),
//!         order_by: Some(json!({ "name": 1 })),
//!         ..FindParams::default()
//!     })
//!     .await?;
//!
//! let handle = dbo
//!     .table("items")
//!     .subscribe(&json!({ "status": "open" }), &Default::default(), Some(callback))
//!     .await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::redundant_pub_crate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::single_match_else)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::unused_async)]
#![allow(clippy::too_many_lines)]

pub mod config;
pub mod db;
pub mod error;
#[cfg(test)]
mod error_tests;
pub mod filter;
#[cfg(test)]
mod filter_tests;
pub mod joins;
#[cfg(test)]
mod joins_tests;
pub mod mutation;
#[cfg(test)]
mod mutation_tests;
pub mod pubsub;
pub mod query;
pub mod rules;
#[cfg(test)]
mod rules_tests;
pub mod schema;
pub mod select;
pub mod socket;
pub mod sql;
pub mod sqlstate;
pub mod sync;
pub mod table;
pub mod telemetry;

pub use config::{
    ConfigError, DatabaseConfig, LiveSqlConfig, LoggingConfig, PubSubConfig, QueryConfig,
    SyncConfig,
};
#[cfg(feature = "postgres")]
pub use db::PgDatabase;
pub use db::{DbClient, DbTransaction, Notification, NotificationSource, Row};
pub use error::{DbErrorInfo, Error, ErrorPayload, Result};
pub use filter::{compile_filter, CompiledFilter, FilterEnv, FilterParams};
pub use joins::{Join, JoinGraph, JoinKind};
pub use mutation::{DeleteParams, InsertParams, MutationResult, UpdateParams};
pub use pubsub::{
    channel_name, ChangeListener, LocalCallback, PubSubManager, SubscriptionEvent,
    SubscriptionHandle,
};
pub use query::{build_query, emit, QueryContext, QueryNode, QueryRequest};
pub use rules::{Access, Command, FieldFilter, Permit, RuleProvider, StaticRules, TableRule};
pub use schema::{Column, Schema, TableInfo};
pub use socket::ClientSocket;
pub use sync::{SyncParams, SyncReplica, SyncSession, SyncSource};
pub use table::{
    Dbo, FindParams, SubscribeParams, SyncHandshake, SyncOptions, TableHandle, TableSyncSource,
};
pub use telemetry::init_tracing;

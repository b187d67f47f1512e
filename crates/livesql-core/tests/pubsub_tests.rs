//! Integration tests for subscriptions driven by trigger notifications.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use common::{joins, row, schema, ChannelSource, MockDb, MockSocket};
use livesql_core::pubsub::notification::DELIMITER;
use livesql_core::{
    Access, Dbo, LiveSqlConfig, LocalCallback, StaticRules, SubscribeParams, SubscriptionEvent,
};

struct Fixture {
    db: MockDb,
    source: Arc<ChannelSource>,
    dbo: Dbo,
}

async fn fixture() -> Fixture {
    let db = MockDb::new();
    db.answer("FROM \"items\"", vec![row(json!({ "id": 1, "name": "a" }))]);
    let dbo = Dbo::new(Arc::new(db.clone()), schema(), joins(), LiveSqlConfig::default());
    let source = ChannelSource::new();
    dbo.enable_pubsub(source.clone()).await.unwrap();
    Fixture { db, source, dbo }
}

fn collector() -> (LocalCallback, mpsc::UnboundedReceiver<SubscriptionEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: LocalCallback = Arc::new(move |event| {
        let _ = tx.send(event);
    });
    (callback, rx)
}

fn changed(table: &str, ids: &str) -> String {
    ["data_has_changed", table, "UPDATE", ids].join(DELIMITER)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<SubscriptionEvent>) -> SubscriptionEvent {
    timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("no event delivered")
        .expect("channel closed")
}

async fn nothing_within(rx: &mut mpsc::UnboundedReceiver<SubscriptionEvent>, ms: u64) -> bool {
    timeout(Duration::from_millis(ms), rx.recv()).await.is_err()
}

// ============================================================================
// Startup
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_start_installs_catalog_and_listens() {
    // Arrange & Act
    let f = fixture().await;

    // Assert
    let statements = f.db.statements();
    assert_eq!(statements[0], "BEGIN");
    assert!(statements[1].contains("CREATE TABLE IF NOT EXISTS livesql.app_triggers"));
    assert_eq!(statements[2], "COMMIT");
    assert!(statements[3].starts_with("INSERT INTO livesql.apps"));
    let manager = f.dbo.pubsub().unwrap();
    assert_eq!(f.source.channel(), Some(manager.listen_channel()));
    assert!(manager.listen_channel().starts_with("livesql_"));
}

#[tokio::test(start_paused = true)]
async fn test_enable_pubsub_is_idempotent() {
    let f = fixture().await;
    let first = f.dbo.pubsub().unwrap().clone();
    let again = f.dbo.enable_pubsub(f.source.clone()).await.unwrap();
    assert!(Arc::ptr_eq(&first, &again));
}

#[tokio::test]
async fn test_subscribe_needs_pubsub() {
    let db = MockDb::new();
    let dbo = Dbo::new(Arc::new(db), schema(), joins(), LiveSqlConfig::default());
    let (callback, _rx) = collector();
    let err = dbo
        .table("items")
        .subscribe(&json!({}), &SubscribeParams::default(), Some(callback))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("dbo.items.subscribe()"));
}

// ============================================================================
// Local subscriptions
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_local_subscription_pushes_initial_data_and_changes() {
    // Arrange
    let f = fixture().await;
    let (callback, mut rx) = collector();

    // Act
    let handle = f
        .dbo
        .table("items")
        .subscribe(&json!({ "name": "a" }), &SubscribeParams::default(), Some(callback))
        .await
        .unwrap();
    let initial = next(&mut rx).await;
    f.source.send(&changed("items", "1"));
    let update = next(&mut rx).await;

    // Assert
    let expected = SubscriptionEvent::Data(vec![row(json!({ "id": 1, "name": "a" }))]);
    assert_eq!(initial, expected);
    assert_eq!(update, expected);
    let manager = f.dbo.pubsub().unwrap();
    let keys = manager.trigger_keys();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].table, "items");
    assert_eq!(keys[0].condition, "\"name\" = 'a'");
    assert!(handle.channel().starts_with("livesql.items."));
    assert_eq!(f.db.count("INSERT INTO livesql.app_triggers"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_identical_conditions_share_one_trigger() {
    // Arrange
    let f = fixture().await;
    let (first, _a) = collector();
    let (second, _b) = collector();
    let table = f.dbo.table("items");

    // Act
    let h1 = table
        .subscribe(&json!({ "name": "a" }), &SubscribeParams::default(), Some(first))
        .await
        .unwrap();
    let h2 = table
        .subscribe(&json!({ "name": "a" }), &SubscribeParams::default(), Some(second))
        .await
        .unwrap();

    // Assert
    let manager = f.dbo.pubsub().unwrap();
    assert_eq!(manager.subscription_count(), 2);
    assert_eq!(manager.trigger_keys().len(), 1);
    assert_eq!(f.db.count("INSERT INTO livesql.app_triggers"), 1);
    h1.unsubscribe();
    assert_eq!(manager.trigger_keys().len(), 1);
    h2.unsubscribe();
    assert_eq!(manager.subscription_count(), 0);
    assert!(manager.trigger_keys().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unrelated_notifications_are_ignored() {
    // Arrange
    let f = fixture().await;
    let (callback, mut rx) = collector();
    let _handle = f
        .dbo
        .table("items")
        .subscribe(&json!({}), &SubscribeParams::default(), Some(callback))
        .await
        .unwrap();
    next(&mut rx).await;

    // Act
    f.source.send(&changed("items", "99"));
    f.source.send("not a trigger payload");

    // Assert
    assert!(nothing_within(&mut rx, 1_000).await);
}

#[tokio::test(start_paused = true)]
async fn test_throttle_coalesces_bursts() {
    // Arrange
    let f = fixture().await;
    let (callback, mut rx) = collector();
    let params = SubscribeParams {
        throttle: Some(1_700),
        ..SubscribeParams::default()
    };
    let _handle = f
        .dbo
        .table("items")
        .subscribe(&json!({}), &params, Some(callback))
        .await
        .unwrap();
    next(&mut rx).await;
    let start = Instant::now();

    // Act
    for _ in 0..3 {
        f.source.send(&changed("items", "1"));
    }
    next(&mut rx).await;

    // Assert
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(1_600) && elapsed <= Duration::from_millis(1_800));
    assert!(nothing_within(&mut rx, 5_000).await);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_stops_pushes() {
    // Arrange
    let f = fixture().await;
    let (callback, mut rx) = collector();
    let handle = f
        .dbo
        .table("items")
        .subscribe(&json!({}), &SubscribeParams::default(), Some(callback))
        .await
        .unwrap();
    next(&mut rx).await;

    // Act
    handle.unsubscribe();
    f.source.send(&changed("items", "1"));

    // Assert
    assert!(nothing_within(&mut rx, 1_000).await);
    assert_eq!(f.dbo.pubsub().unwrap().subscription_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_query_failure_is_pushed_as_error() {
    // Arrange
    let f = fixture().await;
    let (callback, mut rx) = collector();
    let _handle = f
        .dbo
        .table("items")
        .subscribe(&json!({}), &SubscribeParams::default(), Some(callback))
        .await
        .unwrap();
    next(&mut rx).await;

    // Act
    f.db.fail_on("FROM \"items\"");
    f.source.send(&changed("items", "1"));

    // Assert
    match next(&mut rx).await {
        SubscriptionEvent::Error(payload) => assert!(payload.msg.contains("forced failure")),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(f.dbo.pubsub().unwrap().subscription_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_trigger_error_resets_everything() {
    // Arrange
    let f = fixture().await;
    let (callback, mut rx) = collector();
    let _handle = f
        .dbo
        .table("items")
        .subscribe(&json!({}), &SubscribeParams::default(), Some(callback))
        .await
        .unwrap();
    next(&mut rx).await;

    // Act
    f.source
        .send(&["error", "items", "INSERT", "column \"x\" does not exist"].join(DELIMITER));

    // Assert
    match next(&mut rx).await {
        SubscriptionEvent::Error(payload) => assert!(payload.msg.contains("does not exist")),
        other => panic!("unexpected {other:?}"),
    }
    let manager = f.dbo.pubsub().unwrap();
    assert_eq!(manager.subscription_count(), 0);
    assert!(manager.trigger_keys().is_empty());
    assert_eq!(f.db.count("DELETE FROM livesql.app_triggers WHERE app_id"), 1);
}

// ============================================================================
// Socket subscriptions
// ============================================================================

fn socket_access(socket: Arc<MockSocket>) -> Access {
    let rules = StaticRules::from_json(&json!({
        "items": { "select": { "fields": ["id", "name"] }, "subscribe": { "throttle_ms": 10 } }
    }))
    .unwrap();
    Access::for_socket(Arc::new(rules), json!({ "id": 1 }), socket)
}

#[tokio::test(start_paused = true)]
async fn test_socket_subscription_waits_for_ready() {
    // Arrange
    let f = fixture().await;
    let (socket, mut emitted) = MockSocket::new("s1");
    let client = f.dbo.with_access(socket_access(socket));

    // Act
    let handle = client
        .table("items")
        .subscribe(&json!({}), &SubscribeParams::default(), None)
        .await
        .unwrap();
    let early = timeout(Duration::from_millis(500), emitted.recv()).await;
    client.mark_ready("s1", handle.channel());
    let (channel, payload) = timeout(Duration::from_secs(60), emitted.recv())
        .await
        .unwrap()
        .unwrap();

    // Assert
    assert!(early.is_err());
    assert_eq!(channel, handle.channel());
    assert_eq!(payload, json!({ "data": [{ "id": 1, "name": "a" }] }));
}

#[tokio::test(start_paused = true)]
async fn test_socket_disconnect_removes_its_subscriptions() {
    // Arrange
    let f = fixture().await;
    let (socket, _emitted) = MockSocket::new("s1");
    let client = f.dbo.with_access(socket_access(socket));
    client
        .table("items")
        .subscribe(&json!({ "id": 1 }), &SubscribeParams::default(), None)
        .await
        .unwrap();
    let manager = f.dbo.pubsub().unwrap();
    assert_eq!(manager.subscription_count(), 1);

    f.db.clear();

    // Act
    f.dbo.on_socket_disconnect("s1");
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Assert
    assert_eq!(manager.subscription_count(), 0);
    assert!(manager.trigger_keys().is_empty());
    let statements = f.db.statements();
    let at = dropped_trigger_statement(&statements).expect("trigger row not deleted");
    assert!(statements[at - 1].contains("LOCK TABLE livesql.app_triggers"));
    assert_eq!(statements[at + 1], "COMMIT");
    let params = &f.db.params()[at];
    assert_eq!(params[0], json!(manager.app_id()));
    assert_eq!(params[1], json!("{\"1\"}"));
}

fn dropped_trigger_statement(statements: &[String]) -> Option<usize> {
    statements
        .iter()
        .position(|s| s.starts_with("DELETE FROM livesql.app_triggers") && s.contains("id = ANY"))
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_keeps_trigger_row_while_shared() {
    // Arrange
    let f = fixture().await;
    let (first, _rx1) = collector();
    let (second, _rx2) = collector();
    let table = f.dbo.table("items");
    let a = table
        .subscribe(&json!({ "name": "a" }), &SubscribeParams::default(), Some(first))
        .await
        .unwrap();
    let b = table
        .subscribe(&json!({ "name": "a" }), &SubscribeParams::default(), Some(second))
        .await
        .unwrap();
    f.db.clear();

    // Act
    a.unsubscribe();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let after_first = dropped_trigger_statement(&f.db.statements());
    b.unsubscribe();
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Assert
    assert_eq!(after_first, None);
    assert!(dropped_trigger_statement(&f.db.statements()).is_some());
    assert!(f.dbo.pubsub().unwrap().trigger_keys().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_subscription_without_callback_or_socket_is_rejected() {
    let f = fixture().await;
    let err = f
        .dbo
        .table("items")
        .subscribe(&json!({}), &SubscribeParams::default(), None)
        .await
        .unwrap_err();
    assert!(matches!(err.root(), livesql_core::Error::Validation(_)));
    assert_eq!(f.dbo.pubsub().unwrap().subscription_count(), 0);
}

// ============================================================================
// Heartbeat and shutdown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_heartbeat_touches_registered_triggers() {
    // Arrange
    let f = fixture().await;
    let (callback, _rx) = collector();
    let _handle = f
        .dbo
        .table("items")
        .subscribe(&json!({}), &SubscribeParams::default(), Some(callback))
        .await
        .unwrap();
    let manager = f.dbo.pubsub().unwrap().clone();
    f.db.clear();

    // Act
    manager.heartbeat().await.unwrap();

    // Assert
    let statements = f.db.statements();
    assert!(statements[0].starts_with("UPDATE livesql.apps SET last_check"));
    assert_eq!(f.db.count("AS stale"), 1);
    let touched: Vec<Value> = f.db.params().into_iter().nth(1).unwrap();
    assert_eq!(touched[1], json!("{\"1\"}"));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_rejects_new_subscriptions() {
    let f = fixture().await;
    f.dbo.shutdown();
    let (callback, _rx) = collector();
    let err = f
        .dbo
        .table("items")
        .subscribe(&json!({}), &SubscribeParams::default(), Some(callback))
        .await
        .unwrap_err();
    assert!(matches!(err.root(), livesql_core::Error::Closed(_)));
}

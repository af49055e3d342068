//! A full connection wired through the in-process broker.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use statewire_engine::{Block, BlockType, Connection, ConnectionConfig, HostValue, Roots, Transport};

use statewire_broker::Broker;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[tokio::test]
async fn monitor_cycle_over_broker_topics() {
    init_logs();
    let broker = Broker::new();

    // The engine peer consumes the control topic and publishes its updates
    // to the updates topic; the test peer is wired the other way around.
    let engine_side = broker.connect(["control".to_string()], "updates");
    let test_side = broker.connect(["updates".to_string()], "control");

    let roots = Roots::from_entries([(
        "person".to_string(),
        HostValue::map([("name".to_string(), HostValue::Str("Herman".to_string()))]),
    )]);
    let conn = Connection::start(
        "peer",
        Arc::new(engine_side),
        roots.clone(),
        None,
        ConnectionConfig::default(),
    )
    .await
    .unwrap();

    let monitor = Block::parse(json!({
        "type": "monitor",
        "name": "m1",
        "root": "@person",
        "value": {"name": ""},
    }))
    .unwrap();
    let payload = [("m1".to_string(), monitor)].into_iter().collect();
    test_side.send_updates(payload).await.unwrap();

    // The snapshot comes back on the updates topic.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let block = loop {
        if let Some(batch) = test_side.get_updates(0.1).await.unwrap() {
            if let Some(block) = batch.get("m1") {
                break block.clone();
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no snapshot arrived on the updates topic"
        );
    };
    assert_eq!(block.kind, BlockType::Monitor);
    assert_eq!(block.value, json!({"name": "Herman"}));

    // A host mutation flows out on the next tick.
    roots
        .get("person")
        .unwrap()
        .set_field("name", HostValue::Str("Lily".to_string()))
        .unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let block = loop {
        if let Some(batch) = test_side.get_updates(0.1).await.unwrap() {
            if let Some(block) = batch.get("m1") {
                break block.clone();
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no update arrived after the host changed"
        );
    };
    assert_eq!(block.value, json!({"name": "Lily"}));

    conn.shutdown().await;
}

#[tokio::test]
async fn blocks_on_other_topics_do_not_reach_the_engine() {
    init_logs();
    let broker = Broker::new();
    let engine_side = broker.connect(["control".to_string()], "updates");
    let test_side = broker.connect(["updates".to_string()], "elsewhere");

    let conn = Connection::start(
        "peer",
        Arc::new(engine_side),
        Roots::new(),
        None,
        ConnectionConfig::default(),
    )
    .await
    .unwrap();

    // Published without topics, this lands on "elsewhere", which the
    // engine does not subscribe to.
    let stray = Block::parse(json!({"type": "data", "name": "stray", "value": 1})).unwrap();
    let payload = [("stray".to_string(), stray)].into_iter().collect();
    test_side.send_updates(payload).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(conn.inspect(|s| !s.data_blocks.contains_key("stray")));

    conn.shutdown().await;
}

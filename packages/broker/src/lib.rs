//! In-process topic broker for statewire connections.
//!
//! The broker fans blocks out by topic: a published block reaches every
//! peer subscribed to one of its `topics`, or to the publisher's default
//! output stream when the block names none. [`Broker::connect`] returns a
//! [`BrokerTransport`] that plugs straight into
//! `statewire_engine::Connection::start`.
//!
//! This is the reference transport for wiring several in-process peers
//! together and for exercising topic routing in tests; network brokers
//! implement the same `Transport` contract elsewhere.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use statewire_engine::{Block, BlockMap, EngineError, Result, Transport};

struct Subscriber {
    topics: Vec<String>,
    tx: mpsc::UnboundedSender<Block>,
}

#[derive(Default)]
struct BrokerInner {
    subscribers: Vec<Subscriber>,
}

/// A topic fan-out hub shared by any number of peers.
#[derive(Clone, Default)]
pub struct Broker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl Broker {
    pub fn new() -> Broker {
        Broker::default()
    }

    /// Attach a peer. The peer consumes blocks published to any of
    /// `topics`; blocks it publishes without explicit topics go to its
    /// `output_topic`.
    pub fn connect(
        &self,
        topics: impl IntoIterator<Item = String>,
        output_topic: impl Into<String>,
    ) -> BrokerTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(Subscriber {
            topics: topics.into_iter().collect(),
            tx,
        });
        BrokerTransport {
            broker: self.clone(),
            output_topic: output_topic.into(),
            inbound: AsyncMutex::new(rx),
        }
    }

    /// Fan a payload out to every subscriber with a matching topic. Each
    /// subscriber receives a block at most once per publish. Subscribers
    /// whose receiving end is gone are dropped.
    pub fn publish(&self, default_topic: &str, blocks: BlockMap) {
        let mut inner = self.lock();
        for (_, block) in blocks {
            inner.subscribers.retain(|sub| {
                let matches = sub
                    .topics
                    .iter()
                    .any(|t| block.topic_matches(t, default_topic));
                if !matches {
                    return true;
                }
                match sub.tx.send(block.clone()) {
                    Ok(()) => true,
                    Err(_) => {
                        log::debug!("dropping dead subscriber");
                        false
                    }
                }
            });
        }
    }

    /// Number of attached peers.
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One peer's endpoint on a [`Broker`].
pub struct BrokerTransport {
    broker: Broker,
    output_topic: String,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<Block>>,
}

impl BrokerTransport {
    pub fn output_topic(&self) -> &str {
        &self.output_topic
    }
}

#[async_trait]
impl Transport for BrokerTransport {
    fn incoming_update_period(&self) -> f64 {
        0.05
    }

    async fn get_updates(&self, wait: f64) -> Result<Option<BlockMap>> {
        let mut rx = self.inbound.lock().await;
        let mut batch: BlockMap = IndexMap::new();
        loop {
            match rx.try_recv() {
                Ok(block) => {
                    batch.insert(block.name.clone(), block);
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if batch.is_empty() {
                        return Err(EngineError::transport("broker detached"));
                    }
                    break;
                }
            }
        }
        if batch.is_empty() {
            match tokio::time::timeout(Duration::from_secs_f64(wait), rx.recv()).await {
                Ok(Some(block)) => {
                    batch.insert(block.name.clone(), block);
                }
                Ok(None) => return Err(EngineError::transport("broker detached")),
                Err(_) => return Ok(None),
            }
        }
        Ok(Some(batch))
    }

    async fn send_updates(&self, outgoing: BlockMap) -> Result<()> {
        self.broker.publish(&self.output_topic, outgoing);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use statewire_engine::BlockType;

    fn block(name: &str, topics: serde_json::Value) -> Block {
        Block::parse(json!({"type": "data", "name": name, "topics": topics, "value": 1})).unwrap()
    }

    fn payload(blocks: Vec<Block>) -> BlockMap {
        blocks.into_iter().map(|b| (b.name.clone(), b)).collect()
    }

    #[tokio::test]
    async fn routes_by_explicit_topic() {
        let broker = Broker::new();
        let alpha = broker.connect(["alpha".to_string()], "out");
        let beta = broker.connect(["beta".to_string()], "out");
        let publisher = broker.connect([], "out");

        publisher
            .send_updates(payload(vec![block("d1", json!("alpha"))]))
            .await
            .unwrap();

        let got = alpha.get_updates(0.1).await.unwrap().unwrap();
        assert!(got.contains_key("d1"));
        assert!(beta.get_updates(0.01).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_topics_fall_back_to_output_stream() {
        let broker = Broker::new();
        let listener = broker.connect(["updates".to_string()], "other");
        let publisher = broker.connect([], "updates");

        let mut b = Block::new(BlockType::Data, "plain");
        b.value = json!(2);
        publisher.send_updates(payload(vec![b])).await.unwrap();

        let got = listener.get_updates(0.1).await.unwrap().unwrap();
        assert_eq!(got["plain"].value, json!(2));
    }

    #[tokio::test]
    async fn multi_topic_subscriber_receives_once() {
        let broker = Broker::new();
        let listener = broker.connect(["a".to_string(), "b".to_string()], "out");
        let publisher = broker.connect([], "out");

        publisher
            .send_updates(payload(vec![block("d1", json!(["a", "b"]))]))
            .await
            .unwrap();

        let got = listener.get_updates(0.1).await.unwrap().unwrap();
        assert_eq!(got.len(), 1);
        assert!(listener.get_updates(0.01).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dead_subscribers_are_dropped() {
        let broker = Broker::new();
        let listener = broker.connect(["t".to_string()], "out");
        let publisher = broker.connect([], "out");
        assert_eq!(broker.subscriber_count(), 2);

        drop(listener);
        publisher
            .send_updates(payload(vec![block("d1", json!("t"))]))
            .await
            .unwrap();
        assert_eq!(broker.subscriber_count(), 1);
    }
}

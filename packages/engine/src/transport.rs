//! The transport contract.
//!
//! Transports move blocks between a connection and the outside world: a
//! stream broker, named pipes, or the in-process loopback below. The engine
//! only ever calls `get_updates` from the input pump and `send_updates`
//! from the output pump; both are allowed to block (await) up to their
//! stated bounds.

use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::sync::{mpsc, Mutex};

use crate::block::{Block, BlockMap};
use crate::connection::Connection;
use crate::error::{EngineError, Result};

/// A pluggable block transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Called once after the connection is constructed.
    async fn init(&self, _conn: &Connection) -> Result<()> {
        Ok(())
    }

    /// How long `get_updates` may wait for input, in seconds.
    fn incoming_update_period(&self) -> f64 {
        2.0
    }

    /// Pace of the outgoing pump, in seconds. `None` lets the engine use
    /// the minimum monitor period, falling back to the default update
    /// period.
    fn outgoing_update_period(&self) -> Option<f64> {
        None
    }

    /// Fetch pending inbound blocks, waiting up to `wait` seconds. Called
    /// only from the input pump.
    async fn get_updates(&self, wait: f64) -> Result<Option<BlockMap>>;

    /// Publish outgoing blocks. Called only from the output pump; may
    /// block until the transport acknowledges.
    async fn send_updates(&self, outgoing: BlockMap) -> Result<()>;

    /// Whether a drained outgoing payload is worth publishing.
    fn has_updates(&self, outgoing: &BlockMap) -> bool {
        !outgoing.is_empty()
    }
}

/// In-process loopback transport: blocks pushed on the handle arrive at the
/// connection, published blocks come back out on the handle. The reference
/// transport for tests and embedding without a network.
pub struct LoopbackTransport {
    inbound: Mutex<mpsc::UnboundedReceiver<Block>>,
    out_tx: mpsc::UnboundedSender<BlockMap>,
}

/// Test-side handle of a loopback pair.
pub struct LoopbackHandle {
    in_tx: mpsc::UnboundedSender<Block>,
    outgoing: Mutex<mpsc::UnboundedReceiver<BlockMap>>,
}

/// Create a connected loopback pair.
pub fn loopback() -> (LoopbackHandle, LoopbackTransport) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    (
        LoopbackHandle {
            in_tx,
            outgoing: Mutex::new(out_rx),
        },
        LoopbackTransport {
            inbound: Mutex::new(in_rx),
            out_tx,
        },
    )
}

impl LoopbackHandle {
    /// Queue a block for the connection's next input poll.
    pub fn push(&self, block: Block) {
        let _ = self.in_tx.send(block);
    }

    /// Wait for the next published payload, up to `timeout`. `None` when
    /// nothing arrives in time.
    pub async fn next_outgoing(&self, timeout: Duration) -> Option<BlockMap> {
        let mut rx = self.outgoing.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Wait for the next published block with the given name, skipping
    /// payloads that do not carry it.
    pub async fn next_named(&self, name: &str, timeout: Duration) -> Option<Block> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())?
                .max(Duration::from_millis(1));
            let payload = self.next_outgoing(remaining).await?;
            if let Some(block) = payload.get(name) {
                return Some(block.clone());
            }
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn incoming_update_period(&self) -> f64 {
        0.05
    }

    async fn get_updates(&self, wait: f64) -> Result<Option<BlockMap>> {
        let mut rx = self.inbound.lock().await;
        let mut batch: BlockMap = IndexMap::new();
        // Drain whatever is queued; otherwise wait up to the bound for the
        // first block to arrive.
        loop {
            match rx.try_recv() {
                Ok(block) => {
                    batch.insert(block.name.clone(), block);
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if batch.is_empty() {
                        return Err(EngineError::transport("loopback closed"));
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
                Ok(None) => return Err(EngineError::transport("loopback closed")),
                Err(_) => return Ok(None),
            }
        }
        Ok(Some(batch))
    }

    async fn send_updates(&self, outgoing: BlockMap) -> Result<()> {
        self.out_tx
            .send(outgoing)
            .map_err(|_| EngineError::transport("loopback receiver dropped"))
    }
}

//! In-process channel.
//!
//! `MemoryChannel::pair()` returns the client's `Channel` together with a
//! `MemoryPeer` that plays the worker: it reads what the client sent and
//! injects inbound messages, channel errors or closure.

use super::{Channel, ChannelReceiver, ChannelSender};
use crate::protocol::{InboundMessage, OutboundMessage};
use crate::{ClientError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Factory for in-process channel pairs.
pub struct MemoryChannel;

impl MemoryChannel {
    pub fn pair() -> (Channel, MemoryPeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let channel = Channel::new(
            MemorySender {
                tx: Some(outbound_tx),
                closed: closed.clone(),
            },
            MemoryReceiver { rx: inbound_rx },
        );
        let peer = MemoryPeer {
            outbound: outbound_rx,
            inbound: Some(inbound_tx),
            closed,
        };
        (channel, peer)
    }
}

struct MemorySender {
    tx: Option<mpsc::UnboundedSender<String>>,
    closed: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl ChannelSender for MemorySender {
    async fn send(&mut self, payload: String) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| ClientError::channel("channel closed"))?;
        tx.send(payload)
            .map_err(|_| ClientError::channel("peer disconnected"))
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.tx = None;
        Ok(())
    }
}

struct MemoryReceiver {
    rx: mpsc::UnboundedReceiver<Result<String>>,
}

#[async_trait::async_trait]
impl ChannelReceiver for MemoryReceiver {
    async fn recv(&mut self) -> Option<Result<String>> {
        self.rx.recv().await
    }
}

/// Worker-side end of an in-process channel.
#[derive(Debug)]
pub struct MemoryPeer {
    outbound: mpsc::UnboundedReceiver<String>,
    inbound: Option<mpsc::UnboundedSender<Result<String>>>,
    closed: Arc<AtomicBool>,
}

impl MemoryPeer {
    /// Next raw payload sent by the client. `None` once the client closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    /// Next message sent by the client, parsed.
    pub async fn recv_message(&mut self) -> Option<OutboundMessage> {
        let payload = self.outbound.recv().await?;
        serde_json::from_str(&payload).ok()
    }

    /// Next message if one is already queued.
    pub fn try_recv_message(&mut self) -> Option<OutboundMessage> {
        let payload = self.outbound.try_recv().ok()?;
        serde_json::from_str(&payload).ok()
    }

    /// Deliver a typed message to the client.
    pub fn send(&self, message: &InboundMessage) -> Result<()> {
        self.send_raw(serde_json::to_string(message)?)
    }

    /// Deliver an arbitrary JSON value to the client.
    pub fn send_json(&self, value: serde_json::Value) -> Result<()> {
        self.send_raw(value.to_string())
    }

    /// Deliver a raw payload, which need not be valid JSON.
    pub fn send_raw(&self, payload: impl Into<String>) -> Result<()> {
        self.push(Ok(payload.into()))
    }

    /// Report a channel-level error to the client without closing.
    pub fn fail(&self, message: impl Into<String>) -> Result<()> {
        self.push(Err(ClientError::channel(message)))
    }

    /// Close the worker side; the client observes end-of-channel.
    pub fn close(&mut self) {
        self.inbound = None;
    }

    /// Whether the client released its end.
    pub fn is_closed_by_client(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn push(&self, item: Result<String>) -> Result<()> {
        let tx = self
            .inbound
            .as_ref()
            .ok_or_else(|| ClientError::channel("peer closed"))?;
        tx.send(item)
            .map_err(|_| ClientError::channel("client disconnected"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_carries_messages_both_ways() {
        let (channel, mut peer) = MemoryChannel::pair();
        let (mut sender, mut receiver) = channel.into_parts();

        sender
            .send(r#"{"type":"create_env","env_id":"a"}"#.to_string())
            .await
            .unwrap();
        assert_eq!(
            peer.recv_message().await,
            Some(OutboundMessage::CreateEnv {
                env_id: "a".into()
            })
        );

        peer.send(&InboundMessage::Ready { message: None }).unwrap();
        let text = receiver.recv().await.unwrap().unwrap();
        assert_eq!(text, r#"{"type":"ready"}"#);
    }

    #[tokio::test]
    async fn test_peer_failure_and_close_are_observed() {
        let (channel, mut peer) = MemoryChannel::pair();
        let (_sender, mut receiver) = channel.into_parts();

        peer.fail("worker crashed").unwrap();
        assert!(matches!(
            receiver.recv().await,
            Some(Err(ClientError::ChannelFailure { .. }))
        ));

        peer.close();
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_client_close_is_visible_to_peer() {
        let (channel, mut peer) = MemoryChannel::pair();
        let (mut sender, _receiver) = channel.into_parts();

        sender.close().await.unwrap();
        assert!(peer.is_closed_by_client());
        assert!(peer.recv().await.is_none());
        assert!(sender.send("{}".to_string()).await.is_err());
    }
}

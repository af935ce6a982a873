//! Bidirectional message channel to the worker.
//!
//! The client needs exactly two capabilities from a transport: send one text
//! message, and receive zero or more text messages asynchronously. A
//! `Channel` bundles one half of each, and the client owns it exclusively for
//! its whole lifetime.
//!
//! # Implementations
//!
//! - **memory**: in-process pair backed by tokio mpsc, used by tests and
//!   in-process workers
//! - **stream**: length-prefixed JSON frames over TCP or a child process's
//!   stdio

pub mod memory;
pub mod stream;

pub use memory::{MemoryChannel, MemoryPeer};
pub use stream::StreamChannel;

use crate::Result;

/// Outbound half of a channel.
#[async_trait::async_trait]
pub trait ChannelSender: Send + 'static {
    /// Deliver one serialized message to the worker.
    async fn send(&mut self, payload: String) -> Result<()>;

    /// Release the channel. Called exactly once, on termination.
    async fn close(&mut self) -> Result<()>;
}

/// Inbound half of a channel.
#[async_trait::async_trait]
pub trait ChannelReceiver: Send + 'static {
    /// Next inbound payload.
    ///
    /// `Some(Err(_))` reports a channel-level error without closing the
    /// channel; `None` means the channel is closed for good. Must be cancel
    /// safe: the client polls it inside `tokio::select!`.
    async fn recv(&mut self) -> Option<Result<String>>;
}

/// A sender/receiver pair connected to one worker.
pub struct Channel {
    sender: Box<dyn ChannelSender>,
    receiver: Box<dyn ChannelReceiver>,
}

impl Channel {
    pub fn new(sender: impl ChannelSender, receiver: impl ChannelReceiver) -> Self {
        Self {
            sender: Box::new(sender),
            receiver: Box::new(receiver),
        }
    }

    pub fn into_parts(self) -> (Box<dyn ChannelSender>, Box<dyn ChannelReceiver>) {
        (self.sender, self.receiver)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

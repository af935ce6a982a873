//! Builder for configuring a `WorkerClient`.

use super::driver::Driver;
use super::{ClientInner, WorkerClient};
use crate::channel::Channel;
use crate::config::ClientConfig;
use crate::dispatcher::OutputObserver;
use crate::protocol::OutputAt;
use crate::ready::ReadyState;
use crate::{ClientError, Result};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Builder for configuring a `WorkerClient`.
///
/// # Example
///
/// ```rust,ignore
/// let (channel, _peer) = MemoryChannel::pair();
/// let client = WorkerClient::builder(channel)
///     .request_timeout(Duration::from_secs(10))
///     .on_output_at(|out| eprint!("{}", out.caml_ppf))
///     .build()?;
/// ```
pub struct WorkerClientBuilder {
    channel: Channel,
    request_timeout: Option<Duration>,
    handshake_timeout: Option<Duration>,
    observer: Option<OutputObserver>,
}

impl WorkerClientBuilder {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            request_timeout: Some(ClientConfig::DEFAULT_REQUEST_TIMEOUT),
            handshake_timeout: None,
            observer: None,
        }
    }

    /// Timeout armed for every request.
    ///
    /// Default: 30 seconds
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Let requests wait indefinitely unless overridden per call.
    pub fn without_request_timeout(mut self) -> Self {
        self.request_timeout = None;
        self
    }

    /// Timeout for the readiness handshake.
    ///
    /// Default: same as the request timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Observe every incremental output message as it arrives.
    pub fn on_output_at<F>(mut self, observer: F) -> Self
    where
        F: Fn(&OutputAt) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    fn validate(&self) -> Result<()> {
        for (field, timeout) in [
            ("request_timeout", self.request_timeout),
            ("handshake_timeout", self.handshake_timeout),
        ] {
            if timeout == Some(Duration::ZERO) {
                return Err(ClientError::Validation {
                    field: field.to_string(),
                    message: "timeout must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Build the client and start its driver task.
    ///
    /// Must be called within a tokio runtime.
    pub fn build(self) -> Result<WorkerClient> {
        self.validate()?;

        let handshake_timeout = self.handshake_timeout.or(self.request_timeout);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ReadyState::Uninitialized);
        let terminated = Arc::new(AtomicBool::new(false));

        let driver = Driver::new(
            self.channel,
            self.observer,
            commands_rx,
            state_tx,
            handshake_timeout,
            terminated.clone(),
        );
        tokio::spawn(driver.run());

        Ok(WorkerClient {
            inner: Arc::new(ClientInner {
                commands: commands_tx,
                state: state_rx,
                terminated,
            }),
            request_timeout: self.request_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;

    #[tokio::test]
    async fn test_zero_timeout_is_rejected() {
        let (channel, _peer) = MemoryChannel::pair();
        let result = WorkerClientBuilder::new(channel)
            .request_timeout(Duration::ZERO)
            .build();

        match result {
            Err(ClientError::Validation { field, .. }) => assert_eq!(field, "request_timeout"),
            other => panic!("Expected Validation error, got: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_zero_handshake_timeout_is_rejected() {
        let (channel, _peer) = MemoryChannel::pair();
        let result = WorkerClientBuilder::new(channel)
            .handshake_timeout(Duration::ZERO)
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_defaults_build() {
        let (channel, _peer) = MemoryChannel::pair();
        let client = WorkerClientBuilder::new(channel).build().unwrap();
        assert_eq!(client.ready_state(), ReadyState::Uninitialized);
        assert_eq!(
            client.request_timeout(),
            Some(ClientConfig::DEFAULT_REQUEST_TIMEOUT)
        );
        assert!(!client.is_terminated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_request_timeout_waits_indefinitely() {
        let (channel, mut peer) = MemoryChannel::pair();
        let client = WorkerClientBuilder::new(channel)
            .without_request_timeout()
            .build()
            .unwrap();
        assert_eq!(client.request_timeout(), None);

        let mut task = tokio::spawn({
            let client = client.clone();
            async move { client.evaluate("loop", "").await }
        });
        assert!(peer.recv().await.is_some());

        // Well past the default deadline, still pending.
        let waited = tokio::time::timeout(Duration::from_secs(120), &mut task).await;
        assert!(waited.is_err());

        peer.send_json(serde_json::json!({"type": "output", "cell_id": 1, "caml_ppf": "done"}))
            .unwrap();
        assert_eq!(task.await.unwrap().unwrap().caml_ppf, "done");
    }
}

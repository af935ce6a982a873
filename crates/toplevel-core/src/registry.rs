//! Pending-request registry.
//!
//! Maps each outstanding correlation key to the caller awaiting its response.
//! Every entry is settled exactly once: by a matching terminal message, by
//! its timer, or by a bulk rejection (channel failure, termination). Lookups
//! for absent keys are not errors; a late response after a timeout is an
//! expected race and is simply dropped.

use crate::config::ClientConfig;
use crate::protocol::{CorrelationKey, Response};
use crate::timer::{Expiry, Timer};
use crate::{ClientError, Result};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Sender half through which a pending request is settled.
pub type Reply = oneshot::Sender<Result<Response>>;

#[derive(Debug)]
struct PendingRequest {
    reply: Reply,
    ticket: u64,
    timeout: Option<Duration>,
    // Held for its Drop: removing the entry cancels the timer.
    _timer: Option<Timer>,
}

impl PendingRequest {
    fn settle(self, key: &CorrelationKey, outcome: Result<Response>) {
        if self.reply.send(outcome).is_err() {
            debug!("Caller for {} stopped waiting before settlement", key);
        }
    }
}

/// Registry of requests awaiting a terminal response.
#[derive(Debug)]
pub struct PendingRegistry {
    entries: HashMap<CorrelationKey, PendingRequest>,
    next_cell_id: u64,
    next_ticket: u64,
    expiry_tx: mpsc::UnboundedSender<Expiry>,
}

impl PendingRegistry {
    /// Create an empty registry whose timers report on `expiry_tx`.
    pub fn new(expiry_tx: mpsc::UnboundedSender<Expiry>) -> Self {
        Self {
            entries: HashMap::new(),
            next_cell_id: ClientConfig::FIRST_CELL_ID,
            next_ticket: 0,
            expiry_tx,
        }
    }

    /// Allocate the next numeric correlation key.
    ///
    /// Strictly increasing for the lifetime of the registry; never recycled.
    pub fn next_cell_id(&mut self) -> u64 {
        let id = self.next_cell_id;
        self.next_cell_id += 1;
        id
    }

    /// Register a pending request, arming a timer when `timeout` is set.
    ///
    /// If `key` is already pending the newcomer is rejected with
    /// `KeyInUse` and the existing entry is left untouched. Returns whether
    /// the entry was registered.
    pub fn register(&mut self, key: CorrelationKey, reply: Reply, timeout: Option<Duration>) -> bool {
        if self.entries.contains_key(&key) {
            let _ = reply.send(Err(ClientError::KeyInUse {
                key: key.to_string(),
            }));
            return false;
        }

        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let timer = timeout.map(|after| {
            Timer::start(
                after,
                Expiry::Request {
                    key: key.clone(),
                    ticket,
                },
                self.expiry_tx.clone(),
            )
        });

        debug!("Registered pending request for {}", key);
        self.entries.insert(
            key,
            PendingRequest {
                reply,
                ticket,
                timeout,
                _timer: timer,
            },
        );
        true
    }

    /// Resolve the entry for `key`. Returns `false` if nothing was pending.
    pub fn resolve(&mut self, key: &CorrelationKey, response: Response) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                debug!("Resolved {} with {}", key, response.kind());
                entry.settle(key, Ok(response));
                true
            }
            None => false,
        }
    }

    /// Reject the entry for `key`. Returns `false` if nothing was pending.
    pub fn reject(&mut self, key: &CorrelationKey, error: ClientError) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                debug!("Rejected {}: {}", key, error);
                entry.settle(key, Err(error));
                true
            }
            None => false,
        }
    }

    /// Handle a fired timer for the registration identified by `ticket`.
    ///
    /// Stale expiries (the entry was already settled, or the key has since
    /// been registered again) are ignored.
    pub fn expire(&mut self, key: &CorrelationKey, ticket: u64) -> bool {
        let current = matches!(self.entries.get(key), Some(entry) if entry.ticket == ticket);
        if !current {
            return false;
        }

        match self.entries.remove(key) {
            Some(entry) => {
                let after = entry.timeout.unwrap_or_default();
                debug!("Request for {} timed out after {:?}", key, after);
                entry.settle(key, Err(ClientError::Timeout(after)));
                true
            }
            None => false,
        }
    }

    /// Reject every pending entry, building one error per entry.
    ///
    /// Returns the number of entries rejected.
    pub fn reject_all(&mut self, mut error: impl FnMut() -> ClientError) -> usize {
        let count = self.entries.len();
        for (key, entry) in self.entries.drain() {
            entry.settle(&key, Err(error()));
        }
        count
    }

    pub fn contains(&self, key: &CorrelationKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EnvAck;

    fn registry() -> (PendingRegistry, mpsc::UnboundedReceiver<Expiry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PendingRegistry::new(tx), rx)
    }

    fn ack(env_id: &str) -> Response {
        Response::EnvCreated(EnvAck {
            env_id: env_id.to_string(),
        })
    }

    #[tokio::test]
    async fn test_cell_ids_start_at_one_and_increase() {
        let (mut reg, _rx) = registry();
        assert_eq!(reg.next_cell_id(), 1);
        assert_eq!(reg.next_cell_id(), 2);
        assert_eq!(reg.next_cell_id(), 3);
    }

    #[tokio::test]
    async fn test_resolve_settles_and_removes_entry() {
        let (mut reg, _rx) = registry();
        let key = CorrelationKey::Env("env1".into());
        let (tx, rx) = oneshot::channel();

        assert!(reg.register(key.clone(), tx, None));
        assert!(reg.contains(&key));

        assert!(reg.resolve(&key, ack("env1")));
        assert!(reg.is_empty());
        assert_eq!(rx.await.unwrap().unwrap(), ack("env1"));
    }

    #[tokio::test]
    async fn test_resolve_unknown_key_is_discarded() {
        let (mut reg, _rx) = registry();
        assert!(!reg.resolve(&CorrelationKey::Cell(99), ack("x")));
        assert!(!reg.reject(&CorrelationKey::Cell(99), ClientError::Terminated));
    }

    #[tokio::test]
    async fn test_second_settlement_is_ignored() {
        let (mut reg, _rx) = registry();
        let key = CorrelationKey::Cell(1);
        let (tx, rx) = oneshot::channel();
        reg.register(key.clone(), tx, None);

        assert!(reg.reject(
            &key,
            ClientError::Operation {
                message: "boom".into()
            }
        ));
        assert!(!reg.resolve(&key, ack("late")));

        match rx.await.unwrap() {
            Err(ClientError::Operation { message }) => assert_eq!(message, "boom"),
            other => panic!("Expected Operation error, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_key_rejects_newcomer() {
        let (mut reg, _rx) = registry();
        let key = CorrelationKey::Env("dup".into());
        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();

        assert!(reg.register(key.clone(), first_tx, None));
        assert!(!reg.register(key.clone(), second_tx, None));

        assert!(matches!(
            second_rx.await.unwrap(),
            Err(ClientError::KeyInUse { .. })
        ));

        reg.resolve(&key, ack("dup"));
        assert!(first_rx.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_expiry_rejects_with_timeout() {
        let (mut reg, mut expiries) = registry();
        let key = CorrelationKey::Cell(reg.next_cell_id());
        let (tx, rx) = oneshot::channel();
        reg.register(key.clone(), tx, Some(Duration::from_millis(50)));

        let expiry = expiries.recv().await.unwrap();
        match expiry {
            Expiry::Request { key: fired, ticket } => {
                assert_eq!(fired, key);
                assert!(reg.expire(&fired, ticket));
            }
            other => panic!("Expected request expiry, got: {:?}", other),
        }

        assert!(reg.is_empty());
        match rx.await.unwrap() {
            Err(ClientError::Timeout(after)) => assert_eq!(after, Duration::from_millis(50)),
            other => panic!("Expected Timeout, got: {:?}", other),
        }

        // A late response for the expired key is dropped.
        assert!(!reg.resolve(&key, ack("late")));
    }

    #[tokio::test]
    async fn test_stale_expiry_does_not_hit_reregistered_key() {
        let (mut reg, _rx) = registry();
        let key = CorrelationKey::Env("env1".into());

        let (tx, _first_rx) = oneshot::channel();
        reg.register(key.clone(), tx, None);
        reg.resolve(&key, ack("env1"));

        let (tx, _second_rx) = oneshot::channel();
        reg.register(key.clone(), tx, None);

        // Ticket 1 belonged to the first registration.
        assert!(!reg.expire(&key, 1));
        assert!(reg.contains(&key));
    }

    #[tokio::test]
    async fn test_reject_all_drains_registry() {
        let (mut reg, _rx) = registry();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = oneshot::channel();
            let key = CorrelationKey::Cell(reg.next_cell_id());
            reg.register(key, tx, Some(Duration::from_secs(30)));
            receivers.push(rx);
        }

        assert_eq!(reg.reject_all(|| ClientError::Terminated), 3);
        assert!(reg.is_empty());

        for rx in receivers {
            assert!(matches!(rx.await.unwrap(), Err(ClientError::Terminated)));
        }
    }
}

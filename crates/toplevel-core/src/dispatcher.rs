//! Inbound message dispatcher.
//!
//! The dispatcher owns the registry, the output accumulator and the ready
//! state machine. It consumes one inbound message at a time and applies at
//! most one settle-or-accumulate effect, so it can be driven directly in
//! tests without any channel.
//!
//! | `type`                                        | effect                              |
//! |-----------------------------------------------|-------------------------------------|
//! | `ready` / `init_error`                        | ready-state transition              |
//! | `output_at`                                   | accumulate + observer               |
//! | `output`, `completions`, `types`, `errors`    | resolve by `cell_id`                |
//! | `eval_error`                                  | reject by `cell_id`                 |
//! | `env_created`, `env_destroyed`                | resolve by `env_id`                 |
//! | anything else                                 | logged and ignored                  |

use crate::accumulator::OutputAccumulator;
use crate::protocol::{CorrelationKey, InboundMessage, OutputAt, Response};
use crate::ready::{ReadyMachine, ReadyState};
use crate::registry::PendingRegistry;
use crate::timer::Expiry;
use crate::ClientError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Callback invoked once per incremental output message.
pub type OutputObserver = Arc<dyn Fn(&OutputAt) + Send + Sync>;

/// Effect of dispatching one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handshake completed.
    Ready,
    /// Handshake failed.
    InitFailed,
    /// Incremental fragment appended for a pending cell.
    Accumulated(u64),
    Resolved(CorrelationKey),
    Rejected(CorrelationKey),
    /// Message referenced a key with nothing pending.
    Discarded(CorrelationKey),
    /// Message had no effect (unknown type, malformed, stray handshake message).
    Ignored,
}

pub struct Dispatcher {
    registry: PendingRegistry,
    accumulator: OutputAccumulator,
    ready: ReadyMachine,
    observer: Option<OutputObserver>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("accumulator", &self.accumulator)
            .field("ready", &self.ready)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(expiry_tx: mpsc::UnboundedSender<Expiry>, observer: Option<OutputObserver>) -> Self {
        Self {
            registry: PendingRegistry::new(expiry_tx),
            accumulator: OutputAccumulator::new(),
            ready: ReadyMachine::new(),
            observer,
        }
    }

    pub fn registry(&self) -> &PendingRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut PendingRegistry {
        &mut self.registry
    }

    pub fn accumulator(&self) -> &OutputAccumulator {
        &self.accumulator
    }

    pub fn ready(&self) -> &ReadyMachine {
        &self.ready
    }

    pub fn ready_mut(&mut self) -> &mut ReadyMachine {
        &mut self.ready
    }

    /// Parse and dispatch a raw inbound payload.
    ///
    /// Malformed JSON is a protocol violation: logged, never raised.
    pub fn dispatch_text(&mut self, text: &str) -> DispatchOutcome {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!("Discarding malformed worker message: {}", e);
                return DispatchOutcome::Ignored;
            }
        };

        let tag = value
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("<missing>")
            .to_string();

        match serde_json::from_value::<InboundMessage>(value) {
            Ok(InboundMessage::Unknown) => {
                warn!("Unknown message type: {}", tag);
                DispatchOutcome::Ignored
            }
            Ok(message) => self.dispatch(message),
            Err(e) => {
                warn!("Discarding invalid '{}' message: {}", tag, e);
                DispatchOutcome::Ignored
            }
        }
    }

    /// Apply one inbound message.
    pub fn dispatch(&mut self, message: InboundMessage) -> DispatchOutcome {
        match message {
            InboundMessage::Ready { message } => {
                if self.ready.acknowledge(message) {
                    DispatchOutcome::Ready
                } else {
                    DispatchOutcome::Ignored
                }
            }
            InboundMessage::InitError { message } => {
                if self.ready.fail(message) {
                    DispatchOutcome::InitFailed
                } else {
                    DispatchOutcome::Ignored
                }
            }
            InboundMessage::OutputAt(fragment) => self.accumulate(fragment),
            InboundMessage::Output(mut output) => {
                let cell_id = output.cell_id;
                if self.accumulator.merge_into(&mut output) {
                    debug!("Merged streamed output into cell {}", cell_id);
                }
                self.resolve(CorrelationKey::Cell(cell_id), Response::Output(output))
            }
            InboundMessage::Completions(completions) => {
                let key = CorrelationKey::Cell(completions.cell_id);
                self.resolve(key, Response::Completions(completions))
            }
            InboundMessage::Types(types) => {
                let key = CorrelationKey::Cell(types.cell_id);
                self.resolve(key, Response::Types(types))
            }
            InboundMessage::Errors(errors) => {
                let key = CorrelationKey::Cell(errors.cell_id);
                self.resolve(key, Response::Errors(errors))
            }
            InboundMessage::EvalError { cell_id, message } => {
                self.accumulator.discard(cell_id);
                let key = CorrelationKey::Cell(cell_id);
                if self.registry.reject(&key, ClientError::Operation { message }) {
                    DispatchOutcome::Rejected(key)
                } else {
                    self.discarded(key)
                }
            }
            InboundMessage::EnvCreated(ack) => {
                let key = CorrelationKey::Env(ack.env_id.clone());
                self.resolve(key, Response::EnvCreated(ack))
            }
            InboundMessage::EnvDestroyed(ack) => {
                let key = CorrelationKey::Env(ack.env_id.clone());
                self.resolve(key, Response::EnvDestroyed(ack))
            }
            InboundMessage::Unknown => {
                warn!("Unknown message type");
                DispatchOutcome::Ignored
            }
        }
    }

    /// Handle a fired timer.
    pub fn expire(&mut self, expiry: Expiry, handshake_timeout: Option<Duration>) -> bool {
        match expiry {
            Expiry::Request { key, ticket } => {
                let expired = self.registry.expire(&key, ticket);
                if expired {
                    if let CorrelationKey::Cell(cell_id) = key {
                        self.accumulator.discard(cell_id);
                    }
                }
                expired
            }
            Expiry::Handshake => {
                let after = handshake_timeout.unwrap_or_default();
                self.ready
                    .fail(format!("Worker not ready after {:?}", after))
            }
        }
    }

    /// Channel-level failure: reject every pending request and abort an
    /// in-flight handshake. Returns the number of requests rejected.
    pub fn fail_channel(&mut self, message: &str) -> usize {
        if *self.ready.state() == ReadyState::Initializing {
            self.ready.fail(format!("Channel failure: {}", message));
        }
        self.accumulator.clear();
        self.registry.reject_all(|| ClientError::channel(message))
    }

    /// Reject everything outstanding with `Terminated`.
    pub fn terminate(&mut self) -> usize {
        self.ready.terminate();
        self.accumulator.clear();
        self.registry.reject_all(|| ClientError::Terminated)
    }

    fn accumulate(&mut self, fragment: OutputAt) -> DispatchOutcome {
        if let Some(observer) = &self.observer {
            observer(&fragment);
        }

        let key = CorrelationKey::Cell(fragment.cell_id);
        if !self.registry.contains(&key) {
            // No terminal message will ever consume it.
            return self.discarded(key);
        }

        self.accumulator
            .append(fragment.cell_id, &fragment.caml_ppf);
        DispatchOutcome::Accumulated(fragment.cell_id)
    }

    fn resolve(&mut self, key: CorrelationKey, response: Response) -> DispatchOutcome {
        if self.registry.resolve(&key, response) {
            DispatchOutcome::Resolved(key)
        } else {
            self.discarded(key)
        }
    }

    fn discarded(&self, key: CorrelationKey) -> DispatchOutcome {
        debug!("No pending request for {}, discarding message", key);
        DispatchOutcome::Discarded(key)
    }
}

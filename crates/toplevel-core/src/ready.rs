//! Readiness handshake state machine.
//!
//! ```text
//! Uninitialized ──initialize──▶ Initializing ──ready──────▶ Ready
//!                                    │
//!                                    └──init_error/timeout──▶ Failed
//! ```
//!
//! `Ready` and `Failed` are terminal. A client that failed its handshake
//! needs a fresh channel and a fresh client.

use crate::timer::Timer;
use crate::{ClientError, Result};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Observable handshake state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReadyState {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
    /// Carries the failure cause reported to every later caller.
    Failed(String),
}

impl ReadyState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ReadyState::Ready)
    }
}

#[derive(Debug)]
struct Handshake {
    reply: oneshot::Sender<Result<()>>,
    _timer: Option<Timer>,
}

/// Owns the handshake state and everyone waiting on it.
#[derive(Debug, Default)]
pub struct ReadyMachine {
    state: ReadyState,
    handshake: Option<Handshake>,
    waiters: Vec<oneshot::Sender<Result<()>>>,
}

impl ReadyMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &ReadyState {
        &self.state
    }

    /// Check whether a handshake may start from the current state.
    pub fn check_can_begin(&self) -> Result<()> {
        match &self.state {
            ReadyState::Uninitialized => Ok(()),
            ReadyState::Initializing | ReadyState::Ready => Err(ClientError::AlreadyInitialized),
            ReadyState::Failed(cause) => Err(ClientError::InitializationFailed {
                message: cause.clone(),
            }),
        }
    }

    /// Enter `Initializing`, holding the caller of `initialize` until the
    /// worker answers or `timer` fires.
    pub fn begin(&mut self, reply: oneshot::Sender<Result<()>>, timer: Option<Timer>) {
        if let Err(e) = self.check_can_begin() {
            let _ = reply.send(Err(e));
            return;
        }
        info!("Worker handshake started");
        self.state = ReadyState::Initializing;
        self.handshake = Some(Handshake {
            reply,
            _timer: timer,
        });
    }

    /// Wait for readiness.
    ///
    /// Settles immediately unless a handshake is in flight. Before any
    /// handshake the worker is assumed usable as-is.
    pub fn wait(&mut self, waiter: oneshot::Sender<Result<()>>) {
        match &self.state {
            ReadyState::Uninitialized | ReadyState::Ready => {
                let _ = waiter.send(Ok(()));
            }
            ReadyState::Initializing => self.waiters.push(waiter),
            ReadyState::Failed(cause) => {
                let _ = waiter.send(Err(ClientError::InitializationFailed {
                    message: cause.clone(),
                }));
            }
        }
    }

    /// Worker reported readiness. Returns `false` if already terminal.
    pub fn acknowledge(&mut self, greeting: Option<String>) -> bool {
        match self.state {
            ReadyState::Initializing => {}
            ReadyState::Uninitialized => {
                debug!("Worker announced readiness without a handshake");
            }
            ReadyState::Ready | ReadyState::Failed(_) => {
                debug!("Ignoring readiness message in state {:?}", self.state);
                return false;
            }
        }

        match greeting {
            Some(greeting) => info!("Worker ready: {}", greeting),
            None => info!("Worker ready"),
        }
        self.state = ReadyState::Ready;
        if let Some(handshake) = self.handshake.take() {
            let _ = handshake.reply.send(Ok(()));
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        true
    }

    /// Handshake failed. Only meaningful while `Initializing`.
    pub fn fail(&mut self, cause: impl Into<String>) -> bool {
        if self.state != ReadyState::Initializing {
            warn!("Ignoring initialization failure in state {:?}", self.state);
            return false;
        }

        let cause = cause.into();
        warn!("Worker initialization failed: {}", cause);
        self.state = ReadyState::Failed(cause.clone());
        if let Some(handshake) = self.handshake.take() {
            let _ = handshake.reply.send(Err(ClientError::InitializationFailed {
                message: cause.clone(),
            }));
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(ClientError::InitializationFailed {
                message: cause.clone(),
            }));
        }
        true
    }

    /// Reject everyone still waiting on the handshake.
    pub fn terminate(&mut self) {
        if let Some(handshake) = self.handshake.take() {
            let _ = handshake.reply.send(Err(ClientError::Terminated));
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(ClientError::Terminated));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handshake_success_settles_initializer_and_waiters() {
        let mut machine = ReadyMachine::new();
        let (init_tx, init_rx) = oneshot::channel();
        let (wait_tx, wait_rx) = oneshot::channel();

        machine.begin(init_tx, None);
        assert_eq!(machine.state(), &ReadyState::Initializing);
        machine.wait(wait_tx);

        assert!(machine.acknowledge(Some("hello".into())));
        assert!(machine.state().is_ready());
        assert!(init_rx.await.unwrap().is_ok());
        assert!(wait_rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_failure_is_terminal_and_sticky() {
        let mut machine = ReadyMachine::new();
        let (init_tx, init_rx) = oneshot::channel();
        machine.begin(init_tx, None);

        assert!(machine.fail("package fmt not found"));
        assert!(matches!(
            init_rx.await.unwrap(),
            Err(ClientError::InitializationFailed { .. })
        ));

        // Later waiters fail fast with the stored cause.
        let (wait_tx, wait_rx) = oneshot::channel();
        machine.wait(wait_tx);
        match wait_rx.await.unwrap() {
            Err(ClientError::InitializationFailed { message }) => {
                assert_eq!(message, "package fmt not found")
            }
            other => panic!("Expected InitializationFailed, got: {:?}", other),
        }

        // A late readiness message does not revive the client.
        assert!(!machine.acknowledge(None));
        assert!(matches!(machine.state(), ReadyState::Failed(_)));
    }

    #[tokio::test]
    async fn test_second_begin_is_rejected() {
        let mut machine = ReadyMachine::new();
        let (first_tx, _first_rx) = oneshot::channel();
        machine.begin(first_tx, None);
        machine.acknowledge(None);

        assert!(matches!(
            machine.check_can_begin(),
            Err(ClientError::AlreadyInitialized)
        ));

        let (second_tx, second_rx) = oneshot::channel();
        machine.begin(second_tx, None);
        assert!(matches!(
            second_rx.await.unwrap(),
            Err(ClientError::AlreadyInitialized)
        ));
        assert!(machine.state().is_ready());
    }

    #[tokio::test]
    async fn test_wait_before_handshake_passes_through() {
        let mut machine = ReadyMachine::new();
        let (tx, rx) = oneshot::channel();
        machine.wait(tx);
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_fail_outside_handshake_is_ignored() {
        let mut machine = ReadyMachine::new();
        assert!(!machine.fail("stray"));
        assert_eq!(machine.state(), &ReadyState::Uninitialized);
    }

    #[tokio::test]
    async fn test_terminate_rejects_pending_handshake() {
        let mut machine = ReadyMachine::new();
        let (init_tx, init_rx) = oneshot::channel();
        let (wait_tx, wait_rx) = oneshot::channel();
        machine.begin(init_tx, None);
        machine.wait(wait_tx);

        machine.terminate();
        assert!(matches!(init_rx.await.unwrap(), Err(ClientError::Terminated)));
        assert!(matches!(wait_rx.await.unwrap(), Err(ClientError::Terminated)));
    }
}

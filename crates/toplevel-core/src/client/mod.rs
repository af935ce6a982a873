//! Public client facade.
//!
//! `WorkerClient` is a cheap, cloneable handle onto a driver task that owns
//! the channel and all correlation state. Every operation waits for the
//! readiness handshake, hands a request to the driver and suspends until the
//! matching terminal message, a timeout or termination settles it.
//!
//! # Example
//!
//! ```rust,ignore
//! let channel = StreamChannel::connect_tcp(addr).await?;
//! let client = WorkerClient::new(channel)?;
//!
//! client.initialize(InitConfig::new().require("fmt")).await?;
//! let output = client.evaluate("1 + 1;;", "").await?;
//! println!("{}", output.caml_ppf);
//!
//! client.terminate();
//! ```

mod builder;
mod driver;

pub use builder::WorkerClientBuilder;

use crate::channel::Channel;
use crate::config::InitConfig;
use crate::protocol::{
    Completions, EnvAck, ErrorList, EvalOutput, Request, Response, TypesResult,
};
use crate::ready::ReadyState;
use crate::{ClientError, Result};
use driver::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

/// Handle for issuing requests to one worker.
///
/// Clones share the same channel, registry and handshake. The driver task
/// stops when `terminate` is called or the last clone is dropped.
#[derive(Clone)]
pub struct WorkerClient {
    inner: Arc<ClientInner>,
    request_timeout: Option<Duration>,
}

struct ClientInner {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ReadyState>,
    terminated: Arc<AtomicBool>,
}

impl WorkerClient {
    /// Create a builder for a client over `channel`.
    pub fn builder(channel: Channel) -> WorkerClientBuilder {
        WorkerClientBuilder::new(channel)
    }

    /// Create a client with default settings.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(channel: Channel) -> Result<Self> {
        Self::builder(channel).build()
    }

    // ========================================
    // Handshake
    // ========================================

    /// Run the one-time readiness handshake.
    ///
    /// Resolves when the worker reports readiness. Fails with
    /// `InitializationFailed` on `init_error` or when the handshake timer
    /// fires, and with `AlreadyInitialized` on a repeated call.
    pub async fn initialize(&self, config: InitConfig) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Initialize { config, reply })?;
        Self::settle(rx).await
    }

    /// Wait until the handshake has settled.
    ///
    /// Returns immediately if no handshake was started or it already
    /// succeeded; fails with the stored cause if it failed.
    pub async fn wait_until_ready(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::WaitReady { reply })?;
        Self::settle(rx).await
    }

    /// Current handshake state.
    pub fn ready_state(&self) -> ReadyState {
        self.inner.state.borrow().clone()
    }

    /// Handle onto the same worker whose requests use `timeout` instead of
    /// the configured default. `None` waits indefinitely.
    ///
    /// ```rust,ignore
    /// let types = client
    ///     .with_timeout(Some(Duration::from_millis(500)))
    ///     .query_types(source, 12, "")
    ///     .await?;
    /// ```
    pub fn with_timeout(&self, timeout: Option<Duration>) -> Self {
        Self {
            inner: self.inner.clone(),
            request_timeout: timeout,
        }
    }

    /// Timeout armed for requests issued through this handle.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    // ========================================
    // Operations
    // ========================================

    /// Evaluate a phrase (or several) in `env_id`.
    ///
    /// Incremental output is delivered to the observer registered with
    /// `WorkerClientBuilder::on_output_at`; the returned output carries the
    /// accumulated toplevel output when the worker left it empty.
    pub async fn evaluate(&self, code: &str, env_id: &str) -> Result<EvalOutput> {
        let request = Request::Eval {
            env_id: env_id.to_string(),
            code: code.to_string(),
        };
        match self.request(request).await? {
            Response::Output(output) => Ok(output),
            other => Err(unexpected("output", &other)),
        }
    }

    /// Evaluate with an explicit timeout; `None` waits indefinitely.
    pub async fn evaluate_with_timeout(
        &self,
        code: &str,
        env_id: &str,
        timeout: Option<Duration>,
    ) -> Result<EvalOutput> {
        self.with_timeout(timeout).evaluate(code, env_id).await
    }

    /// Completions for the identifier at `position` in `source`.
    pub async fn complete(&self, source: &str, position: usize, env_id: &str) -> Result<Completions> {
        let request = Request::Complete {
            env_id: env_id.to_string(),
            source: source.to_string(),
            position,
        };
        match self.request(request).await? {
            Response::Completions(completions) => Ok(completions),
            other => Err(unexpected("completions", &other)),
        }
    }

    /// Types of the expressions enclosing `position` in `source`.
    pub async fn query_types(&self, source: &str, position: usize, env_id: &str) -> Result<TypesResult> {
        let request = Request::TypeAt {
            env_id: env_id.to_string(),
            source: source.to_string(),
            position,
        };
        match self.request(request).await? {
            Response::Types(types) => Ok(types),
            other => Err(unexpected("types", &other)),
        }
    }

    /// Diagnostics for `source` without evaluating it.
    pub async fn query_errors(&self, source: &str, env_id: &str) -> Result<ErrorList> {
        let request = Request::Errors {
            env_id: env_id.to_string(),
            source: source.to_string(),
        };
        match self.request(request).await? {
            Response::Errors(errors) => Ok(errors),
            other => Err(unexpected("errors", &other)),
        }
    }

    // ========================================
    // Environments
    // ========================================

    /// Create an isolated environment named `env_id`.
    ///
    /// The id doubles as the correlation key, so only one create or destroy
    /// per id may be in flight; a concurrent second call fails with
    /// `KeyInUse`.
    pub async fn create_environment(&self, env_id: &str) -> Result<EnvAck> {
        let request = Request::CreateEnv {
            env_id: env_id.to_string(),
        };
        match self.request(request).await? {
            Response::EnvCreated(ack) => Ok(ack),
            other => Err(unexpected("env_created", &other)),
        }
    }

    /// Destroy the environment named `env_id`.
    pub async fn destroy_environment(&self, env_id: &str) -> Result<EnvAck> {
        let request = Request::DestroyEnv {
            env_id: env_id.to_string(),
        };
        match self.request(request).await? {
            Response::EnvDestroyed(ack) => Ok(ack),
            other => Err(unexpected("env_destroyed", &other)),
        }
    }

    // ========================================
    // Lifecycle
    // ========================================

    /// Close the channel and fail every outstanding request with
    /// `Terminated`.
    ///
    /// Returns without waiting for the driver. Calling it again is a no-op,
    /// and every later operation fails with `Terminated`.
    pub fn terminate(&self) {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            debug!("Worker client already terminated");
            return;
        }
        info!("Terminate requested");
        // Driver already gone means everything is settled.
        let _ = self.inner.commands.send(Command::Terminate);
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst) || self.inner.commands.is_closed()
    }

    async fn request(&self, request: Request) -> Result<Response> {
        self.wait_until_ready().await?;

        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Call {
            request,
            timeout: self.request_timeout,
            reply,
        })?;
        Self::settle(rx).await
    }

    fn send_command(&self, command: Command) -> Result<()> {
        if self.inner.terminated.load(Ordering::SeqCst) {
            return Err(ClientError::Terminated);
        }
        self.inner
            .commands
            .send(command)
            .map_err(|_| ClientError::Terminated)
    }

    async fn settle<T>(rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        // A dropped reply means the driver went away without answering.
        rx.await.unwrap_or(Err(ClientError::Terminated))
    }
}

impl std::fmt::Debug for WorkerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerClient")
            .field("state", &*self.inner.state.borrow())
            .field("request_timeout", &self.request_timeout)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

fn unexpected(expected: &'static str, actual: &Response) -> ClientError {
    ClientError::UnexpectedResponse {
        expected,
        actual: actual.kind(),
    }
}

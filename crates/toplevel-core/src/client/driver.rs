//! Driver task owning all client state.
//!
//! One spawned task per client. It multiplexes facade commands, inbound
//! channel traffic and fired timers in a single `select!` loop, so the
//! registry, accumulator and ready state are only ever touched by one task
//! and need no locking.

use crate::channel::{Channel, ChannelReceiver, ChannelSender};
use crate::config::InitConfig;
use crate::dispatcher::{DispatchOutcome, Dispatcher, OutputObserver};
use crate::protocol::{OutboundMessage, Request};
use crate::ready::ReadyState;
use crate::registry::Reply;
use crate::timer::{Expiry, Timer};
use crate::{ClientError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Requests from the facade to the driver.
pub(crate) enum Command {
    Initialize {
        config: InitConfig,
        reply: oneshot::Sender<Result<()>>,
    },
    WaitReady {
        reply: oneshot::Sender<Result<()>>,
    },
    Call {
        request: Request,
        timeout: Option<Duration>,
        reply: Reply,
    },
    Terminate,
}

pub(crate) struct Driver {
    dispatcher: Dispatcher,
    sender: Box<dyn ChannelSender>,
    receiver: Box<dyn ChannelReceiver>,
    commands: mpsc::UnboundedReceiver<Command>,
    expiry_tx: mpsc::UnboundedSender<Expiry>,
    expiries: mpsc::UnboundedReceiver<Expiry>,
    state_tx: watch::Sender<ReadyState>,
    handshake_timeout: Option<Duration>,
    channel_open: bool,
    // Set by the facade the moment `terminate` is called.
    terminated: Arc<AtomicBool>,
}

impl Driver {
    pub(crate) fn new(
        channel: Channel,
        observer: Option<OutputObserver>,
        commands: mpsc::UnboundedReceiver<Command>,
        state_tx: watch::Sender<ReadyState>,
        handshake_timeout: Option<Duration>,
        terminated: Arc<AtomicBool>,
    ) -> Self {
        let (expiry_tx, expiries) = mpsc::unbounded_channel();
        let (sender, receiver) = channel.into_parts();
        Self {
            dispatcher: Dispatcher::new(expiry_tx.clone(), observer),
            sender,
            receiver,
            commands,
            expiry_tx,
            expiries,
            state_tx,
            handshake_timeout,
            channel_open: true,
            terminated,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Terminate) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                inbound = self.receiver.recv(), if self.channel_open => {
                    self.handle_inbound(inbound);
                }
                Some(expiry) = self.expiries.recv() => {
                    if !self.is_terminated() {
                        self.dispatcher.expire(expiry, self.handshake_timeout);
                    }
                }
            }
            self.publish_state();
        }

        self.shutdown().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initialize { config, reply } => self.initialize(config, reply).await,
            Command::WaitReady { reply } => self.dispatcher.ready_mut().wait(reply),
            Command::Call {
                request,
                timeout,
                reply,
            } => self.call(request, timeout, reply).await,
            Command::Terminate => {}
        }
    }

    async fn initialize(&mut self, config: InitConfig, reply: oneshot::Sender<Result<()>>) {
        if let Err(e) = self.dispatcher.ready().check_can_begin() {
            // Rejected without touching the channel.
            let _ = reply.send(Err(e));
            return;
        }
        if !self.channel_open {
            let _ = reply.send(Err(ClientError::channel("channel closed")));
            return;
        }

        let payload = match OutboundMessage::init(&config).to_json() {
            Ok(p) => p,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let timer = self
            .handshake_timeout
            .map(|after| Timer::start(after, Expiry::Handshake, self.expiry_tx.clone()));
        self.dispatcher.ready_mut().begin(reply, timer);

        debug!(
            "Sending init ({} packages)",
            config.findlib_requires.len()
        );
        if let Err(e) = self.sender.send(payload).await {
            self.dispatcher
                .ready_mut()
                .fail(format!("Failed to send init: {}", e));
        }
    }

    async fn call(&mut self, request: Request, timeout: Option<Duration>, reply: Reply) {
        if !self.channel_open {
            let _ = reply.send(Err(ClientError::channel("channel closed")));
            return;
        }

        let registry = self.dispatcher.registry_mut();
        let (key, message) = request.bind(|| registry.next_cell_id());
        let payload = match message.to_json() {
            Ok(p) => p,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        if !registry.register(key.clone(), reply, timeout) {
            return;
        }

        debug!("Sending request for {}", key);
        if let Err(e) = self.sender.send(payload).await {
            warn!("Failed to send request for {}: {}", key, e);
            self.dispatcher.registry_mut().reject(&key, e);
        }
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn handle_inbound(&mut self, inbound: Option<Result<String>>) {
        // Nothing is dispatched once termination was requested, even if the
        // `Terminate` command is still queued behind buffered traffic.
        if self.is_terminated() {
            debug!("Dropping inbound message after termination");
            return;
        }

        match inbound {
            Some(Ok(text)) => {
                let outcome = self.dispatcher.dispatch_text(&text);
                if let DispatchOutcome::Discarded(key) = outcome {
                    debug!("Late or unmatched message for {}", key);
                }
            }
            Some(Err(e)) => {
                warn!("Channel error: {}", e);
                let rejected = self.dispatcher.fail_channel(&e.to_string());
                debug!("Rejected {} pending requests after channel error", rejected);
            }
            None => {
                warn!("Channel closed by worker");
                self.channel_open = false;
                self.dispatcher.fail_channel("channel closed");
            }
        }
    }

    fn publish_state(&self) {
        let state = self.dispatcher.ready().state();
        self.state_tx.send_if_modified(|current| {
            if current != state {
                *current = state.clone();
                true
            } else {
                false
            }
        });
    }

    async fn shutdown(mut self) {
        info!("Terminating worker client");

        self.commands.close();
        if let Err(e) = self.sender.close().await {
            debug!("Channel close failed: {}", e);
        }

        let rejected = self.dispatcher.terminate();
        debug!("Rejected {} pending requests on termination", rejected);

        // Settle commands that raced with termination.
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Initialize { reply, .. } | Command::WaitReady { reply } => {
                    let _ = reply.send(Err(ClientError::Terminated));
                }
                Command::Call { reply, .. } => {
                    let _ = reply.send(Err(ClientError::Terminated));
                }
                Command::Terminate => {}
            }
        }
    }
}

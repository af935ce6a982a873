//! Length-prefixed JSON channel over a byte stream.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! Works over any `AsyncRead`/`AsyncWrite` pair. A background task reads
//! frames into a bounded queue so that `recv()` stays cancel safe: a frame
//! is never half-consumed when the client's select loop picks another branch.

use super::{Channel, ChannelReceiver, ChannelSender};
use crate::config::TransportConfig;
use crate::{ClientError, Result};
use std::net::SocketAddr;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > TransportConfig::MAX_FRAME_SIZE {
        return Err(ClientError::Validation {
            field: "frame".to_string(),
            message: format!(
                "Frame size {} exceeds maximum {}",
                len,
                TransportConfig::MAX_FRAME_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > TransportConfig::MAX_FRAME_SIZE {
        return Err(ClientError::Validation {
            field: "frame".to_string(),
            message: format!(
                "Frame size {} exceeds maximum {}",
                payload.len(),
                TransportConfig::MAX_FRAME_SIZE
            ),
        });
    }

    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Factory for stream-backed channels.
pub struct StreamChannel;

impl StreamChannel {
    /// Build a channel from a reader/writer pair.
    ///
    /// Must be called within a tokio runtime.
    pub fn from_io<R, W>(reader: R, writer: W) -> Channel
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::build(reader, writer, None)
    }

    /// Connect to a worker listening on a TCP address.
    pub async fn connect_tcp(addr: SocketAddr) -> Result<Channel> {
        let stream = tokio::time::timeout(TransportConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::channel(format!("connect to {} timed out", addr)))?
            .map_err(|e| ClientError::channel(format!("connect to {} failed: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        debug!("Connected to worker at {}", addr);

        let (reader, writer) = stream.into_split();
        Ok(Self::build(reader, writer, None))
    }

    /// Spawn a worker process and talk to it over its stdin/stdout.
    ///
    /// The child is killed when the channel is closed or dropped.
    pub fn spawn(mut command: Command) -> Result<Channel> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClientError::channel("worker stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClientError::channel("worker stdout unavailable"))?;

        debug!("Spawned worker process (PID {:?})", child.id());

        Ok(Self::build(stdout, stdin, Some(child)))
    }

    fn build<R, W>(reader: R, writer: W, child: Option<Child>) -> Channel
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(TransportConfig::INBOUND_BUFFER);
        let task = tokio::spawn(read_loop(reader, tx));

        Channel::new(
            FrameSender {
                writer: Some(Box::new(writer)),
                child,
            },
            FrameReceiver { rx, task },
        )
    }
}

async fn read_loop<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<Result<String>>) {
    loop {
        let item = match read_frame(&mut reader).await {
            Ok(Some(frame)) => match String::from_utf8(frame) {
                Ok(text) => Ok(text),
                // One bad frame is a malformed message, not a broken channel.
                Err(e) => {
                    warn!("Dropping frame with invalid UTF-8: {}", e.utf8_error());
                    continue;
                }
            },
            Ok(None) => {
                debug!("Worker stream closed");
                return;
            }
            Err(e) => {
                warn!("Worker stream read failed: {}", e);
                let _ = tx.send(Err(ClientError::channel(e.to_string()))).await;
                return;
            }
        };

        if tx.send(item).await.is_err() {
            return;
        }
    }
}

struct FrameSender {
    writer: Option<Box<dyn AsyncWrite + Unpin + Send>>,
    child: Option<Child>,
}

#[async_trait::async_trait]
impl ChannelSender for FrameSender {
    async fn send(&mut self, payload: String) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ClientError::channel("channel closed"))?;
        write_frame(writer, payload.as_bytes())
            .await
            .map_err(|e| ClientError::channel(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Worker stream shutdown failed: {}", e);
            }
        }
        if let Some(mut child) = self.child.take() {
            // Already exited once stdin closed, usually.
            if let Err(e) = child.start_kill() {
                debug!("Worker process kill failed: {}", e);
            }
            let _ = child.wait().await;
        }
        Ok(())
    }
}

struct FrameReceiver {
    rx: mpsc::Receiver<Result<String>>,
    task: JoinHandle<()>,
}

#[async_trait::async_trait]
impl ChannelReceiver for FrameReceiver {
    async fn recv(&mut self) -> Option<Result<String>> {
        self.rx.recv().await
    }
}

impl Drop for FrameReceiver {
    fn drop(&mut self) {
        self.task.abort();
    }
}

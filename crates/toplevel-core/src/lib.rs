//! Toplevel Core - Async client for a toplevel worker.
//!
//! The worker evaluates code, answers completion and type queries, and
//! manages isolated environments. It speaks JSON messages over a single
//! bidirectional channel and answers requests in any order. This crate
//! matches every response back to the request that caused it and stitches
//! incremental output into the final evaluation result.
//!
//! # Example
//!
//! ```rust,ignore
//! use toplevel_core::{InitConfig, StreamChannel, WorkerClient};
//!
//! #[tokio::main]
//! async fn main() -> toplevel_core::Result<()> {
//!     let channel = StreamChannel::connect_tcp("127.0.0.1:7878".parse().unwrap()).await?;
//!     let client = WorkerClient::builder(channel)
//!         .on_output_at(|out| eprint!("{}", out.caml_ppf))
//!         .build()?;
//!
//!     client.initialize(InitConfig::new().require("fmt")).await?;
//!
//!     client.create_environment("scratch").await?;
//!     let output = client.evaluate("let x = 40 + 2;;", "scratch").await?;
//!     println!("{}", output.caml_ppf);
//!
//!     client.terminate();
//!     Ok(())
//! }
//! ```

pub mod accumulator;
pub mod channel;
pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod ready;
pub mod registry;
pub mod timer;

mod client;

// Re-export commonly used types
pub use channel::{Channel, ChannelReceiver, ChannelSender, MemoryChannel, MemoryPeer, StreamChannel};
pub use client::{WorkerClient, WorkerClientBuilder};
pub use config::{ClientConfig, InitConfig};
pub use discovery::WorkerLocation;
pub use error::{ClientError, Result};
pub use protocol::{
    CompletionEntry, CompletionSet, Completions, CorrelationKey, EnvAck, ErrorList, EvalOutput,
    InboundMessage, Location, MimeVal, OutboundMessage, OutputAt, Position, ToplevelError,
    TypeInfo, TypesResult,
};
pub use ready::ReadyState;

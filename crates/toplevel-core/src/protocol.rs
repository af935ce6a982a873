//! Wire protocol between the client and the worker.
//!
//! Every message is a JSON object carrying a `type` discriminator. Outbound
//! and inbound families are modelled as separate tagged enums so the
//! dispatcher matches exhaustively on what the worker can send.
//!
//! ```text
//! client → worker: {"type":"eval","cell_id":1,"env_id":"","code":"1+1;;"}
//! worker → client: {"type":"output","cell_id":1,"stdout":"","stderr":"","caml_ppf":"- : int = 2","mime_vals":[]}
//! ```

use crate::config::InitConfig;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Value matching one outbound request to its terminal inbound response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    /// Numeric key drawn from the client's monotonic counter.
    Cell(u64),
    /// Caller-chosen environment id.
    Env(String),
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationKey::Cell(id) => write!(f, "cell {}", id),
            CorrelationKey::Env(id) => write!(f, "env {:?}", id),
        }
    }
}

/// Messages sent to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Init {
        findlib_requires: Vec<String>,
        stdlib_dcs: Option<String>,
        findlib_index: Option<String>,
    },
    Eval {
        cell_id: u64,
        env_id: String,
        code: String,
    },
    Complete {
        cell_id: u64,
        env_id: String,
        source: String,
        position: usize,
    },
    TypeAt {
        cell_id: u64,
        env_id: String,
        source: String,
        position: usize,
    },
    Errors {
        cell_id: u64,
        env_id: String,
        source: String,
    },
    CreateEnv {
        env_id: String,
    },
    DestroyEnv {
        env_id: String,
    },
}

impl OutboundMessage {
    /// Build the handshake message for an init configuration.
    pub fn init(config: &InitConfig) -> Self {
        OutboundMessage::Init {
            findlib_requires: config.findlib_requires.clone(),
            stdlib_dcs: config.stdlib_dcs.clone(),
            findlib_index: config.findlib_index.clone(),
        }
    }

    /// Correlation key the worker will echo back, `None` for the handshake.
    pub fn correlation_key(&self) -> Option<CorrelationKey> {
        match self {
            OutboundMessage::Init { .. } => None,
            OutboundMessage::Eval { cell_id, .. }
            | OutboundMessage::Complete { cell_id, .. }
            | OutboundMessage::TypeAt { cell_id, .. }
            | OutboundMessage::Errors { cell_id, .. } => Some(CorrelationKey::Cell(*cell_id)),
            OutboundMessage::CreateEnv { env_id } | OutboundMessage::DestroyEnv { env_id } => {
                Some(CorrelationKey::Env(env_id.clone()))
            }
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// An operation waiting for a correlation key.
///
/// Numeric keys are assigned by the registry at issuance, so the facade
/// describes the operation and the driver binds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Eval { env_id: String, code: String },
    Complete { env_id: String, source: String, position: usize },
    TypeAt { env_id: String, source: String, position: usize },
    Errors { env_id: String, source: String },
    CreateEnv { env_id: String },
    DestroyEnv { env_id: String },
}

impl Request {
    /// Attach a correlation key, drawing a numeric one only when needed.
    pub fn bind(self, next_cell_id: impl FnOnce() -> u64) -> (CorrelationKey, OutboundMessage) {
        match self {
            Request::Eval { env_id, code } => {
                let cell_id = next_cell_id();
                let message = OutboundMessage::Eval {
                    cell_id,
                    env_id,
                    code,
                };
                (CorrelationKey::Cell(cell_id), message)
            }
            Request::Complete {
                env_id,
                source,
                position,
            } => {
                let cell_id = next_cell_id();
                let message = OutboundMessage::Complete {
                    cell_id,
                    env_id,
                    source,
                    position,
                };
                (CorrelationKey::Cell(cell_id), message)
            }
            Request::TypeAt {
                env_id,
                source,
                position,
            } => {
                let cell_id = next_cell_id();
                let message = OutboundMessage::TypeAt {
                    cell_id,
                    env_id,
                    source,
                    position,
                };
                (CorrelationKey::Cell(cell_id), message)
            }
            Request::Errors { env_id, source } => {
                let cell_id = next_cell_id();
                let message = OutboundMessage::Errors {
                    cell_id,
                    env_id,
                    source,
                };
                (CorrelationKey::Cell(cell_id), message)
            }
            Request::CreateEnv { env_id } => (
                CorrelationKey::Env(env_id.clone()),
                OutboundMessage::CreateEnv { env_id },
            ),
            Request::DestroyEnv { env_id } => (
                CorrelationKey::Env(env_id.clone()),
                OutboundMessage::DestroyEnv { env_id },
            ),
        }
    }
}

/// Messages received from the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Ready {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    InitError {
        message: String,
    },
    OutputAt(OutputAt),
    Output(EvalOutput),
    Completions(Completions),
    Types(TypesResult),
    Errors(ErrorList),
    EvalError {
        cell_id: u64,
        message: String,
    },
    EnvCreated(EnvAck),
    EnvDestroyed(EnvAck),
    /// Any discriminator this client does not understand.
    #[serde(other)]
    Unknown,
}

/// Payload that settles a pending request.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Output(EvalOutput),
    Completions(Completions),
    Types(TypesResult),
    Errors(ErrorList),
    EnvCreated(EnvAck),
    EnvDestroyed(EnvAck),
}

impl Response {
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Output(_) => "output",
            Response::Completions(_) => "completions",
            Response::Types(_) => "types",
            Response::Errors(_) => "errors",
            Response::EnvCreated(_) => "env_created",
            Response::EnvDestroyed(_) => "env_destroyed",
        }
    }
}

/// Rich output item attached to an evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MimeVal {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Position {
    /// Character offset.
    pub pos_cnum: i64,
    /// Line number.
    pub pos_lnum: i64,
    /// Offset of the beginning of the line.
    pub pos_bol: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Location {
    pub loc_start: Position,
    pub loc_end: Position,
}

/// Terminal result of an evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalOutput {
    pub cell_id: u64,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// Toplevel's pretty-printed output.
    #[serde(default)]
    pub caml_ppf: String,
    #[serde(default)]
    pub mime_vals: Vec<MimeVal>,
}

/// Incremental output emitted after each evaluated phrase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputAt {
    pub cell_id: u64,
    /// Character offset just past the phrase.
    #[serde(default)]
    pub loc: i64,
    #[serde(default)]
    pub caml_ppf: String,
    #[serde(default)]
    pub mime_vals: Vec<MimeVal>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionEntry {
    pub name: String,
    /// Value, Module, Type, ...
    pub kind: String,
    pub desc: String,
    pub info: String,
    pub deprecated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionSet {
    pub from: i64,
    pub to: i64,
    pub entries: Vec<CompletionEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completions {
    pub cell_id: u64,
    #[serde(default)]
    pub completions: CompletionSet,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeInfo {
    pub loc: Location,
    pub type_str: String,
    pub tail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypesResult {
    pub cell_id: u64,
    #[serde(default)]
    pub types: Vec<TypeInfo>,
}

/// A diagnostic reported by the worker for a piece of source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToplevelError {
    pub kind: String,
    pub loc: Location,
    pub main: String,
    pub sub: Vec<String>,
    pub source: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorList {
    pub cell_id: u64,
    #[serde(default)]
    pub errors: Vec<ToplevelError>,
}

/// Acknowledgement of an environment lifecycle request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvAck {
    pub env_id: String,
}

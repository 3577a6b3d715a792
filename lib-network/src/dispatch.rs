//! Typed protocol dispatch
//!
//! Envelope kinds map onto one sum type with a single fallback arm for
//! forward compatibility. Unknown kinds emit an event and are dropped
//! without any error back to the sender. Request/response pairs are
//! correlated by id in a per-peer pending table; responses arriving
//! after the caller's deadline are discarded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use lib_trust::PeerId;

use crate::envelope::Envelope;
use crate::error::NetworkError;
use crate::Result;

/// Default deadline for request/response round trips.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    Ping,
    Pong,
    Hello { node_id: String },
    Welcome { node_id: String },
    Announce { metadata: Value },
    Gossip { data: Vec<u8> },
    Request { id: String, method: String, params: Value },
    Response { id: String, result: Option<Value>, error: Option<String> },
    /// Fallback arm: a kind this build does not understand.
    Unknown { kind: String },
}

impl ProtocolMessage {
    pub fn kind(&self) -> &str {
        match self {
            ProtocolMessage::Ping => "ping",
            ProtocolMessage::Pong => "pong",
            ProtocolMessage::Hello { .. } => "hello",
            ProtocolMessage::Welcome { .. } => "welcome",
            ProtocolMessage::Announce { .. } => "announce",
            ProtocolMessage::Gossip { .. } => "gossip",
            ProtocolMessage::Request { .. } => "request",
            ProtocolMessage::Response { .. } => "response",
            ProtocolMessage::Unknown { kind } => kind,
        }
    }

    /// Body bytes for the envelope. Bodies are JSON; the kind string
    /// lives in the envelope header.
    pub fn body(&self) -> Result<Vec<u8>> {
        #[derive(Serialize)]
        struct HelloBody<'a> {
            node_id: &'a str,
        }

        let value = match self {
            ProtocolMessage::Ping | ProtocolMessage::Pong => Value::Null,
            ProtocolMessage::Hello { node_id } | ProtocolMessage::Welcome { node_id } => {
                serde_json::to_value(HelloBody { node_id })
                    .map_err(|e| NetworkError::Malformed(e.to_string()))?
            }
            ProtocolMessage::Announce { metadata } => metadata.clone(),
            ProtocolMessage::Gossip { data } => {
                serde_json::json!({ "data": data })
            }
            ProtocolMessage::Request { id, method, params } => {
                serde_json::json!({ "id": id, "method": method, "params": params })
            }
            ProtocolMessage::Response { id, result, error } => {
                serde_json::json!({ "id": id, "result": result, "error": error })
            }
            ProtocolMessage::Unknown { .. } => Value::Null,
        };
        serde_json::to_vec(&value).map_err(|e| NetworkError::Malformed(e.to_string()))
    }

    /// Parse from an envelope's kind and body; malformed bodies of a
    /// known kind are errors, unknown kinds fall through.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self> {
        let body: Value = if envelope.body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&envelope.body)
                .map_err(|e| NetworkError::Malformed(format!("body: {e}")))?
        };

        let get_str = |v: &Value, key: &str| -> Result<String> {
            v.get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| NetworkError::Malformed(format!("missing field {key}")))
        };

        Ok(match envelope.kind.as_str() {
            "ping" => ProtocolMessage::Ping,
            "pong" => ProtocolMessage::Pong,
            "hello" => ProtocolMessage::Hello {
                node_id: get_str(&body, "node_id")?,
            },
            "welcome" => ProtocolMessage::Welcome {
                node_id: get_str(&body, "node_id")?,
            },
            "announce" => ProtocolMessage::Announce { metadata: body },
            "gossip" => {
                let data = body
                    .get("data")
                    .and_then(Value::as_array)
                    .map(|arr| {
                        arr.iter()
                            .filter_map(Value::as_u64)
                            .map(|b| b as u8)
                            .collect()
                    })
                    .unwrap_or_default();
                ProtocolMessage::Gossip { data }
            }
            "request" => ProtocolMessage::Request {
                id: get_str(&body, "id")?,
                method: get_str(&body, "method")?,
                params: body.get("params").cloned().unwrap_or(Value::Null),
            },
            "response" => ProtocolMessage::Response {
                id: get_str(&body, "id")?,
                result: body.get("result").cloned().filter(|v| !v.is_null()),
                error: body
                    .get("error")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            other => ProtocolMessage::Unknown {
                kind: other.to_string(),
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    UnknownType { from: PeerId, kind: String },
    Gossip { from: PeerId, data: Vec<u8> },
    Announce { from: PeerId, metadata: Value },
    PongReceived { from: PeerId },
    WelcomeReceived { from: PeerId, node_id: String },
}

/// Application hook for `request` envelopes.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(
        &self,
        from: &str,
        method: &str,
        params: Value,
    ) -> std::result::Result<Value, String>;
}

type PendingMap =
    Mutex<HashMap<(PeerId, String), oneshot::Sender<std::result::Result<Value, String>>>>;

pub struct Dispatcher {
    self_id: PeerId,
    pending: PendingMap,
    events_tx: mpsc::Sender<DispatchEvent>,
    request_handler: RwLock<Option<Arc<dyn RequestHandler>>>,
}

impl Dispatcher {
    pub fn new(self_id: PeerId, event_buffer: usize) -> (Self, mpsc::Receiver<DispatchEvent>) {
        let (events_tx, events_rx) = mpsc::channel(event_buffer);
        (
            Self {
                self_id,
                pending: Mutex::new(HashMap::new()),
                events_tx,
                request_handler: RwLock::new(None),
            },
            events_rx,
        )
    }

    pub fn set_request_handler(&self, handler: Arc<dyn RequestHandler>) {
        *self.request_handler.write() = Some(handler);
    }

    /// Handle one accepted envelope; the returned message, if any, is
    /// the reply the caller should route back to the sender.
    pub async fn handle(&self, envelope: &Envelope) -> Result<Option<ProtocolMessage>> {
        let message = ProtocolMessage::from_envelope(envelope)?;
        let from = envelope.from.clone();

        Ok(match message {
            ProtocolMessage::Ping => Some(ProtocolMessage::Pong),
            ProtocolMessage::Pong => {
                let _ = self.events_tx.send(DispatchEvent::PongReceived { from }).await;
                None
            }
            ProtocolMessage::Hello { .. } => Some(ProtocolMessage::Welcome {
                node_id: self.self_id.clone(),
            }),
            ProtocolMessage::Welcome { node_id } => {
                let _ = self
                    .events_tx
                    .send(DispatchEvent::WelcomeReceived { from, node_id })
                    .await;
                None
            }
            ProtocolMessage::Announce { metadata } => {
                let _ = self
                    .events_tx
                    .send(DispatchEvent::Announce { from, metadata })
                    .await;
                None
            }
            ProtocolMessage::Gossip { data } => {
                let _ = self.events_tx.send(DispatchEvent::Gossip { from, data }).await;
                None
            }
            ProtocolMessage::Request { id, method, params } => {
                let handler = self.request_handler.read().clone();
                let (result, error) = match handler {
                    Some(handler) => match handler.handle(&from, &method, params).await {
                        Ok(value) => (Some(value), None),
                        Err(message) => (None, Some(message)),
                    },
                    None => (None, Some(format!("no handler for method {method}"))),
                };
                Some(ProtocolMessage::Response { id, result, error })
            }
            ProtocolMessage::Response { id, result, error } => {
                let sender = self.pending.lock().remove(&(from.clone(), id.clone()));
                match sender {
                    Some(tx) => {
                        let outcome = match error {
                            Some(e) => Err(e),
                            None => Ok(result.unwrap_or(Value::Null)),
                        };
                        let _ = tx.send(outcome);
                    }
                    None => {
                        // Late or unsolicited; the correlator already gave up.
                        debug!(peer = %from, id, "discarding uncorrelated response");
                    }
                }
                None
            }
            ProtocolMessage::Unknown { kind } => {
                warn!(peer = %from, kind, "unknown envelope kind dropped");
                let _ = self
                    .events_tx
                    .send(DispatchEvent::UnknownType { from, kind })
                    .await;
                None
            }
        })
    }

    /// Register interest in a response before sending the request.
    pub fn register_request(
        &self,
        peer: &str,
        id: &str,
    ) -> oneshot::Receiver<std::result::Result<Value, String>> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .insert((peer.to_string(), id.to_string()), tx);
        rx
    }

    /// Await a registered response with a deadline. On expiry the
    /// pending slot is dropped so a late response is discarded.
    pub async fn await_response(
        &self,
        peer: &str,
        id: &str,
        rx: oneshot::Receiver<std::result::Result<Value, String>>,
        timeout: Duration,
    ) -> Result<Value> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(NetworkError::Malformed(message)),
            Ok(Err(_)) => Err(NetworkError::Timeout),
            Err(_) => {
                self.pending
                    .lock()
                    .remove(&(peer.to_string(), id.to_string()));
                Err(NetworkError::Timeout)
            }
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("self_id", &self.self_id)
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

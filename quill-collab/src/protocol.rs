//! JSON wire protocol between editor clients and the server.
//!
//! ```text
//! client                                    server
//!   │  GET /ws/{docId}?userId=..&color=..     │
//!   │ ───────────────────────────────────────►│
//!   │◄──── {"type":"init","docId","text","presence"}
//!   │                                         │
//!   │  {"type":"insert","position":3,"value":"abc"}
//!   │ ───────────────────────────────────────►│  apply_and_broadcast
//!   │◄──── {"type":"delete",...,"source":"bob","timestamp":...}
//! ```
//!
//! Every frame is one JSON text message. Client frames carry an operation
//! with any subset of fields except `type`; the server fills in the rest.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::operation::{DocumentId, Operation};
use crate::presence::PresenceEntry;

/// Route prefix for the document socket.
pub const WS_ROUTE_PREFIX: &str = "/ws/";

/// Message sent by the server that is not an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// First frame on every connection: the state the client starts from
    Init {
        #[serde(rename = "docId")]
        document_id: DocumentId,
        text: String,
        presence: HashMap<String, PresenceEntry>,
    },
}

impl ServerMessage {
    pub fn init(
        document_id: DocumentId,
        text: String,
        presence: HashMap<String, PresenceEntry>,
    ) -> Self {
        ServerMessage::Init {
            document_id,
            text,
            presence,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }
}

/// Decode one client frame.
pub fn decode_operation(frame: &str) -> Result<Operation, ProtocolError> {
    serde_json::from_str(frame).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
}

/// Encode an operation for delivery to a client.
pub fn encode_operation(op: &Operation) -> Result<String, ProtocolError> {
    serde_json::to_string(op).map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

/// Parameters of a socket upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub document_id: DocumentId,
    pub user_id: Option<String>,
    pub color: Option<String>,
}

impl ConnectRequest {
    /// Parse a request target such as `/ws/notes?userId=alice&color=%23ff0000`.
    ///
    /// `userID` is accepted as an alias of `userId`. Empty query values count
    /// as absent. The document id is the raw path segment.
    pub fn parse(target: &str) -> Result<Self, ProtocolError> {
        let url = url::Url::parse(&format!("http://localhost{target}"))
            .map_err(|_| ProtocolError::UnknownRoute(target.to_string()))?;

        let raw_id = url
            .path()
            .strip_prefix(WS_ROUTE_PREFIX)
            .filter(|rest| !rest.contains('/'))
            .ok_or_else(|| ProtocolError::UnknownRoute(url.path().to_string()))?;
        let document_id = raw_id
            .parse::<DocumentId>()
            .map_err(|_| ProtocolError::InvalidDocumentId(raw_id.to_string()))?;

        let mut user_id = None;
        let mut color = None;
        for (key, value) in url.query_pairs() {
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                "userId" | "userID" => user_id = Some(value.into_owned()),
                "color" => color = Some(value.into_owned()),
                _ => {}
            }
        }

        Ok(Self {
            document_id,
            user_id,
            color,
        })
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// Request path is not a document socket
    UnknownRoute(String),
    InvalidDocumentId(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnknownRoute(path) => write!(f, "Unknown route: {path}"),
            Self::InvalidDocumentId(id) => write!(f, "Invalid document id: {id:?}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

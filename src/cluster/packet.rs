//! Wire packet codec
//!
//! Every frame on a cluster connection is one JSON envelope terminated by a
//! newline:
//!
//! ```text
//! {"name":"node-a","datatype":"cluster.ping","datamessage":"{\"time\":...}","time":"2024-01-01T00:00:00Z"}
//! ```
//!
//! `datamessage` is an opaque JSON document serialized into a string. The
//! cluster core only ever opens the four reserved control types listed in
//! [`ControlKind`]; everything else is handed to collaborators untouched.
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::NodeName;
use crate::api_error;
use crate::error::{Result, SkeinError};

/// A payload that can travel through the cluster.
///
/// `DATA_TYPE` is the logical type name stamped on every packet carrying this
/// payload; receivers dispatch on it by plain string comparison.
pub trait Message: Serialize + DeserializeOwned {
    const DATA_TYPE: &'static str;
}

/// The closed set of packet types the cluster core consumes itself
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ControlKind {
    AuthRequest,
    AuthResponse,
    Ping,
    Shutdown,
}

impl ControlKind {
    pub const fn tag(self) -> &'static str {
        match self {
            ControlKind::AuthRequest => "cluster.auth-request",
            ControlKind::AuthResponse => "cluster.auth-response",
            ControlKind::Ping => "cluster.ping",
            ControlKind::Shutdown => "cluster.shutdown-notice",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "cluster.auth-request" => Some(ControlKind::AuthRequest),
            "cluster.auth-response" => Some(ControlKind::AuthResponse),
            "cluster.ping" => Some(ControlKind::Ping),
            "cluster.shutdown-notice" => Some(ControlKind::Shutdown),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub key: String,
}

impl Message for AuthRequest {
    const DATA_TYPE: &'static str = ControlKind::AuthRequest.tag();
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
}

impl Message for AuthResponse {
    const DATA_TYPE: &'static str = ControlKind::AuthResponse.tag();
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub time: DateTime<Utc>,
}

impl Message for Ping {
    const DATA_TYPE: &'static str = ControlKind::Ping.tag();
}

/// Sent to every peer right before a node shuts down
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownNotice {}

impl Message for ShutdownNotice {
    const DATA_TYPE: &'static str = ControlKind::Shutdown.tag();
}

/// One decoded frame. Packets are never mutated after construction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    name: NodeName,
    #[serde(rename = "datatype")]
    data_type: String,
    #[serde(rename = "datamessage")]
    data_message: String,
    time: DateTime<Utc>,
}

impl Packet {
    /// Wrap `message` in an envelope from `sender`, stamped with the current time
    pub fn new<M: Message>(sender: &NodeName, message: &M) -> Result<Self> {
        Ok(Self {
            name: sender.clone(),
            data_type: M::DATA_TYPE.to_string(),
            data_message: serde_json::to_string(message)?,
            time: Utc::now(),
        })
    }

    pub fn from_outbound(sender: &NodeName, message: &OutboundMessage) -> Self {
        Self {
            name: sender.clone(),
            data_type: message.data_type.clone(),
            data_message: message.data_message.clone(),
            time: Utc::now(),
        }
    }

    /// Serialize into a newline-terminated frame
    pub fn pack(&self) -> Result<Vec<u8>> {
        let mut frame = serde_json::to_vec(self)?;
        frame.push(b'\n');
        Ok(frame)
    }

    /// Parse one frame. A frame that does not decode is never partially trusted.
    pub fn unpack(frame: &[u8]) -> Result<Self> {
        let trimmed = frame
            .strip_suffix(b"\n")
            .map(|f| f.strip_suffix(b"\r").unwrap_or(f))
            .unwrap_or(frame);
        serde_json::from_slice(trimmed).map_err(|e| {
            SkeinError::MalformedFrame(format!("failed to decode packet envelope: {}", e))
        })
    }

    /// Decode the opaque body into the caller's expected shape
    pub fn decode<M: DeserializeOwned>(&self) -> Result<M> {
        serde_json::from_str(&self.data_message).map_err(|e| {
            SkeinError::PayloadDecode(format!(
                "{} payload from {}: {}",
                self.data_type, self.name, e
            ))
        })
    }

    /// True when this packet carries an `M`
    pub fn is<M: Message>(&self) -> bool {
        self.data_type == M::DATA_TYPE
    }

    pub fn control_kind(&self) -> Option<ControlKind> {
        ControlKind::from_tag(&self.data_type)
    }

    pub fn name(&self) -> &NodeName {
        &self.name
    }

    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    pub fn data_message(&self) -> &str {
        &self.data_message
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }
}

/// Pack `message` from `sender` straight into a frame
pub fn pack<M: Message>(message: &M, sender: &NodeName) -> Result<Vec<u8>> {
    Packet::new(sender, message)?.pack()
}

/// An application payload on its way into the cluster.
///
/// The sender name and timestamp are stamped when the dispatcher writes it.
/// Reserved control types are refused so collaborators cannot spoof protocol
/// traffic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    data_type: String,
    data_message: String,
}

impl OutboundMessage {
    pub fn new<M: Message>(message: &M) -> Result<Self> {
        Self::raw(M::DATA_TYPE, serde_json::to_string(message)?)
    }

    /// Build from an already serialized body, e.g. to relay a received packet
    pub fn raw(data_type: impl Into<String>, data_message: impl Into<String>) -> Result<Self> {
        let data_type = data_type.into();
        if ControlKind::from_tag(&data_type).is_some() {
            return Err(api_error!(
                "data type {} is reserved for cluster control traffic",
                data_type
            ));
        }
        Ok(Self {
            data_type,
            data_message: data_message.into(),
        })
    }

    pub fn data_type(&self) -> &str {
        &self.data_type
    }
}

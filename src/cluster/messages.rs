/// Messages flowing between cluster tasks and across the collaborator boundary
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::NodeName;
use super::packet::{OutboundMessage, Packet};
use super::peer::Peer;
use crate::error::SkeinError;

/// Events raised by connection tasks and the manager surface for the central
/// dispatcher. Never exposed to collaborators.
#[derive(Debug, Clone)]
pub enum InternalEvent {
    /// A peer was added to the configured set
    PeerAdded(NodeName),
    /// A peer was removed from the configured set
    PeerRemoved(NodeName),
    /// A connection survived the join delay and is now online
    PeerJoined(NodeName),
    /// A joined connection went away
    PeerLeft {
        name: NodeName,
        error: Option<String>,
    },
    /// An administrative request from the HTTP API
    Admin(AdminRequest),
}

/// Operator actions against a single connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminAction {
    /// Drop the current connection; the connector dials again
    Reconnect,
    /// Ask the peer to shut its side down, then drop the connection
    Down,
}

impl std::str::FromStr for AdminAction {
    type Err = SkeinError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reconnect" => Ok(AdminAction::Reconnect),
            "down" => Ok(AdminAction::Down),
            other => Err(crate::api_error!("unknown admin action: {}", other)),
        }
    }
}

impl std::fmt::Display for AdminAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdminAction::Reconnect => write!(f, "reconnect"),
            AdminAction::Down => write!(f, "down"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminRequest {
    pub action: AdminAction,
    pub node: NodeName,
}

/// An application payload addressed to exactly one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMessage {
    pub node: NodeName,
    pub message: OutboundMessage,
}

/// A packet read from a connection, together with the connection it came from
#[derive(Debug)]
pub(crate) struct Inbound {
    pub peer: Arc<Peer>,
    pub packet: Packet,
}

//! Cluster membership and messaging
//!
//! A [`Manager`] keeps authenticated TCP connections, optionally over TLS,
//! to every configured peer, detects dead peers by read timeout, settles
//! duplicate connections, tracks quorum and moves typed packets between the
//! application and the rest of the cluster.
mod arbitrator;
pub mod connection_pool;
mod dispatcher;
pub mod handshake;
mod incoming;
pub mod manager;
pub mod messages;
pub mod node_name;
mod outgoing;
pub mod packet;
pub mod peer;
pub mod quorum;
pub mod registry;
mod shared;
pub mod stream;

pub use arbitrator::arbitration_key;
pub use manager::{ClusterEvents, Manager, NodeReport};
pub use messages::{AdminAction, AdminRequest, NodeMessage};
pub use node_name::NodeName;
pub use packet::{ControlKind, Message, OutboundMessage, Packet};
pub use peer::{Direction, NodeStatus};
pub use quorum::has_quorum;
pub use registry::ManagerRegistry;
pub use shared::ConfiguredPeer;
pub use stream::TlsConfig;

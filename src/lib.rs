//! skein: cluster membership and messaging for a self-hosted global load
//! balancer
pub mod api;
pub mod cli;
pub mod cluster;
pub mod error;
pub mod settings;

pub use cluster::{ClusterEvents, Manager, ManagerRegistry, Message, NodeName, Packet};
pub use error::{Result, SkeinError};

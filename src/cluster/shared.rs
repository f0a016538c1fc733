//! State shared by every task of one cluster manager
use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::NodeName;
use super::connection_pool::ConnectionPool;
use super::messages::{Inbound, InternalEvent};
use super::stream::TlsConfig;
use crate::settings::{ClusterConfig, ClusterSettings, CHANNEL_BUFFER_SIZE};

/// Format a line with the node name prefix, emit it through `tracing` and
/// offer it to the public log channel (dropped when the channel is full).
macro_rules! cluster_log {
    ($core:expr, $level:ident, $($arg:tt)+) => {{
        let line = format!("[{}] {}", $core.name, format_args!($($arg)+));
        tracing::$level!("{}", line);
        let _ = $core.log_tx.try_send(line);
    }};
}
pub(crate) use cluster_log;

/// A peer this node should stay connected to
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfiguredPeer {
    pub name: NodeName,
    pub address: String,
}

#[derive(Debug)]
pub(crate) struct ClusterCore {
    pub name: NodeName,
    pub auth_key: String,
    pub log_traffic: bool,
    pub tls: Option<TlsConfig>,
    pub settings: RwLock<ClusterSettings>,
    pub configured: RwLock<BTreeMap<NodeName, ConfiguredPeer>>,
    pub pool: ConnectionPool,
    pub internal_tx: mpsc::Sender<InternalEvent>,
    pub incoming_tx: mpsc::Sender<Inbound>,
    pub log_tx: mpsc::Sender<String>,
    /// Stops the connector, acceptor and dispatcher
    pub stop: CancellationToken,
}

/// Receiving ends of the core's queues, consumed by the dispatcher and the
/// public log channel
#[derive(Debug)]
pub(crate) struct CoreReceivers {
    pub internal_rx: mpsc::Receiver<InternalEvent>,
    pub incoming_rx: mpsc::Receiver<Inbound>,
    pub log_rx: mpsc::Receiver<String>,
}

impl ClusterCore {
    pub fn new(config: &ClusterConfig) -> (Self, CoreReceivers) {
        let (internal_tx, internal_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let (incoming_tx, incoming_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let (log_tx, log_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let core = Self {
            name: NodeName::from(config.name.as_str()),
            auth_key: config.auth_key.clone(),
            log_traffic: config.log_traffic,
            tls: config.tls.clone(),
            settings: RwLock::new(config.settings),
            configured: RwLock::new(BTreeMap::new()),
            pool: ConnectionPool::new(),
            internal_tx,
            incoming_tx,
            log_tx,
            stop: CancellationToken::new(),
        };
        (
            core,
            CoreReceivers {
                internal_rx,
                incoming_rx,
                log_rx,
            },
        )
    }

    /// Copy of the current settings. Callers keep the copy for the step they
    /// are running so a concurrent update never changes a timeout midway.
    pub fn settings(&self) -> ClusterSettings {
        *self.settings.read()
    }

    pub fn configured_peers(&self) -> Vec<ConfiguredPeer> {
        self.configured.read().values().cloned().collect()
    }

    pub fn configured_count(&self) -> usize {
        self.configured.read().len()
    }

    pub fn is_configured(&self, name: &str) -> bool {
        self.configured.read().contains_key(name)
    }

    /// Connected peers that are also configured
    pub fn connected_configured_count(&self) -> usize {
        let configured = self.configured.read();
        self.pool
            .names()
            .iter()
            .filter(|name| configured.contains_key(*name))
            .count()
    }
}

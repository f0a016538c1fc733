//! The cluster manager: the public face of the cluster core
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info_span;
use tracing_futures::Instrument;

use super::NodeName;
use super::dispatcher::{Dispatcher, Publishers};
use super::incoming::accept_loop;
use super::messages::{AdminRequest, InternalEvent, NodeMessage};
use super::outgoing::connect_loop;
use super::packet::{pack, Message, OutboundMessage, Packet, ShutdownNotice};
use super::peer::NodeStatus;
use super::quorum::has_quorum;
use super::shared::{cluster_log, ClusterCore, ConfiguredPeer};
use crate::config_error;
use crate::error::{Result, SkeinError};
use crate::settings::{ClusterConfig, ClusterSettings, CHANNEL_BUFFER_SIZE, NOTIFICATION_BUFFER_SIZE};

/// Receiving ends of everything the cluster publishes
#[derive(Debug)]
pub struct ClusterEvents {
    /// Application packets from other nodes
    pub from_cluster: mpsc::Receiver<Packet>,
    /// Admin requests received through the HTTP API
    pub from_cluster_api: mpsc::Receiver<AdminRequest>,
    pub node_join: mpsc::Receiver<NodeName>,
    pub node_leave: mpsc::Receiver<NodeName>,
    pub quorum_state: mpsc::Receiver<bool>,
    /// Every diagnostic line the manager logs
    pub log: mpsc::Receiver<String>,
}

/// Administrative view of one configured peer, overlaid with its live
/// connection when there is one
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    pub name: NodeName,
    pub addr: String,
    pub status: NodeStatus,
    pub error: Option<String>,
    pub join_time: Option<DateTime<Utc>>,
    pub lag_ms: i64,
    pub packets: u64,
}

/// Handle on a running (or not yet started) cluster node.
///
/// Cheap to clone; every clone drives the same node.
#[derive(Clone, Debug)]
pub struct Manager {
    core: Arc<ClusterCore>,
    to_cluster_tx: mpsc::Sender<OutboundMessage>,
    to_node_tx: mpsc::Sender<NodeMessage>,
    // taken when the manager starts
    dispatcher: Arc<Mutex<Option<Dispatcher>>>,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
}

impl Manager {
    pub fn new(config: ClusterConfig) -> Result<(Self, ClusterEvents)> {
        if config.name.is_empty() {
            return Err(config_error!("cluster node name must not be empty"));
        }
        config.settings.validate()?;

        let (core, receivers) = ClusterCore::new(&config);
        let core = Arc::new(core);

        let (to_cluster_tx, to_cluster_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let (to_node_tx, to_node_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let (from_cluster_tx, from_cluster_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let (from_cluster_api_tx, from_cluster_api_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let (node_join_tx, node_join_rx) = mpsc::channel(NOTIFICATION_BUFFER_SIZE);
        let (node_leave_tx, node_leave_rx) = mpsc::channel(NOTIFICATION_BUFFER_SIZE);
        let (quorum_tx, quorum_rx) = mpsc::channel(NOTIFICATION_BUFFER_SIZE);

        let dispatcher = Dispatcher::new(
            core.clone(),
            to_cluster_rx,
            to_node_rx,
            receivers.internal_rx,
            receivers.incoming_rx,
            Publishers {
                from_cluster: from_cluster_tx,
                from_cluster_api: from_cluster_api_tx,
                node_join: node_join_tx,
                node_leave: node_leave_tx,
                quorum_state: quorum_tx,
            },
        );

        let manager = Self {
            core,
            to_cluster_tx,
            to_node_tx,
            dispatcher: Arc::new(Mutex::new(Some(dispatcher))),
            local_addr: Arc::new(Mutex::new(None)),
        };
        let events = ClusterEvents {
            from_cluster: from_cluster_rx,
            from_cluster_api: from_cluster_api_rx,
            node_join: node_join_rx,
            node_leave: node_leave_rx,
            quorum_state: quorum_rx,
            log: receivers.log_rx,
        };
        Ok((manager, events))
    }

    /// Bind the cluster listener and start every background task.
    ///
    /// Failing to bind is the only error reported here; everything after
    /// that is handled per connection. Returns the bound address, which
    /// differs from `addr` when port 0 was requested.
    pub async fn listen_and_serve(&self, addr: &str) -> Result<SocketAddr> {
        let dispatcher = self
            .dispatcher
            .lock()
            .take()
            .ok_or_else(|| config_error!("cluster manager {} was already started", self.core.name))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| config_error!("failed to listen on {}: {}", addr, e))?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);
        cluster_log!(self.core, info, "cluster listening on {}", local_addr);

        let node = self.core.name.clone();
        tokio::spawn(
            accept_loop(self.core.clone(), listener)
                .instrument(info_span!("acceptor", node = %node)),
        );
        tokio::spawn(
            connect_loop(self.core.clone()).instrument(info_span!("connector", node = %node)),
        );
        tokio::spawn(dispatcher.run().instrument(info_span!("dispatcher", node = %node)));
        Ok(local_addr)
    }

    pub fn name(&self) -> &NodeName {
        &self.core.name
    }

    /// Address of the cluster listener once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// True when `secret` is this cluster's shared secret
    pub fn verify_secret(&self, secret: &str) -> bool {
        self.core.auth_key == secret
    }

    /// Add (or re-address) a peer this node should stay connected to
    pub fn add_peer(&self, name: impl Into<NodeName>, address: impl Into<String>) {
        let name = name.into();
        let address = address.into();
        cluster_log!(self.core, info, "adding node {} ({})", name, address);
        self.core.configured.write().insert(
            name.clone(),
            ConfiguredPeer {
                name: name.clone(),
                address,
            },
        );
        if let Err(e) = self.core.internal_tx.try_send(InternalEvent::PeerAdded(name.clone())) {
            cluster_log!(
                self.core,
                warn,
                "internal queue full, quorum not re-evaluated after adding {}: {}",
                name,
                e
            );
        }
    }

    /// Forget a configured peer and drop its connection
    pub fn remove_peer(&self, name: &str) {
        cluster_log!(self.core, info, "removing node {}", name);
        self.core.configured.write().remove(name);
        if let Err(e) = self
            .core
            .internal_tx
            .try_send(InternalEvent::PeerRemoved(NodeName::from(name)))
        {
            cluster_log!(
                self.core,
                warn,
                "internal queue full, quorum not re-evaluated after removing {}: {}",
                name,
                e
            );
        }
        self.core.pool.close(name);
    }

    pub fn configured_peers(&self) -> Vec<ConfiguredPeer> {
        self.core.configured_peers()
    }

    pub fn is_configured(&self, name: &str) -> bool {
        self.core.is_configured(name)
    }

    /// Names of the peers currently holding a registered connection
    pub fn connected_peers(&self) -> Vec<NodeName> {
        self.core.pool.names()
    }

    /// Local and remote socket address of the connection registered for `name`
    pub fn connection_addrs(&self, name: &str) -> Option<(SocketAddr, SocketAddr)> {
        self.core
            .pool
            .get(name)
            .map(|peer| (peer.local_addr(), peer.remote_addr()))
    }

    pub fn quorum(&self) -> bool {
        has_quorum(
            self.core.configured_count(),
            self.core.connected_configured_count(),
        )
    }

    /// Queue `message` for every connected peer
    pub async fn broadcast<M: Message>(&self, message: &M) -> Result<()> {
        let outbound = OutboundMessage::new(message)?;
        self.to_cluster_tx
            .send(outbound)
            .await
            .map_err(|_| SkeinError::Closed("cluster manager stopped".to_string()))
    }

    /// Queue `message` for one connected peer
    pub async fn send_to<M: Message>(&self, node: impl Into<NodeName>, message: &M) -> Result<()> {
        let message = NodeMessage {
            node: node.into(),
            message: OutboundMessage::new(message)?,
        };
        self.to_node_tx
            .send(message)
            .await
            .map_err(|_| SkeinError::Closed("cluster manager stopped".to_string()))
    }

    /// Sender for broadcast traffic, for collaborators that run their own loop
    pub fn to_cluster(&self) -> mpsc::Sender<OutboundMessage> {
        self.to_cluster_tx.clone()
    }

    /// Sender for unicast traffic
    pub fn to_node(&self) -> mpsc::Sender<NodeMessage> {
        self.to_node_tx.clone()
    }

    pub fn settings(&self) -> ClusterSettings {
        self.core.settings()
    }

    /// Replace the timings. Connections already past a step keep the value
    /// they started it with.
    pub fn update_settings(&self, settings: ClusterSettings) -> Result<()> {
        settings.validate()?;
        *self.core.settings.write() = settings;
        cluster_log!(self.core, info, "settings updated: {:?}", settings);
        Ok(())
    }

    pub fn node_reports(&self) -> Vec<NodeReport> {
        self.core
            .configured_peers()
            .into_iter()
            .map(|configured| {
                let mut report = NodeReport {
                    name: configured.name,
                    addr: configured.address,
                    status: NodeStatus::Offline,
                    error: None,
                    join_time: None,
                    lag_ms: 0,
                    packets: 0,
                };
                if let Some(peer) = self.core.pool.get(report.name.as_str()) {
                    let metrics = peer.metrics();
                    report.status = metrics.status;
                    report.error = metrics.error;
                    report.join_time = Some(peer.join_time());
                    report.lag_ms = metrics.lag.num_milliseconds();
                    report.packets = metrics.packets;
                }
                report
            })
            .collect()
    }

    /// Hand an admin request to the dispatcher
    pub fn admin_request(&self, request: AdminRequest) -> Result<()> {
        let known = self.core.is_configured(request.node.as_str())
            || self.core.pool.exists(request.node.as_str());
        if !known {
            return Err(SkeinError::NodeNotFound(request.node.to_string()));
        }
        self.core
            .internal_tx
            .try_send(InternalEvent::Admin(request))
            .map_err(|e| crate::api_error!("cluster manager busy: {}", e))
    }

    /// Log the configured and connected state
    pub fn state_dump(&self) {
        cluster_log!(self.core, info, "cluster state:");
        for configured in self.core.configured_peers() {
            cluster_log!(
                self.core,
                info,
                "configured node: {} ({})",
                configured.name,
                configured.address
            );
        }
        for peer in self.core.pool.snapshot() {
            let metrics = peer.metrics();
            cluster_log!(
                self.core,
                info,
                "connected node: {} {} local {} remote {} status {} packets {} lag {} ms",
                peer.name(),
                peer.direction(),
                peer.local_addr(),
                peer.remote_addr(),
                metrics.status,
                metrics.packets,
                metrics.lag.num_milliseconds()
            );
        }
    }

    /// Tell every peer we are leaving, then stop all tasks and connections
    pub async fn shutdown(&self) {
        cluster_log!(self.core, info, "stopping cluster manager");
        match pack(&ShutdownNotice {}, &self.core.name) {
            Ok(frame) => {
                if let Err(e) = self.core.pool.write_all(&frame).await {
                    cluster_log!(self.core, warn, "failed to send shutdown notice: {}", e);
                }
            }
            Err(e) => cluster_log!(self.core, error, "failed to pack shutdown notice: {}", e),
        }
        self.core.stop.cancel();
        self.core.pool.close_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.core.stop.is_cancelled()
    }
}

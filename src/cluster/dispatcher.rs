//! Central dispatcher
//!
//! The one task that publishes to collaborators: quorum changes, joins,
//! leaves, application packets and admin requests all leave the cluster core
//! from here. It also writes the application's outbound traffic through the
//! connection pool.
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use super::NodeName;
use super::messages::{AdminAction, AdminRequest, Inbound, InternalEvent, NodeMessage};
use super::packet::{pack, ControlKind, OutboundMessage, Packet, Ping, ShutdownNotice};
use super::peer::NodeStatus;
use super::quorum::has_quorum;
use super::shared::{cluster_log, ClusterCore};

/// How long an application packet may wait for room on the `from_cluster`
/// channel before it is dropped
const FROM_CLUSTER_SEND_TIMEOUT: Duration = Duration::from_millis(100);

/// Publishing ends of the collaborator channels
#[derive(Debug)]
pub(crate) struct Publishers {
    pub from_cluster: mpsc::Sender<Packet>,
    pub from_cluster_api: mpsc::Sender<AdminRequest>,
    pub node_join: mpsc::Sender<NodeName>,
    pub node_leave: mpsc::Sender<NodeName>,
    pub quorum_state: mpsc::Sender<bool>,
}

#[derive(Debug)]
pub(crate) struct Dispatcher {
    core: Arc<ClusterCore>,
    to_cluster_rx: mpsc::Receiver<OutboundMessage>,
    to_node_rx: mpsc::Receiver<NodeMessage>,
    internal_rx: mpsc::Receiver<InternalEvent>,
    incoming_rx: mpsc::Receiver<Inbound>,
    publishers: Publishers,
}

impl Dispatcher {
    pub fn new(
        core: Arc<ClusterCore>,
        to_cluster_rx: mpsc::Receiver<OutboundMessage>,
        to_node_rx: mpsc::Receiver<NodeMessage>,
        internal_rx: mpsc::Receiver<InternalEvent>,
        incoming_rx: mpsc::Receiver<Inbound>,
        publishers: Publishers,
    ) -> Self {
        Self {
            core,
            to_cluster_rx,
            to_node_rx,
            internal_rx,
            incoming_rx,
            publishers,
        }
    }

    pub async fn run(mut self) {
        cluster_log!(self.core, info, "starting central dispatcher");
        self.update_quorum();

        loop {
            tokio::select! {
                _ = self.core.stop.cancelled() => {
                    cluster_log!(self.core, info, "exit of central dispatcher");
                    break;
                }
                Some(message) = self.to_cluster_rx.recv() => {
                    self.handle_broadcast(message).await;
                }
                Some(message) = self.to_node_rx.recv() => {
                    self.handle_unicast(message).await;
                }
                Some(event) = self.internal_rx.recv() => {
                    self.handle_internal(event).await;
                }
                Some(inbound) = self.incoming_rx.recv() => {
                    self.handle_inbound(inbound).await;
                }
                else => {
                    cluster_log!(self.core, info, "all dispatcher inputs closed, exiting");
                    break;
                }
            }
        }
    }

    fn update_quorum(&self) {
        let configured = self.core.configured_count();
        let connected = self.core.connected_configured_count();
        let quorum = has_quorum(configured, connected);
        cluster_log!(
            self.core,
            info,
            "cluster quorum state: {} ({} of {} configured peers connected)",
            quorum,
            connected,
            configured
        );
        let _ = self.publishers.quorum_state.try_send(quorum);
    }

    async fn handle_broadcast(&self, message: OutboundMessage) {
        if self.core.log_traffic {
            cluster_log!(self.core, debug, "traffic to cluster: {:?}", message);
        }
        let packet = Packet::from_outbound(&self.core.name, &message);
        let result = match packet.pack() {
            Ok(frame) => self.core.pool.write_all(&frame).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            cluster_log!(
                self.core,
                warn,
                "failed to write {} to the cluster: {}",
                message.data_type(),
                e
            );
        }
    }

    async fn handle_unicast(&self, message: NodeMessage) {
        if self.core.log_traffic {
            cluster_log!(self.core, debug, "traffic to cluster node: {:?}", message);
        }
        let packet = Packet::from_outbound(&self.core.name, &message.message);
        let result = match packet.pack() {
            Ok(frame) => self.core.pool.write_to(message.node.as_str(), &frame).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            cluster_log!(
                self.core,
                warn,
                "failed to write {} to {}: {}",
                message.message.data_type(),
                message.node,
                e
            );
        }
    }

    async fn handle_internal(&self, event: InternalEvent) {
        match event {
            InternalEvent::PeerAdded(name) => {
                cluster_log!(self.core, info, "cluster node added: {}", name);
                self.update_quorum();
            }
            InternalEvent::PeerRemoved(name) => {
                cluster_log!(self.core, info, "cluster node removed: {}", name);
                self.update_quorum();
            }
            InternalEvent::PeerJoined(name) => {
                cluster_log!(self.core, info, "cluster node joined: {}", name);
                let _ = self.publishers.node_join.try_send(name);
                self.update_quorum();
            }
            InternalEvent::PeerLeft { name, error } => {
                cluster_log!(
                    self.core,
                    info,
                    "cluster node left: {} ({})",
                    name,
                    error.as_deref().unwrap_or("no error")
                );
                let _ = self.publishers.node_leave.try_send(name);
                self.update_quorum();
            }
            InternalEvent::Admin(request) => self.handle_admin(request).await,
        }
    }

    async fn handle_admin(&self, request: AdminRequest) {
        cluster_log!(
            self.core,
            info,
            "cluster API request: {} ({})",
            request.action,
            request.node
        );
        match request.action {
            AdminAction::Reconnect => {
                if !self.core.pool.close(request.node.as_str()) {
                    cluster_log!(self.core, warn, "reconnect: {} is not connected", request.node);
                }
            }
            AdminAction::Down => match self.core.pool.get(request.node.as_str()) {
                Some(peer) => {
                    let sent = match pack(&ShutdownNotice {}, &self.core.name) {
                        Ok(frame) => peer.write_frame(&frame).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = sent {
                        cluster_log!(self.core, warn, "down: failed to notify {}: {}", request.node, e);
                    }
                    peer.close();
                }
                None => cluster_log!(self.core, warn, "down: {} is not connected", request.node),
            },
        }

        if self.publishers.from_cluster_api.try_send(request).is_err() {
            cluster_log!(
                self.core,
                warn,
                "unable to write API request to from_cluster_api, channel full"
            );
        }
    }

    async fn handle_inbound(&self, inbound: Inbound) {
        let Inbound { peer, packet } = inbound;
        if self.core.log_traffic {
            cluster_log!(self.core, debug, "traffic received: {:?}", packet);
        }
        peer.increment_packet_count();

        match packet.control_kind() {
            Some(ControlKind::AuthRequest) => peer.set_status(NodeStatus::Authenticating),
            // a late or repeated answer to our own auth request
            Some(ControlKind::AuthResponse) => {}
            Some(ControlKind::Shutdown) => {
                cluster_log!(
                    self.core,
                    info,
                    "got exit notice from node {} (shutdown)",
                    packet.name()
                );
                peer.set_status(NodeStatus::Stopping);
                peer.close();
            }
            Some(ControlKind::Ping) => {
                let sent = packet
                    .decode::<Ping>()
                    .map(|ping| ping.time)
                    .unwrap_or_else(|_| packet.time());
                let lag = Utc::now() - sent;
                if self.core.log_traffic {
                    cluster_log!(
                        self.core,
                        debug,
                        "got ping from node {} ({} ms)",
                        packet.name(),
                        lag.num_milliseconds()
                    );
                }
                peer.set_lag(lag);
            }
            None => {
                let data_type = packet.data_type().to_string();
                if let Err(e) = self
                    .publishers
                    .from_cluster
                    .send_timeout(packet, FROM_CLUSTER_SEND_TIMEOUT)
                    .await
                {
                    cluster_log!(
                        self.core,
                        warn,
                        "unable to send {} from {} to from_cluster, channel full: {}",
                        data_type,
                        peer.name(),
                        e
                    );
                }
            }
        }
    }
}

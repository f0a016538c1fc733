//! Registration, duplicate arbitration and the lifetime of one connection
//!
//! Every authorized connection, incoming or outgoing, ends up in
//! [`run_connection`]. It registers the peer, waits out the join delay, starts
//! the keepalive and runs the read loop until the connection fails.
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time;
use tracing::info_span;
use tracing_futures::Instrument;

use super::connection_pool::DuplicateName;
use super::handshake::AuthorizedConnection;
use super::messages::{Inbound, InternalEvent};
use super::packet::{pack, Ping};
use super::peer::{Direction, FrameReader, NodeStatus, Peer};
use super::shared::{cluster_log, ClusterCore};
use crate::error::{Result, SkeinError};

/// Tie-break key for two connections between the same pair of nodes.
///
/// Both ends derive the same string for a given socket: the address of the
/// side that dialed it. On the dialing side that is the local address, on
/// the accepting side the remote one. When two connections collide, the one
/// with the lexicographically greater key survives on both nodes, so the
/// nodes agree without exchanging anything.
pub fn arbitration_key(peer: &Peer) -> String {
    match peer.direction() {
        Direction::Outgoing => peer.local_addr().to_string(),
        Direction::Incoming => peer.remote_addr().to_string(),
    }
}

/// Put `peer` in the pool, settling a collision with an existing connection.
///
/// Returns false when `peer` lost and must be dropped.
pub(crate) fn register(core: &ClusterCore, peer: &Arc<Peer>) -> bool {
    loop {
        let existing = match core.pool.add(peer.clone()) {
            Ok(()) => return true,
            Err(DuplicateName { existing }) => existing,
        };

        let new_key = arbitration_key(peer);
        let old_key = arbitration_key(&existing);
        if new_key <= old_key {
            cluster_log!(
                core,
                info,
                "two connections to {}: old {} ({}) new {} ({}), dropping the new one",
                peer.name(),
                old_key,
                existing.direction(),
                new_key,
                peer.direction()
            );
            return false;
        }

        if core.pool.replace(&existing, peer.clone()) {
            cluster_log!(
                core,
                info,
                "two connections to {}: old {} ({}) new {} ({}), keeping the new one",
                peer.name(),
                old_key,
                existing.direction(),
                new_key,
                peer.direction()
            );
            existing.close();
            return true;
        }
        // the entry changed between add and replace; look again
    }
}

/// Drive an authorized connection until it fails or is cancelled
pub(crate) async fn run_connection(core: Arc<ClusterCore>, conn: AuthorizedConnection) {
    let AuthorizedConnection { peer, reader } = conn;
    cluster_log!(
        core,
        info,
        "{} attempting to join ({} {})",
        peer.name(),
        peer.direction(),
        peer.remote_addr()
    );

    if core.stop.is_cancelled() || !register(&core, &peer) {
        peer.close();
        peer.shutdown_writer().await;
        return;
    }

    let settings = core.settings();
    tokio::select! {
        _ = time::sleep(settings.join_delay) => {}
        _ = peer.closed() => {
            cluster_log!(
                core,
                info,
                "{} was replaced by another connection, closing the discarded one ({})",
                peer.name(),
                peer.remote_addr()
            );
            core.pool.remove(&peer);
            peer.shutdown_writer().await;
            return;
        }
    }

    let span = info_span!("keepalive", node = %core.name, peer = %peer.name());
    tokio::spawn(keepalive(core.clone(), peer.clone(), settings.ping_interval).instrument(span));

    // a full queue delays the join announcement, it is never dropped
    if core
        .internal_tx
        .send(InternalEvent::PeerJoined(peer.name().clone()))
        .await
        .is_err()
    {
        peer.close();
    }
    peer.set_status(NodeStatus::Online);
    peer.set_error(None);

    cluster_log!(
        core,
        info,
        "{} joined ({}), read timeout {:?}",
        peer.name(),
        peer.remote_addr(),
        settings.read_timeout
    );
    let err = read_loop(&core, &peer, reader, settings.read_timeout).await;
    cluster_log!(
        core,
        info,
        "{} left ({}): {}",
        peer.name(),
        peer.remote_addr(),
        err
    );

    peer.set_status(NodeStatus::Leaving);
    peer.set_error(Some(err.to_string()));
    core.pool.remove(&peer);
    peer.close();
    peer.shutdown_writer().await;

    let _ = core
        .internal_tx
        .send(InternalEvent::PeerLeft {
            name: peer.name().clone(),
            error: Some(err.to_string()),
        })
        .await;
}

/// Read frames and queue them for the dispatcher. Always ends with the reason
/// the connection is no longer usable.
async fn read_loop(
    core: &ClusterCore,
    peer: &Arc<Peer>,
    mut reader: FrameReader,
    read_timeout: Duration,
) -> SkeinError {
    loop {
        let packet = tokio::select! {
            result = reader.read_packet(read_timeout) => result,
            _ = peer.closed() => return SkeinError::Closed("connection closed locally".to_string()),
        };
        let packet = match packet {
            Ok(packet) => packet,
            Err(e) => return e,
        };

        let inbound = Inbound {
            peer: peer.clone(),
            packet,
        };
        // back pressure: a slow dispatcher slows the reader down
        tokio::select! {
            result = core.incoming_tx.send(inbound) => {
                if result.is_err() {
                    return SkeinError::Closed("cluster manager stopped".to_string());
                }
            }
            _ = peer.closed() => return SkeinError::Closed("connection closed locally".to_string()),
        }
    }
}

/// Ping `peer` every `interval` until the connection is closed. A failed
/// write closes the connection.
async fn keepalive(core: Arc<ClusterCore>, peer: Arc<Peer>, interval: Duration) {
    loop {
        if let Err(e) = ping(&core, &peer).await {
            cluster_log!(
                core,
                warn,
                "failed to send ping to {} ({}): {}",
                peer.name(),
                peer.remote_addr(),
                e
            );
            peer.close();
            return;
        }

        tokio::select! {
            _ = time::sleep(interval) => {}
            _ = peer.closed() => {
                cluster_log!(core, debug, "exiting pinger for {}", peer.name());
                return;
            }
        }
    }
}

async fn ping(core: &ClusterCore, peer: &Peer) -> Result<()> {
    let frame = pack(&Ping { time: Utc::now() }, &core.name)?;
    if core.log_traffic {
        cluster_log!(core, debug, "sending ping to {}", peer.name());
    }
    peer.write_frame(&frame).await
}

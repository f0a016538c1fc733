//! Shared-secret authentication performed on every new socket
//!
//! The dialing side sends `cluster.auth-request{key}` and waits for one
//! `cluster.auth-response`. The accepting side reads one frame, compares the
//! key exactly and answers. Nothing else is read or written until the
//! handshake is done; only then is the socket wrapped in a [`Peer`].
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

use super::NodeName;
use super::packet::{pack, AuthRequest, AuthResponse, Packet};
use super::peer::{Direction, FrameReader, NodeStatus, Peer};
use super::shared::{cluster_log, ClusterCore};
use super::stream::{PeerStream, PeerWriter};
use crate::auth_error;
use crate::error::{Result, SkeinError};

/// A connection that passed the handshake, ready for arbitration
#[derive(Debug)]
pub struct AuthorizedConnection {
    pub peer: Arc<Peer>,
    pub reader: FrameReader,
}

async fn write_raw(writer: &mut PeerWriter, frame: &[u8], write_timeout: Duration) -> Result<()> {
    let write = async {
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok::<_, std::io::Error>(())
    };
    timeout(write_timeout, write)
        .await
        .map_err(|_| SkeinError::Write(format!("handshake write timed out after {:?}", write_timeout)))?
        .map_err(|e| SkeinError::Write(e.to_string()))
}

/// Authenticate a socket we dialed to `expected`
pub(crate) async fn authorize_outgoing(
    core: &ClusterCore,
    expected: &NodeName,
    stream: PeerStream,
    read_timeout: Duration,
) -> Result<AuthorizedConnection> {
    let write_timeout = core.settings().write_timeout;
    let local_addr = stream.local_addr()?;
    let remote_addr = stream.peer_addr()?;
    let (read_half, mut write_half) = stream.split();
    let mut reader = FrameReader::new(read_half);

    let request = pack(
        &AuthRequest {
            key: core.auth_key.clone(),
        },
        &core.name,
    )?;
    write_raw(&mut write_half, &request, write_timeout).await?;

    let packet = reader.read_packet(read_timeout).await?;
    if !packet.is::<AuthResponse>() {
        return Err(auth_error!(
            "{} answered the auth request with {}",
            expected,
            packet.data_type()
        ));
    }
    let response: AuthResponse = packet.decode()?;
    if !response.ok {
        return Err(auth_error!(
            "{} refused the connection: {}",
            expected,
            response.error.unwrap_or_default()
        ));
    }
    if packet.name() != expected {
        return Err(auth_error!(
            "{} is configured at {} but {} answered",
            expected,
            remote_addr,
            packet.name()
        ));
    }

    cluster_log!(
        core,
        debug,
        "outgoing auth to {} ({}) completed",
        expected,
        remote_addr
    );
    let peer = Peer::new(
        expected.clone(),
        Direction::Outgoing,
        local_addr,
        remote_addr,
        write_half,
        write_timeout,
    );
    peer.set_status(NodeStatus::Authenticating);
    Ok(AuthorizedConnection {
        peer: Arc::new(peer),
        reader,
    })
}

/// Authenticate a socket accepted by the listener
pub(crate) async fn authorize_incoming(
    core: &ClusterCore,
    stream: PeerStream,
    read_timeout: Duration,
) -> Result<AuthorizedConnection> {
    let write_timeout = core.settings().write_timeout;
    let local_addr = stream.local_addr()?;
    let remote_addr = stream.peer_addr()?;
    let (read_half, mut write_half) = stream.split();
    let mut reader = FrameReader::new(read_half);

    let packet = reader.read_packet(read_timeout).await?;
    if let Err(err) = check_request(core, &packet) {
        let response = pack(
            &AuthResponse {
                ok: false,
                error: Some(err.to_string()),
                time: None,
            },
            &core.name,
        )?;
        // the socket is dropped right after, a failed write changes nothing
        let _ = write_raw(&mut write_half, &response, write_timeout).await;
        let _ = timeout(write_timeout, write_half.shutdown()).await;
        return Err(err);
    }

    let response = pack(
        &AuthResponse {
            ok: true,
            error: None,
            time: Some(Utc::now()),
        },
        &core.name,
    )?;
    write_raw(&mut write_half, &response, write_timeout).await?;

    cluster_log!(
        core,
        debug,
        "incoming auth completed by {} ({})",
        packet.name(),
        remote_addr
    );
    let peer = Peer::new(
        packet.name().clone(),
        Direction::Incoming,
        local_addr,
        remote_addr,
        write_half,
        write_timeout,
    );
    peer.set_status(NodeStatus::Authenticating);
    Ok(AuthorizedConnection {
        peer: Arc::new(peer),
        reader,
    })
}

fn check_request(core: &ClusterCore, packet: &Packet) -> Result<()> {
    if !packet.is::<AuthRequest>() {
        return Err(auth_error!(
            "expected an auth request, got {}",
            packet.data_type()
        ));
    }
    let request: AuthRequest = packet.decode()?;
    if request.key != core.auth_key {
        return Err(auth_error!("invalid authentication key"));
    }
    if packet.name() == &core.name {
        return Err(auth_error!("{} is this node's own name", packet.name()));
    }
    Ok(())
}

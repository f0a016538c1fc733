//! Inbound acceptor
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::info_span;
use tracing_futures::Instrument;

use super::arbitrator::run_connection;
use super::handshake::authorize_incoming;
use super::shared::{cluster_log, ClusterCore};
use super::stream::PeerStream;
use crate::error::{Result, SkeinError};

/// Accept sockets until the stop token is cancelled. Every socket gets its
/// own handshake task, so a slow or hostile client never blocks the others.
pub(crate) async fn accept_loop(core: Arc<ClusterCore>, listener: TcpListener) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote_addr)) => {
                    cluster_log!(core, debug, "new socket from {}", remote_addr);
                    let span = info_span!("connection", node = %core.name, remote = %remote_addr);
                    tokio::spawn(handle_socket(core.clone(), stream).instrument(span));
                }
                Err(e) => cluster_log!(core, warn, "failed to accept connection: {}", e),
            },
            _ = core.stop.cancelled() => {
                cluster_log!(core, info, "exit of incoming acceptor");
                // dropping the listener closes it
                return;
            }
        }
    }
}

/// TLS accept when configured, bounded by the read timeout like the
/// handshake that follows
async fn secure(core: &ClusterCore, stream: TcpStream) -> Result<PeerStream> {
    let read_timeout = core.settings().read_timeout;
    match &core.tls {
        Some(tls) => timeout(read_timeout, tls.accept(stream))
            .await
            .map_err(|_| SkeinError::Tls(format!("handshake not completed within {:?}", read_timeout)))?,
        None => Ok(PeerStream::Tcp(stream)),
    }
}

async fn handle_socket(core: Arc<ClusterCore>, stream: TcpStream) {
    let read_timeout = core.settings().read_timeout;
    let remote_addr = stream.peer_addr().ok();
    let authorized = match secure(&core, stream).await {
        Ok(stream) => authorize_incoming(&core, stream, read_timeout).await,
        Err(e) => Err(e),
    };
    match authorized {
        Ok(conn) => run_connection(core, conn).await,
        Err(e) => {
            cluster_log!(
                core,
                info,
                "incoming connection from {:?} refused: {}",
                remote_addr,
                e
            );
        }
    }
}

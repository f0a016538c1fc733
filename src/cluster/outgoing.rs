//! Outbound connector: keeps dialing configured peers that are not connected
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::{self, timeout};
use tracing::info_span;
use tracing_futures::Instrument;

use super::arbitrator::run_connection;
use super::handshake::{authorize_outgoing, AuthorizedConnection};
use super::shared::{cluster_log, ClusterCore, ConfiguredPeer};
use super::stream::PeerStream;
use crate::error::{Result, SkeinError};

/// Dial loop. Runs until the manager's stop token is cancelled; there is no
/// backoff, every disconnected peer is tried once per connect interval.
pub(crate) async fn connect_loop(core: Arc<ClusterCore>) {
    cluster_log!(core, info, "starting outgoing connector");
    loop {
        let settings = core.settings();
        let mut dials = JoinSet::new();
        for target in core.configured_peers() {
            if core.pool.exists(target.name.as_str()) {
                continue;
            }
            cluster_log!(
                core,
                debug,
                "connecting to non-connected cluster node {} ({})",
                target.name,
                target.address
            );
            let core = core.clone();
            dials.spawn(async move {
                let result = dial(&core, &target).await;
                (target, result)
            });
        }

        while let Some(joined) = dials.join_next().await {
            let (target, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    cluster_log!(core, error, "dial task failed: {}", e);
                    continue;
                }
            };
            match result {
                Ok(conn) => {
                    let span = info_span!("connection", node = %core.name, peer = %target.name);
                    tokio::spawn(run_connection(core.clone(), conn).instrument(span));
                }
                Err(e) => {
                    cluster_log!(core, debug, "dial to {} ({}) failed: {}", target.name, target.address, e)
                }
            }
        }

        tokio::select! {
            _ = time::sleep(settings.connect_interval) => {}
            _ = core.stop.cancelled() => {
                cluster_log!(core, info, "exit of outgoing connector");
                return;
            }
        }
    }
}

/// Dial `target` once, wrap the socket in TLS when configured and run the
/// handshake on it
async fn dial(core: &ClusterCore, target: &ConfiguredPeer) -> Result<AuthorizedConnection> {
    let settings = core.settings();
    let stream = timeout(settings.connect_timeout, TcpStream::connect(target.address.as_str()))
        .await
        .map_err(|_| {
            SkeinError::ConnectTimeout(format!(
                "{} ({}) after {:?}",
                target.name, target.address, settings.connect_timeout
            ))
        })?
        .map_err(|e| SkeinError::Dial(format!("{} ({}): {}", target.name, target.address, e)))?;

    // a stopping manager makes no new connections
    if core.stop.is_cancelled() {
        return Err(SkeinError::Closed("cluster manager stopped".to_string()));
    }
    let stream = match &core.tls {
        Some(tls) => timeout(settings.connect_timeout, tls.connect(&target.address, stream))
            .await
            .map_err(|_| {
                SkeinError::ConnectTimeout(format!(
                    "TLS handshake with {} ({}) after {:?}",
                    target.name, target.address, settings.connect_timeout
                ))
            })??,
        None => PeerStream::Tcp(stream),
    };
    authorize_outgoing(core, &target.name, stream, settings.read_timeout).await
}

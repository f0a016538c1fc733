//! CLI for this application
//!
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::config_error;
use crate::error::Result;
use crate::cluster::TlsConfig;
use crate::settings;

/// A `name=host:port` peer given on the command line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerArg {
    pub name: String,
    pub address: String,
}

fn parse_peer(value: &str) -> std::result::Result<PeerArg, String> {
    let (name, address) = value
        .split_once('=')
        .ok_or_else(|| format!("expected name=host:port, got '{}'", value))?;
    let name = name.trim();
    let address = address.trim();
    if name.is_empty() || address.is_empty() {
        return Err(format!("expected name=host:port, got '{}'", value));
    }
    if !address.contains(':') {
        return Err(format!("peer address '{}' has no port", address));
    }
    Ok(PeerArg {
        name: name.to_string(),
        address: address.to_string(),
    })
}

#[derive(Clone, Debug, clap::Parser)]
#[command(name = "skein", version, about = "Cluster node of a self-hosted global load balancer")]
pub struct Cli {
    // Unique name of this node
    #[clap(long, env("SKEIN_NAME"), help = "Unique name of this cluster node")]
    pub name: String,

    // Shared secret
    #[clap(
        long,
        env("SKEIN_SECRET"),
        hide_env_values = true,
        help = "Shared secret every cluster node presents when connecting"
    )]
    pub secret: String,

    // Server listen address
    #[clap(
        long,
        default_value = "0.0.0.0",
        env("SKEIN_LISTEN_ADDRESS"),
        help = "IP Address to listen on"
    )]
    pub listen_address: String,

    // TCP listen port for cluster traffic
    #[clap(
        long,
        default_value = settings::DEFAULT_PORT_CLUSTER,
        env("SKEIN_CLUSTER_PORT"),
        help = "Port to bind the cluster listener to"
    )]
    pub cluster_port: u16,

    // HTTP API listen port
    #[clap(
        long,
        default_value = settings::DEFAULT_PORT_HTTP,
        env("SKEIN_HTTP_PORT"),
        help = "Port to bind the admin HTTP API to"
    )]
    pub http_port: u16,

    // Cluster configuration information: peers
    #[clap(
        long = "peer",
        env("SKEIN_PEERS"),
        value_delimiter = ',',
        value_parser = parse_peer,
        help = "Peer to stay connected to, as name=host:port (repeatable)"
    )]
    pub peers: Vec<PeerArg>,

    #[clap(
        long,
        default_value = "5000",
        env("SKEIN_PING_INTERVAL_MS"),
        help = "Milliseconds between pings to each peer"
    )]
    pub ping_interval_ms: u64,

    #[clap(
        long,
        default_value = "500",
        env("SKEIN_JOIN_DELAY_MS"),
        help = "Milliseconds to wait before announcing a new connection"
    )]
    pub join_delay_ms: u64,

    #[clap(
        long,
        default_value = "11000",
        env("SKEIN_READ_TIMEOUT_MS"),
        help = "Milliseconds of silence before a peer is considered dead"
    )]
    pub read_timeout_ms: u64,

    #[clap(
        long,
        default_value = "2000",
        env("SKEIN_CONNECT_INTERVAL_MS"),
        help = "Milliseconds between dial rounds for disconnected peers"
    )]
    pub connect_interval_ms: u64,

    #[clap(
        long,
        default_value = "10000",
        env("SKEIN_CONNECT_TIMEOUT_MS"),
        help = "Milliseconds a single dial may take"
    )]
    pub connect_timeout_ms: u64,

    #[clap(
        long,
        default_value = "10000",
        env("SKEIN_WRITE_TIMEOUT_MS"),
        help = "Milliseconds a frame may take to reach a peer before it is dropped"
    )]
    pub write_timeout_ms: u64,

    // TLS for cluster traffic: all three of cert, key and CA or none
    #[clap(long, env("SKEIN_TLS_CERT"), help = "PEM certificate chain presented to peers")]
    pub tls_cert: Option<PathBuf>,

    #[clap(long, env("SKEIN_TLS_KEY"), help = "PEM private key of the TLS certificate")]
    pub tls_key: Option<PathBuf>,

    #[clap(long, env("SKEIN_TLS_CA"), help = "PEM CA bundle peer certificates are checked against")]
    pub tls_ca: Option<PathBuf>,

    #[clap(
        long,
        env("SKEIN_TLS_SERVER_NAME"),
        help = "Name expected in peer certificates instead of the peer's host"
    )]
    pub tls_server_name: Option<String>,

    #[clap(
        long,
        env("SKEIN_LOG_TRAFFIC"),
        help = "Log every packet sent and received"
    )]
    pub log_traffic: bool,
}

impl Cli {
    pub fn cluster_settings(&self) -> settings::ClusterSettings {
        settings::ClusterSettings {
            ping_interval: Duration::from_millis(self.ping_interval_ms),
            join_delay: Duration::from_millis(self.join_delay_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            connect_interval: Duration::from_millis(self.connect_interval_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }

    pub fn tls_config(&self) -> Result<Option<TlsConfig>> {
        match (&self.tls_cert, &self.tls_key, &self.tls_ca) {
            (None, None, None) => {
                if self.tls_server_name.is_some() {
                    return Err(config_error!("--tls-server-name needs --tls-cert, --tls-key and --tls-ca"));
                }
                Ok(None)
            }
            (Some(cert), Some(key), Some(ca)) => {
                let mut tls = TlsConfig::from_pem_files(cert, key, ca)?;
                if let Some(name) = &self.tls_server_name {
                    tls = tls.with_server_name(name);
                }
                Ok(Some(tls))
            }
            _ => Err(config_error!("--tls-cert, --tls-key and --tls-ca must be given together")),
        }
    }

    pub fn cluster_config(&self) -> Result<settings::ClusterConfig> {
        let settings = self.cluster_settings();
        settings.validate()?;
        if self.peers.iter().any(|peer| peer.name == self.name) {
            return Err(config_error!("{} is listed as its own peer", self.name));
        }
        let mut config = settings::ClusterConfig::new(&self.name, &self.secret).with_settings(settings);
        config.log_traffic = self.log_traffic;
        config.tls = self.tls_config()?;
        Ok(config)
    }

    fn ip(&self) -> Result<IpAddr> {
        self.listen_address
            .parse::<IpAddr>()
            .map_err(|e| config_error!("invalid listen address {}: {}", self.listen_address, e))
    }

    pub fn cluster_socket_address(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::from((self.ip()?, self.cluster_port)))
    }

    pub fn http_socket_address(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::from((self.ip()?, self.http_port)))
    }
}

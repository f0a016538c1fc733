//! skein application settings
use std::time::Duration;

use crate::cluster::TlsConfig;

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const STANDARD_PORT_CLUSTER: u16 = 9650;
pub const DEFAULT_PORT_CLUSTER: &str = "9650";
pub const STANDARD_PORT_HTTP: u16 = 9651;
pub const DEFAULT_PORT_HTTP: &str = "9651";

/// Buffer size of the data channels (to/from cluster, log, internal queues)
pub const CHANNEL_BUFFER_SIZE: usize = 100;
/// Buffer size of the join/leave/quorum notification channels
pub const NOTIFICATION_BUFFER_SIZE: usize = 10;
/// Frames longer than this are rejected as malformed
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Adjustable timings of a running cluster node.
///
/// Changing these on a live manager affects connections started afterwards;
/// connections already past a step keep the value they read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClusterSettings {
    /// How often a connected peer is pinged
    pub ping_interval: Duration,
    /// Delay before announcing a newly registered peer; settles racing
    /// duplicate connects. Must be shorter than `read_timeout`.
    pub join_delay: Duration,
    /// A peer that sends nothing for this long is considered dead
    pub read_timeout: Duration,
    /// How often disconnected peers are redialed
    pub connect_interval: Duration,
    /// How long a single dial may take
    pub connect_timeout: Duration,
    /// How long one frame may take to reach the socket. A peer that stops
    /// reading is dropped after this.
    pub write_timeout: Duration,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(5),
            join_delay: Duration::from_millis(500),
            read_timeout: Duration::from_secs(11),
            connect_interval: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
        }
    }
}

impl ClusterSettings {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.join_delay >= self.read_timeout {
            return Err(crate::config_error!(
                "join delay ({:?}) must be shorter than read timeout ({:?})",
                self.join_delay,
                self.read_timeout
            ));
        }
        if self.ping_interval >= self.read_timeout {
            return Err(crate::config_error!(
                "ping interval ({:?}) must be shorter than read timeout ({:?})",
                self.ping_interval,
                self.read_timeout
            ));
        }
        if self.write_timeout.is_zero() {
            return Err(crate::config_error!("write timeout must not be zero"));
        }
        Ok(())
    }
}

/// Everything a cluster manager needs to start
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    // Name of this node; must be unique within the cluster
    pub name: String,

    // Shared secret every node presents during the handshake
    pub auth_key: String,

    pub settings: ClusterSettings,

    // Log every packet sent and received at debug level
    pub log_traffic: bool,

    // Encrypt cluster traffic; plain TCP when unset
    pub tls: Option<TlsConfig>,
}

impl ClusterConfig {
    pub fn new(name: impl Into<String>, auth_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            auth_key: auth_key.into(),
            settings: ClusterSettings::default(),
            log_traffic: false,
            tls: None,
        }
    }

    pub fn with_settings(mut self, settings: ClusterSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }
}

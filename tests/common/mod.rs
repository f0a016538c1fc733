#![allow(dead_code)]
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;

use skein::cluster::{ClusterEvents, Manager, Message, TlsConfig};
use skein::settings::{ClusterConfig, ClusterSettings};

pub const SECRET: &str = "integration-secret";
pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendHealth {
    pub pool: String,
    pub online: bool,
}

impl Message for BackendHealth {
    const DATA_TYPE: &'static str = "healthcheck.BackendHealth";
}

pub fn fast_settings() -> ClusterSettings {
    ClusterSettings {
        ping_interval: Duration::from_millis(100),
        join_delay: Duration::from_millis(50),
        read_timeout: Duration::from_millis(500),
        connect_interval: Duration::from_millis(100),
        connect_timeout: Duration::from_millis(500),
        write_timeout: Duration::from_millis(500),
    }
}

pub fn manager(name: &str, secret: &str) -> (Manager, ClusterEvents) {
    Manager::new(ClusterConfig::new(name, secret).with_settings(fast_settings())).unwrap()
}

pub async fn start(name: &str) -> (Manager, ClusterEvents, SocketAddr) {
    start_with_secret(name, SECRET).await
}

pub async fn start_with_secret(name: &str, secret: &str) -> (Manager, ClusterEvents, SocketAddr) {
    let (manager, events) = manager(name, secret);
    let addr = manager.listen_and_serve("127.0.0.1:0").await.unwrap();
    (manager, events, addr)
}

/// TLS material under tests/data: `node` is signed by `ca`, `rogue` by
/// `rogue-ca`
pub fn tls_config(cert: &str, ca: &str) -> TlsConfig {
    let data = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests").join("data");
    TlsConfig::from_pem_files(
        &data.join(format!("{}.pem", cert)),
        &data.join(format!("{}.key", cert)),
        &data.join(format!("{}.pem", ca)),
    )
    .unwrap()
}

pub async fn start_tls(name: &str, tls: TlsConfig) -> (Manager, ClusterEvents, SocketAddr) {
    let config = ClusterConfig::new(name, SECRET)
        .with_settings(fast_settings())
        .with_tls(tls);
    let (manager, events) = Manager::new(config).unwrap();
    let addr = manager.listen_and_serve("127.0.0.1:0").await.unwrap();
    (manager, events, addr)
}

/// Drain a log channel in the background so no line is dropped
pub fn collect_log(mut log: mpsc::Receiver<String>) -> Arc<Mutex<Vec<String>>> {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    tokio::spawn(async move {
        while let Some(line) = log.recv().await {
            sink.lock().push(line);
        }
    });
    lines
}

pub fn count_lines(lines: &Mutex<Vec<String>>, needle: &str) -> usize {
    lines.lock().iter().filter(|line| line.contains(needle)).count()
}

/// A loopback port nobody listens on right now
pub fn free_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

pub async fn recv<T>(rx: &mut mpsc::Receiver<T>) -> T {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting on channel")
        .expect("channel closed")
}

/// Receive until `expected` shows up, skipping stale values
pub async fn recv_until<T: PartialEq + std::fmt::Debug>(rx: &mut mpsc::Receiver<T>, expected: T) {
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Some(value) if value == expected => return,
                Some(_) => continue,
                None => panic!("channel closed waiting for {:?}", expected),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {:?}", expected))
}

/// Assert nothing arrives on `rx` for `quiet`
pub async fn assert_silent<T: std::fmt::Debug>(rx: &mut mpsc::Receiver<T>, quiet: Duration) {
    if let Ok(Some(value)) = timeout(quiet, rx.recv()).await {
        panic!("expected nothing, got {:?}", value);
    }
}

/// Poll `condition` until it holds
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let polled = timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting until {}", what);
}

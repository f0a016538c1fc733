//! Peer sockets: plain TCP or TLS over TCP
use std::fmt;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

use crate::config_error;
use crate::error::{Result, SkeinError};

pub type PeerReader = ReadHalf<PeerStream>;
pub type PeerWriter = WriteHalf<PeerStream>;

/// A connected peer socket, encrypted or not
pub enum PeerStream {
    Tcp(TcpStream),
    TlsClient(Box<client::TlsStream<TcpStream>>),
    TlsServer(Box<server::TlsStream<TcpStream>>),
}

impl PeerStream {
    fn tcp(&self) -> &TcpStream {
        match self {
            PeerStream::Tcp(stream) => stream,
            PeerStream::TlsClient(stream) => stream.get_ref().0,
            PeerStream::TlsServer(stream) => stream.get_ref().0,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.tcp().local_addr()?)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.tcp().peer_addr()?)
    }

    pub fn is_tls(&self) -> bool {
        !matches!(self, PeerStream::Tcp(_))
    }

    pub fn split(self) -> (PeerReader, PeerWriter) {
        tokio::io::split(self)
    }
}

impl fmt::Debug for PeerStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            PeerStream::Tcp(_) => "tcp",
            PeerStream::TlsClient(_) => "tls-client",
            PeerStream::TlsServer(_) => "tls-server",
        };
        f.debug_struct("PeerStream")
            .field("kind", &kind)
            .field("peer", &self.tcp().peer_addr().ok())
            .finish()
    }
}

impl AsyncRead for PeerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            PeerStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            PeerStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            PeerStream::TlsServer(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PeerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            PeerStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            PeerStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            PeerStream::TlsServer(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            PeerStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            PeerStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            PeerStream::TlsServer(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            PeerStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            PeerStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            PeerStream::TlsServer(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// TLS material of a cluster node.
///
/// Every node presents the same kind of certificate when accepting and
/// verifies the remote certificate against `ca` when dialing. The shared
/// secret handshake runs inside the encrypted stream.
#[derive(Clone)]
pub struct TlsConfig {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
    /// Name checked against the remote certificate instead of the host part
    /// of the peer address
    server_name: Option<String>,
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl TlsConfig {
    /// Build from PEM encoded certificate chain, private key and CA bundle
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8], ca_pem: &[u8]) -> Result<Self> {
        let certs = read_certs(cert_pem, "certificate")?;
        let key = read_key(key_pem)?;
        let mut roots = RootCertStore::empty();
        for ca in read_certs(ca_pem, "CA bundle")? {
            roots
                .add(ca)
                .map_err(|e| config_error!("invalid CA certificate: {}", e))?;
        }

        let server = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| config_error!("invalid certificate or key: {}", e))?;
        let client = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server)),
            connector: TlsConnector::from(Arc::new(client)),
            server_name: None,
        })
    }

    pub fn from_pem_files(cert: &Path, key: &Path, ca: &Path) -> Result<Self> {
        Self::from_pem(&read_file(cert)?, &read_file(key)?, &read_file(ca)?)
    }

    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }

    pub(crate) async fn accept(&self, stream: TcpStream) -> Result<PeerStream> {
        let stream = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|e| SkeinError::Tls(format!("accept: {}", e)))?;
        Ok(PeerStream::TlsServer(Box::new(stream)))
    }

    /// TLS handshake on a socket dialed to `address` (`host:port`)
    pub(crate) async fn connect(&self, address: &str, stream: TcpStream) -> Result<PeerStream> {
        let host = match &self.server_name {
            Some(name) => name.clone(),
            None => host_of(address).to_string(),
        };
        let server_name = ServerName::try_from(host.clone())
            .map_err(|e| SkeinError::Tls(format!("invalid server name {}: {}", host, e)))?;
        let stream = self
            .connector
            .connect(server_name, stream)
            .await
            .map_err(|e| SkeinError::Tls(format!("connect to {}: {}", address, e)))?;
        Ok(PeerStream::TlsClient(Box::new(stream)))
    }
}

/// Host part of `host:port`, without IPv6 brackets
fn host_of(address: &str) -> &str {
    let host = address.rsplit_once(':').map_or(address, |(host, _)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| config_error!("cannot read {}: {}", path.display(), e))
}

fn read_certs(pem: &[u8], what: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| config_error!("invalid {} PEM: {}", what, e))?;
    if certs.is_empty() {
        return Err(config_error!("no certificate found in {} PEM", what));
    }
    Ok(certs)
}

fn read_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut BufReader::new(pem))
        .map_err(|e| config_error!("invalid private key PEM: {}", e))?
        .ok_or_else(|| config_error!("no private key found in PEM"))
}

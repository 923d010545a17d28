//! Byte-stream transport used to reach a caster

use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::{config::NtripConfig, ClientError};

/// Bidirectional byte stream to a caster
pub trait CasterStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> CasterStream for T {}

pub type BoxedStream = Box<dyn CasterStream>;

/// Opens [CasterStream]s for an [NtripConfig].
///
/// The default [TcpConnector] resolves the host and connects over TCP,
/// wrapping the socket in TLS when `use_tls` is set. Tests swap in
/// in-memory connectors.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &NtripConfig) -> Result<BoxedStream, ClientError>;
}

/// Plain TCP / TLS [Connector]
#[derive(Clone, Debug, Default)]
pub struct TcpConnector;

#[async_trait::async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, config: &NtripConfig) -> Result<BoxedStream, ClientError> {
        debug!("Connecting to {}", config.url());

        let sock = TcpStream::connect(&config.url()).await?;
        sock.set_nodelay(true)?;

        if !config.use_tls {
            debug!("Using plain TCP connection");
            return Ok(Box::new(sock));
        }

        debug!("Using TLS connection");

        let mut root_cert_store = rustls::RootCertStore::empty();
        root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls_config));
        let dnsname = ServerName::try_from(config.host.clone())?;

        let tls_sock = connector.connect(dnsname, sock).await?;

        Ok(Box::new(tls_sock))
    }
}

//! TLS client context shared by every HTTPS connection of an [`EventLoop`].
//!
//! [`EventLoop`]: super::EventLoop

use std::{
    fs::File,
    io::{self, BufReader},
    path::{Path, PathBuf},
    sync::Arc,
};

use rustls::{crypto::ring, ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("couldn't read trusted root certificates from {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no usable trusted root certificate found in {path:?}")]
    NoCertificates { path: PathBuf },
    #[error("couldn't build tls client config: {0}")]
    Rustls(#[from] rustls::Error),
}

/// A wrapper for [`tokio_rustls::TlsConnector`], built once per event loop.
///
/// Peer certificates are verified against the configured roots, including the peer host name.
#[derive(Clone)]
pub struct TlsContext {
    connector: TlsConnector,
}

impl TlsContext {
    /// Build a context trusting the certificates of a PEM bundle, usually
    /// `/etc/ssl/certs/ca-certificates.crt`.
    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self, TlsError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| TlsError::Io {
            path: path.to_owned(),
            source,
        })?;
        let certs = rustls_pemfile::certs(&mut BufReader::new(file))
            .collect::<io::Result<Vec<_>>>()
            .map_err(|source| TlsError::Io {
                path: path.to_owned(),
                source,
            })?;

        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(certs);
        if ignored > 0 {
            tracing::warn!("ignored {ignored} unparsable root certificates in {path:?}");
        }
        if added == 0 {
            return Err(TlsError::NoCertificates {
                path: path.to_owned(),
            });
        }
        tracing::debug!("loaded {added} trusted root certificates from {path:?}");
        Self::with_roots(roots)
    }

    /// Build a context trusting the bundled Mozilla root certificates.
    pub fn with_webpki_roots() -> Result<Self, TlsError> {
        Self::with_roots(RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_owned(),
        })
    }

    fn with_roots(roots: RootCertStore) -> Result<Self, TlsError> {
        let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    pub async fn connect(
        &self,
        server_name: &str,
        tcp_stream: TcpStream,
    ) -> io::Result<TlsStream<TcpStream>> {
        let sni = ServerName::try_from(server_name)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
            .to_owned();
        tracing::trace!("TlsContext::connect({server_name:?})");
        self.connector.connect(sni, tcp_stream).await
    }
}

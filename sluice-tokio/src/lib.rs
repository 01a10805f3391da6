//! # Tokio Transport Implementation
//!
//! Tokio-backed implementations of the `sluice` runtime and transport
//! abstractions.
//!
//! Features:
//!
//! - Uses `tokio::net::TcpStream` for I/O, with `TCP_NODELAY` set
//! - Optional TLS support via `rustls` (`tls` feature), advertising the
//!   configured ALPN protocols so the client can pick HTTP/2, with an
//!   optional client certificate for servers that require one
//! - Optional HTTP forward proxy, reached through `CONNECT` tunnels
//! - Integrates Tokio I/O types with `futures-lite` traits via `tokio-util`
//!
//! Limitations:
//!
//! - Only client-side connections are supported
//! - Addresses are tried in resolution order until one connects

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::{Context as _, bail};
use futures_lite::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, warn};

use sluice::AsyncRuntime;
use sluice::http::Uri;
use sluice::transport::{BidiStream, TransportPlugin};

#[cfg(feature = "tls")]
use {
    rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName},
    std::sync::Arc,
    tokio_rustls::{TlsConnector, client::TlsStream},
};

/// Tokio-based async runtime adapter.
#[derive(Clone, Copy, Default, Debug)]
pub struct TokioRuntime;

impl AsyncRuntime for TokioRuntime {
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future);
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send + 'static {
        tokio::time::sleep(duration)
    }
}

mod proxy;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Builder for [`TokioTransport`].
#[derive(Clone, Debug)]
pub struct TokioTransportBuilder {
    alpn_protocols: Vec<Vec<u8>>,
    ca_certificate: Option<Vec<u8>>,
    trust_all_certificates: bool,
    client_auth: Option<ClientAuth>,
    proxy: Option<Uri>,
    connect_timeout: Duration,
}

/// Certificate chain and private key presented to servers that ask for one.
#[derive(Clone)]
struct ClientAuth {
    chain: Vec<Vec<u8>>,
    key: Vec<u8>,
}

impl fmt::Debug for ClientAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientAuth")
            .field("chain", &self.chain.len())
            .finish_non_exhaustive()
    }
}

impl Default for TokioTransportBuilder {
    fn default() -> Self {
        Self {
            alpn_protocols: vec![b"h2".to_vec(), b"http/1.1".to_vec()],
            ca_certificate: None,
            trust_all_certificates: false,
            client_auth: None,
            proxy: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl TokioTransportBuilder {
    /// ALPN protocol identifiers to advertise, in preference order.
    pub fn with_alpn_protocols(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.alpn_protocols = protocols;
        self
    }

    /// An extra trusted CA certificate, DER encoded.
    pub fn with_ca_certificate(mut self, der: Vec<u8>) -> Self {
        self.ca_certificate = Some(der);
        self
    }

    /// Skips server certificate verification. For tests only.
    pub fn with_trust_all_certificates(mut self, trust_all: bool) -> Self {
        self.trust_all_certificates = trust_all;
        self
    }

    /// Client certificate chain (leaf first) and PKCS#8, PKCS#1 or SEC1
    /// private key, all DER encoded.
    pub fn with_client_auth_cert(mut self, chain: Vec<Vec<u8>>, key: Vec<u8>) -> Self {
        self.client_auth = Some(ClientAuth { chain, key });
        self
    }

    /// Routes every connection through the `http://` forward proxy at
    /// `proxy` using `CONNECT` tunnels.
    pub fn with_proxy(mut self, proxy: Uri) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn build(self) -> anyhow::Result<TokioTransport> {
        #[cfg(feature = "tls")]
        let tls = self.tls_connector()?;

        let proxy = match &self.proxy {
            Some(uri) => {
                if uri.scheme_str() != Some("http") {
                    bail!("unsupported proxy {uri}: only http:// proxies are supported");
                }
                let host = uri.host().context("proxy URI missing host")?;
                Some(ProxyAddress {
                    host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
                    port: default_port(uri),
                })
            }
            None => None,
        };

        Ok(TokioTransport {
            connect_timeout: self.connect_timeout,
            proxy,
            #[cfg(feature = "tls")]
            tls,
        })
    }

    #[cfg(feature = "tls")]
    fn tls_connector(&self) -> anyhow::Result<TlsConnector> {
        use rustls::{ClientConfig, RootCertStore};

        let builder = if self.trust_all_certificates {
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::NoVerifier))
        } else {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            if let Some(der) = &self.ca_certificate {
                roots
                    .add(CertificateDer::from(der.clone()))
                    .context("invalid CA certificate")?;
            }
            ClientConfig::builder().with_root_certificates(roots)
        };
        let mut config = match &self.client_auth {
            Some(auth) => {
                let chain = auth.chain.iter().cloned().map(CertificateDer::from).collect();
                let key = PrivateKeyDer::try_from(auth.key.clone())
                    .map_err(anyhow::Error::msg)
                    .context("invalid client private key")?;
                builder
                    .with_client_auth_cert(chain, key)
                    .context("invalid client certificate or key")?
            }
            None => builder.with_no_client_auth(),
        };
        config.alpn_protocols = self.alpn_protocols.clone();
        Ok(TlsConnector::from(Arc::new(config)))
    }
}

/// Tokio-based transport plugin.
///
/// Opens a TCP connection per call and, for `https` URIs, layers TLS on top
/// of it.
#[derive(Clone)]
pub struct TokioTransport {
    connect_timeout: Duration,
    proxy: Option<ProxyAddress>,
    #[cfg(feature = "tls")]
    tls: TlsConnector,
}

#[derive(Clone, Debug)]
struct ProxyAddress {
    host: String,
    port: u16,
}

impl TokioTransport {
    pub fn builder() -> TokioTransportBuilder {
        TokioTransportBuilder::default()
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    async fn dial(&self, host: &str, port: u16) -> anyhow::Result<TcpStream> {
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .with_context(|| format!("connecting to {host}:{port} timed out"))?
            .with_context(|| format!("failed to connect to {host}:{port}"))?;
        let _ = tcp.set_nodelay(true);
        debug!(host, port, "TCP connection established");
        Ok(tcp)
    }
}

impl Default for TokioTransport {
    /// Advertises `h2` and `http/1.1` and trusts the webpki roots.
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            proxy: None,
            #[cfg(feature = "tls")]
            tls: {
                let mut roots = rustls::RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                let mut config = rustls::ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth();
                config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
                TlsConnector::from(Arc::new(config))
            },
        }
    }
}

/// A bidirectional Tokio-backed I/O stream.
///
/// This represents a single TCP (or TLS-over-TCP) connection.
#[derive(Debug)]
pub enum TokioIo {
    /// Plain TCP stream
    Plain(Compat<TcpStream>),

    /// TLS-encrypted TCP stream
    #[cfg(feature = "tls")]
    Tls(Compat<TlsStream<TcpStream>>),
}

impl AsyncRead for TokioIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            TokioIo::Plain(io) => Pin::new(io).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            TokioIo::Tls(io) => Pin::new(io).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TokioIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            TokioIo::Plain(io) => Pin::new(io).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            TokioIo::Tls(io) => Pin::new(io).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TokioIo::Plain(io) => Pin::new(io).poll_flush(cx),
            #[cfg(feature = "tls")]
            TokioIo::Tls(io) => Pin::new(io).poll_flush(cx),
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TokioIo::Plain(io) => Pin::new(io).poll_close(cx),
            #[cfg(feature = "tls")]
            TokioIo::Tls(io) => Pin::new(io).poll_close(cx),
        }
    }
}

impl BidiStream for TokioIo {
    /// Returns the negotiated ALPN protocol, if TLS is in use.
    fn alpn_protocol(&self) -> Option<&[u8]> {
        #[cfg(feature = "tls")]
        if let TokioIo::Tls(stream) = self {
            return stream.get_ref().get_ref().1.alpn_protocol();
        }
        None
    }
}

fn default_port(uri: &Uri) -> u16 {
    uri.port_u16().unwrap_or_else(|| {
        if uri.scheme_str() == Some("https") {
            443
        } else {
            80
        }
    })
}

impl TransportPlugin for TokioTransport {
    type Io = TokioIo;

    async fn connect(&self, uri: &Uri) -> anyhow::Result<TokioIo> {
        let host = uri.host().context("URI missing host")?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = default_port(uri);

        let tcp = match &self.proxy {
            Some(address) => {
                let tcp = self.dial(&address.host, address.port).await?;
                proxy::tunnel(tcp, host, port).await?
            }
            None => self.dial(host, port).await?,
        };

        if uri.scheme_str() != Some("https") {
            return Ok(TokioIo::Plain(tcp.compat()));
        }

        #[cfg(feature = "tls")]
        {
            let domain = ServerName::try_from(host.to_string()).context("invalid DNS name")?;
            match self.tls.connect(domain, tcp).await {
                Ok(stream) => Ok(TokioIo::Tls(stream.compat())),
                Err(error) => {
                    warn!(host, port, %error, "TLS handshake failed");
                    Err(anyhow::Error::new(error)
                        .context(format!("TLS handshake with {host}:{port} failed")))
                }
            }
        }

        #[cfg(not(feature = "tls"))]
        {
            warn!(host, port, "https requested but TLS support is not compiled in");
            anyhow::bail!("TLS support not compiled in")
        }
    }
}

#[cfg(feature = "tls")]
mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    /// Accepts any server certificate.
    #[derive(Debug)]
    pub(crate) struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }
}

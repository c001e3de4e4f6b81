//! QUIC transport: dial/listen, stream multiplex, keepalive.
//!
//! Single-process manager owning one listener and any number of outbound
//! connections. The first stream on every connection — inbound or
//! outbound — carries the `AUTH <token>` handshake; no other stream may be
//! opened until it completes, which this module enforces structurally: a
//! [`QuicConnection`] is only ever handed back to the caller once the
//! handshake has already succeeded.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use iroh_quinn::{self as quinn, ClientConfig, Connection, Endpoint, ServerConfig, TransportConfig, VarInt};
use tokio::sync::Mutex;
use tokio_rustls::rustls;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

const HANDSHAKE_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const AUTH_OK: &str = "AUTH_OK";

/// Validates an inbound `AUTH <token>` line, returning `Ok(())` if the
/// token is acceptable. Implemented by the session manager over the
/// authenticator so this module stays free of auth policy.
pub type TokenValidator = Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

/// TLS material for the QUIC endpoint. Certificates and the
/// ALPN list are supplied by configuration; this crate never fabricates them.
#[derive(Clone)]
pub struct QuicTlsConfig {
    pub client: rustls::ClientConfig,
    pub server: Option<rustls::ServerConfig>,
    pub alpn: Vec<Vec<u8>>,
}

impl QuicTlsConfig {
    /// Build client and server TLS material from configuration: the
    /// server identity is the cert/key pair at `cert_path`/`key_path`;
    /// client verification uses the platform root store unless
    /// `tls_insecure` is set, mirroring the relay HTTP client's TLS policy.
    pub fn from_paths(tls_insecure: bool, cert_path: &std::path::Path, key_path: &std::path::Path, alpn: Vec<Vec<u8>>) -> Result<Self> {
        let client = if tls_insecure {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(InsecureServerVerifier))
                .with_no_client_auth()
        } else {
            let roots = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::ClientConfig::builder().with_root_certificates(roots).with_no_client_auth()
        };

        let certs = load_cert_chain(cert_path)?;
        let key = load_private_key(key_path)?;
        let server = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::ConfigInvalid(format!("invalid quic server identity: {e}")))?;

        Ok(Self { client, server: Some(server), alpn })
    }
}

fn load_cert_chain(path: &std::path::Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let bytes = std::fs::read(path)?;
    let mut reader = std::io::BufReader::new(bytes.as_slice());
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::ConfigInvalid(format!("reading quic cert chain {}: {e}", path.display())))
}

fn load_private_key(path: &std::path::Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let bytes = std::fs::read(path)?;
    let mut reader = std::io::BufReader::new(bytes.as_slice());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::ConfigInvalid(format!("reading quic private key {}: {e}", path.display())))?
        .ok_or_else(|| Error::ConfigInvalid(format!("no private key found in {}", path.display())))
}

/// Accepts any server certificate. Used only when `tls_insecure` is set
/// (development), mirroring the relay HTTP client's `tls_insecure` knob.
#[derive(Debug)]
struct InsecureServerVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::CryptoProvider::get_default()
            .map(|p| p.signature_verification_algorithms.supported_schemes())
            .unwrap_or_default()
    }
}

/// Per-connection, per-stream byte counters.
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

/// Snapshot of one managed connection's state.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub remote_addr: SocketAddr,
    pub is_closed: bool,
    pub streams: HashMap<String, StreamStats>,
}

struct ManagedStream {
    send: Mutex<quinn::SendStream>,
    recv: Mutex<quinn::RecvStream>,
    stats: std::sync::Mutex<StreamStats>,
}

/// A connection that has already completed the `AUTH` handshake.
pub struct QuicConnection {
    conn: Connection,
    remote_addr: SocketAddr,
    opened_at: Instant,
    streams: DashMap<String, Arc<ManagedStream>>,
}

impl QuicConnection {
    /// Open a bidirectional stream and record it under `name`. Since this
    /// type is only constructed post-`AUTH_OK`, every stream opened through
    /// it is, by construction, a data stream on an authenticated connection.
    pub async fn open_stream(&self, name: &str) -> Result<()> {
        let (send, recv) = self.conn.open_bi().await.map_err(|e| Error::Quic(format!("open_bi: {e}")))?;
        self.streams.insert(
            name.to_string(),
            Arc::new(ManagedStream { send: Mutex::new(send), recv: Mutex::new(recv), stats: std::sync::Mutex::new(StreamStats::default()) }),
        );
        Ok(())
    }

    pub async fn write_stream(&self, name: &str, data: &[u8]) -> Result<()> {
        let stream = self.streams.get(name).ok_or_else(|| Error::ProtocolViolation(format!("no such stream: {name}")))?;
        let mut send = stream.send.lock().await;
        send.write_all(data).await.map_err(|e| Error::Quic(format!("write_all: {e}")))?;
        stream.stats.lock().unwrap().bytes_sent += data.len() as u64;
        crate::metrics::global().add_bytes_sent(data.len() as u64);
        Ok(())
    }

    pub async fn read_stream(&self, name: &str, max_len: usize) -> Result<Vec<u8>> {
        let stream = self.streams.get(name).ok_or_else(|| Error::ProtocolViolation(format!("no such stream: {name}")))?;
        let mut recv = stream.recv.lock().await;
        let mut buf = vec![0u8; max_len];
        let n = recv
            .read(&mut buf)
            .await
            .map_err(|e| Error::Quic(format!("read: {e}")))?
            .unwrap_or(0);
        buf.truncate(n);
        stream.stats.lock().unwrap().bytes_recv += n as u64;
        crate::metrics::global().add_bytes_recv(n as u64);
        Ok(buf)
    }

    pub async fn close_stream(&self, name: &str) -> Result<()> {
        if let Some((_, stream)) = self.streams.remove(name) {
            let mut send = stream.send.lock().await;
            let _ = send.finish();
        }
        Ok(())
    }

    pub fn close(&self, reason: &str) {
        self.conn.close(VarInt::from_u32(0), reason.as_bytes());
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn stats(&self) -> ConnectionStats {
        let streams = self
            .streams
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats.lock().unwrap().clone()))
            .collect();
        ConnectionStats { remote_addr: self.remote_addr, is_closed: self.conn.close_reason().is_some(), streams }
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }
}

/// Single-process QUIC endpoint manager.
pub struct QuicTransport {
    endpoint: Mutex<Option<Endpoint>>,
    alpn: Vec<Vec<u8>>,
    connections: DashMap<SocketAddr, Arc<QuicConnection>>,
}

impl QuicTransport {
    pub fn new(alpn: Vec<Vec<u8>>) -> Self {
        Self { endpoint: Mutex::new(None), alpn, connections: DashMap::new() }
    }

    fn transport_config() -> TransportConfig {
        let mut transport = TransportConfig::default();
        transport.max_idle_timeout(Some(MAX_IDLE_TIMEOUT.try_into().expect("valid idle timeout")));
        transport.keep_alive_interval(Some(KEEPALIVE_INTERVAL));
        transport
    }

    fn client_config(tls: &QuicTlsConfig) -> Result<ClientConfig> {
        let mut client_tls = tls.client.clone();
        client_tls.alpn_protocols = tls.alpn.clone();
        let quic_client = quinn::crypto::rustls::QuicClientConfig::try_from(client_tls)
            .map_err(|e| Error::ConfigInvalid(format!("invalid quic client tls config: {e}")))?;
        let mut config = ClientConfig::new(Arc::new(quic_client));
        config.transport_config(Arc::new(Self::transport_config()));
        Ok(config)
    }

    fn server_config(tls: &QuicTlsConfig) -> Result<ServerConfig> {
        let mut server_tls = tls.server.clone().ok_or_else(|| Error::ConfigInvalid("quic listen requires server tls config".into()))?;
        server_tls.alpn_protocols = tls.alpn.clone();
        let quic_server =
            quinn::crypto::rustls::QuicServerConfig::try_from(server_tls).map_err(|e| Error::ConfigInvalid(format!("invalid quic server tls config: {e}")))?;
        let mut config = ServerConfig::with_crypto(Arc::new(quic_server));
        config.transport_config(Arc::new(Self::transport_config()));
        Ok(config)
    }

    /// Start the listener and accept connections in the background. Each
    /// accepted connection runs the server side of the `AUTH` handshake
    /// before being registered.
    pub fn listen(self: &Arc<Self>, bind_addr: SocketAddr, tls: QuicTlsConfig, validator: TokenValidator, cancel: CancellationToken) -> Result<SocketAddr> {
        let server_config = Self::server_config(&tls)?;
        let endpoint = Endpoint::server(server_config, bind_addr).map_err(|e| Error::Quic(format!("bind listener: {e}")))?;
        let local_addr = endpoint.local_addr().map_err(|e| Error::Quic(format!("local_addr: {e}")))?;

        let this = Arc::clone(self);
        let endpoint_for_loop = endpoint.clone();
        tokio::spawn(async move {
            *this.endpoint.lock().await = Some(endpoint_for_loop.clone());
            loop {
                tokio::select! {
                    incoming = endpoint_for_loop.accept() => {
                        let Some(incoming) = incoming else { break };
                        let validator = validator.clone();
                        let this = Arc::clone(&this);
                        tokio::spawn(async move {
                            if let Err(err) = this.accept_one(incoming, validator).await {
                                tracing::warn!(error = %err, "inbound quic connection rejected");
                            }
                        });
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });

        Ok(local_addr)
    }

    async fn accept_one(self: &Arc<Self>, incoming: quinn::Incoming, validator: TokenValidator) -> Result<()> {
        let connecting = incoming.accept().map_err(|e| Error::Quic(format!("accept: {e}")))?;
        let conn = connecting.await.map_err(|e| Error::Quic(format!("handshake: {e}")))?;
        let remote_addr = conn.remote_address();
        let (mut send, mut recv) = conn.accept_bi().await.map_err(|e| Error::Quic(format!("accept_bi: {e}")))?;
        let line = read_line(&mut recv).await?;
        let token = line
            .strip_prefix("AUTH ")
            .ok_or_else(|| Error::ProtocolViolation(format!("expected AUTH line, got: {line}")))?
            .to_string();

        match validator(token).await {
            Ok(()) => {
                send.write_all(format!("{AUTH_OK}\n").as_bytes()).await.map_err(|e| Error::Quic(format!("write auth_ok: {e}")))?;
            }
            Err(err) => {
                send.write_all(format!("AUTH_REJECTED {err}\n").as_bytes()).await.ok();
                conn.close(VarInt::from_u32(1), b"auth rejected");
                return Err(Error::AuthRejected(err.to_string()));
            }
        }

        let managed = Arc::new(QuicConnection { conn, remote_addr, opened_at: Instant::now(), streams: DashMap::new() });
        self.connections.insert(remote_addr, managed);
        crate::metrics::global().inc_active_connections();
        Ok(())
    }

    /// Open a connection; returns only once the TLS handshake and the
    /// client-side `AUTH` exchange both complete.
    pub async fn dial(&self, addr: SocketAddr, server_name: &str, tls: &QuicTlsConfig, token: &str) -> Result<Arc<QuicConnection>> {
        let client_config = Self::client_config(tls)?;
        let endpoint = self.client_endpoint().await?;
        let connecting = endpoint
            .connect_with(client_config, addr, server_name)
            .map_err(|e| Error::Quic(format!("connect: {e}")))?;
        let conn = tokio::time::timeout(HANDSHAKE_IDLE_TIMEOUT, connecting)
            .await
            .map_err(|_| Error::Transient("quic handshake timed out".into()))?
            .map_err(|e| Error::Quic(format!("handshake: {e}")))?;

        let (mut send, mut recv) = conn.open_bi().await.map_err(|e| Error::Quic(format!("open_bi: {e}")))?;
        send.write_all(format!("AUTH {token}\n").as_bytes()).await.map_err(|e| Error::Quic(format!("write auth: {e}")))?;
        let line = read_line(&mut recv).await?;
        if line.trim_end() != AUTH_OK {
            conn.close(VarInt::from_u32(1), b"auth rejected");
            return Err(Error::AuthRejected(line));
        }

        let remote_addr = conn.remote_address();
        let managed = Arc::new(QuicConnection { conn, remote_addr, opened_at: Instant::now(), streams: DashMap::new() });
        self.connections.insert(remote_addr, Arc::clone(&managed));
        crate::metrics::global().inc_active_connections();
        Ok(managed)
    }

    async fn client_endpoint(&self) -> Result<Endpoint> {
        let mut guard = self.endpoint.lock().await;
        if let Some(endpoint) = guard.as_ref() {
            return Ok(endpoint.clone());
        }
        let endpoint = Endpoint::client("0.0.0.0:0".parse().unwrap()).map_err(|e| Error::Quic(format!("client endpoint: {e}")))?;
        *guard = Some(endpoint.clone());
        Ok(endpoint)
    }

    pub fn connection(&self, remote_addr: SocketAddr) -> Option<Arc<QuicConnection>> {
        self.connections.get(&remote_addr).map(|e| e.clone())
    }

    pub fn close_connection(&self, remote_addr: SocketAddr, reason: &str) {
        if let Some((_, conn)) = self.connections.remove(&remote_addr) {
            conn.close(reason);
            crate::metrics::global().dec_active_connections();
        }
    }

    pub fn stats(&self) -> Vec<ConnectionStats> {
        self.connections.iter().map(|entry| entry.value().stats()).collect()
    }

    /// Close every managed connection (data streams close before the
    /// connection itself, which implicitly tears down the still-open auth
    /// stream) and the listener.
    pub async fn close(&self) {
        for entry in self.connections.iter() {
            for stream_entry in entry.value().streams.iter() {
                let _ = entry.value().close_stream(stream_entry.key()).await;
            }
            entry.value().close("shutting down");
        }
        self.connections.clear();
        if let Some(endpoint) = self.endpoint.lock().await.take() {
            endpoint.close(VarInt::from_u32(0), b"shutting down");
        }
    }
}

async fn read_line(recv: &mut quinn::RecvStream) -> Result<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = recv.read(&mut byte).await.map_err(|e| Error::Quic(format!("read: {e}")))?.unwrap_or(0);
        if n == 0 {
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        buf.push(byte[0]);
        if buf.len() > 4096 {
            return Err(Error::ProtocolViolation("auth line too long".into()));
        }
    }
    String::from_utf8(buf).map_err(|e| Error::ProtocolViolation(format!("non-utf8 auth line: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

    #[test]
    fn auth_ok_is_the_exact_expected_literal() {
        assert_eq!(AUTH_OK, "AUTH_OK");
    }

    /// Self-signed identity plus the matching client/server `QuicTlsConfig`,
    /// built in memory rather than from files so tests don't need fixtures
    /// on disk.
    fn test_tls() -> QuicTlsConfig {
        let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();

        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).expect("self-signed cert");
        let cert_der: CertificateDer<'static> = certified.cert.der().clone();
        let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

        let server = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .expect("build server tls config");

        let client = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureServerVerifier))
            .with_no_client_auth();

        QuicTlsConfig { client, server: Some(server), alpn: vec![b"meshline-test/1".to_vec()] }
    }

    /// A stream-capable [`QuicConnection`] is only ever handed back from
    /// [`QuicTransport::dial`] after the `AUTH` exchange succeeds: a
    /// rejected token never yields a connection at all, so there is no way
    /// to open a stream ahead of `AUTH_OK`. An accepted token yields a
    /// connection that can immediately open and use one.
    #[tokio::test]
    async fn stream_is_unreachable_until_auth_completes() {
        let tls = test_tls();
        let alpn = tls.alpn.clone();
        let transport = Arc::new(QuicTransport::new(alpn));
        let cancel = CancellationToken::new();

        let validator: TokenValidator = Arc::new(|token: String| {
            Box::pin(async move {
                if token == "good-token" {
                    Ok(())
                } else {
                    Err(Error::InvalidToken("rejected by test validator".into()))
                }
            }) as Pin<Box<dyn Future<Output = Result<()>> + Send>>
        });

        let listen_addr = transport.listen("127.0.0.1:0".parse().unwrap(), tls.clone(), validator, cancel.clone()).expect("listen");

        let rejected = tokio::time::timeout(Duration::from_secs(5), transport.dial(listen_addr, "localhost", &tls, "bad-token"))
            .await
            .expect("dial with a rejected token must not hang");
        assert!(matches!(rejected, Err(Error::AuthRejected(_))), "rejected token must not yield a connection: {rejected:?}");
        assert!(transport.connection(listen_addr).is_none(), "a rejected handshake must register no connection to stream on");

        let accepted = tokio::time::timeout(Duration::from_secs(5), transport.dial(listen_addr, "localhost", &tls, "good-token"))
            .await
            .expect("dial with an accepted token must not hang")
            .expect("accepted token dials through");
        accepted.open_stream("data").await.expect("post-auth stream open must succeed");
        tokio::time::timeout(Duration::from_secs(5), accepted.write_stream("data", b"hello"))
            .await
            .expect("post-auth stream write must not hang")
            .expect("post-auth stream write must succeed");

        cancel.cancel();
    }
}

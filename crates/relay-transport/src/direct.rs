//! Direct QUIC transport with certificate-fingerprint pinning.
//!
//! Each endpoint generates a throwaway self-signed certificate at session
//! start. The SHA-256 fingerprints travel through signaling encrypted under
//! the PAKE key, and each side's TLS verifier then accepts exactly one
//! certificate: the one matching the peer's fingerprint. No CA, no name
//! checks, mutual authentication.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use tokio::time::timeout;
use tracing::debug;

use relay_crypto::fingerprint;
use relay_proto::{PeerAddr, PeerMessage, Role};

use crate::{MessageSink, MessageStream, PeerConnection, TransportError, TransportKind};

/// Timeout for dialing the peer's public address
pub const DIAL_PUBLIC_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for dialing the peer's local address
pub const DIAL_LOCAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Keepalive interval on an established connection
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Idle timeout after which a connection is considered dead
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// TLS server name; the pinned verifiers never look at it
const PEER_SERVER_NAME: &str = "relay";

/// How long the listening side holds its own dials back, so the two ends
/// do not cross-connect when both dial at once
const LISTEN_FIRST_DELAY: Duration = Duration::from_millis(300);

/// A QUIC endpoint bound for one session.
///
/// Created before registration so the listening port can be declared to the
/// rendezvous server; armed with the peer's fingerprint once the encrypted
/// exchange completes.
pub struct DirectEndpoint {
    endpoint: quinn::Endpoint,
    cert: CertificateDer<'static>,
    key_pkcs8: Vec<u8>,
    fingerprint: [u8; 32],
    client_config: Option<quinn::ClientConfig>,
}

impl DirectEndpoint {
    /// Bind a fresh endpoint on an ephemeral UDP port and generate the
    /// session certificate.
    ///
    /// # Errors
    ///
    /// [`TransportError::Io`] if the socket cannot bind,
    /// [`TransportError::Tls`] if certificate generation fails.
    pub fn bind() -> Result<Self, TransportError> {
        let issued = rcgen::generate_simple_self_signed(vec![PEER_SERVER_NAME.to_string()])
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        let cert = issued.cert.der().clone();
        let key_pkcs8 = issued.key_pair.serialize_der();
        let fp = fingerprint(cert.as_ref());

        let endpoint =
            quinn::Endpoint::client(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;

        Ok(Self {
            endpoint,
            cert,
            key_pkcs8,
            fingerprint: fp,
            client_config: None,
        })
    }

    /// The bound UDP port, declared to the rendezvous server.
    ///
    /// # Errors
    ///
    /// [`TransportError::Io`] if the socket address cannot be read.
    pub fn port(&self) -> Result<u16, TransportError> {
        Ok(self.endpoint.local_addr()?.port())
    }

    /// SHA-256 fingerprint of this side's certificate.
    #[must_use]
    pub fn fingerprint(&self) -> [u8; 32] {
        self.fingerprint
    }

    /// Arm the endpoint with the peer's fingerprint: installs the pinned
    /// server config for incoming connections and prepares the pinned
    /// client config for dialing.
    ///
    /// # Errors
    ///
    /// [`TransportError::Tls`] if the rustls configs cannot be built.
    pub fn pin_peer(&mut self, peer_fingerprint: [u8; 32]) -> Result<(), TransportError> {
        let key = || PrivateKeyDer::from(PrivatePkcs8KeyDer::from(self.key_pkcs8.clone()));

        let server_tls = rustls::ServerConfig::builder()
            .with_client_cert_verifier(Arc::new(PinnedClientVerifier::new(peer_fingerprint)))
            .with_single_cert(vec![self.cert.clone()], key())
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        let server_crypto = QuicServerConfig::try_from(server_tls)
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(server_crypto));
        server_config.transport_config(transport_config()?);
        self.endpoint.set_server_config(Some(server_config));

        let client_tls = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PinnedServerVerifier::new(
                peer_fingerprint,
            )))
            .with_client_auth_cert(vec![self.cert.clone()], key())
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        let client_crypto = QuicClientConfig::try_from(client_tls)
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        let mut client_config = quinn::ClientConfig::new(Arc::new(client_crypto));
        client_config.transport_config(transport_config()?);
        self.client_config = Some(client_config);

        Ok(())
    }

    /// Establish the direct connection: dial the peer's public then local
    /// address while also accepting on this endpoint; the first connection
    /// whose stream handshake completes wins.
    ///
    /// The sender is primarily the listening side and holds its dials back
    /// briefly; the receiver dials immediately. Both still try both.
    ///
    /// # Errors
    ///
    /// [`TransportError::Timeout`] when every candidate fails; the
    /// orchestrator then falls back to the relay.
    pub async fn establish(
        &self,
        role: Role,
        peer: &PeerAddr,
    ) -> Result<PeerConnection, TransportError> {
        tokio::select! {
            dialed = self.dial_candidates(role, peer) => dialed,
            accepted = self.accept_one() => accepted,
        }
    }

    /// Shut the endpoint down, dropping any pending connections.
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"session over");
    }

    async fn dial_candidates(
        &self,
        role: Role,
        peer: &PeerAddr,
    ) -> Result<PeerConnection, TransportError> {
        if role == Role::Sender {
            tokio::time::sleep(LISTEN_FIRST_DELAY).await;
        }

        let public = SocketAddr::new(peer.public_ip, peer.public_port);
        let local = SocketAddr::new(peer.local_ip, peer.local_port);

        match self.dial_one(public, DIAL_PUBLIC_TIMEOUT).await {
            Ok(conn) => return Ok(conn),
            Err(e) => debug!(addr = %public, error = %e, "public dial failed"),
        }

        match self.dial_one(local, DIAL_LOCAL_TIMEOUT).await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                debug!(addr = %local, error = %e, "local dial failed");
                Err(TransportError::Timeout)
            }
        }
    }

    async fn dial_one(
        &self,
        addr: SocketAddr,
        limit: Duration,
    ) -> Result<PeerConnection, TransportError> {
        let config = self
            .client_config
            .clone()
            .ok_or_else(|| TransportError::Tls("peer fingerprint not pinned".into()))?;

        let connection = timeout(limit, async {
            let connecting = self
                .endpoint
                .connect_with(config, addr, PEER_SERVER_NAME)
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            connecting
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))
        })
        .await
        .map_err(|_| TransportError::Timeout)??;

        // The stream opener sends a probe and waits for the echo; quinn does
        // not surface the stream to the acceptor until bytes flow.
        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let mut sink = QuicSink {
            connection: connection.clone(),
            send,
        };
        let mut stream = QuicStream { recv };

        sink.send(&PeerMessage::Ping).await?;
        match timeout(limit, stream.recv())
            .await
            .map_err(|_| TransportError::Timeout)??
        {
            Some(PeerMessage::Pong) => {}
            _ => return Err(TransportError::Connect("stream handshake failed".into())),
        }

        debug!(addr = %addr, "direct connection established (dialed)");
        Ok(PeerConnection::new(
            TransportKind::Direct,
            Box::new(sink),
            Box::new(stream),
        ))
    }

    async fn accept_one(&self) -> Result<PeerConnection, TransportError> {
        loop {
            let Some(incoming) = self.endpoint.accept().await else {
                return Err(TransportError::Closed);
            };

            let connection = match incoming.await {
                Ok(c) => c,
                Err(e) => {
                    // A dial rejected by the pinned verifier lands here;
                    // keep listening for the real peer.
                    debug!(error = %e, "incoming connection failed");
                    continue;
                }
            };

            let (send, recv) = match connection.accept_bi().await {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(error = %e, "peer opened no stream");
                    continue;
                }
            };

            let mut sink = QuicSink {
                connection: connection.clone(),
                send,
            };
            let mut stream = QuicStream { recv };

            match stream.recv().await {
                Ok(Some(PeerMessage::Ping)) => sink.send(&PeerMessage::Pong).await?,
                // Whatever this connection was, it is not our peer
                _ => continue,
            }

            debug!(remote = %connection.remote_address(), "direct connection established (accepted)");
            return Ok(PeerConnection::new(
                TransportKind::Direct,
                Box::new(sink),
                Box::new(stream),
            ));
        }
    }
}

fn transport_config() -> Result<Arc<quinn::TransportConfig>, TransportError> {
    let mut config = quinn::TransportConfig::default();
    config
        .max_concurrent_bidi_streams(1u8.into())
        .max_concurrent_uni_streams(0u8.into())
        .keep_alive_interval(Some(KEEPALIVE_INTERVAL))
        .max_idle_timeout(Some(
            IDLE_TIMEOUT
                .try_into()
                .map_err(|_| TransportError::Tls("idle timeout out of range".into()))?,
        ));
    Ok(Arc::new(config))
}

struct QuicSink {
    connection: quinn::Connection,
    send: quinn::SendStream,
}

#[async_trait]
impl MessageSink for QuicSink {
    async fn send(&mut self, message: &PeerMessage) -> Result<(), TransportError> {
        let frame = message.encode()?;
        self.send
            .write_all(&frame)
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // Closing the connection discards unacknowledged stream data, so
        // give the peer a bounded window to drain the final frames first.
        let _ = self.send.finish();
        let _ = timeout(Duration::from_secs(5), self.send.stopped()).await;
        self.connection.close(0u32.into(), b"done");
        Ok(())
    }
}

struct QuicStream {
    recv: quinn::RecvStream,
}

#[async_trait]
impl MessageStream for QuicStream {
    async fn recv(&mut self) -> Result<Option<PeerMessage>, TransportError> {
        let mut prefix = [0u8; 4];
        match self.recv.read_exact(&mut prefix).await {
            Ok(()) => {}
            // Peer finished the stream between frames: clean end
            Err(quinn::ReadExactError::FinishedEarly(0)) => return Ok(None),
            Err(_) => return Err(TransportError::Closed),
        }

        let len = u32::from_be_bytes(prefix) as usize;
        if len > relay_proto::MAX_FRAME_SIZE {
            return Err(relay_proto::CodecError::Oversized(len).into());
        }

        let mut body = vec![0u8; len];
        self.recv
            .read_exact(&mut body)
            .await
            .map_err(|_| TransportError::Closed)?;

        Ok(Some(PeerMessage::decode_body(&body)?))
    }
}

/// Accepts exactly the one certificate whose SHA-256 matches the pinned
/// fingerprint. Signatures are still verified.
#[derive(Debug)]
struct PinnedServerVerifier {
    pinned: [u8; 32],
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl PinnedServerVerifier {
    fn new(pinned: [u8; 32]) -> Self {
        Self {
            pinned,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if fingerprint(end_entity.as_ref()) == self.pinned {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Mirror of [`PinnedServerVerifier`] for the accepting side: the dialer
/// must present the pinned certificate.
#[derive(Debug)]
struct PinnedClientVerifier {
    pinned: [u8; 32],
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl PinnedClientVerifier {
    fn new(pinned: [u8; 32]) -> Self {
        Self {
            pinned,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }
}

impl ClientCertVerifier for PinnedClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        if fingerprint(end_entity.as_ref()) == self.pinned {
            Ok(ClientCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_yields_port_and_fingerprint() {
        let endpoint = DirectEndpoint::bind().unwrap();
        assert_ne!(endpoint.port().unwrap(), 0);
        assert_ne!(endpoint.fingerprint(), [0u8; 32]);
    }

    #[tokio::test]
    async fn fingerprints_differ_per_endpoint() {
        let a = DirectEndpoint::bind().unwrap();
        let b = DirectEndpoint::bind().unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[tokio::test]
    async fn pinned_endpoints_connect_on_localhost() {
        let mut listener = DirectEndpoint::bind().unwrap();
        let mut dialer = DirectEndpoint::bind().unwrap();

        listener.pin_peer(dialer.fingerprint()).unwrap();
        dialer.pin_peer(listener.fingerprint()).unwrap();

        let listener_port = listener.port().unwrap();
        let dialer_port = dialer.port().unwrap();

        let to_listener = PeerAddr {
            public_ip: "127.0.0.1".parse().unwrap(),
            public_port: listener_port,
            local_ip: "127.0.0.1".parse().unwrap(),
            local_port: listener_port,
        };
        let to_dialer = PeerAddr {
            public_ip: "127.0.0.1".parse().unwrap(),
            public_port: dialer_port,
            local_ip: "127.0.0.1".parse().unwrap(),
            local_port: dialer_port,
        };

        let (listener_conn, dialer_conn) = tokio::join!(
            listener.establish(Role::Sender, &to_dialer),
            dialer.establish(Role::Receiver, &to_listener),
        );

        let mut a = listener_conn.unwrap();
        let mut b = dialer_conn.unwrap();

        a.send(&PeerMessage::Ping).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Some(PeerMessage::Ping));

        b.send(&PeerMessage::Pong).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), Some(PeerMessage::Pong));
    }

    #[tokio::test]
    async fn wrong_fingerprint_is_rejected() {
        let mut listener = DirectEndpoint::bind().unwrap();
        let mut dialer = DirectEndpoint::bind().unwrap();

        // Listener pins a fingerprint the dialer does not have
        listener.pin_peer([0xEE; 32]).unwrap();
        dialer.pin_peer(listener.fingerprint()).unwrap();

        let listener_port = listener.port().unwrap();
        let dialer_port = dialer.port().unwrap();
        let to_listener = PeerAddr {
            public_ip: "127.0.0.1".parse().unwrap(),
            public_port: listener_port,
            local_ip: "127.0.0.1".parse().unwrap(),
            local_port: listener_port,
        };
        let to_dialer = PeerAddr {
            public_ip: "127.0.0.1".parse().unwrap(),
            public_port: dialer_port,
            local_ip: "127.0.0.1".parse().unwrap(),
            local_port: dialer_port,
        };

        // The listening side keeps rejecting the mismatched certificate and
        // never completes; run it in the background.
        let accept_task = tokio::spawn(async move {
            let _ = listener.establish(Role::Sender, &to_dialer).await;
        });

        let result = dialer.establish(Role::Receiver, &to_listener).await;
        assert!(result.is_err());
        accept_task.abort();
    }
}

//! Direct QUIC transport.
//!
//! Each endpoint generates a throwaway self-signed certificate at session
//! start. Authentication does not come from a CA: the peers swap SHA-256
//! fingerprints through signaling (sealed under the session key) and each
//! side pins its TLS verifier to exactly one certificate. Name checks are
//! meaningless here and skipped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{Endpoint, TransportConfig};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, SignatureScheme};
use tracing::{debug, info};

use crate::crypto::certificate_fingerprint;
use crate::error::{CoreError, CoreResult};
use crate::signaling::PeerNetInfo;

const ALPN: &[u8] = b"relay/1";
const SERVER_NAME: &str = "relay.local";

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Knobs for the direct connection attempt. Defaults are the production
/// policy; tests shrink the timeouts.
#[derive(Debug, Clone)]
pub struct DirectOptions {
    /// When false the direct phase is skipped entirely and the session
    /// goes straight to relay (a user-facing force-relay switch).
    pub enabled: bool,
    pub public_timeout: Duration,
    pub local_timeout: Duration,
}

impl Default for DirectOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            public_timeout: Duration::from_secs(5),
            local_timeout: Duration::from_secs(3),
        }
    }
}

/// A QUIC endpoint that can both listen and dial, plus the certificate
/// material it was born with.
pub struct DirectEndpoint {
    endpoint: Endpoint,
    cert: CertificateDer<'static>,
    key_der: Vec<u8>,
    fingerprint: [u8; 32],
    provider: Arc<CryptoProvider>,
    client_config: Option<quinn::ClientConfig>,
}

impl DirectEndpoint {
    /// Bind to `0.0.0.0:{port}` with a fresh self-signed certificate.
    /// Port 0 asks the OS for one.
    pub fn bind(port: u16) -> CoreResult<Self> {
        let params = rcgen::CertificateParams::new(vec![SERVER_NAME.to_string()])
            .map_err(|e| CoreError::Crypto(format!("certificate params: {e}")))?;
        let key_pair = rcgen::KeyPair::generate()
            .map_err(|e| CoreError::Crypto(format!("key generation: {e}")))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CoreError::Crypto(format!("self-sign: {e}")))?;

        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key_der = key_pair.serialize_der();
        let fingerprint = certificate_fingerprint(cert_der.as_ref());

        let provider = Arc::new(rustls::crypto::ring::default_provider());

        // No server config yet: incoming handshakes are ignored until
        // arm() installs the pinned one, so nothing unauthenticated can
        // connect in the window before the fingerprints are known.
        let addr: SocketAddr = format!("0.0.0.0:{port}")
            .parse()
            .expect("static bind address");
        let endpoint = Endpoint::client(addr)
            .map_err(|e| CoreError::Network(format!("failed to bind QUIC endpoint: {e}")))?;

        info!(
            "QUIC endpoint listening on {}",
            endpoint
                .local_addr()
                .map_err(|e| CoreError::Network(e.to_string()))?
        );

        Ok(Self {
            endpoint,
            cert: cert_der,
            key_der,
            fingerprint,
            provider,
            client_config: None,
        })
    }

    /// SHA-256 of our DER-encoded certificate.
    pub fn fingerprint(&self) -> [u8; 32] {
        self.fingerprint
    }

    pub fn local_addr(&self) -> CoreResult<SocketAddr> {
        self.endpoint
            .local_addr()
            .map_err(|e| CoreError::Network(e.to_string()))
    }

    /// Pin both directions to the peer's certificate. Must be called after
    /// the fingerprint exchange and before any accept or dial.
    pub fn arm(&mut self, peer_fingerprint: [u8; 32]) -> CoreResult<()> {
        let key: PrivatePkcs8KeyDer<'static> = PrivatePkcs8KeyDer::from(self.key_der.clone());

        // Accept side: require a client certificate and pin it.
        let client_verifier = Arc::new(PinnedClientVerifier {
            expected: peer_fingerprint,
            provider: self.provider.clone(),
        });
        let mut server_crypto = rustls::ServerConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| CoreError::Crypto(format!("TLS versions: {e}")))?
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(vec![self.cert.clone()], key.clone_key().into())
            .map_err(|e| CoreError::Crypto(format!("server TLS config: {e}")))?;
        server_crypto.alpn_protocols = vec![ALPN.to_vec()];

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
            QuicServerConfig::try_from(server_crypto)
                .map_err(|e| CoreError::Crypto(format!("QUIC server config: {e}")))?,
        ));
        server_config.transport_config(transport_config()?);
        self.endpoint.set_server_config(Some(server_config));

        // Dial side: pin the server certificate, present our own.
        let server_verifier = Arc::new(PinnedServerVerifier {
            expected: peer_fingerprint,
            provider: self.provider.clone(),
        });
        let mut client_crypto = rustls::ClientConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| CoreError::Crypto(format!("TLS versions: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(server_verifier)
            .with_client_auth_cert(vec![self.cert.clone()], key.into())
            .map_err(|e| CoreError::Crypto(format!("client TLS config: {e}")))?;
        client_crypto.alpn_protocols = vec![ALPN.to_vec()];

        let mut client_config = quinn::ClientConfig::new(Arc::new(
            QuicClientConfig::try_from(client_crypto)
                .map_err(|e| CoreError::Crypto(format!("QUIC client config: {e}")))?,
        ));
        client_config.transport_config(transport_config()?);
        self.client_config = Some(client_config);

        Ok(())
    }

    /// Accept one incoming connection from the pinned peer.
    pub async fn accept(&self) -> CoreResult<quinn::Connection> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| CoreError::Network("endpoint closed".into()))?;
        let conn = incoming
            .await
            .map_err(|e| CoreError::Network(format!("accept failed: {e}")))?;
        info!("accepted QUIC connection from {}", conn.remote_address());
        Ok(conn)
    }

    /// Dial the pinned peer at the given address.
    pub async fn connect(&self, addr: SocketAddr) -> CoreResult<quinn::Connection> {
        let config = self
            .client_config
            .clone()
            .ok_or_else(|| CoreError::Network("endpoint not armed with a peer fingerprint".into()))?;
        let conn = self
            .endpoint
            .connect_with(config, addr, SERVER_NAME)
            .map_err(|e| CoreError::Network(format!("connect: {e}")))?
            .await
            .map_err(|e| CoreError::Network(format!("connection failed: {e}")))?;
        info!("connected to peer at {addr}");
        Ok(conn)
    }

    /// Run the direct connection policy: dial the peer's public address,
    /// then its local one, racing our own accept. First established
    /// connection wins; exhausting the budget abandons the direct path.
    ///
    /// `dial_delay` staggers our own dialing so the side in listen mode
    /// lets the peer's dial land first instead of cross-connecting.
    pub async fn establish_direct(
        &self,
        peer: &PeerNetInfo,
        opts: &DirectOptions,
        dial_delay: Duration,
    ) -> CoreResult<quinn::Connection> {
        if !opts.enabled {
            return Err(CoreError::Network("direct path disabled".into()));
        }

        let candidates = dial_candidates(peer, opts);
        let budget = dial_delay + opts.public_timeout + opts.local_timeout;

        let dial = async {
            tokio::time::sleep(dial_delay).await;
            for (addr, limit) in candidates {
                debug!("direct: dialing {addr} (up to {limit:?})");
                match tokio::time::timeout(limit, self.connect(addr)).await {
                    Ok(Ok(conn)) => return Ok(conn),
                    Ok(Err(e)) => debug!("direct: dial {addr} failed: {e}"),
                    Err(_) => debug!("direct: dial {addr} timed out"),
                }
            }
            // Out of candidates; leave the rest of the budget to accept().
            std::future::pending::<CoreResult<quinn::Connection>>().await
        };

        let attempt = async {
            tokio::select! {
                conn = self.accept() => conn,
                conn = dial => conn,
            }
        };

        match tokio::time::timeout(budget, attempt).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CoreError::Network("no direct path to peer".into())),
        }
    }
}

impl Drop for DirectEndpoint {
    fn drop(&mut self) {
        self.endpoint.close(0u32.into(), b"done");
    }
}

fn transport_config() -> CoreResult<Arc<TransportConfig>> {
    let mut transport = TransportConfig::default();
    transport.max_idle_timeout(Some(
        IDLE_TIMEOUT
            .try_into()
            .map_err(|_| CoreError::Network("idle timeout out of range".into()))?,
    ));
    transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    // Throughput tuning for large transfers.
    transport.stream_receive_window((10u32 * 1024 * 1024).into());
    transport.receive_window((20u32 * 1024 * 1024).into());
    transport.send_window(20 * 1024 * 1024);
    Ok(Arc::new(transport))
}

fn dial_candidates(peer: &PeerNetInfo, opts: &DirectOptions) -> Vec<(SocketAddr, Duration)> {
    let mut candidates = Vec::new();

    if !peer.public_ip.is_empty() && peer.public_port > 0 {
        if let Ok(addr) = format!("{}:{}", peer.public_ip, peer.public_port).parse() {
            candidates.push((addr, opts.public_timeout));
        }
    }
    if !peer.local_ip.is_empty() && peer.local_port > 0 {
        if let Ok(addr) = format!("{}:{}", peer.local_ip, peer.local_port).parse::<SocketAddr>() {
            if !candidates.iter().any(|(a, _)| *a == addr) {
                candidates.push((addr, opts.local_timeout));
            }
        }
    }

    candidates
}

/// Accepts exactly one server certificate: the one whose SHA-256 matches
/// the fingerprint learned through signaling.
#[derive(Debug)]
struct PinnedServerVerifier {
    expected: [u8; 32],
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if certificate_fingerprint(end_entity.as_ref()) == self.expected {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
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
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Mirror of [`PinnedServerVerifier`] for the accepting side.
#[derive(Debug)]
struct PinnedClientVerifier {
    expected: [u8; 32],
    provider: Arc<CryptoProvider>,
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
        if certificate_fingerprint(end_entity.as_ref()) == self.expected {
            Ok(ClientCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
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
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

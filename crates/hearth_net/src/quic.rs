//! The QUIC listener: self-signed server identity, mandatory client
//! certificates, verdicts delegated to the host's [`AuthManager`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::QuicServerConfig;
use quinn::Endpoint;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use tracing::{debug, info, warn};

use crate::auth::{AuthManager, CertVerdict};
use crate::connection::{Connection, ConnectionSeed};
use crate::NetError;

/// Delegates chain verdicts to the [`AuthManager`]; signatures are
/// checked with the provider's algorithms as usual. Clients without a
/// certificate never get past the handshake.
struct DelegatingVerifier {
    auth: Arc<dyn AuthManager>,
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl std::fmt::Debug for DelegatingVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegatingVerifier").finish_non_exhaustive()
    }
}

impl ClientCertVerifier for DelegatingVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let mut chain = Vec::with_capacity(1 + intermediates.len());
        chain.push(end_entity.as_ref().to_vec());
        chain.extend(intermediates.iter().map(|cert| cert.as_ref().to_vec()));

        match self.auth.verify_client_cert(&chain) {
            CertVerdict::Allow => Ok(ClientCertVerified::assertion()),
            CertVerdict::Deny(reason) => {
                debug!("client certificate rejected: {reason}");
                Err(rustls::Error::General(reason))
            }
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

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

pub(crate) struct QuicBound {
    pub(crate) endpoint: Endpoint,
    pub(crate) local_addr: SocketAddr,
}

/// Generates the server identity, publishes it to the auth manager, and
/// starts listening.
pub(crate) fn bind(
    addr: SocketAddr,
    auth: &Arc<dyn AuthManager>,
) -> Result<QuicBound, NetError> {
    let identity = rcgen::generate_simple_self_signed(vec!["hearth".into()])?;
    let cert_der = identity.cert.der().clone();
    auth.register_server_cert(cert_der.as_ref());

    let key = PrivateKeyDer::Pkcs8(identity.key_pair.serialize_der().into());
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let verifier = Arc::new(DelegatingVerifier {
        auth: Arc::clone(auth),
        provider: Arc::clone(&provider),
    });

    let tls = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(NetError::Tls)?
        .with_client_cert_verifier(verifier)
        .with_single_cert(vec![cert_der], key)?;

    let quic_tls = QuicServerConfig::try_from(tls)
        .map_err(|e| NetError::Quic(anyhow::Error::new(e)))?;
    let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_tls));

    let endpoint = Endpoint::server(server_config, addr).map_err(|source| NetError::Bind {
        addr,
        source,
    })?;
    let local_addr = endpoint.local_addr().map_err(|source| NetError::Bind {
        addr,
        source,
    })?;

    info!("quic listener on {local_addr}");

    Ok(QuicBound {
        endpoint,
        local_addr,
    })
}

/// Accepts connections until the endpoint closes. Each connection's
/// first bidirectional stream becomes its packet pipeline.
pub(crate) async fn accept_loop(
    endpoint: Endpoint,
    seed: ConnectionSeed,
    handshake_timeout: Duration,
    new_connections: flume::Sender<Connection>,
) {
    while let Some(incoming) = endpoint.accept().await {
        let seed = seed.clone();
        let new_connections = new_connections.clone();

        tokio::spawn(async move {
            let peer = incoming.remote_address();

            let connecting = match incoming.accept() {
                Ok(connecting) => connecting,
                Err(e) => {
                    debug!("rejected connection from {peer}: {e}");
                    return;
                }
            };

            // Certificate problems surface here, inside the handshake.
            let connection =
                match tokio::time::timeout(handshake_timeout, connecting).await {
                    Ok(Ok(connection)) => connection,
                    Ok(Err(e)) => {
                        warn!(client = %peer, "quic handshake failed: {e}");
                        return;
                    }
                    Err(_) => {
                        warn!(client = %peer, "quic handshake timed out");
                        return;
                    }
                };

            let (send, recv) =
                match tokio::time::timeout(handshake_timeout, connection.accept_bi()).await {
                    Ok(Ok(streams)) => streams,
                    Ok(Err(e)) => {
                        debug!("no stream from {peer}: {e}");
                        return;
                    }
                    Err(_) => {
                        debug!("no stream from {peer} within the handshake window");
                        return;
                    }
                };

            let conn = Connection::spawn(recv, send, peer, seed);
            if new_connections.send_async(conn).await.is_err() {
                debug!("listener dropped while accepting {peer}");
            }
        });
    }
}

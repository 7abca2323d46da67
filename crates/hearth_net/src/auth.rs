//! The host's authentication seam.

use parking_lot::Mutex;

/// Outcome of a client certificate check.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum CertVerdict {
    Allow,
    Deny(String),
}

/// Implemented by the host. The QUIC transport publishes its self-signed
/// server certificate here at startup and consults
/// [`verify_client_cert`](Self::verify_client_cert) for every handshake;
/// a denial rejects the connection at the TLS layer, before any frame is
/// read.
pub trait AuthManager: Send + Sync {
    fn register_server_cert(&self, cert_der: &[u8]);

    /// `chain` is the DER certificate chain the client presented, end
    /// entity first.
    fn verify_client_cert(&self, chain: &[Vec<u8>]) -> CertVerdict;
}

/// Accepts every client that presents *some* certificate. Development
/// and test use.
#[derive(Default)]
pub struct AllowAllAuth {
    server_cert: Mutex<Option<Vec<u8>>>,
}

impl AllowAllAuth {
    pub fn new() -> Self {
        Self::default()
    }

    /// The server certificate registered at bind time, if any.
    pub fn server_cert(&self) -> Option<Vec<u8>> {
        self.server_cert.lock().clone()
    }
}

impl AuthManager for AllowAllAuth {
    fn register_server_cert(&self, cert_der: &[u8]) {
        *self.server_cert.lock() = Some(cert_der.to_vec());
    }

    fn verify_client_cert(&self, chain: &[Vec<u8>]) -> CertVerdict {
        if chain.is_empty() {
            CertVerdict::Deny("no client certificate presented".into())
        } else {
            CertVerdict::Allow
        }
    }
}

//! Certificate-chain validation for the Control side.
//!
//! Path validation is delegated to webpki against the Credential Store's
//! trust roots; the outcome is logged and returned unchanged, so the engine's
//! verdict decides whether the handshake proceeds. webpki only consults CRLs
//! supplied up front and never goes to the network, so revocation checking
//! cannot block the loop.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::{debug, warn};

use crate::credentials::fingerprint;
use crate::error::{DraupnirError, DraupnirResult};

/// Logs and enforces the result of standard path validation.
#[derive(Debug)]
pub struct ChainValidator {
    inner: Arc<WebPkiServerVerifier>,
}

impl ChainValidator {
    pub fn new(roots: RootCertStore, provider: Arc<CryptoProvider>) -> DraupnirResult<Self> {
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|e| DraupnirError::Config(format!("cannot build certificate verifier: {e}")))?;
        Ok(Self { inner })
    }
}

impl ServerCertVerifier for ChainValidator {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let result = self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        );
        match &result {
            Ok(_) => debug!(
                server_name = ?server_name,
                fingerprint = %fingerprint(end_entity),
                "certificate validation status: verified"
            ),
            Err(e) => warn!(
                server_name = ?server_name,
                fingerprint = %fingerprint(end_entity),
                "certificate validation status: {e}"
            ),
        }
        result
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialStore;

    fn validator() -> (ChainValidator, CredentialStore) {
        let store = CredentialStore::embedded().unwrap();
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        (
            ChainValidator::new(store.trusted_authorities(), provider).unwrap(),
            store,
        )
    }

    #[test]
    fn accepts_embedded_identity() {
        let (validator, store) = validator();
        let chain = store.cert_chain(crate::credentials::TlsRole::Server);
        let name = ServerName::try_from("draupnir").unwrap();
        assert!(validator
            .verify_server_cert(&chain[0], &[], &name, &[], UnixTime::now())
            .is_ok());
    }

    #[test]
    fn rejects_wrong_server_name() {
        let (validator, store) = validator();
        let chain = store.cert_chain(crate::credentials::TlsRole::Server);
        let name = ServerName::try_from("example.com").unwrap();
        assert!(validator
            .verify_server_cert(&chain[0], &[], &name, &[], UnixTime::now())
            .is_err());
    }

    #[test]
    fn rejects_foreign_certificate() {
        let (validator, _store) = validator();
        let foreign = rcgen::generate_simple_self_signed(vec!["draupnir".to_string()]).unwrap();
        let name = ServerName::try_from("draupnir").unwrap();
        assert!(validator
            .verify_server_cert(foreign.cert.der(), &[], &name, &[], UnixTime::now())
            .is_err());
    }
}

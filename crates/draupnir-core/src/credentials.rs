//! The single certificate/key identity shared by every session.
//!
//! The store is loaded once at startup, either from the pair compiled into
//! the binary or from PEM files, and is read-only afterwards. The
//! certificate doubles as the only trust anchor: the Control side accepts a
//! Target only if it presents this exact identity.

use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::ServerCertVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{DraupnirError, DraupnirResult};
use crate::tls::{ChainValidator, SessionCache, TlsPolicy};

const EMBEDDED_CERT: &[u8] = include_bytes!("../certs/identity.crt");
const EMBEDDED_KEY: &[u8] = include_bytes!("../certs/identity.key");

/// Side of the handshake an identity query is made for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    Server,
    Client,
}

/// Immutable certificate and private key.
#[derive(Debug)]
pub struct CredentialStore {
    cert: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
    roots: RootCertStore,
}

impl CredentialStore {
    /// The identity compiled into the binary.
    pub fn embedded() -> DraupnirResult<Self> {
        Self::from_pem(EMBEDDED_CERT, EMBEDDED_KEY)
    }

    /// Load a PEM certificate and PEM private key from disk.
    pub fn from_files(cert_path: &Path, key_path: &Path) -> DraupnirResult<Self> {
        let cert_pem = std::fs::read(cert_path).map_err(|e| {
            DraupnirError::Config(format!("cannot read {}: {e}", cert_path.display()))
        })?;
        let key_pem = std::fs::read(key_path).map_err(|e| {
            DraupnirError::Config(format!("cannot read {}: {e}", key_path.display()))
        })?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Parse a PEM certificate and key. Only the first certificate is used.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> DraupnirResult<Self> {
        let cert = rustls_pemfile::certs(&mut &cert_pem[..])
            .next()
            .ok_or_else(|| DraupnirError::Config("no certificate found in PEM input".into()))?
            .map_err(|e| DraupnirError::Config(format!("invalid certificate PEM: {e}")))?;

        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| DraupnirError::Config(format!("invalid private key PEM: {e}")))?
            .ok_or_else(|| DraupnirError::Config("no private key found in PEM input".into()))?;

        // Reject keys the signing provider cannot use before any handshake needs them.
        rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|e| DraupnirError::Config(format!("unusable private key: {e}")))?;

        let mut roots = RootCertStore::empty();
        roots
            .add(cert.clone())
            .map_err(|e| DraupnirError::Config(format!("certificate is not a valid anchor: {e}")))?;

        let store = Self { cert, key, roots };
        debug!(fingerprint = %store.fingerprint(), "credential store loaded");
        Ok(store)
    }

    /// Trust anchors for chain validation: the store's own certificate.
    pub fn trusted_authorities(&self) -> RootCertStore {
        self.roots.clone()
    }

    /// Certificates presented during the handshake. Only the server presents one.
    pub fn cert_chain(&self, role: TlsRole) -> Vec<CertificateDer<'static>> {
        match role {
            TlsRole::Server => vec![self.cert.clone()],
            TlsRole::Client => Vec::new(),
        }
    }

    /// Private key matching `cert`, or `None` for any certificate this store
    /// did not issue.
    pub fn private_key_for(&self, cert: &CertificateDer<'_>) -> Option<PrivateKeyDer<'static>> {
        (cert.as_ref() == self.cert.as_ref()).then(|| self.key.clone_key())
    }

    /// Hex SHA-256 of the certificate.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.cert)
    }

    /// Engine configuration for the Target side.
    pub fn server_config(&self, policy: &TlsPolicy) -> DraupnirResult<Arc<ServerConfig>> {
        let resolver = IdentityResolver::new(self)?;
        let mut config = ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver));
        config.session_storage = Arc::new(SessionCache::new(
            policy.session_cache_capacity,
            policy.cache_policy,
        ));
        info!(fingerprint = %self.fingerprint(), "serving TLS identity");
        Ok(Arc::new(config))
    }

    /// Engine configuration for the Control side. The peer is validated
    /// against [`Self::trusted_authorities`] and no client certificate is sent.
    pub fn client_config(&self, policy: &TlsPolicy) -> DraupnirResult<Arc<ClientConfig>> {
        let provider = provider();
        let validator: Arc<dyn ServerCertVerifier> = Arc::new(ChainValidator::new(
            self.trusted_authorities(),
            provider.clone(),
        )?);
        let config = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .dangerous()
            .with_custom_certificate_verifier(validator)
            .with_no_client_auth();
        debug!(server_name = %policy.server_name, "client TLS configuration ready");
        Ok(Arc::new(config))
    }
}

/// Hex SHA-256 of a DER certificate.
pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    hex::encode(Sha256::digest(cert.as_ref()))
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Answers the engine's "which certificate and key" query on the server side.
#[derive(Debug)]
struct IdentityResolver {
    identity: Arc<CertifiedKey>,
}

impl IdentityResolver {
    fn new(store: &CredentialStore) -> DraupnirResult<Self> {
        let chain = store.cert_chain(TlsRole::Server);
        let key = chain
            .first()
            .and_then(|cert| store.private_key_for(cert))
            .ok_or_else(|| DraupnirError::Config("no key for the server certificate".into()))?;
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)?;
        Ok(Self {
            identity: Arc::new(CertifiedKey::new(chain, signing_key)),
        })
    }
}

impl ResolvesServerCert for IdentityResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        debug!(server_name = ?client_hello.server_name(), "resolving server identity");
        Some(self.identity.clone())
    }
}

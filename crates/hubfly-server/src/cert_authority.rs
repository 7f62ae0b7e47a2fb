//! Certificate authority abstraction for TLS provisioning
//!
//! This trait allows for different issuance backends (certbot, mock for testing, etc.)

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from certificate authority operations
#[derive(Debug, Error)]
pub enum CaError {
    /// The client program is not installed or could not be started
    #[error("certificate authority client unavailable: {0}")]
    Unavailable(String),

    /// The authority refused the request; carries its output verbatim
    #[error("{0}")]
    Rejected(String),

    #[error("issuance timed out after {0:?}")]
    Timeout(Duration),
}

/// Trait for certificate issuance and revocation
///
/// Issued material is expected under the configured certificate root at
/// `<cert_root>/<domain>/{fullchain,privkey}.pem`.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Prove ownership of `domain` through the HTTP-01 webroot and obtain a certificate
    ///
    /// # Arguments
    /// * `domain` - Host name the certificate is issued for
    /// * `webroot` - Directory served at `/.well-known/acme-challenge/`
    /// * `contact` - Registration address, may be empty
    async fn issue(&self, domain: &str, webroot: &Path, contact: &str) -> Result<(), CaError>;

    /// Revoke the certificate previously issued for `domain`
    async fn revoke(&self, domain: &str) -> Result<(), CaError>;
}

use std::fs::File;
use std::io::{BufRead, BufReader, Cursor};
use std::path::{Path, PathBuf};

use rustls_pemfile::{certs, private_key};

use crate::CertificateError;

/// Where the certificate authority leaves material for a domain
///
/// Follows the certbot `live/<domain>/` layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePaths {
    pub fullchain: PathBuf,
    pub privkey: PathBuf,
}

impl CertificatePaths {
    pub fn for_domain(cert_root: &Path, domain: &str) -> Self {
        let dir = cert_root.join(domain);
        Self {
            fullchain: dir.join("fullchain.pem"),
            privkey: dir.join("privkey.pem"),
        }
    }

    /// Leaf certificate path, used for revocation
    pub fn cert(&self) -> PathBuf {
        self.fullchain.with_file_name("cert.pem")
    }
}

/// What was found when inspecting issued material
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CertificateSummary {
    /// Number of certificates in the chain (leaf first)
    pub chain_len: usize,
}

fn open(path: &Path) -> Result<BufReader<File>, CertificateError> {
    let file = File::open(path).map_err(|source| CertificateError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(BufReader::new(file))
}

fn count_certs(reader: &mut dyn BufRead, origin: &Path) -> Result<usize, CertificateError> {
    let chain = certs(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertificateError::Certificate(format!("Failed to parse certificates: {}", e)))?;
    if chain.is_empty() {
        return Err(CertificateError::EmptyChain(origin.to_path_buf()));
    }
    Ok(chain.len())
}

fn require_key(reader: &mut dyn BufRead, origin: &Path) -> Result<(), CertificateError> {
    private_key(reader)
        .map_err(|e| CertificateError::Certificate(format!("Failed to parse private key: {}", e)))?
        .map(|_| ())
        .ok_or_else(|| CertificateError::MissingKey(origin.to_path_buf()))
}

/// Check that a chain and its key exist and parse
pub fn inspect_certificate(paths: &CertificatePaths) -> Result<CertificateSummary, CertificateError> {
    let chain_len = count_certs(&mut open(&paths.fullchain)?, &paths.fullchain)?;
    require_key(&mut open(&paths.privkey)?, &paths.privkey)?;

    tracing::debug!(
        fullchain = %paths.fullchain.display(),
        chain_len,
        "Certificate material inspected"
    );
    Ok(CertificateSummary { chain_len })
}

/// Same checks as [`inspect_certificate`] on in-memory PEM content
pub fn inspect_certificate_pem(
    chain_pem: &str,
    key_pem: &str,
) -> Result<CertificateSummary, CertificateError> {
    let origin = Path::new("<memory>");
    let chain_len = count_certs(&mut Cursor::new(chain_pem.as_bytes()), origin)?;
    require_key(&mut Cursor::new(key_pem.as_bytes()), origin)?;
    Ok(CertificateSummary { chain_len })
}

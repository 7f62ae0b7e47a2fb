use std::path::PathBuf;

use thiserror::Error;

/// Errors reading certificate material from disk
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("No certificates found in {0:?}")]
    EmptyChain(PathBuf),

    #[error("No private key found in {0:?}")]
    MissingKey(PathBuf),
}

mod error;
mod tls;

pub use error::CertificateError;
pub use tls::{inspect_certificate, inspect_certificate_pem, CertificatePaths, CertificateSummary};

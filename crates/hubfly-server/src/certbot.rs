use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hubfly_common::CertificatePaths;
use tokio::process::Command;

use crate::cert_authority::{CaError, CertificateAuthority};
use crate::config::ResolvedConfig;

/// Certificate authority backed by the `certbot` client
pub struct CertbotClient {
    binary: String,
    cert_root: PathBuf,
}

impl CertbotClient {
    pub fn new(binary: impl Into<String>, cert_root: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            cert_root: cert_root.into(),
        }
    }

    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self::new(config.acme_binary.clone(), config.cert_root.clone())
    }

    fn issue_args(domain: &str, webroot: &Path, contact: &str) -> Vec<String> {
        let mut args = vec![
            "certonly".to_string(),
            "--webroot".to_string(),
            "-w".to_string(),
            webroot.display().to_string(),
            "-d".to_string(),
            domain.to_string(),
            "--non-interactive".to_string(),
            "--agree-tos".to_string(),
            "--keep-until-expiring".to_string(),
        ];
        if contact.is_empty() {
            args.push("--register-unsafely-without-email".to_string());
        } else {
            args.push("-m".to_string());
            args.push(contact.to_string());
        }
        args
    }

    fn revoke_args(&self, domain: &str) -> Vec<String> {
        let cert = CertificatePaths::for_domain(&self.cert_root, domain).cert();
        vec![
            "revoke".to_string(),
            "--cert-path".to_string(),
            cert.display().to_string(),
            "--reason".to_string(),
            "unspecified".to_string(),
            "--non-interactive".to_string(),
        ]
    }

    /// Run the client to completion; dropping the future kills it
    async fn run(&self, args: &[String]) -> Result<(), CaError> {
        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    CaError::Unavailable(format!("'{}' not found in PATH", self.binary))
                } else {
                    CaError::Unavailable(format!("Failed to execute '{}': {}", self.binary, e))
                }
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::debug!(binary = %self.binary, stdout = %stdout.trim(), stderr = %stderr.trim(), "certbot finished");

        if !output.status.success() {
            let detail = if stderr.trim().is_empty() {
                stdout.trim()
            } else {
                stderr.trim()
            };
            return Err(CaError::Rejected(format!(
                "{} exited with {}: {}",
                self.binary, output.status, detail
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CertificateAuthority for CertbotClient {
    async fn issue(&self, domain: &str, webroot: &Path, contact: &str) -> Result<(), CaError> {
        tracing::info!("Requesting certificate for {}", domain);
        self.run(&Self::issue_args(domain, webroot, contact)).await
    }

    async fn revoke(&self, domain: &str) -> Result<(), CaError> {
        tracing::info!("Revoking certificate for {}", domain);
        self.run(&self.revoke_args(domain)).await
    }
}

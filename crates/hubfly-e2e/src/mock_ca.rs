//! Mock certificate authority for E2E tests
//!
//! Issuance writes generated material where an ACME client would leave it,
//! so the control plane's own certificate checks run against real PEM files.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use hubfly_common::CertificatePaths;
use hubfly_server::{CaError, CertificateAuthority};

use crate::certificates::TestCertificates;

/// Mock CA that tracks issued certificates without contacting anyone
pub struct MockCertificateAuthority {
    cert_root: PathBuf,
    /// Tracks issued certificates: domain -> webroot used for the challenge
    issued: DashMap<String, PathBuf>,
    /// Domains revoked, in call order
    revoked: Mutex<Vec<String>>,
    /// Whether to simulate failures on issue
    fail_issue: AtomicBool,
    /// Whether to simulate failures on revoke
    fail_revoke: AtomicBool,
    /// Issue succeeds but leaves no files behind
    skip_files: AtomicBool,
}

impl MockCertificateAuthority {
    pub fn new(cert_root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            cert_root: cert_root.into(),
            issued: DashMap::new(),
            revoked: Mutex::new(Vec::new()),
            fail_issue: AtomicBool::new(false),
            fail_revoke: AtomicBool::new(false),
            skip_files: AtomicBool::new(false),
        })
    }

    /// Check if a certificate was issued for the domain
    pub fn has_issued(&self, domain: &str) -> bool {
        self.issued.contains_key(domain)
    }

    pub fn issued_count(&self) -> usize {
        self.issued.len()
    }

    /// Webroot passed for the domain's challenge
    pub fn webroot_for(&self, domain: &str) -> Option<PathBuf> {
        self.issued.get(domain).map(|w| w.value().clone())
    }

    pub fn revoked(&self) -> Vec<String> {
        self.revoked.lock().clone()
    }

    /// Configure mock to fail issuance
    pub fn set_fail_issue(&self, fail: bool) {
        self.fail_issue.store(fail, Ordering::SeqCst);
    }

    /// Configure mock to fail revocation
    pub fn set_fail_revoke(&self, fail: bool) {
        self.fail_revoke.store(fail, Ordering::SeqCst);
    }

    /// Report success without writing certificate files
    pub fn set_skip_files(&self, skip: bool) {
        self.skip_files.store(skip, Ordering::SeqCst);
    }

    /// Remove the domain's certificate files, as an expired or wiped store would
    pub fn wipe(&self, domain: &str) {
        let dir = self.cert_root.join(domain);
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            tracing::debug!("MockCertificateAuthority: nothing to wipe at {}: {}", dir.display(), e);
        }
    }

    fn write_material(&self, domain: &str) -> std::io::Result<()> {
        let certs = TestCertificates::generate(domain);
        let paths = CertificatePaths::for_domain(&self.cert_root, domain);
        if let Some(dir) = paths.fullchain.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&paths.fullchain, &certs.fullchain_pem)?;
        std::fs::write(&paths.privkey, &certs.privkey_pem)?;
        std::fs::write(paths.cert(), &certs.cert_pem)
    }
}

#[async_trait]
impl CertificateAuthority for MockCertificateAuthority {
    async fn issue(&self, domain: &str, webroot: &Path, _contact: &str) -> Result<(), CaError> {
        if self.fail_issue.load(Ordering::SeqCst) {
            return Err(CaError::Rejected(format!(
                "Challenge failed for domain {}: simulated issue failure",
                domain
            )));
        }

        if !self.skip_files.load(Ordering::SeqCst) {
            self.write_material(domain)
                .map_err(|e| CaError::Rejected(format!("Failed to save certificate: {}", e)))?;
        }
        self.issued.insert(domain.to_string(), webroot.to_path_buf());
        tracing::debug!("MockCertificateAuthority: issued certificate for {}", domain);
        Ok(())
    }

    async fn revoke(&self, domain: &str) -> Result<(), CaError> {
        self.revoked.lock().push(domain.to_string());
        if self.fail_revoke.load(Ordering::SeqCst) {
            return Err(CaError::Rejected("simulated revoke failure".into()));
        }
        self.issued.remove(domain);
        tracing::debug!("MockCertificateAuthority: revoked certificate for {}", domain);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_issue_writes_inspectable_material() {
        let dir = tempfile::tempdir().unwrap();
        let ca = MockCertificateAuthority::new(dir.path());

        ca.issue("a.test", Path::new("/var/www"), "").await.unwrap();
        assert!(ca.has_issued("a.test"));
        assert_eq!(ca.webroot_for("a.test"), Some(PathBuf::from("/var/www")));

        let paths = CertificatePaths::for_domain(dir.path(), "a.test");
        let summary = hubfly_common::inspect_certificate(&paths).unwrap();
        assert_eq!(summary.chain_len, 2);

        ca.wipe("a.test");
        assert!(hubfly_common::inspect_certificate(&paths).is_err());
    }

    #[tokio::test]
    async fn test_failure_simulation() {
        let dir = tempfile::tempdir().unwrap();
        let ca = MockCertificateAuthority::new(dir.path());

        ca.set_fail_issue(true);
        assert!(ca.issue("a.test", dir.path(), "").await.is_err());
        assert_eq!(ca.issued_count(), 0);

        ca.set_fail_revoke(true);
        assert!(ca.revoke("a.test").await.is_err());
        assert_eq!(ca.revoked(), vec!["a.test".to_string()]);
    }
}

//! Test appliance harness for E2E tests
//!
//! Wires a complete control plane (file store, apply pipeline, provisioner)
//! into a temporary directory with a mock engine and certificate authority.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use hubfly_server::{Artifact, ControlPlane, Reconciler, ResolvedConfig};

use crate::mock_ca::MockCertificateAuthority;
use crate::mock_engine::MockEngine;

/// First port of the stream range used by test appliances
pub const TEST_PORT_START: u16 = 30000;

/// Last port of the stream range used by test appliances
pub const TEST_PORT_END: u16 = 30009;

/// A control plane rooted in a temporary directory
pub struct TestAppliance {
    pub config: ResolvedConfig,
    pub engine: Arc<MockEngine>,
    pub ca: Arc<MockCertificateAuthority>,
    pub control: Arc<ControlPlane>,
    /// Removed on drop
    _root: TempDir,
}

impl TestAppliance {
    /// Start an appliance with default settings
    pub fn start() -> Self {
        Self::start_with(|_| {})
    }

    /// Start an appliance after adjusting its configuration
    pub fn start_with(adjust: impl FnOnce(&mut ResolvedConfig)) -> Self {
        let root = tempfile::tempdir().expect("Failed to create temp dir");
        let mut config = ResolvedConfig::rooted_at(root.path());
        config.stream_port_range = (TEST_PORT_START, TEST_PORT_END);
        adjust(&mut config);

        let engine = MockEngine::new();
        let ca = MockCertificateAuthority::new(&config.cert_root);
        let control = ControlPlane::from_config(&config, engine.clone(), ca.clone())
            .expect("Failed to build control plane");

        Self {
            config,
            engine,
            ca,
            control,
            _root: root,
        }
    }

    /// Another control plane over the same directories, the way a CLI call
    /// next to a running `reconcile --watch` builds its own
    pub fn sibling_control(&self) -> Arc<ControlPlane> {
        ControlPlane::from_config(&self.config, self.engine.clone(), self.ca.clone())
            .expect("Failed to build control plane")
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.control.provisioner().clone())
    }

    /// Live file path for a site
    pub fn site_path(&self, id: &str) -> PathBuf {
        self.control
            .provisioner()
            .pipeline()
            .live_path(&Artifact::Site(id.to_string()))
    }

    /// Live file path for a stream port
    pub fn port_path(&self, port: u16) -> PathBuf {
        self.control
            .provisioner()
            .pipeline()
            .live_path(&Artifact::StreamPort(port))
    }

    /// Live configuration for a site, if any
    pub fn live_site(&self, id: &str) -> Option<String> {
        std::fs::read_to_string(self.site_path(id)).ok()
    }

    /// Live configuration for a stream port, if any
    pub fn live_port(&self, port: u16) -> Option<String> {
        std::fs::read_to_string(self.port_path(port)).ok()
    }

    /// Every live artifact keyed by its path relative to the config root
    pub fn live_snapshot(&self) -> BTreeMap<PathBuf, String> {
        let layout = &self.config.layout;
        let mut snapshot = BTreeMap::new();
        for dir in [&layout.sites_dir, &layout.streams_dir] {
            collect(dir, &layout.base_dir, &mut snapshot);
        }
        snapshot
    }

    /// Install a user template that shadows or extends the built-ins
    pub fn write_template(&self, name: &str, content: &str) {
        let dir = &self.config.layout.templates_dir;
        std::fs::create_dir_all(dir).expect("Failed to create templates dir");
        std::fs::write(dir.join(format!("{}.conf", name)), content)
            .expect("Failed to write template");
    }

    /// Write a file into the live directory behind the control plane's back
    pub fn write_live(&self, artifact: &Artifact, content: &str) {
        let path = self.control.provisioner().pipeline().live_path(artifact);
        std::fs::write(path, content).expect("Failed to write live file");
    }
}

fn collect(dir: &Path, base: &Path, out: &mut BTreeMap<PathBuf, String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() {
            let content = std::fs::read_to_string(&path).expect("Failed to read live file");
            let relative = path.strip_prefix(base).unwrap_or(&path).to_path_buf();
            out.insert(relative, content);
        }
    }
}

//! Hubfly control plane library
//!
//! Turns site and stream records into reverse-proxy configuration, applies
//! it through a validate/stage/swap/reload pipeline, and drives certificate
//! provisioning. The `hubfly` binary is a thin CLI over [`ControlPlane`].

mod apply;
mod cert_authority;
mod certbot;
mod config;
mod control_plane;
mod engine;
mod lock;
mod provision;
mod reconciler;
pub mod render;
mod state;
mod store;

// Re-export public types
pub use apply::{ApplyError, ApplyLock, ApplyPipeline, Artifact};
pub use cert_authority::{CaError, CertificateAuthority};
pub use certbot::CertbotClient;
pub use config::{ConfigError, Layout, ResolvedConfig, ServerConfig};
pub use control_plane::{Accepted, ControlError, ControlPlane};
pub use engine::{EffectiveConfig, EngineError, NginxEngine, ProxyEngine};
pub use lock::{ExclusiveFile, RecordLock, RecordLockGuard};
pub use provision::{AcmeSettings, JobHandle, ProvisionError, Provisioner};
pub use reconciler::{DriftReport, Reconciler};
pub use render::{RenderError, SiteRenderer};
pub use state::{JobRecord, JobRegistry, JobState, PortAllocator, ResourceKey};
pub use store::{JsonStore, RecordStore, StoreError};

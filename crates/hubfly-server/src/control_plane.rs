use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use hubfly_model::{
    CertIssueStatus, ModelError, Protocol, ResourceStatus, Site, SiteSpec, Stream, StreamSpec,
};
use thiserror::Error;
use uuid::Uuid;

use crate::apply::ApplyPipeline;
use crate::cert_authority::CertificateAuthority;
use crate::config::{ConfigError, ResolvedConfig};
use crate::engine::ProxyEngine;
use crate::lock::RecordLockGuard;
use crate::provision::{AcmeSettings, JobHandle, Provisioner};
use crate::render::{RenderError, SiteRenderer};
use crate::state::{JobRecord, JobState, PortAllocator, ResourceKey};
use crate::store::{JsonStore, RecordStore, StoreError};

/// Ports the HTTP and HTTPS site listeners occupy
const SITE_PORTS: [u16; 2] = [80, 443];

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("invalid request: {0}")]
    Invalid(#[from] ModelError),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{0}")]
    Conflict(String),

    #[error("no free port in {start}-{end}")]
    PortsExhausted { start: u16, end: u16 },

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("job failed: {0}")]
    Job(String),
}

impl From<StoreError> for ControlError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { kind, id } => Self::NotFound { kind, id },
            other => Self::Store(other),
        }
    }
}

/// A record accepted for provisioning, with the jobs that will settle it
pub struct Accepted<T> {
    pub record: T,
    pub jobs: Vec<JobHandle>,
}

impl<T> Accepted<T> {
    /// Wait for every queued job
    pub async fn settle(self) -> (T, Vec<JobRecord>) {
        let mut records = Vec::with_capacity(self.jobs.len());
        for job in self.jobs {
            records.push(job.wait().await);
        }
        (self.record, records)
    }
}

/// Entry point for every site and stream operation
///
/// Mutations persist the record with status `provisioning`, queue a job and
/// return immediately; callers poll the record (or wait on the job) for the
/// outcome.
pub struct ControlPlane {
    store: Arc<dyn RecordStore>,
    provisioner: Arc<Provisioner>,
    ports: Arc<PortAllocator>,
}

impl ControlPlane {
    pub fn new(
        store: Arc<dyn RecordStore>,
        provisioner: Arc<Provisioner>,
        ports: Arc<PortAllocator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            provisioner,
            ports,
        })
    }

    /// Wire the file store, nginx-style pipeline and provisioner from config
    pub fn from_config(
        config: &ResolvedConfig,
        engine: Arc<dyn ProxyEngine>,
        ca: Arc<dyn CertificateAuthority>,
    ) -> Result<Arc<Self>, ControlError> {
        config.layout.ensure_dirs()?;
        let store: Arc<dyn RecordStore> = Arc::new(JsonStore::open(&config.data_dir)?);
        let pipeline = Arc::new(ApplyPipeline::new(
            config.layout.clone(),
            engine,
            config.history_depth,
        ));
        let provisioner = Provisioner::new(
            store.clone(),
            SiteRenderer::from_config(config),
            pipeline,
            ca,
            AcmeSettings::from_config(config),
        );
        let (start, end) = config.stream_port_range;
        Ok(Self::new(store, provisioner, PortAllocator::new(start, end)))
    }

    pub fn provisioner(&self) -> &Arc<Provisioner> {
        &self.provisioner
    }

    /// Held across check-then-save so ids, domains and ports stay unique,
    /// also against other processes sharing the data directory
    fn admission(&self) -> Result<RecordLockGuard<'_>, ControlError> {
        Ok(self.store.lock_records()?)
    }

    pub fn job(&self, id: &Uuid) -> Option<JobRecord> {
        self.provisioner.jobs().get(id)
    }

    // ---- sites ----

    pub fn create_site(&self, spec: SiteSpec) -> Result<Accepted<Site>, ControlError> {
        let site = Site::from_spec(spec, Utc::now())?;
        {
            let _admission = self.admission()?;
            match self.store.get_site(&site.id) {
                Ok(_) => {
                    return Err(ControlError::Conflict(format!(
                        "site '{}' already exists",
                        site.id
                    )))
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
            self.ensure_domain_free(&site.domain, &site.id)?;
            self.store.save_site(&site)?;
        }

        tracing::info!("Site {} accepted for {}", site.id, site.domain);
        let job = self.provisioner.enqueue_site(&site.id);
        Ok(Accepted {
            record: site,
            jobs: vec![job],
        })
    }

    pub fn update_site(&self, id: &str, spec: SiteSpec) -> Result<Accepted<Site>, ControlError> {
        let site = {
            let _admission = self.admission()?;
            let mut site = self.store.get_site(id)?;
            site.apply_update(spec, Utc::now())?;
            self.ensure_domain_free(&site.domain, &site.id)?;
            self.store.save_site(&site)?;
            site
        };

        tracing::info!("Site {} updated", site.id);
        let job = self.provisioner.enqueue_site(&site.id);
        Ok(Accepted {
            record: site,
            jobs: vec![job],
        })
    }

    /// Run provisioning again for a settled site
    pub fn retry_site(&self, id: &str) -> Result<Accepted<Site>, ControlError> {
        let key = ResourceKey::Site(id.to_string());
        let site = {
            let _admission = self.admission()?;
            let current = self.store.get_site(id)?;
            if !current.status.is_settled() && self.provisioner.jobs().is_pending(&key) {
                return Err(ControlError::Conflict(format!(
                    "site '{}' is already provisioning",
                    id
                )));
            }
            self.store.modify_site(id, &mut |site| {
                if site.ssl && site.cert_issue_status == Some(CertIssueStatus::Failed) {
                    site.cert_issue_status = Some(CertIssueStatus::Pending);
                }
                let status = ResourceStatus::Provisioning;
                if let Err(e) = site.set_status(status, None, Utc::now()) {
                    tracing::warn!("Site {} not moved to {}: {}", site.id, status, e);
                }
            })?
        };

        tracing::info!("Retrying site {}", id);
        let job = self.provisioner.enqueue_site(id);
        Ok(Accepted {
            record: site,
            jobs: vec![job],
        })
    }

    pub fn get_site(&self, id: &str) -> Result<Site, ControlError> {
        Ok(self.store.get_site(id)?)
    }

    pub fn list_sites(&self) -> Result<Vec<Site>, ControlError> {
        Ok(self.store.list_sites()?)
    }

    /// Remove a site, optionally revoking its certificate first
    ///
    /// Waits for the site's queue, so any job queued earlier finishes first.
    pub async fn delete_site(&self, id: &str, revoke: bool) -> Result<Site, ControlError> {
        let site = self.store.get_site(id)?;
        let record = self.provisioner.enqueue_site_delete(id, revoke).wait().await;
        if record.state == JobState::Failed {
            return Err(ControlError::Job(record.message.unwrap_or_default()));
        }
        Ok(site)
    }

    /// Dry render of a stored site as it would be applied now
    pub fn render_site(&self, id: &str) -> Result<String, ControlError> {
        let site = self.store.get_site(id)?;
        Ok(self.provisioner.renderer().render(&site)?)
    }

    fn ensure_domain_free(&self, domain: &str, id: &str) -> Result<(), ControlError> {
        let taken = self
            .store
            .list_sites()?
            .into_iter()
            .find(|other| other.domain == domain && other.id != id);
        match taken {
            Some(other) => Err(ControlError::Conflict(format!(
                "domain '{}' is already served by site '{}'",
                domain, other.id
            ))),
            None => Ok(()),
        }
    }

    // ---- streams ----

    pub fn create_stream(&self, spec: StreamSpec) -> Result<Accepted<Stream>, ControlError> {
        spec.validate()?;

        let stream = {
            let _admission = self.admission()?;
            let existing = self.store.list_streams()?;

            let port = match spec.listen_port {
                Some(port) => {
                    ensure_not_site_port(port)?;
                    port
                }
                None => {
                    let in_use: HashSet<u16> = existing.iter().map(|s| s.listen_port).collect();
                    self.ports.allocate(&in_use).ok_or_else(|| {
                        let (start, end) = self.ports.range();
                        ControlError::PortsExhausted { start, end }
                    })?
                }
            };

            let result = self.admit_stream(spec, port, &existing);
            self.ports.release(port);
            result?
        };

        tracing::info!(
            "Stream {} accepted on port {} ({})",
            stream.id,
            stream.listen_port,
            stream.protocol
        );
        let job = self.provisioner.enqueue_port(stream.listen_port);
        Ok(Accepted {
            record: stream,
            jobs: vec![job],
        })
    }

    fn admit_stream(
        &self,
        spec: StreamSpec,
        port: u16,
        existing: &[Stream],
    ) -> Result<Stream, ControlError> {
        let id = match &spec.id {
            Some(id) => {
                if existing.iter().any(|s| &s.id == id) {
                    return Err(ControlError::Conflict(format!(
                        "stream '{}' already exists",
                        id
                    )));
                }
                id.clone()
            }
            None => generate_stream_id(port, existing),
        };

        let domain = spec.domain.as_ref().map(|d| d.trim().to_ascii_lowercase());
        ensure_compatible(port, &id, spec.protocol, domain.as_deref(), existing)?;
        let stream = Stream::from_spec(spec, id, port, Utc::now())?;
        self.store.save_stream(&stream)?;
        Ok(stream)
    }

    /// Replace a stream's intent; moving ports reconciles both
    pub fn update_stream(
        &self,
        id: &str,
        spec: StreamSpec,
    ) -> Result<Accepted<Stream>, ControlError> {
        spec.validate()?;

        let (stream, old_port) = {
            let _admission = self.admission()?;
            let mut stream = self.store.get_stream(id)?;
            let old_port = stream.listen_port;
            let port = spec.listen_port.unwrap_or(old_port);
            if port != old_port {
                ensure_not_site_port(port)?;
            }

            let existing = self.store.list_streams()?;
            let domain = spec.domain.as_ref().map(|d| d.trim().to_ascii_lowercase());
            ensure_compatible(port, id, spec.protocol, domain.as_deref(), &existing)?;

            stream.apply_update(spec, port, Utc::now())?;
            self.store.save_stream(&stream)?;
            (stream, old_port)
        };

        tracing::info!("Stream {} updated", stream.id);
        let mut jobs = vec![self.provisioner.enqueue_port(stream.listen_port)];
        if old_port != stream.listen_port {
            jobs.push(self.provisioner.enqueue_port(old_port));
        }
        Ok(Accepted {
            record: stream,
            jobs,
        })
    }

    pub fn get_stream(&self, id: &str) -> Result<Stream, ControlError> {
        Ok(self.store.get_stream(id)?)
    }

    pub fn list_streams(&self) -> Result<Vec<Stream>, ControlError> {
        Ok(self.store.list_streams()?)
    }

    /// Delete the record and rebuild its port from the remaining streams
    pub fn delete_stream(&self, id: &str) -> Result<Accepted<Stream>, ControlError> {
        let stream = {
            let _admission = self.admission()?;
            let stream = self.store.get_stream(id)?;
            self.store.delete_stream(id)?;
            stream
        };

        tracing::info!("Stream {} deleted from port {}", stream.id, stream.listen_port);
        let job = self.provisioner.enqueue_port(stream.listen_port);
        Ok(Accepted {
            record: stream,
            jobs: vec![job],
        })
    }
}

fn ensure_not_site_port(port: u16) -> Result<(), ControlError> {
    if SITE_PORTS.contains(&port) {
        return Err(ControlError::Conflict(format!(
            "port {} is reserved for site listeners",
            port
        )));
    }
    Ok(())
}

/// A port carries one protocol, and server-name routing (needed as soon as
/// a port has a second stream or any server name) only works over tcp
fn ensure_compatible(
    port: u16,
    id: &str,
    protocol: Protocol,
    domain: Option<&str>,
    existing: &[Stream],
) -> Result<(), ControlError> {
    let siblings: Vec<&Stream> = existing
        .iter()
        .filter(|s| s.listen_port == port && s.id != id)
        .collect();

    if let Some(other) = siblings.iter().find(|s| s.protocol != protocol) {
        return Err(ControlError::Conflict(format!(
            "port {} already carries {} stream '{}'",
            port, other.protocol, other.id
        )));
    }

    let shared = !siblings.is_empty() || domain.is_some();
    if shared && protocol == Protocol::Udp {
        return Err(ControlError::Conflict(format!(
            "udp port {} cannot be shared between streams",
            port
        )));
    }

    if let Some(domain) = domain {
        if let Some(other) = siblings.iter().find(|s| s.domain.as_deref() == Some(domain)) {
            return Err(ControlError::Conflict(format!(
                "server name '{}' on port {} is already routed to stream '{}'",
                domain, port, other.id
            )));
        }
    }
    Ok(())
}

fn generate_stream_id(port: u16, existing: &[Stream]) -> String {
    let base = format!("stream-{}", port);
    if !existing.iter().any(|s| s.id == base) {
        return base;
    }
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", base, &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(id: &str, port: u16, protocol: Protocol, domain: Option<&str>) -> Stream {
        let mut s = Stream::from_spec(
            StreamSpec {
                upstream: "10.0.0.2:443".to_string(),
                ..Default::default()
            },
            id.to_string(),
            port,
            Utc::now(),
        )
        .unwrap();
        s.protocol = protocol;
        s.domain = domain.map(str::to_string);
        s
    }

    #[test]
    fn test_generated_ids() {
        let existing = vec![stream("stream-30001", 30001, Protocol::Tcp, None)];
        assert_eq!(generate_stream_id(30002, &existing), "stream-30002");

        let id = generate_stream_id(30001, &existing);
        assert!(id.starts_with("stream-30001-"));
        assert_eq!(id.len(), "stream-30001-".len() + 8);
    }

    #[test]
    fn test_protocol_mismatch_on_shared_port() {
        let existing = vec![stream("a", 30001, Protocol::Tcp, None)];
        assert!(matches!(
            ensure_compatible(30001, "b", Protocol::Udp, None, &existing),
            Err(ControlError::Conflict(_))
        ));
        // another port is fine
        assert!(ensure_compatible(30002, "b", Protocol::Udp, None, &existing).is_ok());
    }

    #[test]
    fn test_udp_cannot_share() {
        let existing = vec![stream("dns", 30053, Protocol::Udp, None)];
        assert!(ensure_compatible(30053, "dns2", Protocol::Udp, None, &existing).is_err());
        // updating the only stream on the port is not sharing
        assert!(ensure_compatible(30053, "dns", Protocol::Udp, None, &existing).is_ok());
    }

    #[test]
    fn test_duplicate_server_name() {
        let existing = vec![stream("a", 30001, Protocol::Tcp, Some("a.test"))];
        assert!(ensure_compatible(30001, "b", Protocol::Tcp, Some("a.test"), &existing).is_err());
        assert!(ensure_compatible(30001, "b", Protocol::Tcp, Some("b.test"), &existing).is_ok());
        assert!(ensure_compatible(30001, "b", Protocol::Tcp, None, &existing).is_ok());
    }

    #[test]
    fn test_site_ports_reserved() {
        assert!(ensure_not_site_port(443).is_err());
        assert!(ensure_not_site_port(5432).is_ok());
    }
}

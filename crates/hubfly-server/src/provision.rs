//! Provisioning jobs
//!
//! Every mutation is a job on its resource's queue. One worker per queue
//! runs jobs in submission order, so an update followed by a delete can
//! never race: the delete waits for the update's job to finish. A worker
//! retires as soon as its queue is empty; the next job starts a new one.
//!
//! TLS sites go through two phases:
//!
//! ```text
//! provisioning ─► HTTP live (challenge path served) ─► issue ─┬─► cert valid ─► HTTPS live ─► active
//!        │                                                    │                    │
//!        ▼ render/apply failure                               ▼ failure            ▼ apply failure
//!      error                                             cert-failed             error
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hubfly_common::{inspect_certificate, CertificatePaths};
use hubfly_model::{CertIssueStatus, ResourceStatus, Site};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::apply::{ApplyError, ApplyPipeline, Artifact};
use crate::cert_authority::{CaError, CertificateAuthority};
use crate::config::ResolvedConfig;
use crate::render::{render_port, RenderError, SiteRenderer};
use crate::state::{JobRecord, JobRegistry, JobState, ResourceKey};
use crate::store::{RecordStore, StoreError};

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error("Failed to read live configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Certificate issuance settings
#[derive(Debug, Clone)]
pub struct AcmeSettings {
    pub webroot: PathBuf,
    pub contact: String,
    pub cert_root: PathBuf,
    /// Bound on each issue or revoke call
    pub timeout: Duration,
}

impl AcmeSettings {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            webroot: config.webroot.clone(),
            contact: config.acme_email.clone(),
            cert_root: config.cert_root.clone(),
            timeout: config.issue_timeout,
        }
    }
}

#[derive(Debug, Clone)]
enum Action {
    ProvisionSite(String),
    DeleteSite { id: String, revoke: bool },
    RemoveOrphan(String),
    ReconcilePort(u16),
}

impl Action {
    fn resource(&self) -> ResourceKey {
        match self {
            Self::ProvisionSite(id) | Self::DeleteSite { id, .. } | Self::RemoveOrphan(id) => {
                ResourceKey::Site(id.clone())
            }
            Self::ReconcilePort(port) => ResourceKey::Port(*port),
        }
    }
}

struct QueuedJob {
    id: Uuid,
    action: Action,
    done: oneshot::Sender<JobRecord>,
}

/// Handle to a submitted job
pub struct JobHandle {
    pub id: Uuid,
    pub resource: ResourceKey,
    done: oneshot::Receiver<JobRecord>,
}

impl JobHandle {
    /// Wait for the job to finish
    pub async fn wait(self) -> JobRecord {
        match self.done.await {
            Ok(record) => record,
            Err(_) => JobRecord {
                id: self.id,
                resource: self.resource,
                state: JobState::Failed,
                outcome: None,
                message: Some("worker stopped before the job finished".to_string()),
                queued_at: Utc::now(),
                finished_at: Some(Utc::now()),
            },
        }
    }
}

/// Result of running one action
struct Outcome {
    state: JobState,
    status: Option<ResourceStatus>,
    message: Option<String>,
}

impl Outcome {
    fn completed(status: Option<ResourceStatus>, message: Option<String>) -> Self {
        Self {
            state: JobState::Completed,
            status,
            message,
        }
    }

    fn failed(message: String) -> Self {
        Self {
            state: JobState::Failed,
            status: None,
            message: Some(message),
        }
    }
}

pub struct Provisioner {
    store: Arc<dyn RecordStore>,
    renderer: SiteRenderer,
    pipeline: Arc<ApplyPipeline>,
    ca: Arc<dyn CertificateAuthority>,
    acme: AcmeSettings,
    jobs: JobRegistry,
    queues: DashMap<ResourceKey, mpsc::UnboundedSender<QueuedJob>>,
}

impl Provisioner {
    pub fn new(
        store: Arc<dyn RecordStore>,
        renderer: SiteRenderer,
        pipeline: Arc<ApplyPipeline>,
        ca: Arc<dyn CertificateAuthority>,
        acme: AcmeSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            renderer,
            pipeline,
            ca,
            acme,
            jobs: JobRegistry::new(),
            queues: DashMap::new(),
        })
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn renderer(&self) -> &SiteRenderer {
        &self.renderer
    }

    pub fn pipeline(&self) -> &Arc<ApplyPipeline> {
        &self.pipeline
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    /// Resources with a live worker
    pub fn active_queues(&self) -> usize {
        self.queues.len()
    }

    /// Queue a render/apply (and issuance if needed) for a site in `provisioning`
    pub fn enqueue_site(self: &Arc<Self>, id: &str) -> JobHandle {
        self.submit(Action::ProvisionSite(id.to_string()))
    }

    /// Queue removal of a site's artifact and record
    pub fn enqueue_site_delete(self: &Arc<Self>, id: &str, revoke: bool) -> JobHandle {
        self.submit(Action::DeleteSite {
            id: id.to_string(),
            revoke,
        })
    }

    /// Queue removal of a live site artifact that had no record when spotted
    ///
    /// The job checks the store again and keeps the artifact if a record
    /// for `id` exists by the time it runs.
    pub fn enqueue_orphan_removal(self: &Arc<Self>, id: &str) -> JobHandle {
        self.submit(Action::RemoveOrphan(id.to_string()))
    }

    /// Queue a rebuild of the listener on `port` from every stream assigned to it
    pub fn enqueue_port(self: &Arc<Self>, port: u16) -> JobHandle {
        self.submit(Action::ReconcilePort(port))
    }

    fn submit(self: &Arc<Self>, action: Action) -> JobHandle {
        let resource = action.resource();
        let id = self.jobs.enqueue(resource.clone());
        let (done, receiver) = oneshot::channel();
        let mut job = QueuedJob { id, action, done };

        // sent while holding the entry, so a retiring worker sees the job
        loop {
            let sent = self
                .queues
                .entry(resource.clone())
                .or_insert_with(|| self.start_worker(resource.clone()))
                .send(job);
            match sent {
                Ok(()) => break,
                // worker died without retiring; start a new one
                Err(mpsc::error::SendError(returned)) => {
                    job = returned;
                    self.queues.remove_if(&resource, |_, current| current.is_closed());
                }
            }
        }

        tracing::debug!(job = %id, resource = %resource, "Job queued");
        JobHandle {
            id,
            resource,
            done: receiver,
        }
    }

    fn start_worker(self: &Arc<Self>, resource: ResourceKey) -> mpsc::UnboundedSender<QueuedJob> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<QueuedJob>();
        let own = sender.clone();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let job = match receiver.try_recv() {
                    Ok(job) => job,
                    Err(mpsc::error::TryRecvError::Empty) => {
                        if this.retire(&resource, &own, &receiver) {
                            break;
                        }
                        continue;
                    }
                    Err(mpsc::error::TryRecvError::Disconnected) => break,
                };
                this.run_job(&resource, job).await;
            }
            tracing::trace!(resource = %resource, "Worker retired");
        });
        sender
    }

    /// Drop an idle worker's queue entry; `false` when a job arrived first
    fn retire(
        &self,
        resource: &ResourceKey,
        own: &mpsc::UnboundedSender<QueuedJob>,
        receiver: &mpsc::UnboundedReceiver<QueuedJob>,
    ) -> bool {
        match self.queues.entry(resource.clone()) {
            Entry::Occupied(entry) if entry.get().same_channel(own) => {
                if !receiver.is_empty() {
                    return false;
                }
                entry.remove();
                true
            }
            // not ours any more: nothing new can reach this channel
            _ => receiver.is_empty(),
        }
    }

    async fn run_job(&self, resource: &ResourceKey, job: QueuedJob) {
        self.jobs.start(job.id);
        let outcome = self.execute(&job.action).await;
        if outcome.state == JobState::Failed {
            tracing::error!(
                job = %job.id,
                resource = %resource,
                "Job failed: {}",
                outcome.message.as_deref().unwrap_or_default()
            );
        }
        let record = self
            .jobs
            .finish(job.id, outcome.state, outcome.status, outcome.message.clone())
            .unwrap_or_else(|| JobRecord {
                id: job.id,
                resource: resource.clone(),
                state: outcome.state,
                outcome: outcome.status,
                message: outcome.message,
                queued_at: Utc::now(),
                finished_at: Some(Utc::now()),
            });
        // the submitter may have stopped waiting
        let _ = job.done.send(record);
    }

    async fn execute(&self, action: &Action) -> Outcome {
        match action {
            Action::ProvisionSite(id) => match self.provision_site(id).await {
                Ok(Some(site)) => Outcome::completed(Some(site.status), site.error_message),
                Ok(None) => Outcome::completed(None, Some("site no longer exists".to_string())),
                Err(e) => Outcome::failed(e.to_string()),
            },
            Action::DeleteSite { id, revoke } => match self.delete_site(id, *revoke).await {
                Ok(()) => Outcome::completed(None, None),
                Err(e) => Outcome::failed(e.to_string()),
            },
            Action::RemoveOrphan(id) => match self.remove_orphan(id).await {
                Ok(true) => Outcome::completed(None, None),
                Ok(false) => Outcome::completed(None, Some("site has a record, kept".to_string())),
                Err(e) => Outcome::failed(e.to_string()),
            },
            Action::ReconcilePort(port) => match self.reconcile_port(*port).await {
                Ok(()) => Outcome::completed(Some(ResourceStatus::Active), None),
                Err(e) => Outcome::failed(e.to_string()),
            },
        }
    }

    /// Drive a site to `active`, `error` or `cert-failed`
    ///
    /// Returns `None` if the record was deleted before the job ran.
    async fn provision_site(&self, id: &str) -> Result<Option<Site>, ProvisionError> {
        let mut site = match self.store.get_site(id) {
            Ok(site) => site,
            Err(e) if e.is_not_found() => {
                tracing::info!("Site {} was deleted before provisioning ran", id);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if site.status.is_settled() {
            site = self.store.modify_site(id, &mut |s| {
                let status = ResourceStatus::Provisioning;
                if let Err(e) = s.set_status(status, None, Utc::now()) {
                    tracing::warn!("Site {} not moved to {}: {}", s.id, status, e);
                }
            })?;
        }

        // a certificate recorded as valid is only trusted while its files are usable
        if site.tls_ready() {
            let paths = CertificatePaths::for_domain(&self.acme.cert_root, &site.domain);
            if let Err(e) = inspect_certificate(&paths) {
                tracing::warn!(
                    "Certificate for {} is no longer usable, issuing again: {}",
                    site.domain,
                    e
                );
                let domain = site.domain.clone();
                site = self.store.modify_site(id, &mut |s| {
                    if s.domain == domain {
                        s.cert_issue_status = Some(CertIssueStatus::Pending);
                    }
                })?;
            }
        }

        // Phase 1: HTTP listener live, so the challenge path is served
        if let Err(e) = self.render_and_apply(id).await {
            return self.settle_site(id, ResourceStatus::Error, Some(e.to_string()), None);
        }
        if !site.ssl || site.tls_ready() {
            tracing::info!("Site {} is active", id);
            return self.settle_site(id, ResourceStatus::Active, None, None);
        }

        // Phase 2: issuance
        tracing::info!("Site {} is live over HTTP, requesting certificate", id);
        if let Err(message) = self.issue_certificate(&site.domain).await {
            tracing::warn!("Certificate issuance for {} failed: {}", site.domain, message);
            return self.settle_site(
                id,
                ResourceStatus::CertFailed,
                Some(message),
                Some((site.domain.clone(), CertIssueStatus::Failed)),
            );
        }

        let domain = site.domain.clone();
        self.store.modify_site(id, &mut |s| {
            if s.domain == domain {
                s.cert_issue_status = Some(CertIssueStatus::Valid);
            }
        })?;
        tracing::info!("Certificate for {} issued", domain);

        // Phase 3: HTTPS
        if let Err(e) = self.render_and_apply(id).await {
            return self.settle_site(
                id,
                ResourceStatus::Error,
                Some(format!("certificate issued but TLS configuration failed: {}", e)),
                None,
            );
        }

        tracing::info!("Site {} is active with TLS", id);
        self.settle_site(id, ResourceStatus::Active, None, None)
    }

    /// Render the stored record and put it live
    ///
    /// The record is read under the apply lock, so an older rendering never
    /// lands on top of intent another process saved in the meantime.
    async fn render_and_apply(&self, id: &str) -> Result<(), ProvisionError> {
        let held = self.pipeline.lock().await?;
        let site = match self.store.get_site(id) {
            Ok(site) => site,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let text = self.renderer.render(&site)?;
        let result = self
            .pipeline
            .apply_locked(&held, &Artifact::Site(site.id.clone()), &text)
            .await;
        if let Err(e) = &result {
            if e.is_live_diverged() {
                tracing::error!("{}", e);
            }
        }
        Ok(result?)
    }

    /// Issue and check the resulting material; the error is the message to record
    async fn issue_certificate(&self, domain: &str) -> Result<(), String> {
        let call = self.ca.issue(domain, &self.acme.webroot, &self.acme.contact);
        match tokio::time::timeout(self.acme.timeout, call).await {
            Err(_) => return Err(CaError::Timeout(self.acme.timeout).to_string()),
            Ok(Err(e)) => return Err(e.to_string()),
            Ok(Ok(())) => {}
        }

        let paths = CertificatePaths::for_domain(&self.acme.cert_root, domain);
        let summary = inspect_certificate(&paths)
            .map_err(|e| format!("certificate issued but unusable: {}", e))?;
        tracing::debug!(domain, chain_len = summary.chain_len, "Issued certificate checked");
        Ok(())
    }

    /// Record where the site settled; the certificate status is only touched
    /// while the record still names the same domain
    fn settle_site(
        &self,
        id: &str,
        status: ResourceStatus,
        message: Option<String>,
        cert: Option<(String, CertIssueStatus)>,
    ) -> Result<Option<Site>, ProvisionError> {
        let result = self.store.modify_site(id, &mut |site| {
            if let Some((domain, cert_status)) = &cert {
                if &site.domain == domain {
                    site.cert_issue_status = Some(*cert_status);
                }
            }
            if let Err(e) = site.set_status(status, message.clone(), Utc::now()) {
                tracing::warn!("Site {} not moved to {}: {}", site.id, status, e);
            }
        });
        match result {
            Ok(site) => Ok(Some(site)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Revoke (optionally), remove the artifact, then the record
    ///
    /// A failed revoke is logged and deletion proceeds.
    async fn delete_site(&self, id: &str, revoke: bool) -> Result<(), ProvisionError> {
        let site = match self.store.get_site(id) {
            Ok(site) => site,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if revoke && site.ssl {
            let call = self.ca.revoke(&site.domain);
            let result = match tokio::time::timeout(self.acme.timeout, call).await {
                Err(_) => Err(CaError::Timeout(self.acme.timeout)),
                Ok(result) => result,
            };
            match result {
                Ok(()) => tracing::info!("Certificate for {} revoked", site.domain),
                Err(e) => tracing::warn!(
                    "Revoking certificate for {} failed, deleting anyway: {}",
                    site.domain,
                    e
                ),
            }
        }

        self.pipeline.remove(&Artifact::Site(id.to_string())).await?;
        self.store.delete_site(id)?;
        tracing::info!("Site {} deleted", id);
        Ok(())
    }

    /// Remove a site artifact unless a record for it exists by now
    async fn remove_orphan(&self, id: &str) -> Result<bool, ProvisionError> {
        let held = self.pipeline.lock().await?;
        match self.store.get_site(id) {
            Ok(_) => {
                tracing::info!("Site {} has a record, keeping its configuration", id);
                return Ok(false);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        let removed = self
            .pipeline
            .remove_locked(&held, &Artifact::Site(id.to_string()))
            .await?;
        if removed {
            tracing::warn!("Removed site {} configuration with no record", id);
        }
        Ok(removed)
    }

    /// Rebuild the listener for `port` and mark its pending streams active
    ///
    /// On failure stream records are left as they are.
    async fn reconcile_port(&self, port: u16) -> Result<(), ProvisionError> {
        let held = self.pipeline.lock().await?;
        let streams = self.store.streams_on_port(port)?;
        let artifact = Artifact::StreamPort(port);

        match render_port(port, &streams)? {
            None => {
                self.pipeline.remove_locked(&held, &artifact).await?;
                tracing::info!("Port {} has no streams left", port);
            }
            Some(text) => {
                self.pipeline.apply_locked(&held, &artifact, &text).await?;
                tracing::info!("Port {} serves {} stream(s)", port, streams.len());
            }
        }

        for stream in streams.iter().filter(|s| !s.status.is_settled()) {
            let result = self.store.modify_stream(&stream.id, &mut |s| {
                if s.listen_port == port && !s.status.is_settled() {
                    let status = ResourceStatus::Active;
                    if let Err(e) = s.set_status(status, None, Utc::now()) {
                        tracing::warn!("Stream {} not moved to {}: {}", s.id, status, e);
                    }
                }
            });
            match result {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

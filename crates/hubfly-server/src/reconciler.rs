//! Periodic comparison of record intent against live artifacts
//!
//! Sites whose live file no longer matches their rendering, sites left in
//! `error`, and records stuck in `provisioning` with no job behind them are
//! queued again. Live files with no record behind them are removed through
//! the owning site's queue, which checks the store once more first.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use hubfly_model::{ResourceStatus, Site, Stream};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::apply::Artifact;
use crate::provision::{JobHandle, ProvisionError, Provisioner};
use crate::render::render_port;
use crate::state::{JobRecord, ResourceKey};

/// What one pass found and did
#[derive(Debug, Default, Serialize)]
pub struct DriftReport {
    /// Sites queued again
    pub sites: Vec<String>,
    /// Ports rebuilt
    pub ports: Vec<u16>,
    /// Live artifacts removed for lack of a record
    pub orphans: Vec<String>,
    pub jobs: Vec<JobRecord>,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.sites.is_empty() && self.ports.is_empty() && self.orphans.is_empty()
    }
}

pub struct Reconciler {
    provisioner: Arc<Provisioner>,
}

impl Reconciler {
    pub fn new(provisioner: Arc<Provisioner>) -> Self {
        Self { provisioner }
    }

    /// One full pass; waits for the jobs it queued
    pub async fn run_once(&self) -> Result<DriftReport, ProvisionError> {
        let mut report = DriftReport::default();
        let mut handles = Vec::new();

        let sites = self.provisioner.store().list_sites()?;
        for site in &sites {
            if let Some(handle) = self.check_site(site).await? {
                report.sites.push(site.id.clone());
                handles.push(handle);
            }
        }

        let known: HashSet<&str> = sites.iter().map(|s| s.id.as_str()).collect();
        let live = self.provisioner.pipeline().live_artifacts().await?;
        for artifact in &live {
            let Artifact::Site(id) = artifact else {
                continue;
            };
            if known.contains(id.as_str())
                || self.provisioner.jobs().is_pending(&ResourceKey::Site(id.clone()))
            {
                continue;
            }
            tracing::warn!("Queueing removal of {} with no record", artifact);
            handles.push(self.provisioner.enqueue_orphan_removal(id));
            report.orphans.push(artifact.to_string());
        }

        let streams = self.provisioner.store().list_streams()?;
        let ports: BTreeSet<u16> = streams
            .iter()
            .map(|s| s.listen_port)
            .chain(live.iter().filter_map(|a| match a {
                Artifact::StreamPort(port) => Some(*port),
                Artifact::Site(_) => None,
            }))
            .collect();
        for port in ports {
            if self.port_drifted(port, &streams).await? {
                report.ports.push(port);
                handles.push(self.provisioner.enqueue_port(port));
            }
        }

        report.jobs = join_all(handles.into_iter().map(JobHandle::wait)).await;
        Ok(report)
    }

    async fn check_site(&self, site: &Site) -> Result<Option<JobHandle>, ProvisionError> {
        let key = ResourceKey::Site(site.id.clone());
        if self.provisioner.jobs().is_pending(&key) {
            return Ok(None);
        }

        let drifted = match site.status {
            // nothing is working on it, e.g. after a restart
            ResourceStatus::Provisioning => true,
            ResourceStatus::Error => true,
            // issuance is retried on request only
            ResourceStatus::CertFailed => false,
            ResourceStatus::Active => match self.provisioner.renderer().render(site) {
                Ok(expected) => {
                    let live = self
                        .provisioner
                        .pipeline()
                        .live_content(&Artifact::Site(site.id.clone()))
                        .await?;
                    live.as_deref() != Some(expected.as_str())
                }
                Err(e) => {
                    tracing::warn!("Site {} no longer renders: {}", site.id, e);
                    true
                }
            },
        };
        if !drifted {
            return Ok(None);
        }

        tracing::info!("Site {} ({}) queued by reconciler", site.id, site.status);
        let result = self.provisioner.store().modify_site(&site.id, &mut |s| {
            let status = ResourceStatus::Provisioning;
            if let Err(e) = s.set_status(status, None, Utc::now()) {
                tracing::warn!("Site {} not moved to {}: {}", s.id, status, e);
            }
        });
        match result {
            Ok(_) => Ok(Some(self.provisioner.enqueue_site(&site.id))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn port_drifted(&self, port: u16, streams: &[Stream]) -> Result<bool, ProvisionError> {
        if self.provisioner.jobs().is_pending(&ResourceKey::Port(port)) {
            return Ok(false);
        }

        let on_port: Vec<Stream> = streams
            .iter()
            .filter(|s| s.listen_port == port)
            .cloned()
            .collect();
        let expected = match render_port(port, &on_port) {
            Ok(expected) => expected,
            Err(e) => {
                tracing::warn!("Port {} cannot be rendered: {}", port, e);
                return Ok(false);
            }
        };

        let live = self
            .provisioner
            .pipeline()
            .live_content(&Artifact::StreamPort(port))
            .await?;
        let pending = on_port.iter().any(|s| !s.status.is_settled());
        Ok(pending || live != expected)
    }

    /// Run passes every `every` until cancelled
    pub async fn run(&self, every: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!("Reconciler running every {:?}", every);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Reconciler stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(report) if report.is_clean() => tracing::debug!("No drift"),
                        Ok(report) => tracing::info!(
                            sites = report.sites.len(),
                            ports = report.ports.len(),
                            orphans = report.orphans.len(),
                            "Drift repaired"
                        ),
                        Err(e) => tracing::error!("Reconcile pass failed: {}", e),
                    }
                }
            }
        }
    }
}

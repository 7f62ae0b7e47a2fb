//! Validate, stage, swap and reload generated artifacts
//!
//! ```text
//! render ─► stage ─► validate ─► archive ─► swap ─► reload
//!                       │                             │
//!                       ▼                             ▼ (failure)
//!             live untouched, diagnostics     restore previous ─► reload
//! ```
//!
//! Staged files live in `staging/{sites,streams}/` under the same name as
//! their live counterpart, so a staged file can never be mistaken for a
//! live one. Every replaced live file is archived in
//! `history/{sites,streams}/<name>.<seq>` first.
//!
//! Each apply or removal holds `<base_dir>/.apply.lock` for its whole run,
//! so processes sharing the directories never interleave steps.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

use crate::config::Layout;
use crate::engine::{EffectiveConfig, EngineError, ProxyEngine};
use crate::lock::ExclusiveFile;

/// A generated file the engine loads
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Artifact {
    /// `sites/<id>.conf`
    Site(String),
    /// `streams/<port>.conf`
    StreamPort(u16),
}

impl Artifact {
    fn kind_dir(&self) -> &'static str {
        match self {
            Self::Site(_) => "sites",
            Self::StreamPort(_) => "streams",
        }
    }

    pub fn file_name(&self) -> String {
        match self {
            Self::Site(id) => format!("{}.conf", id),
            Self::StreamPort(port) => format!("{}.conf", port),
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Site(id) => write!(f, "site {}", id),
            Self::StreamPort(port) => write!(f, "stream port {}", port),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("Failed to lock {path:?}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to stage {artifact}: {source}")]
    Stage {
        artifact: Artifact,
        #[source]
        source: io::Error,
    },

    /// The engine rejected the candidate; live configuration untouched
    #[error("validation of {artifact} failed:\n{diagnostics}")]
    Validation {
        artifact: Artifact,
        diagnostics: String,
    },

    #[error("engine could not check {artifact}: {source}")]
    Engine {
        artifact: Artifact,
        #[source]
        source: EngineError,
    },

    /// The atomic rename failed; live configuration untouched
    #[error("swap of {artifact} failed: {source}")]
    Swap {
        artifact: Artifact,
        #[source]
        source: io::Error,
    },

    /// Reload failed after the swap; the previous version was restored and reloaded
    #[error("reload after applying {artifact} failed, previous version restored: {message}")]
    Reload { artifact: Artifact, message: String },

    /// Reload failed and so did putting the previous version back
    #[error("LIVE CONFIGURATION DIVERGED for {artifact}: reload failed ({message}), rollback failed ({rollback})")]
    LiveDiverged {
        artifact: Artifact,
        message: String,
        rollback: String,
    },
}

impl ApplyError {
    /// Whether live files may no longer match what the engine runs
    pub fn is_live_diverged(&self) -> bool {
        matches!(self, Self::LiveDiverged { .. })
    }
}

/// Exclusive hold on the live configuration, in this process and on disk
///
/// Held from validation through reload so every check sees the live set
/// it will actually be combined with.
pub struct ApplyLock<'a> {
    _engine: MutexGuard<'a, ()>,
    _file: ExclusiveFile,
}

pub struct ApplyPipeline {
    layout: Layout,
    engine: Arc<dyn ProxyEngine>,
    history_depth: usize,
    engine_lock: Mutex<()>,
    lock_path: PathBuf,
}

impl ApplyPipeline {
    pub fn new(layout: Layout, engine: Arc<dyn ProxyEngine>, history_depth: usize) -> Self {
        let lock_path = layout.base_dir.join(".apply.lock");
        Self {
            layout,
            engine,
            history_depth,
            engine_lock: Mutex::new(()),
            lock_path,
        }
    }

    /// Wait until no other apply runs, here or in another process
    ///
    /// Callers that must read records and render under the same hold pass
    /// the result to [`apply_locked`](Self::apply_locked) or
    /// [`remove_locked`](Self::remove_locked).
    pub async fn lock(&self) -> Result<ApplyLock<'_>, ApplyError> {
        let engine = self.engine_lock.lock().await;
        let file = ExclusiveFile::acquire(self.lock_path.clone())
            .await
            .map_err(|source| ApplyError::Lock {
                path: self.lock_path.clone(),
                source,
            })?;
        Ok(ApplyLock {
            _engine: engine,
            _file: file,
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    fn live_dir(&self, artifact: &Artifact) -> &Path {
        match artifact {
            Artifact::Site(_) => &self.layout.sites_dir,
            Artifact::StreamPort(_) => &self.layout.streams_dir,
        }
    }

    pub fn live_path(&self, artifact: &Artifact) -> PathBuf {
        self.live_dir(artifact).join(artifact.file_name())
    }

    fn staged_path(&self, artifact: &Artifact) -> PathBuf {
        self.layout
            .staging_dir
            .join(artifact.kind_dir())
            .join(artifact.file_name())
    }

    fn history_dir(&self, artifact: &Artifact) -> PathBuf {
        self.layout.history_dir.join(artifact.kind_dir())
    }

    /// Current live text of an artifact
    pub async fn live_content(&self, artifact: &Artifact) -> io::Result<Option<String>> {
        match tokio::fs::read_to_string(self.live_path(artifact)).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Every artifact currently in the live directories
    pub async fn live_artifacts(&self) -> io::Result<Vec<Artifact>> {
        let mut artifacts = Vec::new();
        for name in conf_files(&self.layout.sites_dir).await? {
            if let Some(id) = name.strip_suffix(".conf") {
                artifacts.push(Artifact::Site(id.to_string()));
            }
        }
        for name in conf_files(&self.layout.streams_dir).await? {
            match name.strip_suffix(".conf").and_then(|p| p.parse().ok()) {
                Some(port) => artifacts.push(Artifact::StreamPort(port)),
                None => tracing::warn!("Ignoring unexpected stream artifact {}", name),
            }
        }
        artifacts.sort();
        Ok(artifacts)
    }

    /// Archived versions of an artifact, oldest first
    pub async fn history(&self, artifact: &Artifact) -> io::Result<Vec<PathBuf>> {
        let dir = self.history_dir(artifact);
        let mut versions = history_versions(&dir, &artifact.file_name()).await?;
        versions.sort_by_key(|(seq, _)| *seq);
        Ok(versions.into_iter().map(|(_, path)| path).collect())
    }

    /// Live file set with `artifact` replaced by `candidate` (or left out when `None`)
    async fn effective_config(
        &self,
        artifact: &Artifact,
        candidate: Option<&Path>,
    ) -> io::Result<EffectiveConfig> {
        let mut config = EffectiveConfig::default();
        let target = artifact.file_name();

        for (dir, files, own_kind) in [
            (
                &self.layout.sites_dir,
                &mut config.sites,
                matches!(artifact, Artifact::Site(_)),
            ),
            (
                &self.layout.streams_dir,
                &mut config.streams,
                matches!(artifact, Artifact::StreamPort(_)),
            ),
        ] {
            for name in conf_files(dir).await? {
                if own_kind && name == target {
                    continue;
                }
                files.push(dir.join(name));
            }
            if own_kind {
                if let Some(candidate) = candidate {
                    files.push(candidate.to_path_buf());
                }
            }
        }
        Ok(config)
    }

    /// Put `content` live for `artifact`
    ///
    /// Returns only once the engine runs the new configuration.
    pub async fn apply(&self, artifact: &Artifact, content: &str) -> Result<(), ApplyError> {
        let held = self.lock().await?;
        self.apply_locked(&held, artifact, content).await
    }

    /// [`apply`](Self::apply) under a hold the caller already took
    pub async fn apply_locked(
        &self,
        _held: &ApplyLock<'_>,
        artifact: &Artifact,
        content: &str,
    ) -> Result<(), ApplyError> {
        let staged = self.staged_path(artifact);
        write_staged(&staged, content)
            .await
            .map_err(|source| ApplyError::Stage {
                artifact: artifact.clone(),
                source,
            })?;

        let effective = self
            .effective_config(artifact, Some(&staged))
            .await
            .map_err(|source| ApplyError::Stage {
                artifact: artifact.clone(),
                source,
            })?;

        if let Err(e) = self.engine.validate(&effective).await {
            discard(&staged).await;
            return Err(match e {
                EngineError::Invalid { diagnostics } => {
                    tracing::warn!("Validation of {} failed: {}", artifact, diagnostics);
                    ApplyError::Validation {
                        artifact: artifact.clone(),
                        diagnostics,
                    }
                }
                other => ApplyError::Engine {
                    artifact: artifact.clone(),
                    source: other,
                },
            });
        }

        let live = self.live_path(artifact);
        let previous = match self.archive(artifact).await {
            Ok(previous) => previous,
            Err(source) => {
                discard(&staged).await;
                return Err(ApplyError::Stage {
                    artifact: artifact.clone(),
                    source,
                });
            }
        };

        if let Err(source) = tokio::fs::rename(&staged, &live).await {
            discard(&staged).await;
            return Err(ApplyError::Swap {
                artifact: artifact.clone(),
                source,
            });
        }
        tracing::info!("Swapped {} into {}", artifact, live.display());

        self.reload_or_restore(artifact, previous.as_deref()).await
    }

    /// Take `artifact` out of the live configuration
    ///
    /// Returns `false` when there was nothing live to remove.
    pub async fn remove(&self, artifact: &Artifact) -> Result<bool, ApplyError> {
        let held = self.lock().await?;
        self.remove_locked(&held, artifact).await
    }

    pub async fn remove_locked(
        &self,
        _held: &ApplyLock<'_>,
        artifact: &Artifact,
    ) -> Result<bool, ApplyError> {
        let live = self.live_path(artifact);
        if !tokio::fs::try_exists(&live).await.unwrap_or(false) {
            return Ok(false);
        }

        let previous = self
            .archive(artifact)
            .await
            .map_err(|source| ApplyError::Stage {
                artifact: artifact.clone(),
                source,
            })?;

        tokio::fs::remove_file(&live)
            .await
            .map_err(|source| ApplyError::Swap {
                artifact: artifact.clone(),
                source,
            })?;
        tracing::info!("Removed {} from live configuration", artifact);

        self.reload_or_restore(artifact, previous.as_deref()).await?;
        Ok(true)
    }

    async fn reload_or_restore(
        &self,
        artifact: &Artifact,
        previous: Option<&Path>,
    ) -> Result<(), ApplyError> {
        let message = match self.engine.reload().await {
            Ok(()) => return Ok(()),
            Err(e) => e.to_string(),
        };
        tracing::error!("Reload after {} failed: {}", artifact, message);

        let rollback = match self.restore(artifact, previous).await {
            Ok(()) => self.engine.reload().await.map_err(|e| e.to_string()),
            Err(e) => Err(format!("restoring previous version: {}", e)),
        };

        match rollback {
            Ok(()) => {
                tracing::warn!("Restored previous version of {}", artifact);
                Err(ApplyError::Reload {
                    artifact: artifact.clone(),
                    message,
                })
            }
            Err(rollback) => {
                tracing::error!(
                    "Live configuration diverged for {}: rollback failed: {}",
                    artifact,
                    rollback
                );
                Err(ApplyError::LiveDiverged {
                    artifact: artifact.clone(),
                    message,
                    rollback,
                })
            }
        }
    }

    /// Put the archived version back, or remove the artifact if it was new
    async fn restore(&self, artifact: &Artifact, previous: Option<&Path>) -> io::Result<()> {
        let live = self.live_path(artifact);
        match previous {
            Some(previous) => {
                let staged = self.staged_path(artifact);
                tokio::fs::copy(previous, &staged).await?;
                tokio::fs::rename(&staged, &live).await
            }
            None => match tokio::fs::remove_file(&live).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            },
        }
    }

    /// Copy the current live version into history and prune old versions
    async fn archive(&self, artifact: &Artifact) -> io::Result<Option<PathBuf>> {
        let live = self.live_path(artifact);
        if !tokio::fs::try_exists(&live).await? {
            return Ok(None);
        }

        let dir = self.history_dir(artifact);
        tokio::fs::create_dir_all(&dir).await?;

        let name = artifact.file_name();
        let mut versions = history_versions(&dir, &name).await?;
        versions.sort_by_key(|(seq, _)| *seq);
        let next = versions.last().map(|(seq, _)| seq + 1).unwrap_or(1);

        let archived = dir.join(format!("{}.{}", name, next));
        tokio::fs::copy(&live, &archived).await?;
        versions.push((next, archived.clone()));

        // the newest version is always kept: rollback needs it
        let keep = self.history_depth.max(1);
        if versions.len() > keep {
            let excess = versions.len() - keep;
            for (_, path) in versions.drain(..excess) {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    tracing::debug!("Failed to prune {}: {}", path.display(), e);
                }
            }
        }

        Ok(Some(archived))
    }
}

async fn write_staged(path: &Path, content: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::debug!("Failed to discard {}: {}", path.display(), e);
        }
    }
}

/// `*.conf` file names in `dir`, sorted; a missing directory is empty
async fn conf_files(dir: &Path) -> io::Result<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            if name.ends_with(".conf") && !name.starts_with('.') {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

async fn history_versions(dir: &Path, file_name: &str) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let prefix = format!("{}.", file_name);
    let mut versions = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let seq = name
            .to_str()
            .and_then(|n| n.strip_prefix(&prefix))
            .and_then(|s| s.parse::<u64>().ok());
        if let Some(seq) = seq {
            versions.push((seq, entry.path()));
        }
    }
    Ok(versions)
}

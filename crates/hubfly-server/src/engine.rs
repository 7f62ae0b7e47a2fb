//! Proxy engine abstraction
//!
//! The pipeline only needs two things from the engine: check a full
//! configuration without touching traffic, and reload the running one.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::config::ResolvedConfig;

/// The set of artifact files the engine would load
///
/// Site files are included inside `http {}`, stream files inside `stream {}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EffectiveConfig {
    pub sites: Vec<PathBuf>,
    pub streams: Vec<PathBuf>,
}

impl EffectiveConfig {
    pub fn files(&self) -> impl Iterator<Item = &PathBuf> {
        self.sites.iter().chain(self.streams.iter())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Engine diagnostics, verbatim
    #[error("{diagnostics}")]
    Invalid { diagnostics: String },

    #[error("reload failed: {0}")]
    Reload(String),

    #[error("Failed to execute '{binary}': {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write validation config {path:?}: {source}")]
    Scratch {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[async_trait]
pub trait ProxyEngine: Send + Sync {
    /// Check the full effective configuration without affecting traffic
    async fn validate(&self, config: &EffectiveConfig) -> Result<(), EngineError>;

    /// Reload the running configuration without dropping connections
    async fn reload(&self) -> Result<(), EngineError>;
}

/// nginx driven through its command line
///
/// A missing binary means there is nothing to validate or reload, which
/// keeps dry runs on development machines working.
pub struct NginxEngine {
    binary: String,
    preamble: Vec<String>,
    scratch_dir: PathBuf,
}

enum Invocation {
    Ran(std::process::Output),
    Missing,
}

impl NginxEngine {
    pub fn new(binary: impl Into<String>, preamble: Vec<String>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            preamble,
            scratch_dir: scratch_dir.into(),
        }
    }

    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self::new(
            config.engine_binary.clone(),
            config.engine_preamble.clone(),
            config.layout.staging_dir.clone(),
        )
    }

    /// Standalone main config that includes every artifact in its context
    fn test_config(&self, config: &EffectiveConfig) -> String {
        let mut out = String::new();
        for line in &self.preamble {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str("events {}\n");
        for (context, files) in [("http", &config.sites), ("stream", &config.streams)] {
            if files.is_empty() {
                continue;
            }
            out.push_str(context);
            out.push_str(" {\n");
            for file in files {
                out.push_str(&format!("    include {};\n", absolute(file).display()));
            }
            out.push_str("}\n");
        }
        out
    }

    async fn invoke(&self, args: &[&str]) -> Result<Invocation, EngineError> {
        match Command::new(&self.binary).args(args).output().await {
            Ok(output) => Ok(Invocation::Ran(output)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!("'{}' not found, skipping {}", self.binary, args.join(" "));
                Ok(Invocation::Missing)
            }
            Err(source) => Err(EngineError::Spawn {
                binary: self.binary.clone(),
                source,
            }),
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn combined_output(output: &std::process::Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    [stderr.trim(), stdout.trim()]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl ProxyEngine for NginxEngine {
    async fn validate(&self, config: &EffectiveConfig) -> Result<(), EngineError> {
        let path = self
            .scratch_dir
            .join(format!("validate-{}.conf", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&path, self.test_config(config))
            .await
            .map_err(|source| EngineError::Scratch {
                path: path.clone(),
                source,
            })?;

        let path_arg = path.display().to_string();
        let result = self.invoke(&["-t", "-c", &path_arg]).await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::debug!("Failed to remove {}: {}", path.display(), e);
        }

        match result? {
            Invocation::Missing => Ok(()),
            Invocation::Ran(output) if output.status.success() => {
                tracing::debug!(output = %combined_output(&output), "Configuration test passed");
                Ok(())
            }
            Invocation::Ran(output) => Err(EngineError::Invalid {
                diagnostics: combined_output(&output),
            }),
        }
    }

    async fn reload(&self) -> Result<(), EngineError> {
        match self.invoke(&["-s", "reload"]).await? {
            Invocation::Missing => Ok(()),
            Invocation::Ran(output) if output.status.success() => {
                tracing::info!("Engine reloaded");
                Ok(())
            }
            Invocation::Ran(output) => Err(EngineError::Reload(combined_output(&output))),
        }
    }
}

//! Scripted proxy engine for E2E tests
//!
//! Validation reads every file of the effective configuration and rejects it
//! when any of them contains the rejection marker, the way a real engine
//! rejects an unknown directive. Tests can add one more rejected text to
//! fail a later phase of provisioning on purpose.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use hubfly_server::{EffectiveConfig, EngineError, ProxyEngine};

/// Directive the mock engine does not know
pub const REJECTED_DIRECTIVE: &str = "bogus_directive";

/// Mock engine that records what it was asked to do
pub struct MockEngine {
    /// File sets passed to validate, in call order
    validations: Mutex<Vec<Vec<PathBuf>>>,
    reloads: AtomicUsize,
    /// Number of upcoming reloads that fail
    failing_reloads: AtomicUsize,
    /// Extra text rejected like an unknown directive
    rejected_text: Mutex<Option<String>>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of successful reloads so far
    pub fn reload_count(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    pub fn validation_count(&self) -> usize {
        self.validations.lock().len()
    }

    /// Files seen by the most recent validation
    pub fn last_validation(&self) -> Option<Vec<PathBuf>> {
        self.validations.lock().last().cloned()
    }

    /// Make the next `count` reloads fail
    pub fn fail_next_reloads(&self, count: usize) {
        self.failing_reloads.store(count, Ordering::SeqCst);
    }

    /// Reject any configuration containing `text` until cleared
    pub fn reject_containing(&self, text: &str) {
        *self.rejected_text.lock() = Some(text.to_string());
    }

    pub fn clear_rejection(&self) {
        *self.rejected_text.lock() = None;
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self {
            validations: Mutex::new(Vec::new()),
            reloads: AtomicUsize::new(0),
            failing_reloads: AtomicUsize::new(0),
            rejected_text: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ProxyEngine for MockEngine {
    async fn validate(&self, config: &EffectiveConfig) -> Result<(), EngineError> {
        let files: Vec<PathBuf> = config.files().cloned().collect();
        self.validations.lock().push(files.clone());
        let mut markers = vec![REJECTED_DIRECTIVE.to_string()];
        markers.extend(self.rejected_text.lock().clone());

        for path in files {
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| EngineError::Invalid {
                    diagnostics: format!("open() \"{}\" failed: {}", path.display(), e),
                })?;
            for marker in &markers {
                if let Some(line) = content.lines().position(|l| l.contains(marker.as_str())) {
                    return Err(EngineError::Invalid {
                        diagnostics: format!(
                            "unknown directive \"{}\" in {}:{}",
                            marker,
                            path.display(),
                            line + 1
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    async fn reload(&self) -> Result<(), EngineError> {
        let failing = self
            .failing_reloads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            tracing::debug!("MockEngine: simulated reload failure");
            return Err(EngineError::Reload("simulated reload failure".into()));
        }
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

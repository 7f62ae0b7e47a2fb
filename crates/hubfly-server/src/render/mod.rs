//! Rendering of records into proxy engine configuration
//!
//! Rendering is pure: the same records (and template files) always produce
//! byte-identical text, and nothing here touches the live engine.

mod site;
mod stream;
mod templates;

use std::path::PathBuf;

use thiserror::Error;

pub use site::{SitePaths, SiteRenderer};
pub use stream::{plan_port, render_port, StreamPlan};
pub use templates::{Fragments, TemplateLibrary};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("unknown template '{0}'")]
    UnknownTemplate(String),

    #[error("Failed to read template {path:?}: {source}")]
    TemplateIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("site '{0}' has no upstream")]
    NoUpstream(String),

    #[error("streams on port {port} mix tcp and udp")]
    MixedProtocols { port: u16 },

    #[error("port {port}: server name routing requires tcp")]
    SniOverUdp { port: u16 },

    #[error("port {port}: server name '{domain}' is claimed by more than one stream")]
    DuplicateServerName { port: u16, domain: String },

    #[error("stream '{id}' listens on {found}, not {port}")]
    ForeignStream { id: String, port: u16, found: u16 },
}

const INDENT: &str = "    ";

/// Line-oriented writer for nginx-style block configuration
#[derive(Debug, Default)]
pub(crate) struct ConfWriter {
    out: String,
    depth: usize,
}

impl ConfWriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn line(&mut self, text: &str) {
        if text.is_empty() {
            self.out.push('\n');
            return;
        }
        for _ in 0..self.depth {
            self.out.push_str(INDENT);
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    /// Multi-line text at the current depth; relative indentation is kept
    pub(crate) fn raw(&mut self, text: &str) {
        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            self.line(line);
        }
    }

    pub(crate) fn open(&mut self, header: &str) {
        self.line(&format!("{} {{", header));
        self.depth += 1;
    }

    pub(crate) fn close(&mut self) {
        self.depth = self.depth.saturating_sub(1);
        self.line("}");
    }

    pub(crate) fn blank(&mut self) {
        if !self.out.is_empty() && !self.out.ends_with("\n\n") {
            self.out.push('\n');
        }
    }

    pub(crate) fn finish(self) -> String {
        self.out
    }
}

//! Record types for the hubfly proxy appliance
//!
//! Sites are HTTP virtual hosts, streams are Layer-4 (TCP/UDP) listeners.
//! Both carry a [`ResourceStatus`] that only moves along legal transitions.

mod error;
mod firewall;
mod site;
mod status;
mod stream;

pub use error::{ModelError, TransitionError};
pub use firewall::{
    engine_ident, BlockRules, FirewallConfig, IpAction, IpRule, RateLimitConfig,
    RateUnit,
};
pub use site::{Site, SiteSpec};
pub use status::{CertIssueStatus, ResourceStatus};
pub use stream::{Protocol, Stream, StreamSpec};

use thiserror::Error;

use crate::status::ResourceStatus;

/// A record failed validation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ModelError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// A status change that the lifecycle does not allow
#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal status transition {from} -> {to}")]
pub struct TransitionError {
    pub from: ResourceStatus,
    pub to: ResourceStatus,
}

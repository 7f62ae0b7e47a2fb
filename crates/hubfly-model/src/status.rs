use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TransitionError;

/// Lifecycle of a site or stream record
///
/// ```text
///            ┌──────────────► active ─────────┐
///            │                                │
/// provisioning ──────────────► error ─────────┼──► provisioning
///            │                                │
///            └──────────────► cert-failed ────┘
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceStatus {
    /// Accepted, a worker has not finished with it yet
    #[default]
    Provisioning,
    /// Live configuration matches the record
    Active,
    /// Render, validation or apply failed
    Error,
    /// Served over plain HTTP, certificate issuance failed
    CertFailed,
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Active => "active",
            Self::Error => "error",
            Self::CertFailed => "cert-failed",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(self, next: ResourceStatus) -> bool {
        match (self, next) {
            // progress updates while a worker runs
            (Self::Provisioning, _) => true,
            // any settled state re-enters provisioning on update or retry
            (_, Self::Provisioning) => true,
            _ => false,
        }
    }

    /// Checked transition
    pub fn transition(self, next: ResourceStatus) -> Result<ResourceStatus, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                from: self,
                to: next,
            })
        }
    }

    /// Settled states are the ones no worker is responsible for
    pub fn is_settled(self) -> bool {
        self != Self::Provisioning
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the most recent certificate issuance for a site
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CertIssueStatus {
    #[default]
    Pending,
    Valid,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provisioning_reaches_every_state() {
        for next in [
            ResourceStatus::Provisioning,
            ResourceStatus::Active,
            ResourceStatus::Error,
            ResourceStatus::CertFailed,
        ] {
            assert!(ResourceStatus::Provisioning.can_transition_to(next));
        }
    }

    #[test]
    fn test_settled_states_only_reenter_provisioning() {
        let err = ResourceStatus::Active
            .transition(ResourceStatus::Error)
            .unwrap_err();
        assert_eq!(err.from, ResourceStatus::Active);
        assert_eq!(err.to, ResourceStatus::Error);

        assert!(ResourceStatus::CertFailed
            .transition(ResourceStatus::Active)
            .is_err());
        assert_eq!(
            ResourceStatus::Error.transition(ResourceStatus::Provisioning),
            Ok(ResourceStatus::Provisioning)
        );
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&ResourceStatus::CertFailed).unwrap(),
            "\"cert-failed\""
        );
        assert_eq!(
            serde_json::from_str::<CertIssueStatus>("\"valid\"").unwrap(),
            CertIssueStatus::Valid
        );
    }
}

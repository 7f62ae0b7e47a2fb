use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, TransitionError};
use crate::site::validate_id;
use crate::status::ResourceStatus;

/// Transport of a Layer-4 listener
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied intent for a stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct StreamSpec {
    pub id: Option<String>,
    /// None = assign a free port from the configured range
    pub listen_port: Option<u16>,
    /// host:port
    pub upstream: String,
    pub protocol: Protocol,
    /// Server name used to pick this stream among others on the same port
    pub domain: Option<String>,
}

/// A Layer-4 proxy listener
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stream {
    pub id: String,
    pub listen_port: u16,
    pub upstream: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    pub status: ResourceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StreamSpec {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.upstream.trim().is_empty() || self.upstream.contains(char::is_whitespace) {
            return Err(ModelError::invalid(
                "upstream",
                format!("'{}' is not a host:port target", self.upstream),
            ));
        }
        if self.listen_port == Some(0) {
            return Err(ModelError::invalid("listen_port", "must be between 1 and 65535"));
        }
        if let Some(id) = &self.id {
            validate_id(id)?;
        }
        if let Some(domain) = self.domain.as_deref().map(str::trim) {
            if domain.is_empty()
                || !domain
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            {
                return Err(ModelError::invalid(
                    "domain",
                    format!("'{}' is not a server name", domain),
                ));
            }
            if self.protocol == Protocol::Udp {
                return Err(ModelError::invalid(
                    "domain",
                    "server name routing requires tcp",
                ));
            }
        }
        Ok(())
    }
}

impl Stream {
    /// Build a new record in `provisioning` on an already chosen port
    pub fn from_spec(
        spec: StreamSpec,
        id: String,
        listen_port: u16,
        now: DateTime<Utc>,
    ) -> Result<Self, ModelError> {
        spec.validate()?;
        validate_id(&id)?;
        Ok(Self {
            id,
            listen_port,
            upstream: spec.upstream.trim().to_string(),
            protocol: spec.protocol,
            domain: spec.domain.map(|d| d.trim().to_ascii_lowercase()),
            status: ResourceStatus::Provisioning,
            error_message: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Replace intent fields and re-enter `provisioning`
    pub fn apply_update(
        &mut self,
        spec: StreamSpec,
        listen_port: u16,
        now: DateTime<Utc>,
    ) -> Result<(), ModelError> {
        spec.validate()?;
        if let Some(id) = &spec.id {
            if id != &self.id {
                return Err(ModelError::invalid("id", "cannot be changed by an update"));
            }
        }
        self.status = self
            .status
            .transition(ResourceStatus::Provisioning)
            .map_err(|e| ModelError::invalid("status", e.to_string()))?;
        self.listen_port = listen_port;
        self.upstream = spec.upstream.trim().to_string();
        self.protocol = spec.protocol;
        self.domain = spec.domain.map(|d| d.trim().to_ascii_lowercase());
        self.error_message = None;
        self.updated_at = now;
        Ok(())
    }

    /// Checked status change
    pub fn set_status(
        &mut self,
        next: ResourceStatus,
        message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.status = self.status.transition(next)?;
        self.error_message = message;
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(upstream: &str) -> StreamSpec {
        StreamSpec {
            upstream: upstream.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_protocol_defaults_to_tcp() {
        let spec: StreamSpec = serde_json::from_str(r#"{"upstream":"10.0.0.2:5432"}"#).unwrap();
        assert_eq!(spec.protocol, Protocol::Tcp);
        assert_eq!(spec.listen_port, None);
    }

    #[test]
    fn test_udp_cannot_use_server_names() {
        let mut input = spec("10.0.0.2:53");
        input.protocol = Protocol::Udp;
        input.domain = Some("dns.test".to_string());
        let err = input.validate().unwrap_err();
        assert!(matches!(err, ModelError::Invalid { field: "domain", .. }));
    }

    #[test]
    fn test_rejects_port_zero() {
        let mut input = spec("10.0.0.2:5432");
        input.listen_port = Some(0);
        assert!(input.validate().is_err());
    }

    #[test]
    fn test_domain_is_normalized() {
        let mut input = spec("10.0.0.2:443");
        input.domain = Some(" DB.Example.com ".to_string());
        let stream = Stream::from_spec(input, "s1".to_string(), 30001, Utc::now()).unwrap();
        assert_eq!(stream.domain.as_deref(), Some("db.example.com"));
        assert_eq!(stream.status, ResourceStatus::Provisioning);
    }
}

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, TransitionError};
use crate::firewall::FirewallConfig;
use crate::status::{CertIssueStatus, ResourceStatus};

/// Caller-supplied intent for a site (create and update input)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct SiteSpec {
    /// Defaults to the domain
    pub id: Option<String>,
    pub domain: String,
    pub upstreams: Vec<String>,
    /// Redirect HTTP to HTTPS
    pub force_ssl: bool,
    /// Serve HTTPS once a certificate has been issued
    pub ssl: bool,
    pub templates: Vec<String>,
    pub extra_config: Option<String>,
    #[serde(rename = "proxy_set_header")]
    pub proxy_set_headers: BTreeMap<String, String>,
    pub firewall: Option<FirewallConfig>,
}

/// An HTTP virtual host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Site {
    pub id: String,
    pub domain: String,
    pub upstreams: Vec<String>,
    #[serde(default)]
    pub force_ssl: bool,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub templates: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_config: Option<String>,
    #[serde(
        default,
        rename = "proxy_set_header",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub proxy_set_headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firewall: Option<FirewallConfig>,

    pub status: ResourceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_issue_status: Option<CertIssueStatus>,
}

impl SiteSpec {
    pub fn validate(&self) -> Result<(), ModelError> {
        let domain = self.domain.trim();
        if domain.is_empty() {
            return Err(ModelError::invalid("domain", "must not be empty"));
        }
        if !domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '*')
        {
            return Err(ModelError::invalid(
                "domain",
                format!("'{}' contains characters not allowed in a host name", domain),
            ));
        }

        if self.upstreams.is_empty() {
            return Err(ModelError::invalid("upstreams", "at least one upstream is required"));
        }
        for upstream in &self.upstreams {
            if upstream.trim().is_empty() || upstream.contains(char::is_whitespace) {
                return Err(ModelError::invalid(
                    "upstreams",
                    format!("'{}' is not a host:port target", upstream),
                ));
            }
        }

        if let Some(id) = &self.id {
            validate_id(id)?;
        }

        for name in &self.templates {
            if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
                return Err(ModelError::invalid(
                    "templates",
                    format!("'{}' is not a template name", name),
                ));
            }
        }

        for (name, value) in &self.proxy_set_headers {
            if name.is_empty() || name.contains(char::is_whitespace) || value.contains(['\n', ';'])
            {
                return Err(ModelError::invalid(
                    "proxy_set_header",
                    format!("header '{}' cannot be embedded in a config file", name),
                ));
            }
        }

        if let Some(firewall) = &self.firewall {
            firewall.validate()?;
        }

        Ok(())
    }

    /// Id the site will be stored under
    pub fn resolved_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| self.domain.trim().to_string())
    }
}

impl Site {
    /// Build a new record in `provisioning`
    pub fn from_spec(spec: SiteSpec, now: DateTime<Utc>) -> Result<Self, ModelError> {
        spec.validate()?;
        let id = spec.resolved_id();

        let mut site = Self {
            id,
            domain: String::new(),
            upstreams: Vec::new(),
            force_ssl: false,
            ssl: false,
            templates: Vec::new(),
            extra_config: None,
            proxy_set_headers: BTreeMap::new(),
            firewall: None,
            status: ResourceStatus::Provisioning,
            error_message: None,
            created_at: now,
            updated_at: now,
            cert_issue_status: None,
        };
        site.replace_intent(spec);
        Ok(site)
    }

    /// Replace intent fields from an update and re-enter `provisioning`
    ///
    /// A certificate already issued for the same domain stays valid; a new
    /// domain needs a new issuance.
    pub fn apply_update(&mut self, spec: SiteSpec, now: DateTime<Utc>) -> Result<(), ModelError> {
        spec.validate()?;
        if let Some(id) = &spec.id {
            if id != &self.id {
                return Err(ModelError::invalid("id", "cannot be changed by an update"));
            }
        }
        let domain_changed = spec.domain.trim() != self.domain;

        self.replace_intent(spec);
        if domain_changed && self.ssl {
            self.cert_issue_status = Some(CertIssueStatus::Pending);
        }

        self.status = self
            .status
            .transition(ResourceStatus::Provisioning)
            .map_err(|e| ModelError::invalid("status", e.to_string()))?;
        self.error_message = None;
        self.updated_at = now;
        Ok(())
    }

    fn replace_intent(&mut self, spec: SiteSpec) {
        self.domain = spec.domain.trim().to_string();
        self.upstreams = spec.upstreams;
        self.force_ssl = spec.force_ssl;
        self.ssl = spec.ssl;
        self.templates = spec.templates;
        self.extra_config = spec.extra_config.filter(|c| !c.trim().is_empty());
        self.proxy_set_headers = spec.proxy_set_headers;
        self.firewall = spec.firewall;
        if let Some(firewall) = &mut self.firewall {
            firewall.normalize(&self.id);
        }

        if self.ssl {
            self.cert_issue_status.get_or_insert(CertIssueStatus::Pending);
        } else {
            self.cert_issue_status = None;
        }
    }

    /// TLS may only be rendered after a successful issuance
    pub fn tls_ready(&self) -> bool {
        self.ssl && self.cert_issue_status == Some(CertIssueStatus::Valid)
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

    pub fn primary_upstream(&self) -> &str {
        self.upstreams.first().map(String::as_str).unwrap_or_default()
    }
}

pub(crate) fn validate_id(id: &str) -> Result<(), ModelError> {
    if id.is_empty()
        || id.starts_with('.')
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(ModelError::invalid(
            "id",
            format!("'{}' must be alphanumeric with '-', '_' or '.'", id),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(domain: &str) -> SiteSpec {
        SiteSpec {
            domain: domain.to_string(),
            upstreams: vec!["10.0.0.1:80".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_id_defaults_to_domain() {
        let site = Site::from_spec(spec("a.test"), Utc::now()).unwrap();
        assert_eq!(site.id, "a.test");
        assert_eq!(site.status, ResourceStatus::Provisioning);
        assert_eq!(site.cert_issue_status, None);
    }

    #[test]
    fn test_ssl_site_starts_pending() {
        let mut input = spec("a.test");
        input.ssl = true;
        let site = Site::from_spec(input, Utc::now()).unwrap();
        assert_eq!(site.cert_issue_status, Some(CertIssueStatus::Pending));
        assert!(!site.tls_ready());
    }

    #[test]
    fn test_rejects_missing_upstreams() {
        let mut input = spec("a.test");
        input.upstreams.clear();
        let err = Site::from_spec(input, Utc::now()).unwrap_err();
        assert!(matches!(err, ModelError::Invalid { field: "upstreams", .. }));
    }

    #[test]
    fn test_rejects_path_like_template_names() {
        let mut input = spec("a.test");
        input.templates = vec!["../../etc/passwd".to_string()];
        assert!(Site::from_spec(input, Utc::now()).is_err());
    }

    #[test]
    fn test_update_keeps_certificate_for_same_domain() {
        let mut input = spec("a.test");
        input.ssl = true;
        let mut site = Site::from_spec(input.clone(), Utc::now()).unwrap();
        site.cert_issue_status = Some(CertIssueStatus::Valid);
        site.set_status(ResourceStatus::Active, None, Utc::now())
            .unwrap();

        input.upstreams = vec!["10.0.0.9:80".to_string()];
        site.apply_update(input, Utc::now()).unwrap();
        assert_eq!(site.status, ResourceStatus::Provisioning);
        assert!(site.tls_ready());
        assert_eq!(site.upstreams, vec!["10.0.0.9:80".to_string()]);
    }

    #[test]
    fn test_update_with_new_domain_needs_new_certificate() {
        let mut input = spec("a.test");
        input.ssl = true;
        input.id = Some("site-a".to_string());
        let mut site = Site::from_spec(input.clone(), Utc::now()).unwrap();
        site.cert_issue_status = Some(CertIssueStatus::Valid);

        input.domain = "b.test".to_string();
        site.apply_update(input, Utc::now()).unwrap();
        assert_eq!(site.cert_issue_status, Some(CertIssueStatus::Pending));
    }

    #[test]
    fn test_rate_limit_zone_is_derived_from_id() {
        let mut input = spec("a.test");
        input.firewall = Some(FirewallConfig {
            rate_limit: Some(crate::RateLimitConfig {
                enabled: true,
                rate: 10,
                unit: crate::RateUnit::PerSecond,
                burst: 20,
                zone_name: Some("spoofed".to_string()),
            }),
            ..Default::default()
        });
        let site = Site::from_spec(input, Utc::now()).unwrap();
        let zone = site
            .firewall
            .and_then(|f| f.rate_limit)
            .and_then(|r| r.zone_name);
        assert_eq!(zone.as_deref(), Some("hubfly_rl_a_test"));
    }

    #[test]
    fn test_record_json_shape() {
        let site = Site::from_spec(spec("a.test"), Utc::now()).unwrap();
        let json = serde_json::to_value(&site).unwrap();
        assert_eq!(json["status"], "provisioning");
        assert!(json.get("proxy_set_header").is_none());
        assert!(json.get("cert_issue_status").is_none());
    }
}

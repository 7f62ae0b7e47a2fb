use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Firewall settings attached to a site
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct FirewallConfig {
    /// Evaluated in order, first match wins
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ip_rules: Vec<IpRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_rules: Option<BlockRules>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IpAction {
    Allow,
    Deny,
}

impl IpAction {
    pub fn directive(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

/// Allow or deny an address, a CIDR range, or `all`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpRule {
    pub value: String,
    pub action: IpAction,
}

impl IpRule {
    pub fn allow(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            action: IpAction::Allow,
        }
    }

    pub fn deny(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            action: IpAction::Deny,
        }
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.value == "all" {
            return Ok(());
        }

        let (addr, prefix) = match self.value.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (self.value.as_str(), None),
        };

        let ip: IpAddr = addr
            .parse()
            .map_err(|_| ModelError::invalid("ip_rules", format!("'{}' is not an address", self.value)))?;

        if let Some(prefix) = prefix {
            let max = if ip.is_ipv4() { 32 } else { 128 };
            match prefix.parse::<u8>() {
                Ok(bits) if bits <= max => {}
                _ => {
                    return Err(ModelError::invalid(
                        "ip_rules",
                        format!("'{}' has an invalid prefix length", self.value),
                    ))
                }
            }
        }

        Ok(())
    }
}

/// Request patterns rejected before proxying
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct BlockRules {
    /// Regex patterns matched case-insensitively against User-Agent
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub user_agents: Vec<String>,
    /// HTTP methods rejected on every path
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
    /// Regex patterns for paths rejected outright
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
    /// Path pattern -> methods rejected on that path only
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub path_methods: BTreeMap<String, Vec<String>>,
}

impl BlockRules {
    pub fn validate(&self) -> Result<(), ModelError> {
        let all_methods = self
            .methods
            .iter()
            .chain(self.path_methods.values().flatten());
        for method in all_methods {
            if method.is_empty() || !method.chars().all(|c| c.is_ascii_uppercase()) {
                return Err(ModelError::invalid(
                    "block_rules.methods",
                    format!("'{}' is not an upper-case HTTP method", method),
                ));
            }
        }

        let patterns = self
            .user_agents
            .iter()
            .chain(self.paths.iter())
            .chain(self.path_methods.keys());
        for pattern in patterns {
            if pattern.trim().is_empty() || pattern.contains(['\n', '\r', '"']) {
                return Err(ModelError::invalid(
                    "block_rules",
                    format!("pattern '{}' cannot be embedded in a config file", pattern),
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum RateUnit {
    #[default]
    #[serde(rename = "r/s")]
    PerSecond,
    #[serde(rename = "r/m")]
    PerMinute,
}

impl RateUnit {
    pub fn suffix(self) -> &'static str {
        match self {
            Self::PerSecond => "r/s",
            Self::PerMinute => "r/m",
        }
    }
}

/// Encode an id as an engine identifier
///
/// ASCII letters and digits pass through, every other byte becomes `_`
/// followed by two lowercase hex digits. Distinct ids never share an
/// identifier, so `a.test` and `a-test` get separate zones.
pub fn engine_ident(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() {
            out.push(byte as char);
        } else {
            out.push_str(&format!("_{:02x}", byte));
        }
    }
    out
}

/// Per-client request rate limiting
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Requests per unit
    pub rate: u32,
    #[serde(default)]
    pub unit: RateUnit,
    /// Requests allowed above the rate before rejecting
    #[serde(default)]
    pub burst: u32,
    /// Derived from the site id, never taken from input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_name: Option<String>,
}

impl RateLimitConfig {
    /// Zone name for a site, safe to use as an engine identifier
    pub fn zone_name_for(site_id: &str) -> String {
        format!("hubfly_rl_{}", engine_ident(site_id))
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.enabled && self.rate == 0 {
            return Err(ModelError::invalid("rate_limit.rate", "must be greater than zero"));
        }
        Ok(())
    }
}

impl FirewallConfig {
    pub fn validate(&self) -> Result<(), ModelError> {
        for rule in &self.ip_rules {
            rule.validate()?;
        }
        if let Some(block) = &self.block_rules {
            block.validate()?;
        }
        if let Some(limit) = &self.rate_limit {
            limit.validate()?;
        }
        Ok(())
    }

    /// Fill derived fields for the owning site
    pub fn normalize(&mut self, site_id: &str) {
        if let Some(limit) = &mut self.rate_limit {
            limit.zone_name = Some(RateLimitConfig::zone_name_for(site_id));
        }
    }
}

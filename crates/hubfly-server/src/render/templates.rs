use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use hubfly_model::{engine_ident, BlockRules, FirewallConfig, RateLimitConfig, Site};

use super::RenderError;

/// Compiled template and firewall output, grouped by where it goes
///
/// Each entry may span several lines; indentation inside an entry is
/// relative to the block it is written into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fragments {
    /// Top of the document (`http {}` context)
    pub http: Vec<String>,
    /// Inside `server {}`, before any location
    pub server: Vec<String>,
    /// Inside `location /` and every path-scoped proxy block
    pub location: Vec<String>,
    /// Path-scoped `location` blocks placed after `location /`
    pub path_blocks: Vec<String>,
}

/// Resolves template names to fragments
#[derive(Debug, Clone)]
pub struct TemplateLibrary {
    templates_dir: Option<PathBuf>,
    cache_dir: PathBuf,
}

impl TemplateLibrary {
    pub fn new(templates_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            templates_dir: Some(templates_dir.into()),
            cache_dir: cache_dir.into(),
        }
    }

    /// Library with only the built-in templates
    pub fn builtin_only(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            templates_dir: None,
            cache_dir: cache_dir.into(),
        }
    }

    /// Compile a site's templates and firewall
    ///
    /// `forward` holds the directives that proxy a request to the site's
    /// upstream; path-scoped blocks repeat them so those paths stay proxyable.
    pub fn compile(&self, site: &Site, forward: &[String]) -> Result<Fragments, RenderError> {
        let mut out = Fragments::default();

        if let Some(firewall) = &site.firewall {
            compile_access(site, firewall, &mut out);
        }

        let mut seen = HashSet::new();
        for name in &site.templates {
            if seen.insert(name.as_str()) {
                self.apply(name, site, &mut out)?;
            }
        }

        if let Some(rules) = site.firewall.as_ref().and_then(|f| f.block_rules.as_ref()) {
            let location = out.location.clone();
            compile_path_blocks(rules, forward, &location, &mut out.path_blocks);
        }

        Ok(out)
    }

    fn apply(&self, name: &str, site: &Site, out: &mut Fragments) -> Result<(), RenderError> {
        if let Some(text) = self.read_file(name)? {
            out.location.push(text);
            return Ok(());
        }

        match name {
            "caching" => {
                let ident = engine_ident(&site.id);
                let zone = format!("hubfly_cache_{}", ident);
                out.http.push(format!(
                    "proxy_cache_path {} levels=1:2 keys_zone={}:10m max_size=1g inactive=60m use_temp_path=off;",
                    self.cache_dir.join(&ident).display(),
                    zone
                ));
                out.location.push(format!(
                    "proxy_cache {};\n\
                     proxy_cache_valid 200 302 10m;\n\
                     proxy_cache_valid 404 1m;\n\
                     proxy_cache_use_stale error timeout updating http_500 http_502 http_503 http_504;\n\
                     add_header X-Cache-Status $upstream_cache_status;",
                    zone
                ));
            }
            "cors" => out.location.push(
                "add_header Access-Control-Allow-Origin \"*\" always;\n\
                 add_header Access-Control-Allow-Methods \"GET, POST, PUT, PATCH, DELETE, OPTIONS\" always;\n\
                 add_header Access-Control-Allow-Headers \"Authorization, Content-Type\" always;\n\
                 if ($request_method = OPTIONS) {\n    return 204;\n}"
                    .to_string(),
            ),
            "security-headers" => out.location.push(
                "add_header X-Frame-Options \"SAMEORIGIN\" always;\n\
                 add_header X-Content-Type-Options \"nosniff\" always;\n\
                 add_header Referrer-Policy \"strict-origin-when-cross-origin\" always;\n\
                 add_header X-XSS-Protection \"1; mode=block\" always;"
                    .to_string(),
            ),
            _ => return Err(RenderError::UnknownTemplate(name.to_string())),
        }
        Ok(())
    }

    /// User template at `<templates_dir>/<name>.conf`, which shadows a built-in
    fn read_file(&self, name: &str) -> Result<Option<String>, RenderError> {
        let Some(dir) = &self.templates_dir else {
            return Ok(None);
        };
        let path = template_path(dir, name);
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(RenderError::TemplateIo { path, source }),
        }
    }
}

fn template_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.conf", name))
}

/// IP rules, rate limiting and request-wide blocks
fn compile_access(site: &Site, firewall: &FirewallConfig, out: &mut Fragments) {
    // order is evaluation-significant: first match wins
    for rule in &firewall.ip_rules {
        out.location
            .push(format!("{} {};", rule.action.directive(), rule.value));
    }

    if let Some(limit) = firewall.rate_limit.as_ref().filter(|l| l.enabled) {
        let zone = RateLimitConfig::zone_name_for(&site.id);
        out.http.push(format!(
            "limit_req_zone $binary_remote_addr zone={}:10m rate={}{};",
            zone,
            limit.rate,
            limit.unit.suffix()
        ));
        out.location.push(format!(
            "limit_req zone={} burst={} nodelay;",
            zone, limit.burst
        ));
    }

    let Some(rules) = &firewall.block_rules else {
        return;
    };
    if !rules.user_agents.is_empty() {
        out.server.push(format!(
            "if ($http_user_agent ~* \"({})\") {{\n    return 403;\n}}",
            rules.user_agents.join("|")
        ));
    }
    if !rules.methods.is_empty() {
        out.server.push(method_block(&rules.methods, ""));
    }
}

fn method_block(methods: &[String], indent: &str) -> String {
    format!(
        "{indent}if ($request_method ~ ^({})$) {{\n{indent}    return 405;\n{indent}}}",
        methods.join("|")
    )
}

fn compile_path_blocks(
    rules: &BlockRules,
    forward: &[String],
    location: &[String],
    out: &mut Vec<String>,
) {
    for path in &rules.paths {
        out.push(format!("location ~ \"{}\" {{\n    return 403;\n}}", path));
    }

    for (path, methods) in &rules.path_methods {
        if methods.is_empty() {
            continue;
        }
        let mut block = format!("location ~ \"{}\" {{\n", path);
        block.push_str(&method_block(methods, "    "));
        block.push('\n');
        for text in forward.iter().chain(location) {
            for line in text.lines() {
                block.push_str("    ");
                block.push_str(line);
                block.push('\n');
            }
        }
        block.push('}');
        out.push(block);
    }
}

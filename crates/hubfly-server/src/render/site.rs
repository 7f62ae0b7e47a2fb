use std::path::PathBuf;

use hubfly_common::CertificatePaths;
use hubfly_model::Site;

use super::templates::{Fragments, TemplateLibrary};
use super::{ConfWriter, RenderError};
use crate::config::ResolvedConfig;

const ACME_CHALLENGE_PATH: &str = "/.well-known/acme-challenge/";

/// Fixed filesystem locations referenced from site documents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SitePaths {
    pub webroot: PathBuf,
    pub static_dir: PathBuf,
    pub cert_root: PathBuf,
}

/// Renders a site record into a complete configuration document
#[derive(Debug, Clone)]
pub struct SiteRenderer {
    library: TemplateLibrary,
    paths: SitePaths,
}

impl SiteRenderer {
    pub fn new(library: TemplateLibrary, paths: SitePaths) -> Self {
        Self { library, paths }
    }

    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self::new(
            TemplateLibrary::new(&config.layout.templates_dir, &config.layout.cache_dir),
            SitePaths {
                webroot: config.webroot.clone(),
                static_dir: config.static_dir.clone(),
                cert_root: config.cert_root.clone(),
            },
        )
    }

    /// Render with HTTPS only once the site's certificate has been issued
    pub fn render(&self, site: &Site) -> Result<String, RenderError> {
        self.render_with_tls(site, site.tls_ready())
    }

    /// Render with the HTTPS server block explicitly on or off
    pub fn render_with_tls(&self, site: &Site, tls: bool) -> Result<String, RenderError> {
        if site.upstreams.is_empty() {
            return Err(RenderError::NoUpstream(site.id.clone()));
        }

        let forward = forward_directives(site);
        let fragments = self.library.compile(site, &forward)?;

        let mut w = ConfWriter::new();
        w.line(&format!("# hubfly site {}", site.id));
        if !fragments.http.is_empty() {
            for text in &fragments.http {
                w.raw(text);
            }
        }
        w.blank();

        self.http_server(&mut w, site, &forward, &fragments);

        if tls {
            w.blank();
            self.https_server(&mut w, site, &forward, &fragments);
        }

        Ok(w.finish())
    }

    fn http_server(&self, w: &mut ConfWriter, site: &Site, forward: &[String], fragments: &Fragments) {
        w.open("server");
        w.line("listen 80;");
        w.line(&format!("server_name {};", site.domain));
        w.blank();

        if site.force_ssl {
            w.open("location /");
            w.line("return 301 https://$host$request_uri;");
            w.close();
        } else {
            proxy_body(w, site, forward, fragments);
        }
        w.blank();

        w.open(&format!("location {}", ACME_CHALLENGE_PATH));
        w.line("allow all;");
        w.line(&format!("root {};", self.paths.webroot.display()));
        w.line("try_files $uri =404;");
        w.close();
        w.blank();

        self.error_page(w);
        w.close();
    }

    fn https_server(&self, w: &mut ConfWriter, site: &Site, forward: &[String], fragments: &Fragments) {
        let cert = CertificatePaths::for_domain(&self.paths.cert_root, &site.domain);

        w.open("server");
        w.line("listen 443 ssl;");
        w.line("http2 on;");
        w.line(&format!("server_name {};", site.domain));
        w.blank();
        w.line(&format!("ssl_certificate {};", cert.fullchain.display()));
        w.line(&format!("ssl_certificate_key {};", cert.privkey.display()));
        w.blank();

        proxy_body(w, site, forward, fragments);
        w.blank();

        self.error_page(w);
        w.close();
    }

    fn error_page(&self, w: &mut ConfWriter) {
        w.line("error_page 502 504 /502.html;");
        w.open("location = /502.html");
        w.line(&format!("root {};", self.paths.static_dir.display()));
        w.line("internal;");
        w.close();
    }
}

/// Proxying to the first upstream with the site's header overrides
fn forward_directives(site: &Site) -> Vec<String> {
    let upstream = site.primary_upstream();
    let target = if upstream.starts_with("http://") || upstream.starts_with("https://") {
        upstream.to_string()
    } else {
        format!("http://{}", upstream)
    };

    let mut lines = vec![
        format!("set $upstream_endpoint \"{}\";", target),
        "proxy_pass $upstream_endpoint;".to_string(),
    ];
    // BTreeMap: sorted by header name
    for (name, value) in &site.proxy_set_headers {
        lines.push(format!("proxy_set_header {} {};", name, value));
    }
    lines
}

/// Request-wide blocks, `location /` and the path-scoped blocks
fn proxy_body(w: &mut ConfWriter, site: &Site, forward: &[String], fragments: &Fragments) {
    if !fragments.server.is_empty() {
        for text in &fragments.server {
            w.raw(text);
        }
        w.blank();
    }

    w.open("location /");
    for line in forward {
        w.line(line);
    }
    for text in &fragments.location {
        w.raw(text);
    }
    // last, so it can override anything above
    if let Some(extra) = &site.extra_config {
        w.raw(extra);
    }
    w.close();

    for block in &fragments.path_blocks {
        w.blank();
        w.raw(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use hubfly_model::{BlockRules, CertIssueStatus, FirewallConfig, IpRule, SiteSpec};

    fn renderer() -> SiteRenderer {
        SiteRenderer::new(
            TemplateLibrary::builtin_only("/var/cache/hubfly"),
            SitePaths {
                webroot: PathBuf::from("/var/www/hubfly"),
                static_dir: PathBuf::from("/var/www/hubfly/static"),
                cert_root: PathBuf::from("/etc/letsencrypt/live"),
            },
        )
    }

    fn site(spec: SiteSpec) -> Site {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Site::from_spec(spec, created).unwrap()
    }

    fn basic() -> SiteSpec {
        SiteSpec {
            domain: "a.test".to_string(),
            upstreams: vec!["10.0.0.1:80".to_string(), "10.0.0.2:80".to_string()],
            ..Default::default()
        }
    }

    /// Text of the first `server {` block
    fn http_block(text: &str) -> &str {
        let start = text.find("server {").unwrap();
        let end = text[start..].find("\n}\n").unwrap() + start + 3;
        &text[start..end]
    }

    #[test]
    fn test_plain_site() {
        let mut spec = basic();
        spec.proxy_set_headers
            .insert("X-Real-IP".to_string(), "$remote_addr".to_string());
        spec.proxy_set_headers
            .insert("Host".to_string(), "$host".to_string());
        let text = renderer().render(&site(spec)).unwrap();

        assert_eq!(
            text,
            "# hubfly site a.test\n\
             \n\
             server {\n    \
                 listen 80;\n    \
                 server_name a.test;\n\
             \n    \
                 location / {\n        \
                     set $upstream_endpoint \"http://10.0.0.1:80\";\n        \
                     proxy_pass $upstream_endpoint;\n        \
                     proxy_set_header Host $host;\n        \
                     proxy_set_header X-Real-IP $remote_addr;\n    \
                 }\n\
             \n    \
                 location /.well-known/acme-challenge/ {\n        \
                     allow all;\n        \
                     root /var/www/hubfly;\n        \
                     try_files $uri =404;\n    \
                 }\n\
             \n    \
                 error_page 502 504 /502.html;\n    \
                 location = /502.html {\n        \
                     root /var/www/hubfly/static;\n        \
                     internal;\n    \
                 }\n\
             }\n"
        );
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let mut spec = basic();
        spec.templates = vec!["security-headers".to_string(), "caching".to_string()];
        spec.extra_config = Some("client_max_body_size 50m;".to_string());
        for (k, v) in [("X-B", "2"), ("X-A", "1"), ("X-C", "3")] {
            spec.proxy_set_headers.insert(k.to_string(), v.to_string());
        }
        let record = site(spec);
        let r = renderer();
        assert_eq!(r.render(&record).unwrap(), r.render(&record).unwrap());
        assert_eq!(
            r.render(&record).unwrap(),
            r.render(&record.clone()).unwrap()
        );
    }

    #[test]
    fn test_force_ssl_http_block_only_redirects() {
        let mut spec = basic();
        spec.force_ssl = true;
        spec.ssl = true;
        spec.extra_config = Some("proxy_read_timeout 300s;".to_string());
        spec.firewall = Some(FirewallConfig {
            ip_rules: vec![IpRule::deny("10.0.0.0/8")],
            block_rules: Some(BlockRules {
                paths: vec!["^/private".to_string()],
                ..Default::default()
            }),
            ..Default::default()
        });
        let mut record = site(spec);
        record.cert_issue_status = Some(CertIssueStatus::Valid);
        let text = renderer().render(&record).unwrap();

        let http = http_block(&text);
        assert!(http.contains("return 301 https://$host$request_uri;"));
        assert!(!http.contains("proxy_pass"));
        assert!(!http.contains("proxy_read_timeout"));
        assert!(!http.contains("deny 10.0.0.0/8;"));
        assert!(!http.contains("^/private"));

        // the HTTPS block carries the proxying
        let https = &text[text.find("listen 443 ssl;").unwrap()..];
        assert!(https.contains("proxy_pass $upstream_endpoint;"));
        assert!(https.contains("deny 10.0.0.0/8;"));
        assert!(https.contains("proxy_read_timeout 300s;"));
        assert!(https.contains("location ~ \"^/private\""));
    }

    #[test]
    fn test_acme_challenge_always_present() {
        for (ssl, force_ssl) in [(false, false), (true, false), (false, true), (true, true)] {
            let mut spec = basic();
            spec.ssl = ssl;
            spec.force_ssl = force_ssl;
            let text = renderer().render(&site(spec)).unwrap();
            let http = http_block(&text);
            assert!(http.contains("location /.well-known/acme-challenge/ {"));
            assert!(http.contains("root /var/www/hubfly;"));
        }
    }

    #[test]
    fn test_https_only_after_issuance() {
        let mut spec = basic();
        spec.ssl = true;
        let mut record = site(spec);

        let pending = renderer().render(&record).unwrap();
        assert!(!pending.contains("listen 443"));

        record.cert_issue_status = Some(CertIssueStatus::Valid);
        let issued = renderer().render(&record).unwrap();
        assert!(issued.contains("listen 443 ssl;"));
        assert!(issued.contains("ssl_certificate /etc/letsencrypt/live/a.test/fullchain.pem;"));
        assert!(issued.contains("ssl_certificate_key /etc/letsencrypt/live/a.test/privkey.pem;"));

        // explicit override is honored either way
        assert!(!renderer()
            .render_with_tls(&record, false)
            .unwrap()
            .contains("listen 443"));
    }

    #[test]
    fn test_extra_config_is_last_in_location() {
        let mut spec = basic();
        spec.templates = vec!["security-headers".to_string()];
        spec.extra_config = Some("add_header X-Frame-Options \"DENY\" always;".to_string());
        let text = renderer().render(&site(spec)).unwrap();

        let location = &text[text.find("location / {").unwrap()..];
        let location = &location[..location.find("\n    }").unwrap()];
        assert!(location
            .trim_end()
            .ends_with("add_header X-Frame-Options \"DENY\" always;"));
    }

    #[test]
    fn test_http_fragments_at_top_level() {
        let mut spec = basic();
        spec.templates = vec!["caching".to_string()];
        let text = renderer().render(&site(spec)).unwrap();
        let first_server = text.find("server {").unwrap();
        let cache_path = text.find("proxy_cache_path").unwrap();
        assert!(cache_path < first_server);
    }

    #[test]
    fn test_upstream_scheme_is_kept() {
        let mut spec = basic();
        spec.upstreams = vec!["https://backend.internal:8443".to_string()];
        let text = renderer().render(&site(spec)).unwrap();
        assert!(text.contains("set $upstream_endpoint \"https://backend.internal:8443\";"));
    }
}

use std::collections::HashSet;

use hubfly_model::{Protocol, Stream};

use super::{ConfWriter, RenderError};

/// What the listener on one port should look like
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamPlan {
    /// No streams left; the port's artifact goes away
    Remove,
    /// A single stream without a server name: plain pass-through
    Direct {
        port: u16,
        protocol: Protocol,
        upstream: String,
    },
    /// Route by TLS client-hello server name without terminating TLS
    Sni {
        port: u16,
        routes: Vec<(String, String)>,
        default: Option<String>,
    },
}

/// Decide the listener for `port` from every stream assigned to it
pub fn plan_port(port: u16, streams: &[Stream]) -> Result<StreamPlan, RenderError> {
    if let Some(foreign) = streams.iter().find(|s| s.listen_port != port) {
        return Err(RenderError::ForeignStream {
            id: foreign.id.clone(),
            port,
            found: foreign.listen_port,
        });
    }

    let mut ordered: Vec<&Stream> = streams.iter().collect();
    ordered.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

    let Some(first) = ordered.first() else {
        return Ok(StreamPlan::Remove);
    };

    let protocol = first.protocol;
    if ordered.iter().any(|s| s.protocol != protocol) {
        return Err(RenderError::MixedProtocols { port });
    }

    if ordered.len() == 1 && first.domain.is_none() {
        return Ok(StreamPlan::Direct {
            port,
            protocol,
            upstream: first.upstream.clone(),
        });
    }

    if protocol == Protocol::Udp {
        return Err(RenderError::SniOverUdp { port });
    }

    let mut seen = HashSet::new();
    let mut routes = Vec::new();
    let mut default = None;
    for stream in ordered {
        match &stream.domain {
            Some(domain) => {
                if !seen.insert(domain.as_str()) {
                    return Err(RenderError::DuplicateServerName {
                        port,
                        domain: domain.clone(),
                    });
                }
                routes.push((domain.clone(), stream.upstream.clone()));
            }
            None if default.is_none() => default = Some(stream.upstream.clone()),
            None => {
                tracing::warn!(
                    port,
                    stream = %stream.id,
                    "Stream has no server name and the port already has a default route; it receives no traffic"
                );
            }
        }
    }

    Ok(StreamPlan::Sni {
        port,
        routes,
        default,
    })
}

impl StreamPlan {
    /// Artifact text, or `None` when the artifact should be removed
    pub fn render(&self) -> Option<String> {
        let mut w = ConfWriter::new();
        match self {
            Self::Remove => return None,
            Self::Direct {
                port,
                protocol,
                upstream,
            } => {
                w.line(&format!("# hubfly stream port {}", port));
                w.open("server");
                match protocol {
                    Protocol::Tcp => w.line(&format!("listen {};", port)),
                    Protocol::Udp => w.line(&format!("listen {} udp;", port)),
                }
                w.line(&format!("proxy_pass {};", upstream));
                w.close();
            }
            Self::Sni {
                port,
                routes,
                default,
            } => {
                let variable = format!("$hubfly_stream_{}", port);
                w.line(&format!("# hubfly stream port {}", port));
                w.open(&format!("map $ssl_preread_server_name {}", variable));
                for (domain, upstream) in routes {
                    w.line(&format!("{} {};", domain, upstream));
                }
                if let Some(upstream) = default {
                    w.line(&format!("default {};", upstream));
                }
                w.close();
                w.blank();
                w.open("server");
                w.line(&format!("listen {};", port));
                w.line("ssl_preread on;");
                w.line(&format!("proxy_pass {};", variable));
                w.close();
            }
        }
        Some(w.finish())
    }
}

/// Plan and render in one step
pub fn render_port(port: u16, streams: &[Stream]) -> Result<Option<String>, RenderError> {
    Ok(plan_port(port, streams)?.render())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use hubfly_model::StreamSpec;

    fn stream(id: &str, order: i64, upstream: &str, domain: Option<&str>) -> Stream {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(order);
        Stream::from_spec(
            StreamSpec {
                upstream: upstream.to_string(),
                domain: domain.map(str::to_string),
                ..Default::default()
            },
            id.to_string(),
            30001,
            created,
        )
        .unwrap()
    }

    #[test]
    fn test_empty_port_is_removed() {
        assert_eq!(plan_port(30001, &[]).unwrap(), StreamPlan::Remove);
        assert_eq!(render_port(30001, &[]).unwrap(), None);
    }

    #[test]
    fn test_single_stream_is_direct() {
        let text = render_port(30001, &[stream("db", 0, "10.0.0.2:5432", None)])
            .unwrap()
            .unwrap();
        assert_eq!(
            text,
            "# hubfly stream port 30001\nserver {\n    listen 30001;\n    proxy_pass 10.0.0.2:5432;\n}\n"
        );
    }

    #[test]
    fn test_udp_listener() {
        let mut dns = stream("dns", 0, "10.0.0.53:53", None);
        dns.protocol = Protocol::Udp;
        let text = render_port(30001, &[dns]).unwrap().unwrap();
        assert!(text.contains("listen 30001 udp;"));
    }

    #[test]
    fn test_single_stream_with_domain_uses_sni() {
        let plan = plan_port(30001, &[stream("a", 0, "10.0.0.2:443", Some("a.test"))]).unwrap();
        assert!(matches!(plan, StreamPlan::Sni { .. }));
    }

    #[test]
    fn test_sni_map_and_default() {
        // listed out of creation order on purpose
        let streams = vec![
            stream("b", 2, "10.0.0.3:443", Some("b.test")),
            stream("fallback", 1, "10.0.0.9:443", None),
            stream("a", 0, "10.0.0.2:443", Some("a.test")),
            stream("late", 3, "10.0.0.8:443", None),
        ];
        let text = render_port(30001, &streams).unwrap().unwrap();
        assert_eq!(
            text,
            "# hubfly stream port 30001\n\
             map $ssl_preread_server_name $hubfly_stream_30001 {\n    \
                 a.test 10.0.0.2:443;\n    \
                 b.test 10.0.0.3:443;\n    \
                 default 10.0.0.9:443;\n\
             }\n\
             \n\
             server {\n    \
                 listen 30001;\n    \
                 ssl_preread on;\n    \
                 proxy_pass $hubfly_stream_30001;\n\
             }\n"
        );
    }

    #[test]
    fn test_mixed_protocols_rejected() {
        let a = stream("a", 0, "10.0.0.2:443", None);
        let mut b = stream("b", 1, "10.0.0.3:443", None);
        b.protocol = Protocol::Udp;
        assert!(matches!(
            plan_port(30001, &[a, b]),
            Err(RenderError::MixedProtocols { port: 30001 })
        ));
    }

    #[test]
    fn test_duplicate_server_name_rejected() {
        let streams = vec![
            stream("a", 0, "10.0.0.2:443", Some("a.test")),
            stream("a2", 1, "10.0.0.3:443", Some("a.test")),
        ];
        assert!(matches!(
            plan_port(30001, &streams),
            Err(RenderError::DuplicateServerName { .. })
        ));
    }

    #[test]
    fn test_stream_from_another_port_rejected() {
        let mut other = stream("x", 0, "10.0.0.2:443", None);
        other.listen_port = 30002;
        assert!(matches!(
            plan_port(30001, &[other]),
            Err(RenderError::ForeignStream { found: 30002, .. })
        ));
    }
}

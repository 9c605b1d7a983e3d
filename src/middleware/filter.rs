//! Access-control filter
//!
//! Rejects requests with 503 by client address range or user agent.

use super::Handler;
use crate::body::ProxyBody;
use crate::error::text_response;
use crate::proxy::ConnectionInfo;
use hyper::header::USER_AGENT;
use hyper::{Request, Response, StatusCode};
use regex::Regex;
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RuleConfig {
    #[serde(default)]
    pub allow_from: Vec<String>,
    #[serde(default)]
    pub deny_from: Vec<String>,
    #[serde(default)]
    pub deny_user_agents: Vec<String>,
}

/// An address range in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    ip: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// Parse `addr/prefix`; a bare address is a single-host range
    pub fn parse(s: &str) -> Result<Self, String> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };

        let ip: IpAddr = addr
            .trim()
            .parse()
            .map_err(|_| format!("invalid CIDR address {:?}", s))?;
        let max = if ip.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p
                .trim()
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max)
                .ok_or_else(|| format!("invalid CIDR prefix {:?}", s))?,
            None => max,
        };

        Ok(Self { ip, prefix })
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.ip, addr.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    !0u32 << (32 - self.prefix)
                };
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    !0u128 << (128 - self.prefix)
                };
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        }
    }
}

#[derive(Debug)]
struct Rule {
    allow_from: Vec<Cidr>,
    deny_from: Vec<Cidr>,
    deny_user_agents: Vec<Regex>,
}

/// Access-control filter middleware
#[derive(Debug)]
pub struct Filter {
    rules: Vec<Rule>,
}

impl Filter {
    pub fn new(config: FilterConfig) -> Result<Self, String> {
        let mut rules = Vec::with_capacity(config.rules.len());
        for rule in config.rules {
            let allow_from = rule
                .allow_from
                .iter()
                .map(|s| Cidr::parse(s))
                .collect::<Result<Vec<_>, _>>()?;
            let deny_from = rule
                .deny_from
                .iter()
                .map(|s| Cidr::parse(s))
                .collect::<Result<Vec<_>, _>>()?;
            let deny_user_agents = rule
                .deny_user_agents
                .iter()
                .map(|p| Regex::new(p).map_err(|e| format!("invalid user agent pattern {:?}: {}", p, e)))
                .collect::<Result<Vec<_>, _>>()?;

            rules.push(Rule {
                allow_from,
                deny_from,
                deny_user_agents,
            });
        }

        if rules.is_empty() {
            debug!("Filter middleware configured without rules");
        }
        Ok(Self { rules })
    }

    pub(crate) async fn call(&self, req: Request<ProxyBody>, next: Arc<dyn Handler>) -> Response<ProxyBody> {
        let Some(addr) = req
            .extensions()
            .get::<ConnectionInfo>()
            .and_then(|info| info.remote_addr)
            .map(|addr| addr.ip())
        else {
            warn!("Cannot determine remote address, rejecting request");
            return unavailable();
        };

        let user_agent = req
            .headers()
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if self.is_user_agent_denied(user_agent) || self.is_ip_denied(addr) || !self.is_ip_allowed(addr) {
            debug!(remote_addr = %addr, user_agent, "Request rejected by filter");
            return unavailable();
        }

        next.handle(req).await
    }

    fn is_user_agent_denied(&self, user_agent: &str) -> bool {
        self.rules
            .iter()
            .flat_map(|rule| &rule.deny_user_agents)
            .any(|pattern| pattern.is_match(user_agent))
    }

    fn is_ip_denied(&self, addr: IpAddr) -> bool {
        self.rules
            .iter()
            .flat_map(|rule| &rule.deny_from)
            .any(|net| net.contains(addr))
    }

    fn is_ip_allowed(&self, addr: IpAddr) -> bool {
        let mut allow = self.rules.iter().flat_map(|rule| &rule.allow_from).peekable();
        if allow.peek().is_none() {
            return true;
        }
        allow.any(|net| net.contains(addr))
    }
}

fn unavailable() -> Response<ProxyBody> {
    text_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{empty, full};
    use crate::middleware::handler_fn;

    fn filter(rules: Vec<RuleConfig>) -> Filter {
        Filter::new(FilterConfig { rules }).unwrap()
    }

    fn deny_from(cidrs: &[&str]) -> RuleConfig {
        RuleConfig {
            deny_from: cidrs.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn allow_from(cidrs: &[&str]) -> RuleConfig {
        RuleConfig {
            allow_from: cidrs.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn request(remote: Option<&str>, user_agent: Option<&str>) -> Request<ProxyBody> {
        let mut builder = Request::builder().uri("/");
        if let Some(ua) = user_agent {
            builder = builder.header(USER_AGENT, ua);
        }
        let mut req = builder.body(empty()).unwrap();
        req.extensions_mut().insert(ConnectionInfo {
            remote_addr: remote.map(|r| r.parse().unwrap()),
            tls: false,
        });
        req
    }

    async fn status(filter: &Filter, req: Request<ProxyBody>) -> StatusCode {
        let next = handler_fn(|_req| async { Response::new(full("passed")) });
        filter.call(req, next).await.status()
    }

    #[test]
    fn test_cidr_parse() {
        assert!(Cidr::parse("10.0.0.0/8").is_ok());
        assert!(Cidr::parse("2001:db8::/32").is_ok());
        assert_eq!(Cidr::parse("127.0.0.1").unwrap(), Cidr::parse("127.0.0.1/32").unwrap());
        assert!(Cidr::parse("10.0.0.0/33").is_err());
        assert!(Cidr::parse("::1/129").is_err());
        assert!(Cidr::parse("localhost/8").is_err());
        assert!(Cidr::parse("10.0.0.0/x").is_err());
    }

    #[test]
    fn test_cidr_contains() {
        let net = Cidr::parse("192.168.0.0/16").unwrap();
        assert!(net.contains("192.168.44.1".parse().unwrap()));
        assert!(!net.contains("192.169.0.1".parse().unwrap()));
        assert!(!net.contains("::1".parse().unwrap()));

        let any = Cidr::parse("0.0.0.0/0").unwrap();
        assert!(any.contains("8.8.8.8".parse().unwrap()));

        let v6 = Cidr::parse("2001:db8::/32").unwrap();
        assert!(v6.contains("2001:db8:1::5".parse().unwrap()));
        assert!(!v6.contains("2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn test_cidr_contains_mapped_v4() {
        let net = Cidr::parse("127.0.0.2/32").unwrap();
        assert!(net.contains("::ffff:127.0.0.2".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_deny_from() {
        let f = filter(vec![deny_from(&["127.0.0.2/32"])]);
        assert_eq!(
            status(&f, request(Some("127.0.0.2:5555"), None)).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status(&f, request(Some("127.0.0.1:5555"), None)).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_allow_from_across_rules() {
        let f = filter(vec![allow_from(&["10.0.0.0/8"]), allow_from(&["192.168.1.0/24"])]);
        assert_eq!(status(&f, request(Some("10.1.2.3:1"), None)).await, StatusCode::OK);
        assert_eq!(status(&f, request(Some("192.168.1.9:1"), None)).await, StatusCode::OK);
        assert_eq!(
            status(&f, request(Some("172.16.0.1:1"), None)).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_deny_wins_over_allow() {
        let f = filter(vec![RuleConfig {
            allow_from: vec!["10.0.0.0/8".to_string()],
            deny_from: vec!["10.0.0.5/32".to_string()],
            ..Default::default()
        }]);
        assert_eq!(status(&f, request(Some("10.0.0.4:1"), None)).await, StatusCode::OK);
        assert_eq!(
            status(&f, request(Some("10.0.0.5:1"), None)).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_deny_user_agents() {
        let f = filter(vec![RuleConfig {
            deny_user_agents: vec!["(?i)curl/.*".to_string(), "^BadBot$".to_string()],
            ..Default::default()
        }]);
        assert_eq!(
            status(&f, request(Some("1.2.3.4:1"), Some("curl/8.1.2"))).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status(&f, request(Some("1.2.3.4:1"), Some("BadBot"))).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status(&f, request(Some("1.2.3.4:1"), Some("Mozilla/5.0"))).await,
            StatusCode::OK
        );
        assert_eq!(status(&f, request(Some("1.2.3.4:1"), None)).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_remote_address_rejected() {
        let f = filter(vec![]);
        assert_eq!(status(&f, request(None, None)).await, StatusCode::SERVICE_UNAVAILABLE);

        let bare = Request::builder().uri("/").body(empty()).unwrap();
        assert_eq!(status(&f, bare).await, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_invalid_config() {
        assert!(Filter::new(FilterConfig {
            rules: vec![deny_from(&["300.0.0.1/8"])]
        })
        .is_err());
        assert!(Filter::new(FilterConfig {
            rules: vec![RuleConfig {
                deny_user_agents: vec!["(unclosed".to_string()],
                ..Default::default()
            }]
        })
        .is_err());
    }
}

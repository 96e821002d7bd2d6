//! Hostname to tunnel endpoint mapping.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRule {
    /// Exact host, or a wildcard (`*.example.com` / `.example.com`).
    pub hostname: String,
    /// Tunnel id (string form) the host is routed to.
    pub endpoint: String,
}

impl IngressRule {
    pub fn new(hostname: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
pub trait Ingress: Send + Sync {
    async fn get_rule(&self, host: &str) -> Option<IngressRule>;
    /// Returns `false` if the ingress does not accept dynamic rules.
    async fn set_rule(&self, rule: IngressRule) -> bool;
}

#[async_trait]
impl<I: Ingress + ?Sized> Ingress for Arc<I> {
    async fn get_rule(&self, host: &str) -> Option<IngressRule> {
        (**self).get_rule(host).await
    }

    async fn set_rule(&self, rule: IngressRule) -> bool {
        (**self).set_rule(rule).await
    }
}

fn normalize(host: &str) -> String {
    let host = crate::net::host_of(host);
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    if let Some(rest) = host.strip_prefix("*.") {
        format!(".{rest}")
    } else {
        host
    }
}

/// In-process rule table.
///
/// Lookups try the exact host first, then each parent wildcard from the most
/// specific one outwards (`a.b.example.com` tries `.b.example.com`, then
/// `.example.com`, then `.com`).
#[derive(Debug, Default)]
pub struct StaticIngress {
    rules: RwLock<HashMap<String, String>>,
}

impl StaticIngress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: impl IntoIterator<Item = IngressRule>) -> Self {
        let ing = Self::new();
        {
            let mut map = ing.rules.write();
            for r in rules {
                map.insert(normalize(&r.hostname), r.endpoint);
            }
        }
        ing
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }
}

#[async_trait]
impl Ingress for StaticIngress {
    async fn get_rule(&self, host: &str) -> Option<IngressRule> {
        let host = normalize(host);
        if host.is_empty() {
            return None;
        }
        let map = self.rules.read();
        if let Some(ep) = map.get(&host) {
            return Some(IngressRule::new(host.clone(), ep.clone()));
        }
        let mut rest = host.as_str();
        // Apex also matches its own wildcard.
        let apex = format!(".{rest}");
        if let Some(ep) = map.get(&apex) {
            return Some(IngressRule::new(apex, ep.clone()));
        }
        while let Some(idx) = rest.find('.') {
            let suffix = &rest[idx..];
            if let Some(ep) = map.get(suffix) {
                return Some(IngressRule::new(suffix.to_string(), ep.clone()));
            }
            rest = &rest[idx + 1..];
        }
        None
    }

    async fn set_rule(&self, rule: IngressRule) -> bool {
        let host = normalize(&rule.hostname);
        if host.is_empty() {
            return false;
        }
        self.rules.write().insert(host, rule.endpoint);
        true
    }
}

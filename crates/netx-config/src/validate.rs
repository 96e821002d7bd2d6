//! Configuration validation logic.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use netx_core::net::split_host_port;
use netx_selector::StrategyKind;

use crate::loader::ConfigError;
use crate::types::*;

const HANDLER_TYPES: &[&str] = &["relay", "tunnel", "forward"];
const LISTENER_TYPES: &[&str] = &["tcp", "tls", "rtcp", "rudp"];
const CONNECTOR_TYPES: &[&str] = &["relay", "tunnel", "forward"];
const DIALER_TYPES: &[&str] = &["tcp", "tls"];
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

/// Names of one section; rejects empty and duplicate names.
fn names<'a, T>(
    section: &str,
    items: &'a [T],
    name: impl Fn(&'a T) -> &'a str,
) -> Result<HashSet<&'a str>, ConfigError> {
    let mut seen = HashSet::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let n = name(item);
        if n.trim().is_empty() {
            return Err(invalid(format!("{section}[{i}].name is empty")));
        }
        if !seen.insert(n) {
            return Err(invalid(format!("{section}: duplicate name {n:?}")));
        }
    }
    Ok(seen)
}

struct Refs<'a> {
    chains: HashSet<&'a str>,
    hops: HashSet<&'a str>,
    authers: HashSet<&'a str>,
    bypasses: HashSet<&'a str>,
    resolvers: HashSet<&'a str>,
    hosts: HashSet<&'a str>,
    ingresses: HashSet<&'a str>,
    sds: HashSet<&'a str>,
    limiters: HashSet<&'a str>,
    rlimiters: HashSet<&'a str>,
}

fn check_ref(
    kind: &str,
    known: &HashSet<&str>,
    name: Option<&String>,
    owner: &str,
) -> Result<(), ConfigError> {
    match name {
        Some(n) if !known.contains(n.as_str()) => {
            Err(invalid(format!("{owner}: unknown {kind} {n:?}")))
        }
        _ => Ok(()),
    }
}

fn check_addr(addr: &str, owner: &str) -> Result<(), ConfigError> {
    split_host_port(addr)
        .map(|_| ())
        .map_err(|e| invalid(format!("{owner}: {e}")))
}

fn check_kind(kind: &str, allowed: &[&str], owner: &str) -> Result<(), ConfigError> {
    if allowed.contains(&kind) {
        Ok(())
    } else {
        Err(invalid(format!(
            "{owner}: type {kind:?} must be one of {allowed:?}"
        )))
    }
}

fn check_selector(sel: Option<&SelectorConfig>, owner: &str) -> Result<(), ConfigError> {
    if let Some(sel) = sel {
        sel.strategy
            .parse::<StrategyKind>()
            .map_err(|e| invalid(format!("{owner}: {e}")))?;
    }
    Ok(())
}

fn check_tls(tls: Option<&TlsConfig>, owner: &str) -> Result<(), ConfigError> {
    if let Some(tls) = tls
        && tls.cert_file.is_some() != tls.key_file.is_some()
    {
        return Err(invalid(format!(
            "{owner}: tls.certFile and tls.keyFile must be set together"
        )));
    }
    Ok(())
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    names("services", &config.services, |s| s.name.as_str())?;
    let refs = Refs {
        chains: names("chains", &config.chains, |c| c.name.as_str())?,
        hops: names("hops", &config.hops, |h| h.name.as_str())?,
        authers: names("authers", &config.authers, |a| a.name.as_str())?,
        bypasses: names("bypasses", &config.bypasses, |b| b.name.as_str())?,
        resolvers: names("resolvers", &config.resolvers, |r| r.name.as_str())?,
        hosts: names("hosts", &config.hosts, |h| h.name.as_str())?,
        ingresses: names("ingresses", &config.ingresses, |i| i.name.as_str())?,
        sds: names("sds", &config.sds, |s| s.name.as_str())?,
        limiters: names("limiters", &config.limiters, |l| l.name.as_str())?,
        rlimiters: names("rlimiters", &config.rlimiters, |r| r.name.as_str())?,
    };

    for svc in &config.services {
        validate_service(svc, &refs)?;
    }
    for hop in &config.hops {
        if hop.is_reference() {
            return Err(invalid(format!(
                "hop {:?}: no nodes, file or http loader",
                hop.name
            )));
        }
        validate_hop(hop, &refs, &format!("hop {:?}", hop.name))?;
    }
    for chain in &config.chains {
        let owner = format!("chain {:?}", chain.name);
        if chain.hops.is_empty() {
            return Err(invalid(format!("{owner}: no hops")));
        }
        for hop in &chain.hops {
            if hop.is_reference() {
                if !refs.hops.contains(hop.name.as_str()) {
                    return Err(invalid(format!("{owner}: unknown hop {:?}", hop.name)));
                }
            } else {
                validate_hop(hop, &refs, &format!("{owner} hop {:?}", hop.name))?;
            }
        }
    }

    for b in &config.bypasses {
        if b.matchers.iter().any(|m| m.trim().is_empty()) {
            return Err(invalid(format!("bypass {:?}: empty matcher", b.name)));
        }
    }
    for h in &config.hosts {
        for m in &h.mappings {
            if m.ip.parse::<IpAddr>().is_err() {
                return Err(invalid(format!("hosts {:?}: invalid ip {:?}", h.name, m.ip)));
            }
        }
    }
    for ing in &config.ingresses {
        for r in &ing.rules {
            if r.hostname.trim().is_empty() || r.endpoint.trim().is_empty() {
                return Err(invalid(format!(
                    "ingress {:?}: rules need hostname and endpoint",
                    ing.name
                )));
            }
        }
    }
    for sd in &config.sds {
        check_kind(&sd.kind, &["memory"], &format!("sd {:?}", sd.name))?;
    }
    for rl in &config.rlimiters {
        if rl.rate == 0 {
            return Err(invalid(format!("rlimiter {:?}: rate must be > 0", rl.name)));
        }
    }

    if let Some(level) = &config.log.level
        && !LOG_LEVELS.contains(&level.to_ascii_lowercase().as_str())
    {
        return Err(invalid(format!("log.level must be one of {LOG_LEVELS:?}")));
    }
    if let Some(m) = &config.metrics
        && m.addr.parse::<SocketAddr>().is_err()
    {
        return Err(invalid(format!("metrics.addr {:?} is not ip:port", m.addr)));
    }
    Ok(())
}

fn validate_service(svc: &ServiceConfig, refs: &Refs<'_>) -> Result<(), ConfigError> {
    let owner = format!("service {:?}", svc.name);
    check_addr(&svc.addr, &owner)?;
    check_kind(&svc.handler.kind, HANDLER_TYPES, &format!("{owner} handler"))?;
    check_kind(&svc.listener.kind, LISTENER_TYPES, &format!("{owner} listener"))?;
    check_tls(svc.listener.tls.as_ref(), &owner)?;

    check_ref("chain", &refs.chains, svc.handler.chain.as_ref(), &owner)?;
    check_ref("chain", &refs.chains, svc.listener.chain.as_ref(), &owner)?;
    if let Some(group) = &svc.handler.chain_group {
        if svc.handler.chain.is_some() {
            return Err(invalid(format!("{owner}: chain and chainGroup are exclusive")));
        }
        if group.chains.is_empty() {
            return Err(invalid(format!("{owner}: empty chainGroup")));
        }
        for c in &group.chains {
            check_ref("chain", &refs.chains, Some(c), &owner)?;
        }
        check_selector(group.selector.as_ref(), &owner)?;
    }
    check_ref("auther", &refs.authers, svc.handler.auther.as_ref(), &owner)?;
    check_ref("ingress", &refs.ingresses, svc.handler.ingress.as_ref(), &owner)?;
    check_ref("sd", &refs.sds, svc.handler.sd.as_ref(), &owner)?;
    check_ref("bypass", &refs.bypasses, svc.bypass.as_ref(), &owner)?;
    check_ref("resolver", &refs.resolvers, svc.resolver.as_ref(), &owner)?;
    check_ref("hosts", &refs.hosts, svc.hosts.as_ref(), &owner)?;
    check_ref("limiter", &refs.limiters, svc.limiter.as_ref(), &owner)?;
    check_ref("rlimiter", &refs.rlimiters, svc.rlimiter.as_ref(), &owner)?;

    if svc.max_connections == Some(0) {
        return Err(invalid(format!("{owner}: maxConnections must be > 0")));
    }

    match &svc.forwarder {
        Some(fwd) => {
            if fwd.nodes.is_empty() {
                return Err(invalid(format!("{owner}: forwarder has no nodes")));
            }
            check_selector(fwd.selector.as_ref(), &owner)?;
            for n in &fwd.nodes {
                check_addr(&n.addr, &format!("{owner} forward node {:?}", n.name))?;
                check_ref("bypass", &refs.bypasses, n.bypass.as_ref(), &owner)?;
            }
        }
        None if svc.handler.kind == "forward" => {
            return Err(invalid(format!("{owner}: forward handler needs a forwarder")));
        }
        None => {}
    }
    Ok(())
}

fn validate_hop(hop: &HopConfig, refs: &Refs<'_>, owner: &str) -> Result<(), ConfigError> {
    check_selector(hop.selector.as_ref(), owner)?;
    check_ref("bypass", &refs.bypasses, hop.bypass.as_ref(), owner)?;
    check_ref("resolver", &refs.resolvers, hop.resolver.as_ref(), owner)?;
    check_ref("hosts", &refs.hosts, hop.hosts.as_ref(), owner)?;
    if let Some(http) = &hop.http
        && !(http.url.starts_with("http://") || http.url.starts_with("https://"))
    {
        return Err(invalid(format!("{owner}: http loader url must be http(s)")));
    }
    let mut seen = HashSet::new();
    for node in &hop.nodes {
        let node_owner = format!("{owner} node {:?}", node.name);
        if node.name.trim().is_empty() {
            return Err(invalid(format!("{owner}: node with empty name")));
        }
        if !seen.insert(node.name.as_str()) {
            return Err(invalid(format!("{owner}: duplicate node {:?}", node.name)));
        }
        validate_node(node, refs, &node_owner)?;
    }
    Ok(())
}

/// Node checks shared by inline hops and dynamically loaded node lists.
pub fn validate_node_shape(node: &NodeConfig, owner: &str) -> Result<(), ConfigError> {
    check_addr(&node.addr, owner)?;
    check_kind(&node.connector.kind, CONNECTOR_TYPES, &format!("{owner} connector"))?;
    check_kind(&node.dialer.kind, DIALER_TYPES, &format!("{owner} dialer"))?;
    check_tls(node.dialer.tls.as_ref(), owner)?;
    if node.connector.kind == "tunnel" && node.connector.metadata.get_string("tunnel.id").is_empty() {
        return Err(invalid(format!("{owner}: tunnel connector needs metadata tunnel.id")));
    }
    Ok(())
}

fn validate_node(node: &NodeConfig, refs: &Refs<'_>, owner: &str) -> Result<(), ConfigError> {
    validate_node_shape(node, owner)?;
    check_ref("bypass", &refs.bypasses, node.bypass.as_ref(), owner)?;
    check_ref("resolver", &refs.resolvers, node.resolver.as_ref(), owner)?;
    check_ref("hosts", &refs.hosts, node.hosts.as_ref(), owner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn err(yaml: &str) -> String {
        match validate_config(&parse(yaml)) {
            Err(ConfigError::Validation(msg)) => msg,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    const GOOD: &str = r#"
services:
  - name: relay
    addr: ":8420"
    bypass: lan
    handler:
      chain: out
      auther: users
chains:
  - name: out
    hops:
      - name: h0
hops:
  - name: h0
    selector:
      strategy: fifo
    nodes:
      - name: n0
        addr: relay.example.com:443
        dialer:
          type: tls
authers:
  - name: users
    auths:
      - username: alice
        password: secret
bypasses:
  - name: lan
    matchers: ["10.0.0.0/8", "*.local"]
metrics:
  addr: 127.0.0.1:9100
"#;

    #[test]
    fn accepts_complete_document() {
        validate_config(&parse(GOOD)).unwrap();
    }

    #[test]
    fn rejects_duplicate_names() {
        let msg = err(r#"
services:
  - {name: a, addr: ":1"}
  - {name: a, addr: ":2"}
"#);
        assert!(msg.contains("duplicate"), "{msg}");
    }

    #[test]
    fn rejects_empty_name() {
        assert!(err("bypasses:\n  - name: \"\"\n").contains("name is empty"));
    }

    #[test]
    fn rejects_dangling_references() {
        let msg = err(r#"
services:
  - name: a
    addr: ":1"
    handler:
      chain: missing
"#);
        assert!(msg.contains("unknown chain"), "{msg}");

        let msg = err(r#"
chains:
  - name: c
    hops:
      - name: nowhere
"#);
        assert!(msg.contains("unknown hop"), "{msg}");
    }

    #[test]
    fn rejects_bad_strategy() {
        let msg = err(r#"
hops:
  - name: h
    selector:
      strategy: least-conn
    nodes:
      - {name: n, addr: "1.2.3.4:1"}
"#);
        assert!(msg.contains("strategy"), "{msg}");
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(err("services:\n  - {name: a, addr: \"no-port\"}\n").contains("port"));
        let msg = err(r#"
hops:
  - name: h
    nodes:
      - {name: n, addr: "10.0.0.1:http"}
"#);
        assert!(msg.contains("port"), "{msg}");
    }

    #[test]
    fn forward_handler_needs_targets() {
        let msg = err(r#"
services:
  - name: f
    addr: ":1"
    handler: {type: forward}
"#);
        assert!(msg.contains("forwarder"), "{msg}");
    }

    #[test]
    fn tunnel_connector_needs_id() {
        let msg = err(r#"
hops:
  - name: h
    nodes:
      - name: n
        addr: "10.0.0.1:8421"
        connector: {type: tunnel}
"#);
        assert!(msg.contains("tunnel.id"), "{msg}");
    }

    #[test]
    fn rejects_unknown_types_and_levels() {
        assert!(err("services:\n  - {name: a, addr: \":1\", handler: {type: socks5}}\n").contains("type"));
        assert!(err("log:\n  level: loud\n").contains("log.level"));
        assert!(err("metrics:\n  addr: \":9100\"\n").contains("metrics.addr"));
    }
}

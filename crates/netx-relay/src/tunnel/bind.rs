use std::sync::Arc;

use netx_core::Conn;
use netx_core::ingress::IngressRule;
use netx_core::net::{join_host_port, split_host_port};
use netx_proto::{Address, ConnectorId, Feature, Response, Status, TunnelId, write_response};
use tracing::{debug, info, warn};

use super::pool::{Connector, lease_period};
use super::{TunnelHandler, TunnelRequest, rule_endpoint};
use crate::error::RelayError;
use crate::mux::{MuxSession, Session};

/// Stable host alias for a tunnel: the first 8 bytes of md5(id), in hex.
pub(crate) fn endpoint_alias(tid: &TunnelId) -> String {
    let digest = md5::compute(tid.to_string().as_bytes());
    hex::encode(&digest[..8])
}

impl TunnelHandler {
    pub(super) async fn handle_bind(&self, mut conn: Conn, treq: TunnelRequest) -> Result<(), RelayError> {
        let TunnelRequest {
            network,
            dst,
            tunnel,
            weight,
            ..
        } = treq;

        let cid = if network.is_udp() {
            ConnectorId::new_udp()
        } else {
            ConnectorId::new()
        }
        .with_weight(weight);

        let endpoint = endpoint_alias(&tunnel);
        let (host, addr) = match split_host_port(&dst) {
            Ok((host, port)) if host.is_empty() => (String::new(), join_host_port(&endpoint, port)),
            Ok((host, _)) => (host.to_string(), dst.clone()),
            Err(_) => (String::new(), dst.clone()),
        };

        let mut resp = Response::new(Status::Ok);
        match Address::parse(&addr) {
            Some(a) => resp = resp.with(Feature::Addr(a)),
            None => warn!(addr = %addr, "bind address is not host:port"),
        }
        resp = resp.with(Feature::Tunnel {
            id: cid.into_bytes(),
            weight: None,
        });
        write_response(&mut conn, &resp).await?;

        let session: Arc<dyn Session> = Arc::new(MuxSession::client(conn, &self.opts.mux));
        let mut connector = Connector::new(cid, tunnel, self.node.clone(), session.clone());
        if let Some(sd) = &self.sd {
            connector = connector.with_sd(sd.clone(), self.opts.entrypoint.clone());
        }
        let connector = Arc::new(connector);
        self.pool.add(tunnel, connector.clone(), self.opts.ttl);

        if let Some(ingress) = &self.ingress {
            let target = rule_endpoint(&tunnel);
            ingress.set_rule(IngressRule::new(endpoint.clone(), target.clone())).await;
            if !host.is_empty() {
                ingress.set_rule(IngressRule::new(host.clone(), target)).await;
            }
        }
        connector.register().await;

        info!(
            addr = %addr,
            network = %network,
            tunnel = %tunnel,
            connector = %cid,
            weight = cid.weight(),
            "tunnel established"
        );

        // The client never opens streams of its own; the session lives until
        // either side closes it, and the lease is renewed while it does.
        let mut lease = tokio::time::interval(lease_period(self.opts.ttl));
        lease.tick().await;
        loop {
            tokio::select! {
                res = session.accept() => match res {
                    Ok(stream) => drop(stream),
                    Err(_) => break,
                },
                _ = lease.tick() => {
                    if !self.pool.renew(&tunnel, cid, self.opts.ttl) {
                        debug!(tunnel = %tunnel, connector = %cid, "connector evicted");
                        break;
                    }
                }
            }
        }
        session.close();
        connector.deregister().await;
        debug!(tunnel = %tunnel, connector = %cid, "tunnel closed");
        Ok(())
    }
}

use netx_core::Conn;
use netx_core::net::host_of;
use netx_proto::{Address, Feature, Response, Status, TunnelId, write_request, write_response};
use tracing::{debug, warn};

use super::{TunnelHandler, TunnelRequest};
use crate::error::RelayError;
use crate::handler::{client_key, reply};

/// Response sent down a connector stream: who is calling and what for.
pub(crate) fn peer_response(src: &str, dst: &str) -> Response {
    let mut resp = Response::new(Status::Ok);
    for addr in [src, dst] {
        if let Some(a) = Address::parse(addr) {
            resp = resp.with(Feature::Addr(a));
        }
    }
    resp
}

impl TunnelHandler {
    pub(super) async fn handle_connect(&self, mut conn: Conn, treq: TunnelRequest) -> Result<(), RelayError> {
        let TunnelRequest {
            req,
            network,
            src,
            dst,
            tunnel,
            ctx,
            ..
        } = treq;

        if let Some(bypass) = &self.bypass
            && bypass.contains(network, &dst)
        {
            debug!(dst = %dst, "bypass");
            reply(&mut conn, Status::Forbidden).await;
            return Err(RelayError::Forbidden(dst));
        }

        if self
            .opts
            .entrypoint_id
            .is_some_and(|ep| ep.canonical() == tunnel.canonical())
        {
            write_response(&mut conn, &Response::new(Status::Ok)).await?;
            return self.entrypoint().handle(conn).await;
        }

        let host = host_of(&dst).to_string();
        if !self.opts.direct {
            let routed = match &self.ingress {
                Some(ingress) if !host.is_empty() => ingress
                    .get_rule(&host)
                    .await
                    .and_then(|r| r.endpoint.parse::<TunnelId>().ok()),
                _ => None,
            };
            if routed.is_none_or(|t| t.canonical() != tunnel.canonical()) {
                warn!(host = %host, tunnel = %tunnel, "no route to host");
                reply(&mut conn, Status::HostUnreachable).await;
                return Err(RelayError::NoRoute(host));
            }
        }

        let dialed = match self.dialer().dial(network, &tunnel).await {
            Ok(d) => d,
            Err(e) => {
                reply(&mut conn, Status::ServiceUnavailable).await;
                return Err(e);
            }
        };
        let mut cc = dialed.conn;
        debug!(
            tunnel = %tunnel,
            connector = ?dialed.connector.map(|c| c.to_string()),
            node = %dialed.node,
            "new connection to tunnel"
        );

        if dialed.node == self.node {
            write_response(&mut conn, &Response::new(Status::Ok)).await?;
            write_response(&mut cc, &peer_response(&src, &dst)).await?;
        } else {
            // The remote node answers the client itself.
            write_request(&mut cc, &req).await?;
        }

        let client = client_key(&conn, &ctx);
        self.pipe().run(conn, cc, &client).await
    }
}

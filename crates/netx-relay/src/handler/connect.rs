//! CONNECT: dial the requested target through the router.

use netx_core::Conn;
use netx_core::io::DatagramStream;
use netx_proto::{Response, Status};
use tracing::debug;

use super::{Parsed, RelayHandler, client_key, reply};
use crate::error::RelayError;
use crate::pipe::{Pipe, layered, respond};

impl RelayHandler {
    pub(super) async fn handle_connect(&self, mut conn: Conn, req: Parsed) -> Result<(), RelayError> {
        let Parsed {
            network,
            address,
            mut ctx,
        } = req;
        if address.is_empty() {
            reply(&mut conn, Status::BadRequest).await;
            return Err(RelayError::BadRequest("missing target address".into()));
        }
        if self.opts.hash == "host" {
            ctx = ctx.with_hash_source(address.clone());
        }
        if let Some(bypass) = &self.bypass
            && bypass.contains(network, &address)
        {
            debug!(dst = %address, "bypass");
            reply(&mut conn, Status::Forbidden).await;
            return Err(RelayError::Forbidden(address));
        }

        let upstream = match self.router.dial(&ctx, network, &address).await {
            Ok(c) => c,
            Err(e) => {
                reply(&mut conn, Status::HostUnreachable).await;
                return Err(e.into());
            }
        };
        debug!(network = %network, dst = %address, "connected");

        let mut conn = respond(conn, &Response::new(Status::Ok), self.opts.nodelay).await?;
        if network.is_udp() {
            conn = layered(conn, DatagramStream::new);
        }

        let client = client_key(&conn, &ctx);
        self.pipe().run(conn, upstream, &client).await
    }

    pub(super) fn pipe(&self) -> Pipe {
        Pipe {
            service: self.service.clone(),
            stats: self.stats.clone(),
            traffic: self.traffic_limiter.clone(),
            opts: self.opts.transport,
        }
    }
}

//! Static forwarding: the target comes from the handler's hop, not the
//! request.

use std::sync::Arc;

use netx_chain::{ChainError, Hop, HopSelection};
use netx_core::Conn;
use netx_core::io::DatagramStream;
use netx_proto::{Response, Status};
use netx_selector::Selectable;
use tracing::{debug, warn};

use super::{Parsed, RelayHandler, client_key, reply};
use crate::error::RelayError;
use crate::pipe::{layered, respond};

impl RelayHandler {
    pub(super) async fn handle_forward(
        &self,
        mut conn: Conn,
        hop: &Arc<Hop>,
        req: Parsed,
    ) -> Result<(), RelayError> {
        let Parsed {
            network,
            address,
            mut ctx,
        } = req;
        if self.opts.hash == "host" {
            ctx = ctx.with_hash_source(address.clone());
        }

        let target = match hop.select(&ctx, network, &address) {
            HopSelection::Node(node) => node,
            HopSelection::Bypass | HopSelection::Unavailable => {
                debug!(hop = %hop.name(), "no target available");
                reply(&mut conn, Status::ServiceUnavailable).await;
                return Err(ChainError::NodeUnavailable.into());
            }
        };
        debug!(node = %target.name, dst = %target.addr, "forward");

        let upstream = match self.router.dial(&ctx, network, &target.addr).await {
            Ok(c) => {
                if let Some(m) = target.marker() {
                    m.reset();
                }
                c
            }
            Err(e) => {
                if let Some(m) = target.marker() {
                    m.mark();
                }
                warn!(node = %target.name, dst = %target.addr, error = %e, "forward dial failed");
                reply(&mut conn, Status::HostUnreachable).await;
                return Err(e.into());
            }
        };

        let mut conn = respond(conn, &Response::new(Status::Ok), self.opts.nodelay).await?;
        if network.is_udp() {
            conn = layered(conn, DatagramStream::new);
        }

        let client = client_key(&conn, &ctx);
        self.pipe().run(conn, upstream, &client).await
    }
}

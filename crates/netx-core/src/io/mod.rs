//! I/O helpers shared by handlers and connectors.

mod framed;
mod limited;
mod transport;
mod udp_tun;

pub use framed::{DatagramStream, MAX_DATAGRAM_SIZE, PrefixedWriter};
pub use limited::LimitedStream;
pub use transport::{NoStats, TransferStats, TransportOptions, transport};
pub use udp_tun::{UdpTunConn, encode_frame as encode_udp_tun_frame};

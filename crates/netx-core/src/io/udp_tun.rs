//! UDP-over-stream tunnel framing.
//!
//! Frame layout (SOCKS5 UDP header with the reserved field reused as the
//! payload length):
//!
//! ```text
//! +-----+------+------+----------+----------+----------+
//! | LEN | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +-----+------+------+----------+----------+----------+
//! |  2  |  1   |  1   | Variable |    2     | Variable |
//! +-----+------+------+----------+----------+----------+
//! ```
//!
//! The address is the datagram's destination when sent towards the bound
//! endpoint and its source on the way back.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::net::{AsyncStream, PacketConn};

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// A [`PacketConn`] carried over a byte stream.
pub struct UdpTunConn<S: AsyncStream> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    local_addr: Option<SocketAddr>,
}

impl<S: AsyncStream> UdpTunConn<S> {
    pub fn new(stream: S, local_addr: Option<SocketAddr>) -> Self {
        let (r, w) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(r),
            writer: Mutex::new(w),
            local_addr,
        }
    }
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Encode one tunnel frame.
pub fn encode_frame(addr: SocketAddr, data: &[u8]) -> io::Result<BytesMut> {
    if data.len() > u16::MAX as usize {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "datagram too large"));
    }
    let mut buf = BytesMut::with_capacity(3 + 19 + data.len());
    buf.put_u16(data.len() as u16);
    buf.put_u8(0);
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16(addr.port());
    buf.put_slice(data);
    Ok(buf)
}

#[async_trait]
impl<S: AsyncStream> PacketConn for UdpTunConn<S> {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut r = self.reader.lock().await;
        let mut hdr = [0u8; 4];
        r.read_exact(&mut hdr).await?;
        let dlen = u16::from_be_bytes([hdr[0], hdr[1]]) as usize;
        if hdr[2] != 0 {
            return Err(invalid("fragmented udp frames are not supported"));
        }
        let addr = match hdr[3] {
            ATYP_IPV4 => {
                let mut b = [0u8; 6];
                r.read_exact(&mut b).await?;
                SocketAddr::new(
                    Ipv4Addr::new(b[0], b[1], b[2], b[3]).into(),
                    u16::from_be_bytes([b[4], b[5]]),
                )
            }
            ATYP_IPV6 => {
                let mut b = [0u8; 18];
                r.read_exact(&mut b).await?;
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&b[..16]);
                SocketAddr::new(Ipv6Addr::from(ip).into(), u16::from_be_bytes([b[16], b[17]]))
            }
            ATYP_DOMAIN => {
                let len = r.read_u8().await? as usize;
                let mut host = vec![0u8; len];
                r.read_exact(&mut host).await?;
                let port = r.read_u16().await?;
                let host = String::from_utf8(host).map_err(|_| invalid("bad domain"))?;
                tokio::net::lookup_host((host.as_str(), port))
                    .await?
                    .next()
                    .ok_or_else(|| invalid("domain resolved to no address"))?
            }
            _ => return Err(invalid("unknown address type")),
        };

        let mut data = vec![0u8; dlen];
        r.read_exact(&mut data).await?;
        let n = dlen.min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok((n, addr))
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let frame = encode_frame(target, buf)?;
        let mut w = self.writer.lock().await;
        w.write_all(&frame).await?;
        w.flush().await?;
        Ok(buf.len())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

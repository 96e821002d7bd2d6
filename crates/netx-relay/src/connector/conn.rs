//! Client stream that consumes a pending relay response before the first
//! payload byte is handed to the reader.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use netx_proto::{HEADER_LEN, ParseResult, Status, VERSION1, frame_len, parse_response};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

struct Pending {
    buf: Vec<u8>,
    filled: usize,
}

pub(crate) struct ResponseReader<S> {
    inner: S,
    pending: Option<Pending>,
}

impl<S> ResponseReader<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            pending: Some(Pending {
                buf: vec![0; HEADER_LEN],
                filled: 0,
            }),
        }
    }
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

impl<S: AsyncRead + Unpin> ResponseReader<S> {
    fn poll_response(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while let Some(p) = self.pending.as_mut() {
            if p.filled < p.buf.len() {
                let mut rb = ReadBuf::new(&mut p.buf[p.filled..]);
                ready!(Pin::new(&mut self.inner).poll_read(cx, &mut rb))?;
                let n = rb.filled().len();
                if n == 0 {
                    return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                }
                p.filled += n;
                continue;
            }

            if p.buf.len() == HEADER_LEN {
                if p.buf[0] != VERSION1 {
                    return Poll::Ready(Err(invalid(format!("relay: bad version {}", p.buf[0]))));
                }
                let mut header = [0u8; HEADER_LEN];
                header.copy_from_slice(&p.buf);
                let total = frame_len(&header);
                if total > HEADER_LEN {
                    p.buf.resize(total, 0);
                    continue;
                }
            }

            let resp = match parse_response(&p.buf) {
                ParseResult::Complete((resp, _)) => resp,
                ParseResult::Invalid(e) => return Poll::Ready(Err(invalid(format!("relay: {e}")))),
                ParseResult::Incomplete(_) => {
                    return Poll::Ready(Err(invalid("relay: truncated response".into())));
                }
            };
            self.pending = None;
            if resp.status != Status::Ok {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("relay: peer replied {}", resp.status),
                )));
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ResponseReader<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        ready!(this.poll_response(cx))?;
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ResponseReader<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use netx_proto::{Response, encode_response};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn encoded(status: Status) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_response(&mut buf, &Response::new(status)).unwrap();
        buf.to_vec()
    }

    #[tokio::test]
    async fn strips_ok_response() {
        let (a, mut b) = tokio::io::duplex(256);
        let mut data = encoded(Status::Ok);
        data.extend_from_slice(b"payload");
        b.write_all(&data).await.unwrap();

        let mut r = ResponseReader::new(a);
        let mut buf = [0u8; 7];
        r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[tokio::test]
    async fn error_status_fails_first_read() {
        let (a, mut b) = tokio::io::duplex(256);
        b.write_all(&encoded(Status::HostUnreachable)).await.unwrap();
        let mut r = ResponseReader::new(a);
        let mut buf = [0u8; 1];
        let err = r.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}

//! Stream adapters used by relay framing.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Largest payload a single length-prefixed datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = u16::MAX as usize;

enum ReadState {
    Header { got: usize, hdr: [u8; 2] },
    Body { want: usize },
}

/// Datagrams carried over a byte stream as `[len:2 BE][payload]`.
///
/// Each read returns at most one datagram; payload that does not fit in the
/// caller's buffer is discarded. Each write sends its whole buffer as one
/// datagram and only reports success once the frame has been accepted.
pub struct DatagramStream<S> {
    inner: S,
    read: ReadState,
    rbuf: BytesMut,
    wbuf: BytesMut,
    wlen: usize,
}

impl<S> DatagramStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            read: ReadState::Header { got: 0, hdr: [0; 2] },
            rbuf: BytesMut::new(),
            wbuf: BytesMut::new(),
            wlen: 0,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for DatagramStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            match &mut this.read {
                ReadState::Header { got, hdr } => {
                    let mut rb = ReadBuf::new(&mut hdr[*got..]);
                    ready!(Pin::new(&mut this.inner).poll_read(cx, &mut rb))?;
                    let n = rb.filled().len();
                    if n == 0 {
                        if *got == 0 {
                            return Poll::Ready(Ok(()));
                        }
                        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                    }
                    *got += n;
                    if *got == 2 {
                        let want = u16::from_be_bytes(*hdr) as usize;
                        this.rbuf.clear();
                        this.rbuf.reserve(want);
                        this.read = ReadState::Body { want };
                    }
                }
                ReadState::Body { want } => {
                    let want = *want;
                    while this.rbuf.len() < want {
                        let mut chunk = vec![0u8; want - this.rbuf.len()];
                        let mut rb = ReadBuf::new(&mut chunk);
                        ready!(Pin::new(&mut this.inner).poll_read(cx, &mut rb))?;
                        let n = rb.filled().len();
                        if n == 0 {
                            return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                        }
                        this.rbuf.extend_from_slice(&chunk[..n]);
                    }
                    this.read = ReadState::Header { got: 0, hdr: [0; 2] };
                    if want == 0 {
                        continue;
                    }
                    let n = want.min(buf.remaining());
                    buf.put_slice(&this.rbuf[..n]);
                    this.rbuf.clear();
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for DatagramStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.wbuf.is_empty() {
            if buf.len() > MAX_DATAGRAM_SIZE {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "datagram too large",
                )));
            }
            this.wbuf.reserve(2 + buf.len());
            this.wbuf.put_u16(buf.len() as u16);
            this.wbuf.put_slice(buf);
            this.wlen = buf.len();
        }
        while !this.wbuf.is_empty() {
            let n = ready!(Pin::new(&mut this.inner).poll_write(cx, &this.wbuf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            this.wbuf.advance(n);
        }
        Poll::Ready(Ok(this.wlen))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Writes a held-back header together with the first payload write.
///
/// If the stream is flushed or shut down before any payload is written, the
/// header is sent on its own.
pub struct PrefixedWriter<S> {
    inner: S,
    pending: Option<BytesMut>,
    /// Payload length already copied into `pending`.
    merged: usize,
}

impl<S> PrefixedWriter<S> {
    pub fn new(inner: S, header: Bytes) -> Self {
        Self {
            inner,
            pending: (!header.is_empty()).then(|| BytesMut::from(&header[..])),
            merged: 0,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncWrite + Unpin> PrefixedWriter<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while let Some(pending) = self.pending.as_mut() {
            if pending.is_empty() {
                self.pending = None;
                break;
            }
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedWriter<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedWriter<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match this.pending.as_mut() {
            None => Pin::new(&mut this.inner).poll_write(cx, buf),
            Some(pending) => {
                if this.merged == 0 {
                    pending.extend_from_slice(buf);
                    this.merged = buf.len();
                }
                ready!(this.poll_drain(cx))?;
                let n = this.merged;
                this.merged = 0;
                Poll::Ready(Ok(n))
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.poll_drain(cx))?;
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.poll_drain(cx))?;
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

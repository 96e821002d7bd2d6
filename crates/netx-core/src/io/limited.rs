use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

use crate::limiter::Limiter;

/// Stream throttled by per-direction byte budgets.
///
/// Bytes are charged after they move; the resulting delay is served before
/// the next operation in the same direction.
pub struct LimitedStream<S> {
    inner: S,
    rlimit: Option<Arc<dyn Limiter>>,
    wlimit: Option<Arc<dyn Limiter>>,
    rdelay: Option<Pin<Box<Sleep>>>,
    wdelay: Option<Pin<Box<Sleep>>>,
}

impl<S> LimitedStream<S> {
    pub fn new(
        inner: S,
        read_limiter: Option<Arc<dyn Limiter>>,
        write_limiter: Option<Arc<dyn Limiter>>,
    ) -> Self {
        Self {
            inner,
            rlimit: read_limiter,
            wlimit: write_limiter,
            rdelay: None,
            wdelay: None,
        }
    }

    pub fn is_limited(&self) -> bool {
        self.rlimit.is_some() || self.wlimit.is_some()
    }
}

fn charge(limiter: &Option<Arc<dyn Limiter>>, n: usize) -> Option<Pin<Box<Sleep>>> {
    let d = limiter.as_ref()?.wait(n);
    (!d.is_zero()).then(|| Box::pin(tokio::time::sleep(d)))
}

impl<S: AsyncRead + Unpin> AsyncRead for LimitedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(delay) = self.rdelay.as_mut() {
            ready!(delay.as_mut().poll(cx));
            self.rdelay = None;
        }
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        let n = buf.filled().len() - before;
        if n > 0 {
            self.rdelay = charge(&self.rlimit, n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for LimitedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Some(delay) = self.wdelay.as_mut() {
            ready!(delay.as_mut().poll(cx));
            self.wdelay = None;
        }
        let n = ready!(Pin::new(&mut self.inner).poll_write(cx, buf))?;
        if n > 0 {
            self.wdelay = charge(&self.wlimit, n);
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

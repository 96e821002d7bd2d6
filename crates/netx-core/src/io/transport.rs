//! Bidirectional byte pump between two connections.
//!
//! Both directions are driven from one future as independent poll state
//! machines, so a stalled writer on one side never blocks the other side.
//! Nested chain legs rely on this: a hop's upstream write may only make
//! progress after its downstream has been read.

use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tokio::time::Instant;

use crate::defaults::DEFAULT_RELAY_BUFFER_SIZE;

/// Byte accounting for [`transport`].
pub trait TransferStats {
    /// Bytes read from the first stream and written to the second.
    fn record_up(&self, bytes: u64);
    /// Bytes read from the second stream and written to the first.
    fn record_down(&self, bytes: u64);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoStats;

impl TransferStats for NoStats {
    #[inline]
    fn record_up(&self, _bytes: u64) {}
    #[inline]
    fn record_down(&self, _bytes: u64) {}
}

impl<T: TransferStats + ?Sized> TransferStats for std::sync::Arc<T> {
    fn record_up(&self, bytes: u64) {
        (**self).record_up(bytes)
    }
    fn record_down(&self, bytes: u64) {
        (**self).record_down(bytes)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    pub buffer_size: usize,
    /// Close both sides after this long without traffic in either direction.
    pub idle_timeout: Option<Duration>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_RELAY_BUFFER_SIZE,
            idle_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Read,
    Write { pos: usize, len: usize },
    Flush { len: usize },
    Shutdown,
    Done,
}

enum Step {
    Moved(usize),
    Eof,
}

/// One half of the pump: reads `src`, writes `dst`.
struct Pipe<R, W> {
    src: R,
    dst: W,
    buf: Box<[u8]>,
    phase: Phase,
}

impl<R, W> Pipe<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    fn new(src: R, dst: W, size: usize) -> Self {
        Self {
            src,
            dst,
            buf: vec![0u8; size.max(1)].into_boxed_slice(),
            phase: Phase::Read,
        }
    }

    fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    fn poll_step(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<Step>> {
        loop {
            match self.phase {
                Phase::Read => {
                    let mut rb = ReadBuf::new(&mut self.buf);
                    std::task::ready!(Pin::new(&mut self.src).poll_read(cx, &mut rb))?;
                    let len = rb.filled().len();
                    self.phase = if len == 0 {
                        Phase::Shutdown
                    } else {
                        Phase::Write { pos: 0, len }
                    };
                }
                Phase::Write { pos, len } => {
                    let n =
                        std::task::ready!(Pin::new(&mut self.dst).poll_write(cx, &self.buf[pos..len]))?;
                    if n == 0 {
                        return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                    }
                    self.phase = if pos + n >= len {
                        Phase::Flush { len }
                    } else {
                        Phase::Write { pos: pos + n, len }
                    };
                }
                Phase::Flush { len } => {
                    std::task::ready!(Pin::new(&mut self.dst).poll_flush(cx))?;
                    self.phase = Phase::Read;
                    return Poll::Ready(Ok(Step::Moved(len)));
                }
                Phase::Shutdown => {
                    // Half-close errors are not fatal; the peer may already be gone.
                    let _ = std::task::ready!(Pin::new(&mut self.dst).poll_shutdown(cx));
                    self.phase = Phase::Done;
                    return Poll::Ready(Ok(Step::Eof));
                }
                Phase::Done => return Poll::Ready(Ok(Step::Eof)),
            }
        }
    }
}

type Up<A, B> = Pipe<ReadHalf<A>, WriteHalf<B>>;
type Down<A, B> = Pipe<ReadHalf<B>, WriteHalf<A>>;

/// Copy bytes between `a` and `b` until both directions reach EOF, either
/// side fails, or the idle timeout fires.
///
/// Returns `(up, down)` byte totals, where `up` is `a -> b`.
pub async fn transport<A, B, S>(
    a: A,
    b: B,
    opts: TransportOptions,
    stats: &S,
) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
    S: TransferStats + ?Sized,
{
    let (ar, aw) = tokio::io::split(a);
    let (br, bw) = tokio::io::split(b);
    let mut up: Up<A, B> = Pipe::new(ar, bw, opts.buffer_size);
    let mut down: Down<A, B> = Pipe::new(br, aw, opts.buffer_size);
    let mut totals = (0u64, 0u64);

    let idle = opts.idle_timeout.filter(|d| !d.is_zero());
    let sleep = tokio::time::sleep(idle.unwrap_or(Duration::from_secs(86_400)));
    tokio::pin!(sleep);

    while !(up.is_done() && down.is_done()) {
        let progress = poll_fn(|cx| -> Poll<io::Result<bool>> {
            let mut ready = false;
            let mut moved = false;
            if !up.is_done()
                && let Poll::Ready(step) = up.poll_step(cx)
            {
                ready = true;
                if let Step::Moved(n) = step? {
                    stats.record_up(n as u64);
                    totals.0 += n as u64;
                    moved = true;
                }
            }
            if !down.is_done()
                && let Poll::Ready(step) = down.poll_step(cx)
            {
                ready = true;
                if let Step::Moved(n) = step? {
                    stats.record_down(n as u64);
                    totals.1 += n as u64;
                    moved = true;
                }
            }
            if ready {
                Poll::Ready(Ok(moved))
            } else {
                Poll::Pending
            }
        });

        tokio::select! {
            res = progress => {
                if res?
                    && let Some(d) = idle
                {
                    sleep.as_mut().reset(Instant::now() + d);
                }
            }
            _ = &mut sleep, if idle.is_some() => {
                tracing::debug!(up = totals.0, down = totals.1, "transport idle timeout");
                break;
            }
        }
    }
    Ok(totals)
}

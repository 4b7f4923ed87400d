//! Reader adapters the blob pipeline is composed of.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, SimplexStream, WriteHalf};
use tokio::sync::oneshot;

/// The currency of the pipeline: an owned byte source, replaced at every
/// stage.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub(crate) const PIPE_BUF_SIZE: usize = 64 * 1024;
const TEE_CHUNK_SIZE: usize = 8 * 1024;

/// Counts bytes as they pass through, shared with whoever wants to observe
/// the offset afterwards.
pub struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R, count: Arc<AtomicU64>) -> Self {
        CountingReader { inner, count }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = &mut *self;
        let before = buf.filled().len();
        match Pin::new(&mut me.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                if n > 0 {
                    me.count.fetch_add(n as u64, Ordering::Relaxed);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Marks errors coming out of the source stream so a failure surfacing
/// through the destination's `put_blob` is not blamed on the write side.
pub struct ReadSideAnnotator<R> {
    inner: R,
    what: String,
}

impl<R> ReadSideAnnotator<R> {
    pub fn new(inner: R, what: impl Into<String>) -> Self {
        ReadSideAnnotator {
            inner,
            what: what.into(),
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ReadSideAnnotator<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = &mut *self;
        match Pin::new(&mut me.inner).poll_read(cx, buf) {
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::new(
                e.kind(),
                format!("{}: {}", me.what, e),
            ))),
            other => other,
        }
    }
}

/// Duplicates everything read from `inner` into `writer` before handing the
/// bytes to the caller. At EOF the writer is shut down, so the receiving
/// side of a tee pipe observes a complete stream exactly when this reader
/// was drained to the end.
pub struct TeeReader<R, W> {
    inner: R,
    writer: W,
    buf: Box<[u8]>,
    len: usize,
    wpos: usize,
    rpos: usize,
    eof: bool,
    shutdown_done: bool,
}

impl<R, W> TeeReader<R, W> {
    pub fn new(inner: R, writer: W) -> Self {
        TeeReader {
            inner,
            writer,
            buf: vec![0u8; TEE_CHUNK_SIZE].into_boxed_slice(),
            len: 0,
            wpos: 0,
            rpos: 0,
            eof: false,
            shutdown_done: false,
        }
    }
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> AsyncRead for TeeReader<R, W> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let me = &mut *self;
        loop {
            // the tee write of the current chunk goes first
            if me.wpos < me.len {
                match Pin::new(&mut me.writer).poll_write(cx, &me.buf[me.wpos..me.len]) {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "tee target closed",
                        )));
                    }
                    Poll::Ready(Ok(n)) => {
                        me.wpos += n;
                        continue;
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }
            if me.rpos < me.len {
                let n = (me.len - me.rpos).min(buf.remaining());
                buf.put_slice(&me.buf[me.rpos..me.rpos + n]);
                me.rpos += n;
                return Poll::Ready(Ok(()));
            }
            if me.eof {
                if !me.shutdown_done {
                    match Pin::new(&mut me.writer).poll_shutdown(cx) {
                        Poll::Ready(Ok(())) => me.shutdown_done = true,
                        Poll::Ready(Err(e)) => {
                            me.shutdown_done = true;
                            return Poll::Ready(Err(e));
                        }
                        Poll::Pending => return Poll::Pending,
                    }
                }
                return Poll::Ready(Ok(()));
            }
            let mut rb = ReadBuf::new(&mut me.buf);
            match Pin::new(&mut me.inner).poll_read(cx, &mut rb) {
                Poll::Ready(Ok(())) => {
                    let n = rb.filled().len();
                    if n == 0 {
                        me.eof = true;
                    } else {
                        me.len = n;
                        me.wpos = 0;
                        me.rpos = 0;
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Read end of a worker-fed pipe. EOF is only reported once the worker's
/// final status arrived, so a worker failure surfaces as a read error
/// instead of a silently truncated stream.
pub struct PipeReader {
    inner: ReadHalf<SimplexStream>,
    status: Option<oneshot::Receiver<io::Result<()>>>,
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let me = &mut *self;
        let before = buf.filled().len();
        match Pin::new(&mut me.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() > before {
                    return Poll::Ready(Ok(()));
                }
                // pipe closed; collect what the worker reported
                match me.status.take() {
                    None => Poll::Ready(Ok(())),
                    Some(mut rx) => match Pin::new(&mut rx).poll(cx) {
                        Poll::Ready(Ok(Ok(()))) => Poll::Ready(Ok(())),
                        Poll::Ready(Ok(Err(e))) => Poll::Ready(Err(e)),
                        Poll::Ready(Err(_)) => Poll::Ready(Err(io::Error::other(
                            "background stream worker disappeared",
                        ))),
                        Poll::Pending => {
                            me.status = Some(rx);
                            Poll::Pending
                        }
                    },
                }
            }
            other => other,
        }
    }
}

/// Spawn a worker that owns the write end of an in-memory pipe and returns
/// the read end. The worker's return value is delivered to the reader at
/// EOF, on every exit path.
pub(crate) fn pipe_reader<F, Fut>(make: F) -> PipeReader
where
    F: FnOnce(WriteHalf<SimplexStream>) -> Fut,
    Fut: std::future::Future<Output = io::Result<()>> + Send + 'static,
{
    let (rd, wr) = tokio::io::simplex(PIPE_BUF_SIZE);
    let (tx, rx) = oneshot::channel();
    let fut = make(wr);
    tokio::spawn(async move {
        let res = fut.await;
        if let Err(e) = &res {
            log::error!("stream worker failed: {e}");
        }
        let _ = tx.send(res);
    });
    PipeReader {
        inner: rd,
        status: Some(rx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_counting_reader() {
        let data = vec![1u8; 10_000];
        let count = Arc::new(AtomicU64::new(0));
        let mut r = CountingReader::new(&data[..], count.clone());
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 10_000);
    }

    #[tokio::test]
    async fn test_tee_reader_duplicates_stream() {
        let data: Vec<u8> = (0..100_000u32).map(|x| x as u8).collect();
        let (rd, wr) = tokio::io::simplex(PIPE_BUF_SIZE);
        let side = tokio::spawn(async move {
            let mut rd = rd;
            let mut out = Vec::new();
            rd.read_to_end(&mut out).await.unwrap();
            out
        });
        let mut tee = TeeReader::new(&data[..], wr);
        let mut main = Vec::new();
        tee.read_to_end(&mut main).await.unwrap();
        assert_eq!(main, data);
        assert_eq!(side.await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_pipe_reader_reports_worker_error() {
        let mut r = pipe_reader(|mut wr| async move {
            wr.write_all(b"partial").await?;
            Err(io::Error::other("worker exploded"))
        });
        let mut out = Vec::new();
        let err = r.read_to_end(&mut out).await.unwrap_err();
        assert!(err.to_string().contains("worker exploded"));
        assert_eq!(out, b"partial");
    }

    #[tokio::test]
    async fn test_pipe_reader_success() {
        let mut r = pipe_reader(|mut wr| async move {
            wr.write_all(b"all of it").await?;
            wr.shutdown().await?;
            Ok(())
        });
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"all of it");
    }
}

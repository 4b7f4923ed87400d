//! Periodic progress fan-out for blob copies.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use log::trace;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

use crate::types::BlobInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEventKind {
    /// A new blob is about to be transferred.
    NewArtifact,
    /// Bytes moved since the last event.
    Read,
    /// The blob was reused or intentionally left alone.
    Skipped,
    /// The blob finished transferring.
    Done,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub kind: ProgressEventKind,
    pub artifact: BlobInfo,
    /// Bytes seen so far.
    pub offset: u64,
    /// Bytes since the previous event for this artifact.
    pub offset_update: u64,
}

#[derive(Clone)]
pub(crate) struct ProgressOutput {
    pub channel: Option<mpsc::Sender<ProgressEvent>>,
    pub interval: Duration,
}

impl ProgressOutput {
    pub(crate) fn disabled() -> Self {
        ProgressOutput {
            channel: None,
            interval: Duration::from_secs(1),
        }
    }

    pub(crate) async fn send(&self, kind: ProgressEventKind, artifact: &BlobInfo, offset: u64) {
        if let Some(ch) = &self.channel {
            let _ = ch
                .send(ProgressEvent {
                    kind,
                    artifact: artifact.clone(),
                    offset,
                    offset_update: 0,
                })
                .await;
        }
    }
}

/// Emits a Read event at most once per interval while bytes flow through.
/// Events are dropped rather than awaited when the receiver lags, so a slow
/// consumer cannot stall the pipeline.
pub(crate) struct ProgressReader<R> {
    inner: R,
    channel: mpsc::Sender<ProgressEvent>,
    interval: Duration,
    artifact: BlobInfo,
    offset: u64,
    last_offset: u64,
    last_emit: Instant,
}

impl<R> ProgressReader<R> {
    pub(crate) fn new(
        inner: R,
        channel: mpsc::Sender<ProgressEvent>,
        interval: Duration,
        artifact: BlobInfo,
    ) -> Self {
        ProgressReader {
            inner,
            channel,
            interval,
            artifact,
            offset: 0,
            last_offset: 0,
            last_emit: Instant::now(),
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = &mut *self;
        let before = buf.filled().len();
        match Pin::new(&mut me.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = (buf.filled().len() - before) as u64;
                me.offset += n;
                if n > 0 && me.last_emit.elapsed() >= me.interval {
                    let event = ProgressEvent {
                        kind: ProgressEventKind::Read,
                        artifact: me.artifact.clone(),
                        offset: me.offset,
                        offset_update: me.offset - me.last_offset,
                    };
                    match me.channel.try_send(event) {
                        Ok(()) => {
                            me.last_offset = me.offset;
                            me.last_emit = Instant::now();
                        }
                        Err(e) => trace!("progress receiver not keeping up: {e}"),
                    }
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

//! Pipe - bounded in-process byte channel with lifecycle management
//!
//! A Pipe is a single-producer/single-consumer FIFO of MultiBuffers with an
//! optional byte limit. Writers block once the limit is reached, which gives
//! end-to-end backpressure from the outbound all the way to the client.
//! Either side can be interrupted, which discards buffered data and fails
//! every subsequent operation.
//!
//! Two crossed pipes form the two `Link` endpoints a dispatch hands to the
//! inbound and the outbound handler.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::buffer::MultiBuffer;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeError {
    /// Write side closed and no data remains (reads), or writes after close.
    #[error("pipe closed")]
    Closed,
    /// Pipe interrupted or session cancelled.
    #[error("pipe interrupted")]
    Interrupted,
    /// A bounded read elapsed without data.
    #[error("pipe read timeout")]
    Timeout,
}

struct State {
    queue: VecDeque<MultiBuffer>,
    queued_bytes: usize,
    limit: Option<usize>,
    write_closed: bool,
    interrupted: bool,
}

struct Shared {
    state: Mutex<State>,
    readable: Notify,
    writable: Notify,
    token: CancellationToken,
}

impl Shared {
    fn interrupt(&self) {
        let mut s = self.state.lock().unwrap();
        s.interrupted = true;
        s.queue.clear();
        s.queued_bytes = 0;
        drop(s);
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    fn close_write(&self) {
        let mut s = self.state.lock().unwrap();
        s.write_closed = true;
        drop(s);
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }
}

/// Read half of a Pipe. Exactly one task may read.
pub struct PipeReader {
    shared: Arc<Shared>,
}

/// Write half of a Pipe. Exactly one task may write.
pub struct PipeWriter {
    shared: Arc<Shared>,
}

/// Create a pipe with an optional queued-byte limit.
///
/// `limit: None` means unbounded. A single write larger than the limit is
/// admitted when the pipe is empty, so oversized MultiBuffers cannot wedge
/// the writer. The cancellation token fails both sides with `Interrupted`
/// once cancelled.
pub fn new_pipe(limit: Option<usize>, token: CancellationToken) -> (PipeReader, PipeWriter) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            queue: VecDeque::new(),
            queued_bytes: 0,
            limit,
            write_closed: false,
            interrupted: false,
        }),
        readable: Notify::new(),
        writable: Notify::new(),
        token,
    });
    (
        PipeReader {
            shared: Arc::clone(&shared),
        },
        PipeWriter { shared },
    )
}

impl PipeReader {
    pub async fn read_multi(&self) -> Result<MultiBuffer, PipeError> {
        loop {
            let notified = self.shared.readable.notified();
            {
                let mut s = self.shared.state.lock().unwrap();
                if s.interrupted {
                    return Err(PipeError::Interrupted);
                }
                if let Some(mb) = s.queue.pop_front() {
                    s.queued_bytes -= mb.len();
                    drop(s);
                    self.shared.writable.notify_one();
                    return Ok(mb);
                }
                if s.write_closed {
                    return Err(PipeError::Closed);
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = self.shared.token.cancelled() => return Err(PipeError::Interrupted),
            }
        }
    }

    pub async fn read_multi_timeout(&self, timeout: Duration) -> Result<MultiBuffer, PipeError> {
        match tokio::time::timeout(timeout, self.read_multi()).await {
            Ok(result) => result,
            Err(_) => Err(PipeError::Timeout),
        }
    }

    /// Discard buffered data and fail both sides.
    pub fn interrupt(&self) {
        self.shared.interrupt();
    }
}

impl PipeWriter {
    pub async fn write_multi(&self, mb: MultiBuffer) -> Result<(), PipeError> {
        if mb.is_empty() {
            return Ok(());
        }
        loop {
            let notified = self.shared.writable.notified();
            {
                let mut s = self.shared.state.lock().unwrap();
                if s.interrupted {
                    return Err(PipeError::Interrupted);
                }
                if s.write_closed {
                    return Err(PipeError::Closed);
                }
                let fits = match s.limit {
                    None => true,
                    Some(limit) => s.queue.is_empty() || s.queued_bytes + mb.len() <= limit,
                };
                if fits {
                    s.queued_bytes += mb.len();
                    s.queue.push_back(mb);
                    drop(s);
                    self.shared.readable.notify_one();
                    return Ok(());
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = self.shared.token.cancelled() => return Err(PipeError::Interrupted),
            }
        }
    }

    /// No further writes; pending data stays readable, then readers see EOF.
    pub fn close(&self) {
        self.shared.close_write();
    }

    /// Discard buffered data and fail both sides.
    pub fn interrupt(&self) {
        self.shared.interrupt();
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        // A writer without a reader would block forever on a full pipe.
        self.shared.interrupt();
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.shared.close_write();
    }
}

/// One endpoint of the bidirectional channel between inbound and outbound.
#[async_trait]
pub trait LinkReader: Send + Sync {
    async fn read_multi(&self) -> Result<MultiBuffer, PipeError>;
    async fn read_multi_timeout(&self, timeout: Duration) -> Result<MultiBuffer, PipeError>;
    fn interrupt(&self);
}

#[async_trait]
pub trait LinkWriter: Send + Sync {
    async fn write_multi(&self, mb: MultiBuffer) -> Result<(), PipeError>;
    fn close(&self);
    fn interrupt(&self);
}

#[async_trait]
impl LinkReader for PipeReader {
    async fn read_multi(&self) -> Result<MultiBuffer, PipeError> {
        PipeReader::read_multi(self).await
    }

    async fn read_multi_timeout(&self, timeout: Duration) -> Result<MultiBuffer, PipeError> {
        PipeReader::read_multi_timeout(self, timeout).await
    }

    fn interrupt(&self) {
        PipeReader::interrupt(self)
    }
}

#[async_trait]
impl LinkWriter for PipeWriter {
    async fn write_multi(&self, mb: MultiBuffer) -> Result<(), PipeError> {
        PipeWriter::write_multi(self, mb).await
    }

    fn close(&self) {
        PipeWriter::close(self)
    }

    fn interrupt(&self) {
        PipeWriter::interrupt(self)
    }
}

/// A reader/writer pair bundling one side of a dispatch.
///
/// Bytes written to `writer` surface as reads on the peer link, and
/// vice-versa.
pub struct Link {
    pub reader: Box<dyn LinkReader>,
    pub writer: Box<dyn LinkWriter>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

impl Link {
    /// Tear the link down: no more writes, pending reads discarded.
    pub fn shutdown(&self) {
        self.writer.close();
        self.reader.interrupt();
    }
}

//! One-shot producer/consumer handoff for a single chunk
//!
//! A [`chunk_pipe`] pair connects the worker filling a chunk buffer to
//! the consumer draining it. The consumer's first read blocks until the
//! producer delivers the buffer (or an error); once drained, the buffer
//! returns to its pool and further reads yield EOF.

use crate::pool::PooledBuf;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::oneshot;

/// Create a connected writer/reader pair for one chunk
pub fn chunk_pipe() -> (ChunkWriter, BufferedReader) {
    let (tx, rx) = oneshot::channel();
    (
        ChunkWriter { tx },
        BufferedReader {
            state: State::Waiting(rx),
        },
    )
}

/// Producer side: delivers the filled buffer or an error, exactly once
#[derive(Debug)]
pub struct ChunkWriter {
    tx: oneshot::Sender<io::Result<PooledBuf>>,
}

impl ChunkWriter {
    /// Hand the filled buffer to the reader
    pub fn deliver(self, buf: PooledBuf) {
        // The reader may already be gone if the download was abandoned;
        // the buffer then returns to the pool through its own drop.
        let _ = self.tx.send(Ok(buf));
    }

    /// Terminate the reader with an error
    pub fn fail(self, err: io::Error) {
        let _ = self.tx.send(Err(err));
    }
}

#[derive(Debug)]
enum State {
    Waiting(oneshot::Receiver<io::Result<PooledBuf>>),
    Draining { buf: PooledBuf, pos: usize },
    Done,
}

/// Consumer side: an `AsyncRead` over the delivered chunk
#[derive(Debug)]
pub struct BufferedReader {
    state: State,
}

impl AsyncRead for BufferedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            match &mut self.state {
                State::Waiting(rx) => match Pin::new(rx).poll(cx) {
                    Poll::Ready(Ok(Ok(buf))) => {
                        self.state = State::Draining { buf, pos: 0 };
                    }
                    Poll::Ready(Ok(Err(err))) => {
                        self.state = State::Done;
                        return Poll::Ready(Err(err));
                    }
                    Poll::Ready(Err(_)) => {
                        self.state = State::Done;
                        return Poll::Ready(Err(io::Error::other(
                            "chunk producer dropped before delivery",
                        )));
                    }
                    Poll::Pending => return Poll::Pending,
                },
                State::Draining { buf, pos } => {
                    let remaining = &buf[*pos..];
                    if remaining.is_empty() {
                        // Drained: swap to the EOF sentinel, which also
                        // sends the buffer back to the pool.
                        self.state = State::Done;
                        return Poll::Ready(Ok(()));
                    }
                    let n = remaining.len().min(out.remaining());
                    if n == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    out.put_slice(&remaining[..n]);
                    *pos += n;
                    if *pos == buf.len() {
                        self.state = State::Done;
                    }
                    return Poll::Ready(Ok(()));
                }
                State::Done => return Poll::Ready(Ok(())),
            }
        }
    }
}

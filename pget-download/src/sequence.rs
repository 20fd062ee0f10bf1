//! Ordered concatenation of chunk readers
//!
//! Chunk tasks complete in whatever order the network allows, but the
//! readers were pushed onto the channel in file-offset order, so reading
//! the sequence front to back yields the file's bytes exactly.

use crate::reader::BufferedReader;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

/// A single `AsyncRead` over a channel of [`BufferedReader`]s.
///
/// Each inner reader is drained to EOF before the next is received;
/// when the channel is closed and drained the sequence itself is EOF.
/// An error from any inner reader terminates the sequence.
#[derive(Debug)]
pub struct ReaderSequence {
    rx: mpsc::UnboundedReceiver<BufferedReader>,
    current: Option<BufferedReader>,
    failed: bool,
}

impl ReaderSequence {
    /// Wrap a channel of readers
    pub fn new(rx: mpsc::UnboundedReceiver<BufferedReader>) -> Self {
        Self {
            rx,
            current: None,
            failed: false,
        }
    }
}

impl AsyncRead for ReaderSequence {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.failed {
            return Poll::Ready(Err(io::Error::other("stream already failed")));
        }
        loop {
            if self.current.is_none() {
                match self.rx.poll_recv(cx) {
                    Poll::Ready(Some(reader)) => self.current = Some(reader),
                    Poll::Ready(None) => return Poll::Ready(Ok(())),
                    Poll::Pending => return Poll::Pending,
                }
            }

            let reader = self.current.as_mut().expect("current reader set above");
            let before = out.filled().len();
            match Pin::new(reader).poll_read(cx, out) {
                Poll::Ready(Ok(())) => {
                    if out.filled().len() == before && out.remaining() > 0 {
                        // Inner EOF: move on to the next chunk.
                        self.current = None;
                        continue;
                    }
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Err(err)) => {
                    self.failed = true;
                    self.current = None;
                    return Poll::Ready(Err(err));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use crate::reader::chunk_pipe;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn concatenates_in_channel_order() {
        let pool = BufferPool::new(4, 16);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut writers = Vec::new();
        for _ in 0..3 {
            let (writer, reader) = chunk_pipe();
            tx.send(reader).expect("send reader");
            writers.push(writer);
        }
        drop(tx);

        // Deliver out of order: completion order must not matter.
        let w3 = writers.pop().expect("w3");
        let w2 = writers.pop().expect("w2");
        let w1 = writers.pop().expect("w1");
        for (writer, body) in [(w3, &b"ccc"[..]), (w1, &b"aaa"[..]), (w2, &b"bbb"[..])] {
            let mut buf = pool.checkout().await;
            buf.extend_from_slice(body);
            writer.deliver(buf);
        }

        let mut out = Vec::new();
        ReaderSequence::new(rx)
            .read_to_end(&mut out)
            .await
            .expect("read");
        assert_eq!(out, b"aaabbbccc");
    }

    #[tokio::test]
    async fn closed_empty_channel_is_eof() {
        let (tx, rx) = mpsc::unbounded_channel::<BufferedReader>();
        drop(tx);
        let mut out = Vec::new();
        ReaderSequence::new(rx)
            .read_to_end(&mut out)
            .await
            .expect("read");
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn inner_error_terminates_the_sequence() {
        let pool = BufferPool::new(2, 8);
        let (tx, rx) = mpsc::unbounded_channel();

        let (w1, r1) = chunk_pipe();
        let (w2, r2) = chunk_pipe();
        tx.send(r1).expect("send");
        tx.send(r2).expect("send");
        drop(tx);

        let mut buf = pool.checkout().await;
        buf.extend_from_slice(b"ok");
        w1.deliver(buf);
        w2.fail(io::Error::other("chunk 2 failed"));

        let mut out = Vec::new();
        let err = ReaderSequence::new(rx)
            .read_to_end(&mut out)
            .await
            .expect_err("must surface chunk error");
        assert!(err.to_string().contains("chunk 2 failed"));
    }
}

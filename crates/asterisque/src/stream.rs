//! Byte-stream bridging over block messages.
//!
//! [`PipeOutputStream`] buffers writes and fragments them into blocks no
//! larger than the wire payload bound; closing it flushes and sends the
//! EOF block. [`PipeInputStream`] is the read side: it drains received
//! blocks byte-wise and reports end-of-file at the peer's EOF. A pipe
//! that closes before EOF surfaces as an interrupted read.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, ReadBuf};

use asterisque_core::{Error, DEFAULT_OUTPUT_BUFFER_SIZE, MAX_PAYLOAD_SIZE};

use crate::pipe::{BlockReceiver, Chunk, Pipe};

/// Buffered block writer for one pipe.
pub struct PipeOutputStream {
    pipe: Arc<Pipe>,
    buf: BytesMut,
    capacity: usize,
    closed: bool,
}

impl PipeOutputStream {
    pub fn new(pipe: Arc<Pipe>) -> Self {
        PipeOutputStream::with_capacity(pipe, DEFAULT_OUTPUT_BUFFER_SIZE)
    }

    pub fn with_capacity(pipe: Arc<Pipe>, capacity: usize) -> Self {
        assert!(capacity > 0, "buffer capacity must be positive");
        PipeOutputStream {
            pipe,
            buf: BytesMut::with_capacity(capacity),
            capacity,
            closed: false,
        }
    }

    /// Append bytes, flushing whenever the buffer fills.
    pub async fn write(&mut self, mut data: &[u8]) -> Result<(), Error> {
        if self.closed {
            return Err(Error::Closed("pipe output stream"));
        }
        while !data.is_empty() {
            let room = self.capacity - self.buf.len();
            let take = room.min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() == self.capacity {
                self.flush().await?;
            }
        }
        Ok(())
    }

    /// Send everything buffered, fragmented at the wire payload bound.
    pub async fn flush(&mut self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::Closed("pipe output stream"));
        }
        let mut pending = self.buf.split().freeze();
        while !pending.is_empty() {
            let fragment = pending.split_to(pending.len().min(MAX_PAYLOAD_SIZE));
            self.pipe.send_block(fragment).await?;
        }
        Ok(())
    }

    /// Flush and terminate the stream with an EOF block. Idempotent.
    pub async fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.flush().await?;
        self.closed = true;
        self.pipe.send_eof().await
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Drop for PipeOutputStream {
    fn drop(&mut self) {
        if !self.closed && !self.buf.is_empty() {
            tracing::warn!(
                pipe = self.pipe.id(),
                buffered = self.buf.len(),
                "output stream dropped with unflushed bytes"
            );
        }
    }
}

enum ReadState {
    Open,
    Eof,
    Broken,
}

/// Byte-oriented reader over a pipe's received blocks.
///
/// Created with [`Pipe::input_stream`], which takes the pipe's single
/// consumer seat; it cannot coexist with
/// [`Pipe::block_stream`](crate::Pipe::block_stream).
pub struct PipeInputStream {
    recv: BlockReceiver,
    current: Bytes,
    state: ReadState,
}

impl PipeInputStream {
    pub(crate) fn new(recv: BlockReceiver) -> Self {
        PipeInputStream {
            recv,
            current: Bytes::new(),
            state: ReadState::Open,
        }
    }

    /// Read into `buf`, waiting for at least one byte unless the stream
    /// ended. Returns 0 at end-of-file.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        std::future::poll_fn(|cx| {
            let mut read_buf = ReadBuf::new(buf);
            match Pin::new(&mut *self).poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => Poll::Ready(Ok(read_buf.filled().len())),
                Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                Poll::Pending => Poll::Pending,
            }
        })
        .await
    }

    /// Read until end-of-file, appending to `out`. Returns the number
    /// of bytes read.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> io::Result<usize> {
        let mut total = 0;
        let mut chunk = [0u8; 4096];
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&chunk[..n]);
            total += n;
        }
    }
}

impl AsyncRead for PipeInputStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.current.is_empty() {
                let take = this.current.len().min(buf.remaining());
                buf.put_slice(&this.current.split_to(take));
                return Poll::Ready(Ok(()));
            }
            match this.state {
                ReadState::Eof => return Poll::Ready(Ok(())),
                ReadState::Broken => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::Interrupted,
                        "pipe closed before EOF",
                    )));
                }
                ReadState::Open => {}
            }
            match this.recv.poll_chunk(cx) {
                Poll::Ready(Some(Chunk::Data(payload))) => this.current = payload,
                Poll::Ready(Some(Chunk::Eof)) => this.state = ReadState::Eof,
                Poll::Ready(None) => this.state = ReadState::Broken,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Pipe {
    /// Enable byte-oriented reading for this pipe. Takes the single
    /// consumer seat; fails with `AlreadyConsumed` once any consumer
    /// exists. A service handler opts in from its own dispatch context
    /// by calling this on the pipe it was invoked with.
    pub fn input_stream(&self) -> Result<PipeInputStream, Error> {
        Ok(PipeInputStream::new(self.take_receiver()?))
    }

    /// Buffered byte-oriented writer for this pipe.
    pub fn output_stream(self: &Arc<Self>) -> PipeOutputStream {
        PipeOutputStream::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::PipeContext;
    use crate::session::SessionPost;
    use asterisque_core::{BlockFlags, CircuitBreaker, Message, Wire};

    fn pipe_on(wire: &Arc<Wire>) -> Arc<Pipe> {
        let ctx = PipeContext {
            post: SessionPost::for_tests(wire.clone()),
            max_backlog: 64,
            meter: Arc::new(CircuitBreaker::new("inbound", 1000, 2000)),
        };
        Pipe::new(1, 10, 0, &ctx)
    }

    #[tokio::test]
    async fn small_writes_coalesce_into_one_block() {
        let (wire, peer) = Wire::pair();
        let pipe = pipe_on(&wire);
        let mut out = pipe.output_stream();

        out.write(b"hello ").await.unwrap();
        out.write(b"world").await.unwrap();
        assert_eq!(out.buffered(), 11);
        assert!(peer.inbound().is_empty());

        out.close().await.unwrap();

        let Some(Message::Block { payload, flags, .. }) = peer.inbound().take().await else {
            panic!("expected data block");
        };
        assert_eq!(&payload[..], b"hello world");
        assert!(!flags.contains(BlockFlags::EOF));

        let Some(Message::Block { flags, payload, .. }) = peer.inbound().take().await else {
            panic!("expected EOF block");
        };
        assert!(flags.contains(BlockFlags::EOF));
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn large_write_fragments_at_the_payload_bound() {
        let (wire, peer) = Wire::pair();
        let pipe = pipe_on(&wire);
        // Buffer bigger than a wire payload forces flush to fragment.
        let mut out = PipeOutputStream::with_capacity(pipe, MAX_PAYLOAD_SIZE * 2 + 10);

        let data = vec![7u8; MAX_PAYLOAD_SIZE * 2 + 5];
        out.write(&data).await.unwrap();
        out.flush().await.unwrap();

        let mut sizes = Vec::new();
        for _ in 0..3 {
            let Some(Message::Block { payload, .. }) = peer.inbound().take().await else {
                panic!("expected block");
            };
            sizes.push(payload.len());
        }
        assert_eq!(sizes, vec![MAX_PAYLOAD_SIZE, MAX_PAYLOAD_SIZE, 5]);
    }

    #[tokio::test]
    async fn write_after_close_fails() {
        let (wire, _peer) = Wire::pair();
        let pipe = pipe_on(&wire);
        let mut out = pipe.output_stream();

        out.close().await.unwrap();
        out.close().await.unwrap(); // idempotent
        assert!(matches!(
            out.write(b"late").await,
            Err(Error::Closed(_))
        ));
    }

    #[tokio::test]
    async fn reader_drains_blocks_bytewise() {
        let (wire, _peer) = Wire::pair();
        let pipe = pipe_on(&wire);

        pipe.deliver(BlockFlags::empty(), Bytes::from_static(b"abc")).unwrap();
        pipe.deliver(BlockFlags::empty(), Bytes::from_static(b"defg")).unwrap();
        pipe.deliver(BlockFlags::EOF, Bytes::new()).unwrap();

        let mut input = pipe.input_stream().unwrap();
        let mut two = [0u8; 2];
        assert_eq!(input.read(&mut two).await.unwrap(), 2);
        assert_eq!(&two, b"ab");

        let mut rest = Vec::new();
        assert_eq!(input.read_to_end(&mut rest).await.unwrap(), 5);
        assert_eq!(&rest, b"cdefg");

        // Past EOF: stays at end-of-file.
        assert_eq!(input.read(&mut two).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn close_without_eof_interrupts_the_reader() {
        let (wire, _peer) = Wire::pair();
        let pipe = pipe_on(&wire);

        pipe.deliver(BlockFlags::empty(), Bytes::from_static(b"x")).unwrap();
        let mut input = pipe.input_stream().unwrap();
        pipe.cancel();

        let mut buf = [0u8; 4];
        assert_eq!(input.read(&mut buf).await.unwrap(), 1);
        let err = input.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[tokio::test]
    async fn input_stream_takes_the_only_consumer_seat() {
        let (wire, _peer) = Wire::pair();
        let pipe = pipe_on(&wire);

        let _input = pipe.input_stream().unwrap();
        assert!(matches!(
            pipe.block_stream(),
            Err(Error::AlreadyConsumed(_))
        ));
    }
}

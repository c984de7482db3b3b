//! One outstanding call.
//!
//! A `Pipe` scopes a single RPC invocation: the Open that starts it, the
//! Block traffic inside it, and the Close that resolves it. The pipe is
//! owned by its session's [`PipeSpace`](crate::space::PipeSpace); user
//! code and handlers hold it as `Arc<Pipe>` and reach the session only
//! through a cheap posting handle, so there is no ownership cycle.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use asterisque_core::{
    Abort, BlockFlags, CircuitBreaker, CloseResult, Error, Message, Value,
};

use crate::session::SessionPost;

/// Everything a [`PipeSpace`](crate::space::PipeSpace) needs to build a
/// pipe on the session's behalf.
pub(crate) struct PipeContext {
    pub post: SessionPost,
    pub max_backlog: usize,
    pub meter: Arc<CircuitBreaker>,
}

pub(crate) enum Chunk {
    Data(Bytes),
    Eof,
}

struct Inbox {
    tx: Option<mpsc::UnboundedSender<Chunk>>,
    rx: Option<mpsc::UnboundedReceiver<Chunk>>,
    eof_seen: bool,
}

/// Exactly-once completion cell that any number of callers may await.
struct ResultCell {
    tx: watch::Sender<Option<CloseResult>>,
}

impl ResultCell {
    fn new() -> Self {
        let (tx, _) = watch::channel(None);
        ResultCell { tx }
    }

    /// First completion wins; later attempts are no-ops.
    fn complete(&self, result: CloseResult) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(result);
                true
            } else {
                false
            }
        })
    }

    fn is_complete(&self) -> bool {
        self.tx.borrow().is_some()
    }

    async fn wait(&self) -> CloseResult {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(|slot| slot.is_some()).await {
            Ok(slot) => match &*slot {
                Some(result) => result.clone(),
                None => Err(Abort::session_closed()),
            },
            // The sender lives in the cell itself, so this only happens
            // if the pipe was dropped out from under the waiter.
            Err(_) => Err(Abort::session_closed()),
        }
    }
}

pub struct Pipe {
    id: u16,
    function_id: u16,
    priority: i8,
    post: SessionPost,
    closed: AtomicBool,
    result: ResultCell,
    inbox: Mutex<Inbox>,
    backlog: Arc<AtomicUsize>,
    max_backlog: usize,
    meter: Arc<CircuitBreaker>,
}

impl Pipe {
    pub(crate) fn new(id: u16, function_id: u16, priority: i8, ctx: &PipeContext) -> Arc<Pipe> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Pipe {
            id,
            function_id,
            priority,
            post: ctx.post.clone(),
            closed: AtomicBool::new(false),
            result: ResultCell::new(),
            inbox: Mutex::new(Inbox {
                tx: Some(tx),
                rx: Some(rx),
                eof_seen: false,
            }),
            backlog: Arc::new(AtomicUsize::new(0)),
            max_backlog: ctx.max_backlog,
            meter: ctx.meter.clone(),
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn function_id(&self) -> u16 {
        self.function_id
    }

    pub fn priority(&self) -> i8 {
        self.priority
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Caller side: announce the call to the peer.
    pub(crate) fn open(&self, params: Vec<Value>) -> Result<(), Error> {
        self.post.post(Message::Open {
            pipe_id: self.id,
            priority: self.priority,
            function_id: self.function_id,
            params,
        })
    }

    /// Stream one payload to the peer. Waits at the session's overload
    /// gate when the outbound side is congested. A send on a closed
    /// pipe is dropped with a warning rather than failed, so streaming
    /// producers need no shutdown coordination.
    pub async fn send_block(&self, payload: Bytes) -> Result<(), Error> {
        if self.is_closed() {
            tracing::warn!(pipe = self.id, "dropping block send on closed pipe");
            return Ok(());
        }
        let msg = Message::block(self.id, self.priority, payload)?;
        match self.post.post_block(msg).await {
            Err(Error::Closed(_)) => {
                tracing::warn!(pipe = self.id, "dropping block send, outbound closed");
                Ok(())
            }
            other => other,
        }
    }

    /// Terminate this pipe's payload stream.
    pub async fn send_eof(&self) -> Result<(), Error> {
        if self.is_closed() {
            tracing::warn!(pipe = self.id, "dropping EOF send on closed pipe");
            return Ok(());
        }
        let msg = Message::eof_block(self.id, self.priority);
        match self.post.post_block(msg).await {
            Err(Error::Closed(_)) => Ok(()),
            other => other,
        }
    }

    /// The call's outcome. Fulfilled exactly once; any number of tasks
    /// may await it, before or after completion.
    pub async fn result(&self) -> CloseResult {
        self.result.wait().await
    }

    /// The finite sequence of received block payloads, ended by the
    /// peer's EOF. A pipe has exactly one consumer; a second take fails.
    pub fn block_stream(&self) -> Result<BlockStream, Error> {
        Ok(BlockStream {
            recv: self.take_receiver()?,
            done: false,
        })
    }

    pub(crate) fn take_receiver(&self) -> Result<BlockReceiver, Error> {
        let mut inbox = self.inbox.lock();
        let rx = inbox
            .rx
            .take()
            .ok_or(Error::AlreadyConsumed("pipe block stream"))?;
        Ok(BlockReceiver {
            rx,
            backlog: self.backlog.clone(),
            meter: self.meter.clone(),
        })
    }

    /// Local success termination: sends a Close to the peer and settles
    /// the result future. Idempotent.
    pub fn close_success(&self, value: Value) {
        self.close_local(Ok(value));
    }

    /// Local failure termination. Idempotent.
    pub fn close_failure(&self, code: i32, message: impl Into<String>) {
        self.close_local(Err(Abort::new(code, message)));
    }

    /// Cooperative cancellation: settles the future with a cancellation
    /// failure and tells the peer if the wire still accepts it.
    pub fn cancel(&self) {
        self.close_local(Err(Abort::cancelled()));
    }

    fn close_local(&self, result: CloseResult) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let close = Message::Close {
            pipe_id: self.id,
            result: result.clone(),
        };
        if let Err(e) = self.post.post(close) {
            tracing::warn!(pipe = self.id, error = %e, "could not post close");
        }
        self.finish(result);
    }

    /// Peer ended the call; settle locally without echoing a Close.
    pub(crate) fn on_remote_close(&self, result: CloseResult) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.finish(result);
    }

    /// Session teardown: settle without posting anything.
    pub(crate) fn abort_local(&self, abort: Abort) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.finish(Err(abort));
    }

    fn finish(&self, result: CloseResult) {
        self.result.complete(result);
        // Dropping the sender ends the block stream; a reader that has
        // not seen EOF observes an interrupted stream.
        self.inbox.lock().tx = None;
        self.post.destroy(self.id);
        tracing::debug!(pipe = self.id, "closed");
    }

    /// Route one received block into the inbound stream. Fails with
    /// `ResourceExhausted` when the consumer has fallen more than
    /// `max_backlog` blocks behind.
    pub(crate) fn deliver(&self, flags: BlockFlags, payload: Bytes) -> Result<(), Error> {
        if self.is_closed() {
            tracing::debug!(pipe = self.id, "dropping block for closed pipe");
            return Ok(());
        }
        let mut inbox = self.inbox.lock();
        if inbox.eof_seen {
            tracing::debug!(pipe = self.id, "dropping block after EOF");
            return Ok(());
        }
        if inbox.tx.is_none() {
            return Ok(());
        }

        if !payload.is_empty() {
            let pending = self.backlog.fetch_add(1, Ordering::AcqRel) + 1;
            if pending > self.max_backlog {
                self.backlog.fetch_sub(1, Ordering::AcqRel);
                return Err(Error::ResourceExhausted(format!(
                    "pipe {} backlog exceeds {} blocks",
                    self.id, self.max_backlog
                )));
            }
            self.meter.increment();
            let delivered = inbox
                .tx
                .as_ref()
                .is_some_and(|tx| tx.send(Chunk::Data(payload)).is_ok());
            if !delivered {
                self.backlog.fetch_sub(1, Ordering::AcqRel);
                self.meter.decrement();
            }
        }
        if flags.contains(BlockFlags::EOF) {
            inbox.eof_seen = true;
            if let Some(tx) = inbox.tx.as_ref() {
                let _ = tx.send(Chunk::Eof);
            }
        }
        Ok(())
    }

    /// Whether the result future has been settled.
    pub fn is_settled(&self) -> bool {
        self.result.is_complete()
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.id)
            .field("function_id", &self.function_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Shared consumer seat for a pipe's inbound blocks, with the load
/// accounting attached to consumption.
pub(crate) struct BlockReceiver {
    rx: mpsc::UnboundedReceiver<Chunk>,
    backlog: Arc<AtomicUsize>,
    meter: Arc<CircuitBreaker>,
}

impl BlockReceiver {
    fn consumed_one(&self) {
        self.backlog.fetch_sub(1, Ordering::AcqRel);
        self.meter.decrement();
    }

    pub(crate) fn poll_chunk(&mut self, cx: &mut Context<'_>) -> Poll<Option<Chunk>> {
        let polled = self.rx.poll_recv(cx);
        if let Poll::Ready(Some(Chunk::Data(_))) = &polled {
            self.consumed_one();
        }
        polled
    }
}

impl Drop for BlockReceiver {
    fn drop(&mut self) {
        // Blocks that were delivered but never read still count against
        // the session's load until released here.
        self.rx.close();
        while let Ok(chunk) = self.rx.try_recv() {
            if matches!(chunk, Chunk::Data(_)) {
                self.consumed_one();
            }
        }
    }
}

/// Lazy, finite sequence of received block payloads. Ends after the
/// peer's EOF block, or immediately if the pipe closed first.
pub struct BlockStream {
    recv: BlockReceiver,
    done: bool,
}

impl futures_core::Stream for BlockStream {
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.recv.poll_chunk(cx) {
            Poll::Ready(Some(Chunk::Data(payload))) => Poll::Ready(Some(payload)),
            Poll::Ready(Some(Chunk::Eof)) | Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asterisque_core::{abort, Wire};
    use futures_util::StreamExt;

    fn test_context(wire: &Arc<Wire>) -> PipeContext {
        PipeContext {
            post: SessionPost::for_tests(wire.clone()),
            max_backlog: 4,
            meter: Arc::new(CircuitBreaker::new("inbound", 100, 200)),
        }
    }

    #[tokio::test]
    async fn result_is_fulfilled_exactly_once() {
        let (wire, _peer) = Wire::pair();
        let ctx = test_context(&wire);
        let pipe = Pipe::new(1, 10, 0, &ctx);

        pipe.close_success(Value::I32(1));
        pipe.close_success(Value::I32(2));
        pipe.close_failure(abort::UNEXPECTED, "late");

        assert_eq!(pipe.result().await, Ok(Value::I32(1)));
        // Await again: same settled value.
        assert_eq!(pipe.result().await, Ok(Value::I32(1)));
    }

    #[tokio::test]
    async fn local_close_posts_exactly_one_close_message() {
        let (wire, peer) = Wire::pair();
        let ctx = test_context(&wire);
        let pipe = Pipe::new(1, 10, 0, &ctx);

        pipe.close_success(Value::Null);
        pipe.close_success(Value::Null);

        assert!(matches!(
            peer.inbound().take().await,
            Some(Message::Close { pipe_id: 1, result: Ok(Value::Null) })
        ));
        assert!(peer.inbound().is_empty());
    }

    #[tokio::test]
    async fn block_stream_yields_until_eof() {
        let (wire, _peer) = Wire::pair();
        let ctx = test_context(&wire);
        let pipe = Pipe::new(1, 10, 0, &ctx);

        pipe.deliver(BlockFlags::empty(), Bytes::from_static(&[1])).unwrap();
        pipe.deliver(BlockFlags::empty(), Bytes::from_static(&[2, 3])).unwrap();
        pipe.deliver(BlockFlags::EOF, Bytes::new()).unwrap();

        let stream = pipe.block_stream().unwrap();
        let collected: Vec<Vec<u8>> = stream.map(|b| b.to_vec()).collect().await;
        assert_eq!(collected, vec![vec![1], vec![2, 3]]);
    }

    #[tokio::test]
    async fn second_consumer_is_refused() {
        let (wire, _peer) = Wire::pair();
        let ctx = test_context(&wire);
        let pipe = Pipe::new(1, 10, 0, &ctx);

        let _first = pipe.block_stream().unwrap();
        assert!(matches!(
            pipe.block_stream(),
            Err(Error::AlreadyConsumed(_))
        ));
    }

    #[tokio::test]
    async fn backlog_bound_is_enforced() {
        let (wire, _peer) = Wire::pair();
        let ctx = test_context(&wire); // max_backlog = 4
        let pipe = Pipe::new(1, 10, 0, &ctx);

        for _ in 0..4 {
            pipe.deliver(BlockFlags::empty(), Bytes::from_static(&[0])).unwrap();
        }
        assert!(matches!(
            pipe.deliver(BlockFlags::empty(), Bytes::from_static(&[0])),
            Err(Error::ResourceExhausted(_))
        ));
    }

    #[tokio::test]
    async fn consuming_releases_backlog_and_meter() {
        let (wire, _peer) = Wire::pair();
        let ctx = test_context(&wire);
        let meter = ctx.meter.clone();
        let pipe = Pipe::new(1, 10, 0, &ctx);

        for _ in 0..3 {
            pipe.deliver(BlockFlags::empty(), Bytes::from_static(&[0])).unwrap();
        }
        assert_eq!(meter.load(), 3);

        let mut stream = pipe.block_stream().unwrap();
        stream.next().await.unwrap();
        assert_eq!(meter.load(), 2);

        // Dropping the stream releases what was never read.
        drop(stream);
        assert_eq!(meter.load(), 0);
    }

    #[tokio::test]
    async fn sends_after_close_are_dropped_not_failed() {
        let (wire, peer) = Wire::pair();
        let ctx = test_context(&wire);
        let pipe = Pipe::new(1, 10, 0, &ctx);

        pipe.close_success(Value::Null);
        pipe.send_block(Bytes::from_static(&[1, 2])).await.unwrap();
        pipe.send_eof().await.unwrap();

        // Only the Close ever reached the peer.
        assert!(matches!(
            peer.inbound().take().await,
            Some(Message::Close { .. })
        ));
        assert!(peer.inbound().is_empty());
    }

    #[tokio::test]
    async fn remote_close_settles_without_echo() {
        let (wire, peer) = Wire::pair();
        let ctx = test_context(&wire);
        let pipe = Pipe::new(1, 10, 0, &ctx);

        pipe.on_remote_close(Err(Abort::new(abort::FUNCTION_NOT_FOUND, "nope")));
        assert!(pipe.is_closed());
        assert_eq!(
            pipe.result().await,
            Err(Abort::new(abort::FUNCTION_NOT_FOUND, "nope"))
        );
        assert!(peer.inbound().is_empty());
    }

    #[tokio::test]
    async fn cancel_reports_cancellation() {
        let (wire, _peer) = Wire::pair();
        let ctx = test_context(&wire);
        let pipe = Pipe::new(1, 10, 0, &ctx);

        pipe.cancel();
        let result = pipe.result().await;
        assert_eq!(result.unwrap_err().code, abort::CANCELLED);
    }
}

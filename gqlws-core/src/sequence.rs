//! One pull-based contract for every kind of operation outcome.
//!
//! Whatever the executor hands back (a value, an error, a future, a stream,
//! or values pushed through a callback) ends up behind [`ResultSequence`]:
//! `advance` yields the next item or `Finished`, `cancel` tears consumption
//! down. Completed and failed sequences stay that way; pulling again repeats
//! the terminal signal without re-running anything.

use crate::error::ExecutionError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

/// One pull from a sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum Step<T> {
    Item(T),
    Finished,
}

impl<T> Step<T> {
    pub fn is_finished(&self) -> bool {
        matches!(self, Step::Finished)
    }

    pub fn into_item(self) -> Option<T> {
        match self {
            Step::Item(item) => Some(item),
            Step::Finished => None,
        }
    }
}

#[async_trait]
pub trait ResultSequence<T: Send + 'static>: Send + Sync {
    /// Pull the next item.
    async fn advance(&self) -> Result<Step<T>, ExecutionError>;

    /// Stop consuming. Safe to call any number of times.
    async fn cancel(&self) -> Result<(), ExecutionError>;

    /// Cancel, then reject with `error`.
    async fn fail(&self, error: ExecutionError) -> Result<Step<T>, ExecutionError> {
        let _ = self.cancel().await;
        Err(error)
    }
}

pub type BoxSequence<T> = Box<dyn ResultSequence<T>>;

/// What an executor produced for one operation.
pub enum ExecutionOutcome<T: Send + 'static> {
    Value(T),
    Error(ExecutionError),
    Deferred(BoxFuture<'static, Result<T, ExecutionError>>),
    Stream(BoxStream<'static, Result<T, ExecutionError>>),
    Sequence(BoxSequence<T>),
    Empty,
}

impl<T: Send + 'static> fmt::Debug for ExecutionOutcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            ExecutionOutcome::Value(_) => "Value",
            ExecutionOutcome::Error(_) => "Error",
            ExecutionOutcome::Deferred(_) => "Deferred",
            ExecutionOutcome::Stream(_) => "Stream",
            ExecutionOutcome::Sequence(_) => "Sequence",
            ExecutionOutcome::Empty => "Empty",
        };
        f.debug_tuple("ExecutionOutcome").field(&kind).finish()
    }
}

/// Wraps an outcome in the sequence contract. Existing sequences are
/// returned as they are.
pub fn normalize<T: Send + 'static>(outcome: ExecutionOutcome<T>) -> BoxSequence<T> {
    match outcome {
        ExecutionOutcome::Sequence(sequence) => sequence,
        ExecutionOutcome::Value(value) => Box::new(SingleValue::ready(value)),
        ExecutionOutcome::Deferred(future) => Box::new(SingleValue::deferred(future)),
        ExecutionOutcome::Error(error) => Box::new(FailedSequence::new(error)),
        ExecutionOutcome::Stream(stream) => Box::new(StreamSequence::new(stream)),
        ExecutionOutcome::Empty => Box::new(EmptySequence),
    }
}

enum SingleState<T> {
    Ready(T),
    Pending(BoxFuture<'static, Result<T, ExecutionError>>),
    Delivered,
    Failed(ExecutionError),
}

/// Yields one value (possibly once a future resolves), then `Finished`.
pub struct SingleValue<T> {
    state: Mutex<SingleState<T>>,
}

impl<T> SingleValue<T> {
    pub fn ready(value: T) -> Self {
        Self {
            state: Mutex::new(SingleState::Ready(value)),
        }
    }

    pub fn deferred(future: BoxFuture<'static, Result<T, ExecutionError>>) -> Self {
        Self {
            state: Mutex::new(SingleState::Pending(future)),
        }
    }
}

impl<T> fmt::Debug for SingleValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleValue").finish_non_exhaustive()
    }
}

#[async_trait]
impl<T: Send + 'static> ResultSequence<T> for SingleValue<T> {
    async fn advance(&self) -> Result<Step<T>, ExecutionError> {
        // Concurrent callers queue on the lock and find `Delivered` afterwards.
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, SingleState::Delivered) {
            SingleState::Ready(value) => Ok(Step::Item(value)),
            SingleState::Pending(future) => match future.await {
                Ok(value) => Ok(Step::Item(value)),
                Err(error) => {
                    *state = SingleState::Failed(error.clone());
                    Err(error)
                }
            },
            SingleState::Delivered => Ok(Step::Finished),
            SingleState::Failed(error) => {
                *state = SingleState::Failed(error.clone());
                Err(error)
            }
        }
    }

    async fn cancel(&self) -> Result<(), ExecutionError> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, SingleState::Delivered) {
            SingleState::Ready(_) | SingleState::Delivered => Ok(()),
            SingleState::Pending(future) => match future.await {
                Ok(_) => Ok(()),
                Err(error) => {
                    *state = SingleState::Failed(error.clone());
                    Err(error)
                }
            },
            SingleState::Failed(error) => {
                *state = SingleState::Failed(error.clone());
                Err(error)
            }
        }
    }
}

/// Rejects every pull and every cancel with the same error.
#[derive(Debug, Clone)]
pub struct FailedSequence {
    error: ExecutionError,
}

impl FailedSequence {
    pub fn new(error: ExecutionError) -> Self {
        Self { error }
    }
}

#[async_trait]
impl<T: Send + 'static> ResultSequence<T> for FailedSequence {
    async fn advance(&self) -> Result<Step<T>, ExecutionError> {
        Err(self.error.clone())
    }

    async fn cancel(&self) -> Result<(), ExecutionError> {
        Err(self.error.clone())
    }
}

/// Nothing to deliver.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptySequence;

#[async_trait]
impl<T: Send + 'static> ResultSequence<T> for EmptySequence {
    async fn advance(&self) -> Result<Step<T>, ExecutionError> {
        Ok(Step::Finished)
    }

    async fn cancel(&self) -> Result<(), ExecutionError> {
        Ok(())
    }
}

enum StreamState<T> {
    Active(BoxStream<'static, Result<T, ExecutionError>>),
    Completed,
    Failed(ExecutionError),
}

/// Pulls straight from a native stream; nothing is buffered in between.
pub struct StreamSequence<T> {
    state: Mutex<StreamState<T>>,
    cancelled: CancellationToken,
}

impl<T> StreamSequence<T> {
    pub fn new(stream: BoxStream<'static, Result<T, ExecutionError>>) -> Self {
        Self {
            state: Mutex::new(StreamState::Active(stream)),
            cancelled: CancellationToken::new(),
        }
    }
}

impl<T> fmt::Debug for StreamSequence<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSequence")
            .field("cancelled", &self.cancelled.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<T: Send + 'static> ResultSequence<T> for StreamSequence<T> {
    async fn advance(&self) -> Result<Step<T>, ExecutionError> {
        let mut state = tokio::select! {
            biased;
            _ = self.cancelled.cancelled() => return Ok(Step::Finished),
            guard = self.state.lock() => guard,
        };

        let next = match &mut *state {
            StreamState::Active(stream) => tokio::select! {
                biased;
                _ = self.cancelled.cancelled() => None,
                next = stream.next() => Some(next),
            },
            StreamState::Completed => return Ok(Step::Finished),
            StreamState::Failed(error) => return Err(error.clone()),
        };

        match next {
            Some(Some(Ok(item))) => Ok(Step::Item(item)),
            Some(Some(Err(error))) => {
                *state = StreamState::Failed(error.clone());
                Err(error)
            }
            Some(None) | None => {
                *state = StreamState::Completed;
                Ok(Step::Finished)
            }
        }
    }

    async fn cancel(&self) -> Result<(), ExecutionError> {
        self.cancelled.cancel();
        let mut state = self.state.lock().await;
        match &*state {
            StreamState::Failed(error) => Err(error.clone()),
            _ => {
                *state = StreamState::Completed;
                Ok(())
            }
        }
    }
}

type Waiter<T> = oneshot::Sender<Result<Step<T>, ExecutionError>>;

struct PushState<T> {
    buffer: VecDeque<Result<T, ExecutionError>>,
    waiters: VecDeque<Waiter<T>>,
    closed: bool,
    // Source signalled its own end; buffered entries still drain.
    ended: bool,
    release: Option<Box<dyn FnOnce() + Send>>,
}

fn lock_state<T>(shared: &StdMutex<PushState<T>>) -> MutexGuard<'_, PushState<T>> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Turns a callback-driven source into a pull-based sequence.
///
/// Values pushed while nobody is waiting are buffered; pulls made while the
/// buffer is empty wait in line. Both queues are FIFO and guarded by one lock.
pub struct PushSequence<T> {
    shared: Arc<StdMutex<PushState<T>>>,
}

/// Producer half of a [`PushSequence`], handed to the subscription source.
pub struct PushSender<T> {
    shared: Arc<StdMutex<PushState<T>>>,
}

impl<T> Clone for PushSender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for PushSender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushSender")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> fmt::Debug for PushSequence<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock_state(&self.shared);
        f.debug_struct("PushSequence")
            .field("buffered", &state.buffer.len())
            .field("waiting", &state.waiters.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T> PushSequence<T> {
    pub fn channel() -> (PushSequence<T>, PushSender<T>) {
        let shared = Arc::new(StdMutex::new(PushState {
            buffer: VecDeque::new(),
            waiters: VecDeque::new(),
            closed: false,
            ended: false,
            release: None,
        }));
        (
            PushSequence {
                shared: Arc::clone(&shared),
            },
            PushSender { shared },
        )
    }

    /// Registers how to release the source's handle once it is known.
    ///
    /// Runs at cancellation, or right away if the sequence is already cancelled.
    pub fn on_release(&self, release: impl FnOnce() + Send + 'static) {
        let mut state = lock_state(&self.shared);
        if state.closed {
            drop(state);
            release();
        } else {
            state.release = Some(Box::new(release));
        }
    }

    pub fn buffered(&self) -> usize {
        lock_state(&self.shared).buffer.len()
    }

    pub fn waiting(&self) -> usize {
        lock_state(&self.shared).waiters.len()
    }
}

impl<T> PushSender<T> {
    /// Delivers one value or error. Returns `false` once the sequence is
    /// cancelled; the value is dropped in that case.
    pub fn push(&self, value: Result<T, ExecutionError>) -> bool {
        let mut state = lock_state(&self.shared);
        if state.closed || state.ended {
            return false;
        }

        let mut pending = value.map(Step::Item);
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(pending) {
                Ok(()) => return true,
                // That puller went away; offer the value to the next one.
                Err(returned) => pending = returned,
            }
        }

        match pending {
            Ok(Step::Item(item)) => state.buffer.push_back(Ok(item)),
            Err(error) => state.buffer.push_back(Err(error)),
            Ok(Step::Finished) => {}
        }
        true
    }

    /// Ends the sequence from the source side. Pullers see the values
    /// already buffered, then `Finished`.
    pub fn finish(&self) {
        let mut state = lock_state(&self.shared);
        if state.closed || state.ended {
            return;
        }
        state.ended = true;
        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(Ok(Step::Finished));
        }
    }

    pub fn is_closed(&self) -> bool {
        lock_state(&self.shared).closed
    }
}

#[async_trait]
impl<T: Send + 'static> ResultSequence<T> for PushSequence<T> {
    async fn advance(&self) -> Result<Step<T>, ExecutionError> {
        let receiver = {
            let mut state = lock_state(&self.shared);
            if let Some(next) = state.buffer.pop_front() {
                return next.map(Step::Item);
            }
            if state.closed || state.ended {
                return Ok(Step::Finished);
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        receiver.await.unwrap_or(Ok(Step::Finished))
    }

    async fn cancel(&self) -> Result<(), ExecutionError> {
        let release = {
            let mut state = lock_state(&self.shared);
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            for waiter in state.waiters.drain(..) {
                let _ = waiter.send(Ok(Step::Finished));
            }
            state.buffer.clear();
            state.release.take()
        };

        if let Some(release) = release {
            release();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_single_value_delivers_once() {
        let seq = normalize(ExecutionOutcome::Value(42));

        assert_eq!(seq.advance().await.unwrap(), Step::Item(42));
        assert_eq!(seq.advance().await.unwrap(), Step::Finished);
        assert_eq!(seq.advance().await.unwrap(), Step::Finished);
        assert!(seq.cancel().await.is_ok());
    }

    #[tokio::test]
    async fn test_single_value_concurrent_advances() {
        let seq: Arc<dyn ResultSequence<u32>> =
            Arc::new(SingleValue::deferred(async { Ok(7) }.boxed()));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let seq = Arc::clone(&seq);
            handles.push(tokio::spawn(async move { seq.advance().await }));
        }

        let mut items = 0;
        let mut finished = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                Step::Item(7) => items += 1,
                Step::Finished => finished += 1,
                other => panic!("unexpected step: {:?}", other),
            }
        }
        assert_eq!(items, 1);
        assert_eq!(finished, 15);
    }

    #[tokio::test]
    async fn test_failed_outcome_rejects_advance_and_cancel() {
        let error = ExecutionError::new("rejected");
        let seq = normalize::<u32>(ExecutionOutcome::Error(error.clone()));

        assert_eq!(seq.advance().await.unwrap_err(), error);
        assert_eq!(seq.cancel().await.unwrap_err(), error);
        assert_eq!(seq.advance().await.unwrap_err(), error);
    }

    #[tokio::test]
    async fn test_deferred_failure_rejects_advance_and_cancel() {
        let error = ExecutionError::new("later");
        let failing = error.clone();
        let seq = normalize::<u32>(ExecutionOutcome::Deferred(
            async move { Err(failing) }.boxed(),
        ));

        assert_eq!(seq.advance().await.unwrap_err(), error);
        assert_eq!(seq.cancel().await.unwrap_err(), error);
    }

    #[tokio::test]
    async fn test_deferred_failure_seen_through_cancel_first() {
        let seq = normalize::<u32>(ExecutionOutcome::Deferred(
            async { Err(ExecutionError::new("x")) }.boxed(),
        ));

        assert_eq!(seq.cancel().await.unwrap_err().message(), "x");
        assert_eq!(seq.advance().await.unwrap_err().message(), "x");
    }

    #[tokio::test]
    async fn test_empty_outcome() {
        let seq = normalize::<u32>(ExecutionOutcome::Empty);
        assert_eq!(seq.advance().await.unwrap(), Step::Finished);
        assert!(seq.cancel().await.is_ok());
        assert!(seq.cancel().await.is_ok());
    }

    #[tokio::test]
    async fn test_fail_always_rejects_with_given_error() {
        let seq = normalize(ExecutionOutcome::Value(1));
        let error = ExecutionError::new("cut short");
        assert_eq!(seq.fail(error.clone()).await.unwrap_err(), error);

        let empty = normalize::<u32>(ExecutionOutcome::Empty);
        assert_eq!(empty.fail(error.clone()).await.unwrap_err(), error);
    }

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl ResultSequence<u32> for Counting {
        async fn advance(&self) -> Result<Step<u32>, ExecutionError> {
            Ok(Step::Item(self.0.fetch_add(1, Ordering::SeqCst) as u32))
        }

        async fn cancel(&self) -> Result<(), ExecutionError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_existing_sequence_passes_through() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seq = normalize(ExecutionOutcome::Sequence(Box::new(Counting(Arc::clone(
            &calls,
        )))));

        assert_eq!(seq.advance().await.unwrap(), Step::Item(0));
        assert_eq!(seq.advance().await.unwrap(), Step::Item(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stream_items_then_finished() {
        let stream = futures::stream::iter(vec![Ok(1), Ok(2)]).boxed();
        let seq = normalize(ExecutionOutcome::Stream(stream));

        assert_eq!(seq.advance().await.unwrap(), Step::Item(1));
        assert_eq!(seq.advance().await.unwrap(), Step::Item(2));
        assert_eq!(seq.advance().await.unwrap(), Step::Finished);
        assert_eq!(seq.advance().await.unwrap(), Step::Finished);
    }

    #[tokio::test]
    async fn test_stream_error_is_terminal() {
        let stream =
            futures::stream::iter(vec![Ok(1), Err(ExecutionError::new("broke")), Ok(3)]).boxed();
        let seq = normalize(ExecutionOutcome::Stream(stream));

        assert_eq!(seq.advance().await.unwrap(), Step::Item(1));
        assert_eq!(seq.advance().await.unwrap_err().message(), "broke");
        assert_eq!(seq.advance().await.unwrap_err().message(), "broke");
    }

    #[tokio::test]
    async fn test_stream_cancel_wakes_pending_advance() {
        let seq: Arc<StreamSequence<u32>> =
            Arc::new(StreamSequence::new(futures::stream::pending().boxed()));

        let puller = {
            let seq = Arc::clone(&seq);
            tokio::spawn(async move { seq.advance().await })
        };
        tokio::task::yield_now().await;

        seq.cancel().await.unwrap();
        assert_eq!(puller.await.unwrap().unwrap(), Step::Finished);
        assert_eq!(seq.advance().await.unwrap(), Step::Finished);
    }

    #[tokio::test]
    async fn test_push_buffers_in_order() {
        let (seq, sender) = PushSequence::channel();

        assert!(sender.push(Ok(1)));
        assert!(sender.push(Err(ExecutionError::new("mid"))));
        assert!(sender.push(Ok(2)));
        assert_eq!(seq.buffered(), 3);

        assert_eq!(seq.advance().await.unwrap(), Step::Item(1));
        assert_eq!(seq.advance().await.unwrap_err().message(), "mid");
        assert_eq!(seq.advance().await.unwrap(), Step::Item(2));
        assert_eq!(seq.buffered(), 0);
    }

    #[tokio::test]
    async fn test_push_satisfies_oldest_waiter_first() {
        let (seq, sender) = PushSequence::channel();
        let seq = Arc::new(seq);

        let first = {
            let seq = Arc::clone(&seq);
            tokio::spawn(async move { seq.advance().await })
        };
        while seq.waiting() < 1 {
            tokio::task::yield_now().await;
        }
        let second = {
            let seq = Arc::clone(&seq);
            tokio::spawn(async move { seq.advance().await })
        };
        while seq.waiting() < 2 {
            tokio::task::yield_now().await;
        }

        sender.push(Ok("a"));
        sender.push(Ok("b"));

        assert_eq!(first.await.unwrap().unwrap(), Step::Item("a"));
        assert_eq!(second.await.unwrap().unwrap(), Step::Item("b"));
        assert_eq!(seq.buffered(), 0);
    }

    #[tokio::test]
    async fn test_push_cancel_finishes_waiters_and_drops_later_pushes() {
        let (seq, sender) = PushSequence::<u32>::channel();
        let seq = Arc::new(seq);

        let waiter = {
            let seq = Arc::clone(&seq);
            tokio::spawn(async move { seq.advance().await })
        };
        while seq.waiting() < 1 {
            tokio::task::yield_now().await;
        }

        seq.cancel().await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), Step::Finished);

        assert!(!sender.push(Ok(5)));
        assert!(sender.is_closed());
        assert_eq!(seq.buffered(), 0);
        assert_eq!(seq.advance().await.unwrap(), Step::Finished);
    }

    #[tokio::test]
    async fn test_push_cancel_clears_buffer() {
        let (seq, sender) = PushSequence::channel();
        sender.push(Ok(1));
        seq.cancel().await.unwrap();
        assert_eq!(seq.advance().await.unwrap(), Step::Finished);
    }

    #[tokio::test]
    async fn test_push_release_runs_once() {
        let (seq, _sender) = PushSequence::<u32>::channel();
        let released = Arc::new(AtomicUsize::new(0));
        {
            let released = Arc::clone(&released);
            seq.on_release(move || {
                released.fetch_add(1, Ordering::SeqCst);
            });
        }

        seq.cancel().await.unwrap();
        seq.cancel().await.unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_push_release_registered_after_cancel_runs_immediately() {
        let (seq, _sender) = PushSequence::<u32>::channel();
        seq.cancel().await.unwrap();

        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        seq.on_release(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_push_skips_abandoned_waiter() {
        let (seq, sender) = PushSequence::channel();

        // An advance that is dropped mid-wait leaves a dead waiter behind.
        let mut abandoned = seq.advance();
        assert!(futures::poll!(&mut abandoned).is_pending());
        drop(abandoned);

        assert!(sender.push(Ok(9)));
        assert_eq!(seq.advance().await.unwrap(), Step::Item(9));
    }

    #[tokio::test]
    async fn test_push_finish_drains_buffer_then_finishes() {
        let (seq, sender) = PushSequence::channel();
        sender.push(Ok("last"));
        sender.finish();

        assert!(!sender.push(Ok("dropped")));
        assert_eq!(seq.advance().await.unwrap(), Step::Item("last"));
        assert_eq!(seq.advance().await.unwrap(), Step::Finished);
        assert_eq!(seq.advance().await.unwrap(), Step::Finished);
    }

    #[tokio::test]
    async fn test_push_finish_wakes_waiter() {
        let (seq, sender) = PushSequence::<u32>::channel();
        let seq = Arc::new(seq);
        let waiter = {
            let seq = Arc::clone(&seq);
            tokio::spawn(async move { seq.advance().await })
        };
        while seq.waiting() < 1 {
            tokio::task::yield_now().await;
        }

        sender.finish();
        assert_eq!(waiter.await.unwrap().unwrap(), Step::Finished);
    }
}

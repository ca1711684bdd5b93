//! Operation queue and retry coordination.
//!
//! Operations are drained by a single task, one at a time, in FIFO order. A
//! failed operation that still has retries left goes back to the head of the
//! queue with a `not_before` instant, and other ready operations are served
//! while it waits out its backoff.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::RetryBackoff;
use crate::engine::{OperationOutput, OperationRequest};
use crate::error::{Error, Result};
use crate::fallback::FallbackExecutor;
use crate::pool::ConnectionPool;

/// Receives the single resolution of an enqueued operation.
pub type OperationReceiver = oneshot::Receiver<Result<OperationOutput>>;

/// Bounded retry with backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryCoordinator {
   /// Retries after the first attempt
   pub attempts: u32,
   pub delay: Duration,
   pub backoff: RetryBackoff,
}

impl RetryCoordinator {
   /// Whether an operation that has been retried `retry_count` times may run again
   pub fn should_retry(&self, retry_count: u32) -> bool {
      retry_count < self.attempts
   }

   /// Wait before retry number `retry` (1-based)
   pub fn delay_for(&self, retry: u32) -> Duration {
      self.backoff.delay(self.delay, retry)
   }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
   pub operation_timeout: Duration,
   pub acquire_timeout: Duration,
   pub retry: RetryCoordinator,
}

struct QueuedOperation {
   id: Uuid,
   request: OperationRequest,
   enqueued_at: Instant,
   timeout: Duration,
   retry_count: u32,
   not_before: Option<Instant>,
   sink: oneshot::Sender<Result<OperationOutput>>,
}

impl QueuedOperation {
   fn is_ready(&self, now: Instant) -> bool {
      self.not_before.is_none_or(|at| at <= now)
   }

   fn deadline(&self) -> Instant {
      self.enqueued_at + self.timeout
   }

   fn timed_out(&self) -> Error {
      Error::Timeout {
         waited: self.enqueued_at.elapsed(),
         timeout: self.timeout,
      }
   }

   fn resolve(self, result: Result<OperationOutput>) {
      // The caller may have stopped waiting
      if self.sink.send(result).is_err() {
         trace!(operation = %self.id, "Operation result dropped; caller went away");
      }
   }
}

struct QueueState {
   pending: VecDeque<QueuedOperation>,
   draining: bool,
   accepting: bool,
   cancel: CancellationToken,
   drainer: Option<JoinHandle<()>>,
}

struct QueueInner {
   pool: ConnectionPool,
   fallback: Option<FallbackExecutor>,
   settings: QueueSettings,
   state: Mutex<QueueState>,
   wakeup: Notify,
}

enum Next {
   Run(QueuedOperation),
   Wait(Instant),
   Idle,
   Cancelled,
}

/// FIFO queue of engine operations in front of the [`ConnectionPool`].
///
/// With `fallback` set, operations that exhaust their retries are handed to
/// the fallback executor; without it the last engine error is returned.
#[derive(Clone)]
pub struct OperationQueue {
   inner: Arc<QueueInner>,
}

impl OperationQueue {
   pub fn new(pool: ConnectionPool, fallback: Option<FallbackExecutor>, settings: QueueSettings) -> Self {
      Self {
         inner: Arc::new(QueueInner {
            pool,
            fallback,
            settings,
            state: Mutex::new(QueueState {
               pending: VecDeque::new(),
               draining: false,
               accepting: true,
               cancel: CancellationToken::new(),
               drainer: None,
            }),
            wakeup: Notify::new(),
         }),
      }
   }

   /// Enqueue with the configured operation timeout
   pub fn enqueue(&self, request: OperationRequest) -> OperationReceiver {
      self.enqueue_with_timeout(request, self.inner.settings.operation_timeout)
   }

   /// Append `request` to the tail, starting the drain task if none is running.
   ///
   /// After [`close`](Self::close) the receiver resolves with [`Error::Shutdown`].
   pub fn enqueue_with_timeout(&self, request: OperationRequest, timeout: Duration) -> OperationReceiver {
      let (sink, rx) = oneshot::channel();
      let op = QueuedOperation {
         id: Uuid::new_v4(),
         request,
         enqueued_at: Instant::now(),
         timeout,
         retry_count: 0,
         not_before: None,
         sink,
      };

      let mut state = self.inner.state.lock();
      if !state.accepting {
         drop(state);
         op.resolve(Err(Error::Shutdown));
         return rx;
      }

      trace!(operation = %op.id, kind = ?op.request.kind, "Enqueued operation");
      state.pending.push_back(op);

      if state.draining {
         drop(state);
         self.inner.wakeup.notify_one();
      } else {
         state.draining = true;
         let inner = Arc::clone(&self.inner);
         let cancel = state.cancel.clone();
         state.drainer = Some(tokio::spawn(inner.drain(cancel)));
      }

      rx
   }

   /// Operations waiting for dispatch, including ones backing off before a retry
   pub fn len(&self) -> usize {
      self.inner.state.lock().pending.len()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }

   /// Stop accepting work and resolve everything pending with [`Error::Shutdown`].
   ///
   /// An in-flight operation is resolved with `Shutdown` as well; its engine
   /// call is abandoned. Returns once the drain task has exited.
   pub async fn close(&self) -> usize {
      let (pending, drainer) = {
         let mut state = self.inner.state.lock();
         state.accepting = false;
         state.cancel.cancel();
         (std::mem::take(&mut state.pending), state.drainer.take())
      };

      let count = pending.len();
      for op in pending {
         op.resolve(Err(Error::Shutdown));
      }

      if let Some(handle) = drainer
         && let Err(e) = handle.await
      {
         warn!(error = %e, "Queue drain task ended abnormally");
      }

      debug!(cancelled = count, "Operation queue closed");
      count
   }

   /// Accept operations again after [`close`](Self::close)
   pub fn reopen(&self) {
      let mut state = self.inner.state.lock();
      if !state.accepting {
         state.accepting = true;
         state.draining = false;
         state.cancel = CancellationToken::new();
      }
   }
}

impl QueueInner {
   async fn drain(self: Arc<Self>, cancel: CancellationToken) {
      trace!("Queue drain started");

      loop {
         let op = match self.next(&cancel) {
            Next::Run(op) => op,
            Next::Wait(at) => {
               tokio::select! {
                  biased;
                  _ = cancel.cancelled() => {}
                  _ = self.wakeup.notified() => {}
                  _ = tokio::time::sleep_until(at) => {}
               }
               continue;
            }
            Next::Idle => {
               trace!("Queue drained");
               return;
            }
            Next::Cancelled => return,
         };

         let waited = op.enqueued_at.elapsed();
         if waited > op.timeout {
            debug!(operation = %op.id, ?waited, timeout = ?op.timeout, "Operation timed out before dispatch");
            let timed_out = op.timed_out();
            op.resolve(Err(timed_out));
            continue;
         }

         if op.sink.is_closed() {
            trace!(operation = %op.id, "Skipping operation abandoned by its caller");
            continue;
         }

         let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.attempt(&op) => Some(result),
         };

         match attempt {
            None => op.resolve(Err(Error::Shutdown)),
            Some(Ok(output)) => op.resolve(Ok(output)),
            Some(Err(error @ Error::Timeout { .. })) => op.resolve(Err(error)),
            Some(Err(error)) => self.handle_failure(op, error, &cancel).await,
         }
      }
   }

   /// Pick the next operation, or decide to wait or stop, under the queue lock.
   fn next(&self, cancel: &CancellationToken) -> Next {
      let mut state = self.state.lock();

      if cancel.is_cancelled() {
         // close() already took the queue; anything here was re-queued after that
         for op in state.pending.drain(..) {
            op.resolve(Err(Error::Shutdown));
         }
         state.draining = false;
         return Next::Cancelled;
      }

      let now = Instant::now();
      if let Some(index) = state.pending.iter().position(|op| op.is_ready(now))
         && let Some(op) = state.pending.remove(index)
      {
         return Next::Run(op);
      }

      match state.pending.iter().filter_map(|op| op.not_before).min() {
         Some(at) => Next::Wait(at),
         None => {
            state.draining = false;
            state.drainer = None;
            Next::Idle
         }
      }
   }

   async fn attempt(&self, op: &QueuedOperation) -> Result<OperationOutput> {
      // Never wait for a connection past the operation's own deadline
      let deadline = (Instant::now() + self.settings.acquire_timeout).min(op.deadline());
      let conn = match self.pool.acquire(deadline).await {
         Ok(conn) => conn,
         Err(Error::AcquireTimeout { .. }) if Instant::now() >= op.deadline() => {
            debug!(operation = %op.id, "Operation timed out waiting for a connection");
            return Err(op.timed_out());
         }
         Err(e) => return Err(e),
      };

      trace!(operation = %op.id, connection = %conn.id(), attempt = op.retry_count + 1, "Dispatching operation");
      let result = conn.execute(&op.request).await;
      conn.finish(result.is_err());
      result
   }

   async fn handle_failure(&self, mut op: QueuedOperation, error: Error, cancel: &CancellationToken) {
      let retry = self.settings.retry;

      if error.is_retryable() && retry.should_retry(op.retry_count) {
         op.retry_count += 1;
         let delay = retry.delay_for(op.retry_count);
         debug!(
            operation = %op.id,
            error = %error,
            retry = op.retry_count,
            max_retries = retry.attempts,
            ?delay,
            "Operation failed; retrying"
         );
         op.not_before = Some(Instant::now() + delay);
         self.state.lock().pending.push_front(op);
         return;
      }

      let Some(fallback) = &self.fallback else {
         warn!(operation = %op.id, error = %error, retries = op.retry_count, "Operation failed");
         op.resolve(Err(error));
         return;
      };

      let result = tokio::select! {
         biased;
         _ = cancel.cancelled() => Err(Error::Shutdown),
         result = fallback.execute(&op.request, Some(error)) => result,
      };
      op.resolve(result);
   }
}

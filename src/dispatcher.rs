//! Request dispatcher
//!
//! Outbound device requests are queued as [`RequestRecord`]s. Producers
//! (client API, datastore updater) enqueue without blocking; the single
//! device-I/O actor dequeues, sends, and completes each record exactly once.
//!
//! # Completion
//!
//! A record owns a success and a failure callback. [`RequestRecord::complete`]
//! marks the record completed *before* invoking either callback, so a callback
//! returning an error still leaves the record in a settled state. Completing a
//! record twice returns [`TelewatchError::DoubleCompletion`] and fires nothing.
//!
//! # Shutdown
//!
//! [`RequestDispatcher::shutdown`] wakes every consumer blocked in
//! [`RequestDispatcher::next_blocking`].

use crate::error::{Result, TelewatchError};
use crate::protocol::{Request, Response, ResponseData};
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Called with the request, the decoded response and its parsed payload
pub type SuccessCallback =
    Box<dyn FnOnce(&Request, &Response, &ResponseData) -> Result<()> + Send>;

/// Called with the request and the reason it failed
pub type FailureCallback = Box<dyn FnOnce(&Request, &str) -> Result<()> + Send>;

/// Default priority of a request
pub const DEFAULT_PRIORITY: i32 = 0;

/// One queued device request with its completion callbacks
pub struct RequestRecord {
    id: u64,
    request: Request,
    priority: i32,
    created_at: Instant,
    on_success: Option<SuccessCallback>,
    on_failure: Option<FailureCallback>,
    completed: bool,
}

impl RequestRecord {
    fn new(
        id: u64,
        request: Request,
        on_success: SuccessCallback,
        on_failure: FailureCallback,
        priority: i32,
    ) -> Self {
        Self {
            id,
            request,
            priority,
            created_at: Instant::now(),
            on_success: Some(on_success),
            on_failure: Some(on_failure),
            completed: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Priority recorded at registration. Dequeue order is insertion order.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Time spent since registration
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Complete the record.
    ///
    /// With `success` the success callback receives `response` and `data`,
    /// which must then both be present; otherwise the failure callback runs
    /// with `reason`. The callback's error, if any, is returned.
    pub fn complete(
        &mut self,
        success: bool,
        response: Option<&Response>,
        data: Option<&ResponseData>,
        reason: &str,
    ) -> Result<()> {
        match (success, response, data) {
            (true, Some(response), Some(data)) => self.complete_success(response, data),
            (true, _, _) => {
                self.complete_failure("success reported without a response")?;
                Err(TelewatchError::Api(format!(
                    "request {} completed as success without response data",
                    self.id
                )))
            }
            (false, _, _) => self.complete_failure(reason),
        }
    }

    /// Complete the record successfully
    pub fn complete_success(&mut self, response: &Response, data: &ResponseData) -> Result<()> {
        self.mark_completed()?;
        self.on_failure = None;
        match self.on_success.take() {
            Some(callback) => callback(&self.request, response, data),
            None => Ok(()),
        }
    }

    /// Complete the record with a failure
    pub fn complete_failure(&mut self, reason: &str) -> Result<()> {
        self.mark_completed()?;
        self.on_success = None;
        match self.on_failure.take() {
            Some(callback) => callback(&self.request, reason),
            None => Ok(()),
        }
    }

    fn mark_completed(&mut self) -> Result<()> {
        if self.completed {
            tracing::error!("Request {} ({}) completed twice", self.id, self.request);
            return Err(TelewatchError::DoubleCompletion(format!(
                "request {} ({})",
                self.id, self.request
            )));
        }
        self.completed = true;
        Ok(())
    }
}

impl fmt::Debug for RequestRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestRecord")
            .field("id", &self.id)
            .field("request", &self.request)
            .field("priority", &self.priority)
            .field("completed", &self.completed)
            .finish()
    }
}

/// FIFO of outbound requests shared between producers and the device actor
#[derive(Clone)]
pub struct RequestDispatcher {
    queue_tx: Sender<RequestRecord>,
    queue_rx: Receiver<RequestRecord>,
    shutdown_tx: Arc<Mutex<Option<Sender<()>>>>,
    shutdown_rx: Receiver<()>,
    next_id: Arc<AtomicU64>,
}

impl RequestDispatcher {
    /// Create a dispatcher holding at most `capacity` pending requests
    pub fn new(capacity: usize) -> Self {
        let (queue_tx, queue_rx) = bounded(capacity.max(1));
        let (shutdown_tx, shutdown_rx) = bounded(1);
        Self {
            queue_tx,
            queue_rx,
            shutdown_tx: Arc::new(Mutex::new(Some(shutdown_tx))),
            shutdown_rx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Queue a request. Never blocks; fails if the queue is full.
    pub fn register(
        &self,
        request: Request,
        on_success: SuccessCallback,
        on_failure: FailureCallback,
        priority: i32,
    ) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let record = RequestRecord::new(id, request, on_success, on_failure, priority);
        tracing::trace!("Registering request {}: {}", id, record.request);

        if self.is_shut_down() {
            reject(record, "dispatcher shut down");
            return Err(TelewatchError::Channel("dispatcher shut down".to_string()));
        }

        match self.queue_tx.try_send(record) {
            Ok(()) => {
                // Lost a race with shutdown(): nobody will dequeue it
                if self.is_shut_down() {
                    self.fail_all_pending("dispatcher shut down");
                }
                Ok(id)
            }
            Err(TrySendError::Full(record)) => {
                reject(record, "dispatcher queue full");
                Err(TelewatchError::Capacity(format!(
                    "dispatcher queue full ({} pending)",
                    self.queue_rx.len()
                )))
            }
            Err(TrySendError::Disconnected(record)) => {
                reject(record, "dispatcher closed");
                Err(TelewatchError::Channel("dispatcher closed".to_string()))
            }
        }
    }

    /// Pop the next pending record without blocking
    pub fn next(&self) -> Option<RequestRecord> {
        self.queue_rx.try_recv().ok()
    }

    /// Pop the next record, waiting up to `timeout`.
    ///
    /// Returns `Ok(None)` on timeout and an error once the dispatcher has been
    /// shut down.
    pub fn next_blocking(&self, timeout: Duration) -> Result<Option<RequestRecord>> {
        if self.is_shut_down() {
            return Err(TelewatchError::Channel("dispatcher shut down".to_string()));
        }
        select! {
            recv(self.queue_rx) -> record => Ok(record.ok()),
            recv(self.shutdown_rx) -> _ => {
                Err(TelewatchError::Channel("dispatcher shut down".to_string()))
            }
            default(timeout) => Ok(None),
        }
    }

    /// Number of records waiting
    pub fn pending_count(&self) -> usize {
        self.queue_rx.len()
    }

    /// Remove every pending record and complete it with a failure
    pub fn fail_all_pending(&self, reason: &str) -> usize {
        let mut count = 0;
        while let Ok(mut record) = self.queue_rx.try_recv() {
            if let Err(e) = record.complete_failure(reason) {
                tracing::warn!("Failure callback of request {} failed: {}", record.id(), e);
            }
            count += 1;
        }
        count
    }

    /// Wake every blocked consumer and fail every pending record. Further
    /// blocking calls return immediately and further registrations fail.
    pub fn shutdown(&self) {
        if let Ok(mut guard) = self.shutdown_tx.lock() {
            // Dropping the sender disconnects every receiver clone
            guard.take();
        }
        let failed = self.fail_all_pending("dispatcher shut down");
        if failed > 0 {
            tracing::debug!("Dispatcher shut down with {} pending requests", failed);
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown_tx.lock().map(|g| g.is_none()).unwrap_or(true)
    }
}

/// Fail a record that never made it into the queue
fn reject(mut record: RequestRecord, reason: &str) {
    if let Err(e) = record.complete_failure(reason) {
        tracing::warn!("Failure callback of request {} failed: {}", record.id(), e);
    }
}

impl Default for RequestDispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}

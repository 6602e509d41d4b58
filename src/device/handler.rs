//! Device handler
//!
//! The device-I/O actor. It owns the [`DeviceLink`], pulls request records
//! from the [`RequestDispatcher`] one at a time, writes the encoded frame,
//! waits for the complete reply and completes the record exactly once.
//!
//! # Failure handling
//!
//! | Outcome | Record | Link |
//! |---|---|---|
//! | reply decoded, code `Ok` | success callback | kept |
//! | reply decoded, other code | failure callback | kept |
//! | no complete reply in time | failure callback | kept, partial bytes dropped |
//! | CRC mismatch | failure callback | kept |
//! | framing error / reply to another request / link error | failure callback | reset |

use super::updater::DatastoreUpdater;
use crate::config::DeviceConfig;
use crate::dispatcher::{RequestDispatcher, RequestRecord};
use crate::error::{Result, ResultExt, TelewatchError};
use crate::link::DeviceLink;
use crate::protocol::{parse_response, response_frame_len, Response};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Counters of the device handler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceHandlerStats {
    /// Frames written to the link
    pub requests_sent: u64,
    /// Records completed with success
    pub responses_ok: u64,
    /// Records completed with failure (all causes)
    pub responses_failed: u64,
    /// Replies that did not arrive in time
    pub timeouts: u64,
    /// Replies rejected for a framing problem
    pub framing_errors: u64,
    /// Replies rejected for a CRC mismatch
    pub integrity_errors: u64,
    /// Link teardown/re-initialisation cycles
    pub link_resets: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl DeviceHandlerStats {
    /// Share of completed records that succeeded, as a percentage
    pub fn success_rate(&self) -> f64 {
        let total = self.responses_ok + self.responses_failed;
        if total == 0 {
            100.0
        } else {
            (self.responses_ok as f64 / total as f64) * 100.0
        }
    }
}

pub type SharedStats = Arc<Mutex<DeviceHandlerStats>>;

fn lock_stats(stats: &SharedStats) -> MutexGuard<'_, DeviceHandlerStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Device-I/O actor
pub struct DeviceHandler {
    link: Box<dyn DeviceLink>,
    dispatcher: RequestDispatcher,
    updater: Option<DatastoreUpdater>,
    response_timeout: Duration,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
    stats: SharedStats,
    rx_buffer: Vec<u8>,
}

impl DeviceHandler {
    pub fn new(link: Box<dyn DeviceLink>, dispatcher: RequestDispatcher, config: &DeviceConfig) -> Self {
        Self {
            link,
            dispatcher,
            updater: None,
            response_timeout: config.response_timeout(),
            poll_interval: config.poll_interval(),
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Mutex::new(DeviceHandlerStats::default())),
            rx_buffer: Vec::new(),
        }
    }

    /// Keep the datastore in sync with the device on every loop iteration
    pub fn with_updater(mut self, updater: DatastoreUpdater) -> Self {
        self.updater = Some(updater);
        self
    }

    pub fn dispatcher(&self) -> &RequestDispatcher {
        &self.dispatcher
    }

    pub fn stats(&self) -> DeviceHandlerStats {
        lock_stats(&self.stats).clone()
    }

    /// Initialise the link
    pub fn start(&mut self) -> Result<()> {
        self.link.initialize()?;
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Run the handler loop until stopped or the dispatcher shuts down
    pub fn run(&mut self) {
        tracing::info!("Device handler started");

        if !self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.start() {
                tracing::error!("Device link failed to initialize: {}", e);
                self.dispatcher.fail_all_pending("device link unavailable");
                return;
            }
        }

        while self.running.load(Ordering::SeqCst) {
            if let Some(updater) = self.updater.as_mut() {
                updater.tick(&self.dispatcher);
            }

            match self.dispatcher.next_blocking(self.poll_interval) {
                Ok(Some(record)) => self.process_record(record),
                Ok(None) => {}
                Err(_) => {
                    tracing::debug!("Dispatcher shut down, stopping device handler");
                    self.running.store(false, Ordering::SeqCst);
                }
            }
        }

        let failed = self.dispatcher.fail_all_pending("device handler stopped");
        if failed > 0 {
            tracing::info!("Failed {} pending requests on shutdown", failed);
        }
        self.link.destroy();
        tracing::info!("Device handler stopped");
    }

    /// Initialise the link and run the handler on its own thread
    pub fn spawn(mut self) -> Result<DeviceHandlerHandle> {
        if let Err(e) = self.start() {
            self.dispatcher.fail_all_pending("device link unavailable");
            return Err(e.with_context("starting device handler"));
        }

        let running = self.running.clone();
        let stats = self.stats.clone();
        let dispatcher = self.dispatcher.clone();
        let thread = std::thread::Builder::new()
            .name("device-handler".to_string())
            .spawn(move || self.run())?;

        Ok(DeviceHandlerHandle {
            running,
            dispatcher,
            stats,
            thread: Some(thread),
        })
    }

    /// Serve one record if one is queued within `timeout`. Returns whether a
    /// record was processed.
    pub fn process_next(&mut self, timeout: Duration) -> Result<bool> {
        match self.dispatcher.next_blocking(timeout)? {
            Some(record) => {
                self.process_record(record);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn process_record(&mut self, mut record: RequestRecord) {
        let request = record.request().clone();

        let outcome = self.exchange(&request).and_then(|response| {
            if !response.matches(&request) {
                return Err(TelewatchError::Framing(format!(
                    "{} does not answer {}",
                    response, request
                )));
            }
            if !response.code.is_ok() {
                return Err(TelewatchError::Api(format!("device answered {}", response.code)));
            }
            let data = parse_response(&request, &response)?;
            Ok((response, data))
        });

        let completion = match outcome {
            Ok((response, data)) => {
                lock_stats(&self.stats).responses_ok += 1;
                tracing::trace!("{} -> {}", request, data);
                record.complete_success(&response, &data)
            }
            Err(e) => {
                self.record_failure(&e);
                tracing::debug!("{} failed: {}", request, e);
                if e.requires_link_reset() {
                    self.reset_link();
                }
                record.complete_failure(&e.to_string())
            }
        };

        if let Err(e) = completion {
            tracing::warn!("Completion of {} reported: {}", request, e);
        }
    }

    fn record_failure(&self, err: &TelewatchError) {
        let mut stats = lock_stats(&self.stats);
        stats.responses_failed += 1;
        match err.root() {
            TelewatchError::Timeout(_) => stats.timeouts += 1,
            TelewatchError::Framing(_) => stats.framing_errors += 1,
            TelewatchError::Integrity { .. } => stats.integrity_errors += 1,
            _ => {}
        }
    }

    /// Write the request and wait for one complete reply frame
    fn exchange(&mut self, request: &crate::protocol::Request) -> Result<Response> {
        let frame = request.encode()?;
        self.link.write(&frame)?;
        {
            let mut stats = lock_stats(&self.stats);
            stats.requests_sent += 1;
            stats.bytes_sent += frame.len() as u64;
        }

        let frame = self.receive_frame()?;
        Response::decode(&frame).with_context(|| format!("decoding reply to {}", request))
    }

    fn receive_frame(&mut self) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.response_timeout;
        loop {
            if let Some(frame_len) = response_frame_len(&self.rx_buffer) {
                if self.rx_buffer.len() >= frame_len {
                    return Ok(self.rx_buffer.drain(..frame_len).collect());
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.rx_buffer.clear();
                return Err(TelewatchError::Timeout(format!(
                    "no reply within {:?}",
                    self.response_timeout
                )));
            }

            if let Some(bytes) = self.link.read(remaining)? {
                lock_stats(&self.stats).bytes_received += bytes.len() as u64;
                self.rx_buffer.extend_from_slice(&bytes);
            }
        }
    }

    fn reset_link(&mut self) {
        tracing::warn!("Resetting device link");
        lock_stats(&self.stats).link_resets += 1;
        self.rx_buffer.clear();
        self.link.destroy();
        if let Err(e) = self.link.initialize() {
            tracing::error!("Device link failed to re-initialize: {}", e);
        }
    }
}

/// Handle to a device handler running on its own thread
pub struct DeviceHandlerHandle {
    running: Arc<AtomicBool>,
    dispatcher: RequestDispatcher,
    stats: SharedStats,
    thread: Option<JoinHandle<()>>,
}

impl DeviceHandlerHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> DeviceHandlerStats {
        lock_stats(&self.stats).clone()
    }

    /// Stop the handler and wait for its thread
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.dispatcher.shutdown();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Device handler thread panicked");
            }
        }
    }
}

impl Drop for DeviceHandlerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MockDeviceLink;
    use crate::protocol::commands::{dummy_request, memory_read_request, memory_read_response_payload};
    use crate::protocol::{BlockSpan, MemoryBlock, Request, ResponseCode, ResponseData};
    use std::sync::atomic::AtomicUsize;

    fn config() -> DeviceConfig {
        DeviceConfig {
            response_timeout_ms: 50,
            poll_interval_ms: 5,
            max_pending_requests: 16,
        }
    }

    /// Mock link that answers every write with `reply(request)`
    fn answering_link<F>(reply: F) -> MockDeviceLink
    where
        F: Fn(&Request) -> Option<Vec<u8>> + Send + 'static,
    {
        let pending = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
        let mut link = MockDeviceLink::new();
        link.expect_initialize().returning(|| Ok(()));
        link.expect_destroy().return_const(());
        link.expect_is_operational().return_const(true);

        let queue = pending.clone();
        link.expect_write().returning(move |data| {
            let request = Request::decode(data).unwrap();
            if let Some(bytes) = reply(&request) {
                queue.lock().unwrap().push(bytes);
            }
            Ok(())
        });
        link.expect_read().returning(move |_| {
            let mut queue = pending.lock().unwrap();
            if queue.is_empty() {
                Ok(None)
            } else {
                Ok(Some(queue.remove(0)))
            }
        });
        link
    }

    type Outcome = Arc<Mutex<Vec<std::result::Result<ResponseData, String>>>>;

    fn register(dispatcher: &RequestDispatcher, request: Request) -> Outcome {
        let outcome: Outcome = Arc::new(Mutex::new(Vec::new()));
        let ok = outcome.clone();
        let ko = outcome.clone();
        dispatcher
            .register(
                request,
                Box::new(move |_, _, data| {
                    ok.lock().unwrap().push(Ok(data.clone()));
                    Ok(())
                }),
                Box::new(move |_, reason| {
                    ko.lock().unwrap().push(Err(reason.to_string()));
                    Ok(())
                }),
                0,
            )
            .unwrap();
        outcome
    }

    #[test]
    fn test_successful_exchange() {
        let link = answering_link(|req| {
            let payload = memory_read_response_payload(&[MemoryBlock::new(0x20, vec![7, 7])]).unwrap();
            Some(
                Response::new(req.command, req.subfunction, ResponseCode::Ok, payload.freeze())
                    .encode()
                    .unwrap()
                    .to_vec(),
            )
        });
        let dispatcher = RequestDispatcher::new(8);
        let mut handler = DeviceHandler::new(Box::new(link), dispatcher.clone(), &config());
        handler.start().unwrap();

        let outcome = register(&dispatcher, memory_read_request(&[BlockSpan::new(0x20, 2)]).unwrap());
        assert!(handler.process_next(Duration::from_millis(10)).unwrap());

        assert_eq!(
            *outcome.lock().unwrap(),
            vec![Ok(ResponseData::MemoryRead(vec![MemoryBlock::new(0x20, vec![7, 7])]))]
        );
        let stats = handler.stats();
        assert_eq!(stats.requests_sent, 1);
        assert_eq!(stats.responses_ok, 1);
    }

    #[test]
    fn test_reply_split_over_reads() {
        let link = answering_link(|req| {
            Some(Response::for_request(req, ResponseCode::Ok).encode().unwrap().to_vec())
        });
        // Wrap so each reply arrives in two pieces
        let chunks = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
        let mut split = MockDeviceLink::new();
        let inner = Arc::new(Mutex::new(link));
        split.expect_initialize().returning(|| Ok(()));
        split.expect_destroy().return_const(());
        let w = inner.clone();
        split.expect_write().returning(move |data| w.lock().unwrap().write(data));
        let r = inner.clone();
        let c = chunks.clone();
        split.expect_read().returning(move |timeout| {
            let mut pending = c.lock().unwrap();
            if pending.is_empty() {
                if let Some(bytes) = r.lock().unwrap().read(timeout)? {
                    let (a, b) = bytes.split_at(2);
                    pending.push(a.to_vec());
                    pending.push(b.to_vec());
                }
            }
            if pending.is_empty() {
                Ok(None)
            } else {
                Ok(Some(pending.remove(0)))
            }
        });

        let dispatcher = RequestDispatcher::new(8);
        let mut handler = DeviceHandler::new(Box::new(split), dispatcher.clone(), &config());
        handler.start().unwrap();
        let outcome = register(&dispatcher, dummy_request());
        handler.process_next(Duration::from_millis(10)).unwrap();
        assert_eq!(*outcome.lock().unwrap(), vec![Ok(ResponseData::Empty)]);
    }

    #[test]
    fn test_timeout_fails_record() {
        let link = answering_link(|_| None);
        let dispatcher = RequestDispatcher::new(8);
        let mut handler = DeviceHandler::new(Box::new(link), dispatcher.clone(), &config());
        handler.start().unwrap();

        let outcome = register(&dispatcher, dummy_request());
        handler.process_next(Duration::from_millis(10)).unwrap();

        let outcome = outcome.lock().unwrap();
        assert_eq!(outcome.len(), 1);
        assert!(outcome[0].as_ref().unwrap_err().contains("Timeout"));
        assert_eq!(handler.stats().timeouts, 1);
    }

    #[test]
    fn test_crc_mismatch_fails_record_without_reset() {
        let link = answering_link(|req| {
            let mut bytes = Response::for_request(req, ResponseCode::Ok).encode().unwrap().to_vec();
            let last = bytes.len() - 1;
            bytes[last] ^= 0xFF;
            Some(bytes)
        });
        let dispatcher = RequestDispatcher::new(8);
        let mut handler = DeviceHandler::new(Box::new(link), dispatcher.clone(), &config());
        handler.start().unwrap();

        let outcome = register(&dispatcher, dummy_request());
        handler.process_next(Duration::from_millis(10)).unwrap();

        assert!(outcome.lock().unwrap()[0].is_err());
        let stats = handler.stats();
        assert_eq!(stats.integrity_errors, 1);
        assert_eq!(stats.link_resets, 0);
    }

    #[test]
    fn test_mismatched_reply_resets_link() {
        let inits = Arc::new(AtomicUsize::new(0));
        let counter = inits.clone();
        let mut link = MockDeviceLink::new();
        link.expect_initialize().returning(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        link.expect_destroy().return_const(());
        link.expect_write().returning(|_| Ok(()));
        // Always answers GetInfo, whatever was asked
        let reply = Response::new(0x01, 0x00, ResponseCode::Ok, Vec::new())
            .encode()
            .unwrap()
            .to_vec();
        link.expect_read().returning(move |_| Ok(Some(reply.clone())));

        let dispatcher = RequestDispatcher::new(8);
        let mut handler = DeviceHandler::new(Box::new(link), dispatcher.clone(), &config());
        handler.start().unwrap();

        let outcome = register(&dispatcher, dummy_request());
        handler.process_next(Duration::from_millis(10)).unwrap();

        assert!(outcome.lock().unwrap()[0].is_err());
        let stats = handler.stats();
        assert_eq!(stats.link_resets, 1);
        assert_eq!(stats.framing_errors, 1);
        assert_eq!(inits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_error_code_fails_record() {
        let link = answering_link(|req| {
            Some(Response::for_request(req, ResponseCode::Busy).encode().unwrap().to_vec())
        });
        let dispatcher = RequestDispatcher::new(8);
        let mut handler = DeviceHandler::new(Box::new(link), dispatcher.clone(), &config());
        handler.start().unwrap();

        let outcome = register(&dispatcher, dummy_request());
        handler.process_next(Duration::from_millis(10)).unwrap();
        assert!(outcome.lock().unwrap()[0].as_ref().unwrap_err().contains("Busy"));
    }

    #[test]
    fn test_link_write_error_fails_record() {
        let mut link = MockDeviceLink::new();
        link.expect_initialize().returning(|| Ok(()));
        link.expect_destroy().return_const(());
        link.expect_write()
            .returning(|_| Err(TelewatchError::Link("broken pipe".to_string())));

        let dispatcher = RequestDispatcher::new(8);
        let mut handler = DeviceHandler::new(Box::new(link), dispatcher.clone(), &config());
        handler.start().unwrap();

        let outcome = register(&dispatcher, dummy_request());
        handler.process_next(Duration::from_millis(10)).unwrap();
        assert!(outcome.lock().unwrap()[0].as_ref().unwrap_err().contains("broken pipe"));
        assert_eq!(handler.stats().link_resets, 1);
    }

    #[test]
    fn test_spawned_handler_stops_and_fails_pending() {
        let link = answering_link(|req| {
            Some(Response::for_request(req, ResponseCode::Ok).encode().unwrap().to_vec())
        });
        let dispatcher = RequestDispatcher::new(8);
        let handler = DeviceHandler::new(Box::new(link), dispatcher.clone(), &config());
        let handle = handler.spawn().unwrap();
        assert!(handle.is_running());

        let outcome = register(&dispatcher, dummy_request());
        let deadline = Instant::now() + Duration::from_secs(2);
        while outcome.lock().unwrap().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*outcome.lock().unwrap(), vec![Ok(ResponseData::Empty)]);

        handle.stop();
        assert!(dispatcher.is_shut_down());
    }
}

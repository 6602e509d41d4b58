//! Device links
//!
//! A device link carries encoded frames to the device and brings reply bytes
//! back. The core only needs the byte-stream interface of [`DeviceLink`];
//! framing and integrity checks happen above it, in the device handler.
//!
//! # Implementations
//!
//! - [`EmulatedDeviceLink`] - In-process device serving memory requests from
//!   a [`SparseMemoryImage`](crate::memory::SparseMemoryImage)
//! - [`SubprocessLink`] - Frames piped through the stdin/stdout of a child process
//!
//! Each implementation owns one dedicated thread (device loop or stdout
//! reader) feeding a channel. `destroy()` signals that thread, releases the
//! I/O handle and waits for the thread with a bounded join.

pub mod emulated;
pub mod subprocess;

pub use emulated::EmulatedDeviceLink;
pub use subprocess::SubprocessLink;

use crate::error::{Result, TelewatchError};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

/// How long `destroy()` waits for a link thread before giving up on it
pub const LINK_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Byte-stream connection to a device
///
/// Implementations must be `Send` so the device handler can own them on its
/// own thread.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceLink: Send {
    /// Open the link and start its thread
    fn initialize(&mut self) -> Result<()>;

    /// Stop the link thread and release the I/O handle
    fn destroy(&mut self);

    /// Send bytes to the device
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Wait up to `timeout` for bytes from the device.
    ///
    /// `Ok(None)` means nothing arrived in time; errors mean the link is broken.
    fn read(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>>;

    /// True if the link can carry traffic
    fn is_operational(&self) -> bool;
}

/// A link-owned thread that reports when it exits, so it can be joined with
/// a deadline
#[derive(Debug)]
pub(crate) struct LinkThread {
    name: String,
    handle: Option<JoinHandle<()>>,
    exited_rx: Receiver<()>,
}

impl LinkThread {
    /// Spawn `body` on a named thread
    pub(crate) fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (exited_tx, exited_rx) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                body();
                let _ = exited_tx.send(());
            })
            .map_err(|e| TelewatchError::Link(format!("failed to spawn {} thread: {}", name, e)))?;

        Ok(Self {
            name: name.to_string(),
            handle: Some(handle),
            exited_rx,
        })
    }

    /// Wait up to `timeout` for the thread to exit. Returns false if it did
    /// not; the thread is then left detached.
    pub(crate) fn join_timeout(mut self, timeout: Duration) -> bool {
        let exited = match self.exited_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        };

        if exited {
            if let Some(handle) = self.handle.take() {
                if handle.join().is_err() {
                    tracing::error!("{} thread panicked", self.name);
                }
            }
        } else {
            tracing::warn!("{} thread did not stop within {:?}", self.name, timeout);
        }
        exited
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_link_thread_joins_after_signal() {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let thread = LinkThread::spawn("test-link", move || {
            while flag.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();

        running.store(false, Ordering::SeqCst);
        assert!(thread.join_timeout(Duration::from_secs(1)));
    }

    #[test]
    fn test_link_thread_join_gives_up() {
        let (_keep_tx, rx) = bounded::<()>(1);
        let thread = LinkThread::spawn("stuck-link", move || {
            let _ = rx.recv_timeout(Duration::from_millis(500));
        })
        .unwrap();
        assert!(!thread.join_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_mock_link_read_timeout() {
        let mut link = MockDeviceLink::new();
        link.expect_read().returning(|_| Ok(None));
        link.expect_is_operational().return_const(true);

        assert!(link.is_operational());
        assert_eq!(link.read(Duration::from_millis(1)).unwrap(), None);
    }
}

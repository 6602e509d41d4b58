//! Subprocess device link
//!
//! Runs a device program (an emulator, a serial bridge, ...) as a child
//! process. Frames are written to its stdin; a reader thread forwards
//! whatever it prints on stdout to a channel.

use super::{DeviceLink, LinkThread, LINK_JOIN_TIMEOUT};
use crate::error::{Result, TelewatchError};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use std::io::{Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const READ_BUFFER_SIZE: usize = 4096;

/// Device link over a child process' stdin/stdout
pub struct SubprocessLink {
    program: String,
    args: Vec<String>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    from_device: Option<Receiver<Vec<u8>>>,
    running: Arc<AtomicBool>,
    thread: Option<LinkThread>,
}

impl SubprocessLink {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            child: None,
            stdin: None,
            from_device: None,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn broken(&self, what: &str) -> TelewatchError {
        TelewatchError::Link(format!("cannot {}: link to {} is down", what, self.program))
    }
}

impl DeviceLink for SubprocessLink {
    fn initialize(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Ok(());
        }

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| TelewatchError::Link(format!("failed to start {}: {}", self.program, e)))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (stdin, mut stdout) = match (stdin, stdout) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(TelewatchError::Link(format!(
                    "{} did not expose stdin/stdout",
                    self.program
                )));
            }
        };

        let (tx, rx) = unbounded::<Vec<u8>>();
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let program = self.program.clone();

        let thread = LinkThread::spawn("subprocess-reader", move || {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            while running.load(Ordering::SeqCst) {
                match stdout.read(&mut buf) {
                    Ok(0) => {
                        tracing::debug!("{} closed its stdout", program);
                        break;
                    }
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        tracing::warn!("Reading from {} failed: {}", program, e);
                        break;
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
        });
        let thread = match thread {
            Ok(thread) => thread,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        self.child = Some(child);
        self.stdin = Some(stdin);
        self.from_device = Some(rx);
        self.thread = Some(thread);
        tracing::info!("Subprocess link started: {} {:?}", self.program, self.args);
        Ok(())
    }

    fn destroy(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // Closing stdin lets well-behaved children exit on their own
        self.stdin = None;

        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                tracing::debug!("Killing {}: {}", self.program, e);
            }
            if let Err(e) = child.wait() {
                tracing::warn!("Waiting for {}: {}", self.program, e);
            }
        }
        if let Some(thread) = self.thread.take() {
            thread.join_timeout(LINK_JOIN_TIMEOUT);
            tracing::info!("Subprocess link to {} destroyed", self.program);
        }
        self.from_device = None;
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let err = self.broken("write");
        let stdin = self.stdin.as_mut().ok_or(err)?;
        stdin
            .write_all(data)
            .and_then(|_| stdin.flush())
            .map_err(|e| TelewatchError::Link(format!("write to {} failed: {}", self.program, e)))
    }

    fn read(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let rx = self.from_device.as_ref().ok_or_else(|| self.broken("read"))?;
        match rx.recv_timeout(timeout) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(self.broken("read")),
        }
    }

    fn is_operational(&self) -> bool {
        self.child.is_some() && self.running.load(Ordering::SeqCst)
    }
}

impl Drop for SubprocessLink {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_missing_program_fails() {
        let mut link = SubprocessLink::new("/nonexistent/telewatch-device", vec![]);
        assert!(matches!(link.initialize(), Err(TelewatchError::Link(_))));
        assert!(!link.is_operational());
    }

    #[test]
    fn test_not_initialized() {
        let mut link = SubprocessLink::new("cat", vec![]);
        assert!(link.write(&[1]).is_err());
        assert!(link.read(Duration::from_millis(1)).is_err());
    }

    #[test]
    fn test_echo_through_cat() {
        let mut link = SubprocessLink::new("cat", vec![]);
        link.initialize().unwrap();
        assert!(link.is_operational());

        link.write(&[1, 2, 3, 4]).unwrap();
        let mut received = Vec::new();
        while received.len() < 4 {
            match link.read(Duration::from_secs(2)).unwrap() {
                Some(bytes) => received.extend(bytes),
                None => break,
            }
        }
        assert_eq!(received, vec![1, 2, 3, 4]);

        link.destroy();
        assert!(!link.is_operational());
        assert!(link.write(&[1]).is_err());
    }
}

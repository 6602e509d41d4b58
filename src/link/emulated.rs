//! Emulated device link
//!
//! An in-process device for running the telemetry core without hardware.
//! A device thread decodes request frames, serves `MemoryControl` reads and
//! writes from a shared [`SparseMemoryImage`] and sends encoded responses
//! back.
//!
//! | Request | Response |
//! |---|---|
//! | `MemoryControl/Read` | blocks read from the image, `InvalidRequest` if any is out of range |
//! | `MemoryControl/Write` | spans written, `InvalidRequest` on a bad write |
//! | `GetInfo`, `DummyCommand` | empty `Ok` |
//! | anything else | `UnsupportedFeature` |
//!
//! Frames that fail to decode are dropped without reply, like a device would.
//!
//! # Example
//!
//! ```ignore
//! use telewatch_rs::link::{DeviceLink, EmulatedDeviceLink};
//! use telewatch_rs::memory::SparseMemoryImage;
//!
//! let mut image = SparseMemoryImage::new();
//! image.add_region(0x2000_0000, 1024)?;
//!
//! let mut link = EmulatedDeviceLink::new(image);
//! link.initialize()?;
//! ```

use super::{DeviceLink, LinkThread, LINK_JOIN_TIMEOUT};
use crate::error::{Result, TelewatchError};
use crate::memory::SparseMemoryImage;
use crate::protocol::commands::{
    memory_read_response_payload, memory_write_response_payload, parse_memory_read_request,
    parse_memory_write_request, BlockSpan, CommandId, MemoryBlock, MemoryControlSubfn,
};
use crate::protocol::{request_frame_len, Request, Response, ResponseCode};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// How often the device thread checks its stop flag
const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Memory image shared between the emulated device and the test/host code
pub type SharedMemoryImage = Arc<Mutex<SparseMemoryImage>>;

/// Lock the shared image, recovering from poisoning
pub fn lock_image(image: &SharedMemoryImage) -> MutexGuard<'_, SparseMemoryImage> {
    image.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Device-side knobs, shared with the device thread
#[derive(Debug, Default)]
struct DeviceBehavior {
    /// Swallow every request without answering
    unresponsive: AtomicBool,
    /// Flip one bit of every response
    corrupt_responses: AtomicBool,
}

/// In-process device serving memory requests
pub struct EmulatedDeviceLink {
    image: SharedMemoryImage,
    behavior: Arc<DeviceBehavior>,
    running: Arc<AtomicBool>,
    to_device: Option<Sender<Vec<u8>>>,
    from_device: Option<Receiver<Vec<u8>>>,
    thread: Option<LinkThread>,
}

impl EmulatedDeviceLink {
    /// Create a link over `image`. Call [`initialize`](DeviceLink::initialize)
    /// before use.
    pub fn new(image: SparseMemoryImage) -> Self {
        Self::with_shared_image(Arc::new(Mutex::new(image)))
    }

    /// Create a link over an image the caller keeps a handle to
    pub fn with_shared_image(image: SharedMemoryImage) -> Self {
        Self {
            image,
            behavior: Arc::new(DeviceBehavior::default()),
            running: Arc::new(AtomicBool::new(false)),
            to_device: None,
            from_device: None,
            thread: None,
        }
    }

    /// Handle to the emulated device memory
    pub fn memory(&self) -> SharedMemoryImage {
        self.image.clone()
    }

    /// Stop answering requests (simulates a hung device)
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.behavior.unresponsive.store(unresponsive, Ordering::SeqCst);
    }

    /// Corrupt every response on the wire (simulates line noise)
    pub fn set_corrupt_responses(&self, corrupt: bool) {
        self.behavior.corrupt_responses.store(corrupt, Ordering::SeqCst);
    }
}

impl DeviceLink for EmulatedDeviceLink {
    fn initialize(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }

        let (to_device, device_rx) = unbounded::<Vec<u8>>();
        let (device_tx, from_device) = unbounded::<Vec<u8>>();
        self.running.store(true, Ordering::SeqCst);

        let device = DeviceLoop {
            image: self.image.clone(),
            behavior: self.behavior.clone(),
            running: self.running.clone(),
            rx: device_rx,
            tx: device_tx,
            buffer: Vec::new(),
        };
        self.thread = Some(LinkThread::spawn("emulated-device", move || device.run())?);
        self.to_device = Some(to_device);
        self.from_device = Some(from_device);

        tracing::info!("Emulated device link initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.to_device = None;
        self.from_device = None;
        if let Some(thread) = self.thread.take() {
            thread.join_timeout(LINK_JOIN_TIMEOUT);
            tracing::info!("Emulated device link destroyed");
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let tx = self
            .to_device
            .as_ref()
            .ok_or_else(|| TelewatchError::Link("emulated link is not initialized".to_string()))?;
        tx.send(data.to_vec())
            .map_err(|_| TelewatchError::Link("emulated device has stopped".to_string()))
    }

    fn read(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let rx = self
            .from_device
            .as_ref()
            .ok_or_else(|| TelewatchError::Link("emulated link is not initialized".to_string()))?;
        match rx.recv_timeout(timeout) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(TelewatchError::Link("emulated device has stopped".to_string()))
            }
        }
    }

    fn is_operational(&self) -> bool {
        self.thread.is_some() && self.running.load(Ordering::SeqCst)
    }
}

impl Drop for EmulatedDeviceLink {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// State owned by the device thread
struct DeviceLoop {
    image: SharedMemoryImage,
    behavior: Arc<DeviceBehavior>,
    running: Arc<AtomicBool>,
    rx: Receiver<Vec<u8>>,
    tx: Sender<Vec<u8>>,
    buffer: Vec<u8>,
}

impl DeviceLoop {
    fn run(mut self) {
        tracing::debug!("Emulated device thread started");

        while self.running.load(Ordering::SeqCst) {
            match self.rx.recv_timeout(DEVICE_POLL_INTERVAL) {
                Ok(bytes) => {
                    self.buffer.extend_from_slice(&bytes);
                    self.drain_frames();
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        tracing::debug!("Emulated device thread stopped");
    }

    fn drain_frames(&mut self) {
        while let Some(frame_len) = request_frame_len(&self.buffer) {
            if self.buffer.len() < frame_len {
                break;
            }
            let frame: Vec<u8> = self.buffer.drain(..frame_len).collect();

            let request = match Request::decode(&frame) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!("Emulated device dropped a frame: {}", e);
                    continue;
                }
            };

            if self.behavior.unresponsive.load(Ordering::SeqCst) {
                tracing::trace!("Emulated device ignoring {}", request);
                continue;
            }

            let response = {
                let mut image = lock_image(&self.image);
                serve_request(&mut image, &request)
            };
            match response.encode() {
                Ok(bytes) => {
                    let mut bytes = bytes.to_vec();
                    if self.behavior.corrupt_responses.load(Ordering::SeqCst) {
                        if let Some(last) = bytes.last_mut() {
                            *last ^= 0x01;
                        }
                    }
                    if self.tx.send(bytes).is_err() {
                        self.running.store(false, Ordering::SeqCst);
                        return;
                    }
                }
                Err(e) => tracing::error!("Emulated device failed to encode {}: {}", response, e),
            }
        }
    }
}

/// Compute the device answer to `request` against `image`
pub fn serve_request(image: &mut SparseMemoryImage, request: &Request) -> Response {
    let command = match CommandId::try_from(request.command) {
        Ok(command) => command,
        Err(_) => return Response::for_request(request, ResponseCode::UnsupportedFeature),
    };

    match command {
        CommandId::GetInfo | CommandId::DummyCommand => {
            Response::for_request(request, ResponseCode::Ok)
        }
        CommandId::MemoryControl if request.subfunction == MemoryControlSubfn::Read as u8 => {
            serve_memory_read(image, request)
                .unwrap_or_else(|_| Response::for_request(request, ResponseCode::InvalidRequest))
        }
        CommandId::MemoryControl if request.subfunction == MemoryControlSubfn::Write as u8 => {
            serve_memory_write(image, request)
                .unwrap_or_else(|_| Response::for_request(request, ResponseCode::InvalidRequest))
        }
        _ => Response::for_request(request, ResponseCode::UnsupportedFeature),
    }
}

fn serve_memory_read(image: &SparseMemoryImage, request: &Request) -> Result<Response> {
    let spans = parse_memory_read_request(&request.payload)?;
    let blocks = spans
        .iter()
        .map(|span| -> Result<MemoryBlock> {
            let data = image.read(span.address, span.length as usize)?;
            Ok(MemoryBlock::new(span.address, data))
        })
        .collect::<Result<Vec<_>>>()?;
    let payload = memory_read_response_payload(&blocks)?;
    Ok(Response::new(
        request.command,
        request.subfunction,
        ResponseCode::Ok,
        payload.freeze(),
    ))
}

fn serve_memory_write(image: &mut SparseMemoryImage, request: &Request) -> Result<Response> {
    let blocks = parse_memory_write_request(&request.payload)?;
    let mut spans = Vec::with_capacity(blocks.len());
    for block in &blocks {
        image.write(block.address, &block.data)?;
        spans.push(BlockSpan::new(block.address, block.data.len() as u16));
    }
    let payload = memory_write_response_payload(&spans)?;
    Ok(Response::new(
        request.command,
        request.subfunction,
        ResponseCode::Ok,
        payload.freeze(),
    ))
}

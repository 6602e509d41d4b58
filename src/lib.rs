//! # Telewatch-RS: Embedded Telemetry Core
//!
//! The server-side core of an embedded debugging tool. It keeps a live view
//! of variables in the memory of a target device and streams their values to
//! front-end clients, within a bandwidth budget.
//!
//! ## Architecture
//!
//! - **Protocol**: Framed request/response messages with a CRC-32 trailer
//! - **Dispatcher**: Bounded queue of device requests, each completed exactly once
//! - **Device**: A handler thread owning the [`link::DeviceLink`], fed by an updater
//!   that turns watched entries and pending writes into memory requests
//! - **Datastore**: Registry of watchable entries with per-owner observers
//! - **Streamer/Throttler**: Per-connection update queues drained at a paced bitrate
//! - **API**: JSON messages exchanged with clients
//!
//! Components share state through `Arc<Mutex<_>>` handles and talk to the
//! device thread through crossbeam channels.
//!
//! ## Configuration
//!
//! Settings are stored in the platform-appropriate data directory under
//! `dev.telewatch.telewatch-rs`:
//!
//! - **Linux**: `~/.local/share/dev.telewatch.telewatch-rs/`
//! - **macOS**: `~/Library/Application Support/dev.telewatch.telewatch-rs/`
//! - **Windows**: `%APPDATA%\dev.telewatch.telewatch-rs\`
//!
//! ## Example
//!
//! ```ignore
//! use telewatch_rs::{
//!     config::AppConfig,
//!     datastore::Datastore,
//!     device::{DatastoreUpdater, DeviceHandler},
//!     dispatcher::RequestDispatcher,
//!     link::EmulatedDeviceLink,
//!     streamer::ValueStreamer,
//!     api::TelemetryApi,
//! };
//!
//! let config = AppConfig::load_or_default(None);
//! let datastore = Datastore::from_config(&config.datastore).into_shared();
//! let streamer = ValueStreamer::new().into_shared();
//!
//! let dispatcher = RequestDispatcher::new(config.device.max_pending_requests);
//! let updater = DatastoreUpdater::new(datastore.clone(), Endianness::Little, 64);
//! let handle = DeviceHandler::new(Box::new(link), dispatcher, &config.device)
//!     .with_updater(updater)
//!     .spawn()?;
//!
//! let mut api = TelemetryApi::new(datastore, streamer, config.api.clone(), &config.throttling)?;
//! let conn = api.open_connection();
//! api.handle_message(conn, r#"{"cmd": "get_watchable_count"}"#);
//! for (conn, message) in api.process() {
//!     // send to the client
//! }
//! handle.stop();
//! ```

pub mod api;
pub mod config;
pub mod datastore;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod link;
pub mod memory;
pub mod protocol;
pub mod streamer;
pub mod throttler;
pub mod types;

// Re-export commonly used types
pub use api::TelemetryApi;
pub use config::AppConfig;
pub use datastore::{Datastore, DatastoreEntry, SharedDatastore};
pub use device::{DatastoreUpdater, DeviceHandler, DeviceHandlerHandle};
pub use dispatcher::RequestDispatcher;
pub use error::{Result, TelewatchError};
pub use memory::SparseMemoryImage;
pub use streamer::{SharedStreamer, ValueStreamer};
pub use throttler::Throttler;
pub use types::{EntryId, VariableDescription, VariableType, WatchableType, WatchableValue};

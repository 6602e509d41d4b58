//! Device-side actors
//!
//! - [`DeviceHandler`] - Owns the link and serves dispatcher records
//! - [`DatastoreUpdater`] - Turns watched entries and target updates into requests
//!
//! # Example
//!
//! ```ignore
//! use telewatch_rs::device::{DatastoreUpdater, DeviceHandler};
//!
//! let updater = DatastoreUpdater::new(datastore.clone(), Endianness::Little, 64);
//! let handle = DeviceHandler::new(Box::new(link), dispatcher.clone(), &config.device)
//!     .with_updater(updater)
//!     .spawn()?;
//! // ...
//! handle.stop();
//! ```

pub mod handler;
pub mod updater;

pub use handler::{DeviceHandler, DeviceHandlerHandle, DeviceHandlerStats};
pub use updater::{encode_value, DatastoreUpdater};

//! Full telemetry stack over an emulated device

use telewatch_rs::config::{ApiConfig, DeviceConfig, ThrottlingConfig};
use telewatch_rs::link::emulated::{lock_image, EmulatedDeviceLink, SharedMemoryImage};
use telewatch_rs::streamer::ConnectionId;
use telewatch_rs::types::Endianness;
use telewatch_rs::{
    datastore, DatastoreUpdater, Datastore, DeviceHandler, DeviceHandlerHandle, EntryId,
    RequestDispatcher, SharedDatastore, SparseMemoryImage, TelemetryApi, ValueStreamer,
};
use serde_json::Value;

use super::builders::VariableBuilder;

pub const RAM_BASE: u64 = 0x2000_0000;

/// Device misbehavior to apply before the handler starts
#[derive(Debug, Clone, Copy, Default)]
pub struct Faults {
    pub unresponsive: bool,
    pub corrupt_responses: bool,
}

pub fn device_config() -> DeviceConfig {
    DeviceConfig {
        response_timeout_ms: 100,
        poll_interval_ms: 5,
        max_pending_requests: 32,
    }
}

pub fn unthrottled() -> ThrottlingConfig {
    ThrottlingConfig {
        enabled: false,
        ..ThrottlingConfig::default()
    }
}

pub struct Rig {
    pub datastore: SharedDatastore,
    pub memory: SharedMemoryImage,
    pub api: TelemetryApi,
    pub handle: Option<DeviceHandlerHandle>,
    pub ids: Vec<EntryId>,
}

impl Rig {
    /// Start a stack over `image` with the given variables registered in order
    pub fn start(image: SparseMemoryImage, variables: Vec<VariableBuilder>, faults: Faults) -> Self {
        let mut ds = Datastore::new(64);
        let ids = variables
            .into_iter()
            .map(|builder| {
                let (path, desc) = builder.build();
                ds.add_variable(path, desc).unwrap()
            })
            .collect();
        let datastore = ds.into_shared();

        let link = EmulatedDeviceLink::new(image);
        link.set_unresponsive(faults.unresponsive);
        link.set_corrupt_responses(faults.corrupt_responses);
        let memory = link.memory();

        let config = device_config();
        let dispatcher = RequestDispatcher::new(config.max_pending_requests);
        let updater = DatastoreUpdater::new(datastore.clone(), Endianness::Little, 16);
        let handle = DeviceHandler::new(Box::new(link), dispatcher, &config)
            .with_updater(updater)
            .spawn()
            .unwrap();

        let api = TelemetryApi::new(
            datastore.clone(),
            ValueStreamer::new().into_shared(),
            ApiConfig::default(),
            &unthrottled(),
        )
        .unwrap();

        Self {
            datastore,
            memory,
            api,
            handle: Some(handle),
            ids,
        }
    }

    pub fn request(&mut self, conn: ConnectionId, request: Value) -> Vec<Value> {
        self.api.handle_request(conn, request)
    }

    pub fn write_memory(&self, address: u64, data: &[u8]) {
        lock_image(&self.memory).write(address, data).unwrap();
    }

    pub fn read_memory(&self, address: u64, len: usize) -> Vec<u8> {
        lock_image(&self.memory).read(address, len).unwrap()
    }

    /// Raw bytes last stored for `id`
    pub fn stored_bytes(&self, id: EntryId) -> Option<Vec<u8>> {
        let ds = datastore::lock(&self.datastore);
        ds.get_entry(id)?.value()?.as_bytes().map(<[u8]>::to_vec)
    }

    pub fn handle(&self) -> &DeviceHandlerHandle {
        self.handle.as_ref().unwrap()
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop();
        }
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        self.stop();
    }
}

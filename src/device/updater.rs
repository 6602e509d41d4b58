//! Datastore updater
//!
//! Bridges the datastore and the dispatcher. Every tick it registers:
//!
//! - one memory read per variable the datastore needs polled, whose success
//!   callback stores the bytes read with [`Datastore::set_value`](crate::datastore::Datastore::set_value)
//! - one memory write per pending target update, whose completion marks the
//!   update done
//!
//! At most one read and one write are in flight per entry. Callbacks lock the
//! datastore, so the updater never registers while holding that lock.

use crate::datastore::{self, SharedDatastore};
use crate::dispatcher::{FailureCallback, RequestDispatcher, SuccessCallback};
use crate::error::{Result, ResultExt, TelewatchError};
use crate::protocol::{memory_read_request, memory_write_request, BlockSpan, MemoryBlock, ResponseData};
use crate::types::{Endianness, EntryId, VariableDescription, VariableType, WatchableValue};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type InFlight = Arc<Mutex<HashSet<EntryId>>>;

fn lock_set(set: &InFlight) -> MutexGuard<'_, HashSet<EntryId>> {
    set.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Convert a target value into the bytes to write for `desc`
pub fn encode_value(desc: &VariableDescription, value: &WatchableValue, endianness: Endianness) -> Result<Vec<u8>> {
    if desc.is_bitfield() {
        return Err(TelewatchError::Api("bitfield writes are not supported".to_string()));
    }

    macro_rules! ordered {
        ($v:expr) => {
            match endianness {
                Endianness::Little => $v.to_le_bytes().to_vec(),
                Endianness::Big => $v.to_be_bytes().to_vec(),
            }
        };
    }

    let bytes = match (value, desc.var_type) {
        (WatchableValue::Bytes(bytes), t) => {
            if bytes.len() != t.size_bytes() {
                return Err(TelewatchError::Api(format!(
                    "{} bytes given for a {} variable",
                    bytes.len(),
                    t
                )));
            }
            bytes.clone()
        }
        (_, VariableType::Raw(_)) => {
            return Err(TelewatchError::Api("raw variables take a byte array".to_string()))
        }
        (WatchableValue::Bool(b), _) => {
            return encode_value(desc, &WatchableValue::Int(*b as i64), endianness)
        }
        (WatchableValue::Int(v), t) => match t {
            VariableType::U8 => ordered!(*v as u8),
            VariableType::I8 => ordered!(*v as i8),
            VariableType::Bool => vec![(*v != 0) as u8],
            VariableType::U16 => ordered!(*v as u16),
            VariableType::I16 => ordered!(*v as i16),
            VariableType::U32 => ordered!(*v as u32),
            VariableType::I32 => ordered!(*v as i32),
            VariableType::U64 => ordered!(*v as u64),
            VariableType::I64 => ordered!(*v),
            VariableType::F32 => ordered!(*v as f32),
            VariableType::F64 => ordered!(*v as f64),
            VariableType::Raw(_) => Vec::new(),
        },
        (WatchableValue::Float(v), t) => match t {
            VariableType::F32 => ordered!(*v as f32),
            VariableType::F64 => ordered!(*v),
            _ => return encode_value(desc, &WatchableValue::Int(v.round() as i64), endianness),
        },
    };
    Ok(bytes)
}

/// Keeps the datastore in sync with device memory
pub struct DatastoreUpdater {
    datastore: SharedDatastore,
    endianness: Endianness,
    max_pending: usize,
    reads_in_flight: InFlight,
    writes_in_flight: InFlight,
}

impl DatastoreUpdater {
    pub fn new(datastore: SharedDatastore, endianness: Endianness, max_pending: usize) -> Self {
        Self {
            datastore,
            endianness,
            max_pending,
            reads_in_flight: Arc::new(Mutex::new(HashSet::new())),
            writes_in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Entries with a read currently queued or on the wire
    pub fn reads_in_flight(&self) -> usize {
        lock_set(&self.reads_in_flight).len()
    }

    pub fn writes_in_flight(&self) -> usize {
        lock_set(&self.writes_in_flight).len()
    }

    /// Register the requests needed right now. Returns how many were registered.
    pub fn tick(&mut self, dispatcher: &RequestDispatcher) -> usize {
        let (reads, writes) = self.collect_work();
        let mut registered = 0;

        for (id, value, desc) in writes {
            if dispatcher.pending_count() >= self.max_pending {
                break;
            }
            if self.register_write(dispatcher, id, &value, &desc) {
                registered += 1;
            }
        }

        for (id, desc) in reads {
            if dispatcher.pending_count() >= self.max_pending {
                break;
            }
            if self.register_read(dispatcher, id, &desc) {
                registered += 1;
            }
        }

        registered
    }

    /// Snapshot the work to do under the datastore lock
    #[allow(clippy::type_complexity)]
    fn collect_work(
        &self,
    ) -> (
        Vec<(EntryId, VariableDescription)>,
        Vec<(EntryId, WatchableValue, VariableDescription)>,
    ) {
        let ds = datastore::lock(&self.datastore);
        let reads_in_flight = lock_set(&self.reads_in_flight);
        let writes_in_flight = lock_set(&self.writes_in_flight);

        let reads = ds
            .variables_to_poll()
            .into_iter()
            .filter(|id| !reads_in_flight.contains(id))
            .filter_map(|id| {
                let desc = ds.get_entry(id)?.variable_description()?.clone();
                Some((id, desc))
            })
            .collect();

        let writes = ds
            .pending_target_updates()
            .into_iter()
            .filter(|id| !writes_in_flight.contains(id))
            .filter_map(|id| {
                let entry = ds.get_entry(id)?;
                let value = entry.target_update()?.value.clone();
                let desc = entry.variable_description()?.clone();
                Some((id, value, desc))
            })
            .collect();

        (reads, writes)
    }

    fn register_read(&self, dispatcher: &RequestDispatcher, id: EntryId, desc: &VariableDescription) -> bool {
        let request = match u16::try_from(desc.byte_len())
            .map_err(|_| TelewatchError::OutOfRange(format!("variable {} is too large to read", id)))
            .and_then(|len| memory_read_request(&[BlockSpan::new(desc.address, len)]))
        {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Cannot poll entry {}: {}", id, e);
                return false;
            }
        };

        lock_set(&self.reads_in_flight).insert(id);

        let datastore = self.datastore.clone();
        let in_flight = self.reads_in_flight.clone();
        let on_success: SuccessCallback = Box::new(move |_, _, data| {
            lock_set(&in_flight).remove(&id);
            let bytes = match data {
                ResponseData::MemoryRead(blocks) => blocks.first().map(|b| b.data.clone()),
                _ => None,
            };
            let bytes = bytes.ok_or_else(|| {
                TelewatchError::Framing(format!("read of entry {} returned no block", id))
            })?;
            datastore::lock(&datastore)
                .set_value(id, WatchableValue::Bytes(bytes))
                .context("storing polled value")
        });

        let in_flight = self.reads_in_flight.clone();
        let on_failure: FailureCallback = Box::new(move |_, reason| {
            lock_set(&in_flight).remove(&id);
            tracing::debug!("Read of entry {} failed: {}", id, reason);
            Ok(())
        });

        dispatcher.register(request, on_success, on_failure, 0).is_ok()
    }

    fn register_write(
        &self,
        dispatcher: &RequestDispatcher,
        id: EntryId,
        value: &WatchableValue,
        desc: &VariableDescription,
    ) -> bool {
        let request = encode_value(desc, value, self.endianness)
            .and_then(|bytes| memory_write_request(&[MemoryBlock::new(desc.address, bytes)]));
        let request = match request {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Cannot write entry {}: {}", id, e);
                if let Err(e) = datastore::lock(&self.datastore).mark_target_update_complete(id, false) {
                    tracing::warn!("{}", e);
                }
                return false;
            }
        };

        lock_set(&self.writes_in_flight).insert(id);

        let datastore = self.datastore.clone();
        let in_flight = self.writes_in_flight.clone();
        let on_success: SuccessCallback = Box::new(move |_, _, _| {
            lock_set(&in_flight).remove(&id);
            datastore::lock(&datastore).mark_target_update_complete(id, true)
        });

        let datastore = self.datastore.clone();
        let in_flight = self.writes_in_flight.clone();
        let on_failure: FailureCallback = Box::new(move |_, reason| {
            lock_set(&in_flight).remove(&id);
            tracing::warn!("Write of entry {} failed: {}", id, reason);
            datastore::lock(&datastore).mark_target_update_complete(id, false)
        });

        dispatcher.register(request, on_success, on_failure, 0).is_ok()
    }
}

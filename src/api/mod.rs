//! Client-facing API
//!
//! Transport-agnostic JSON API served to front-end clients. Each message is
//! an object with a `cmd` field and an optional `reqid` echoed back in the
//! reply. Replies carry `cmd` prefixed with `response_`; failures reply with
//! an `error` message.
//!
//! | Request | Reply |
//! |---|---|
//! | `echo {payload}` | `response_echo {payload}` |
//! | `get_watchable_count` | `response_get_watchable_count {qty}` |
//! | `get_watchable_list {max_per_response?, filter?}` | one or more `response_get_watchable_list {qty, content, done}` |
//! | `subscribe_watchable {watchables}` | `response_subscribe_watchable {subscribed}` |
//! | `unsubscribe_watchable {watchables}` | `response_unsubscribe_watchable {unsubscribed}` |
//! | `write_value {updates}` | `response_write_value {updates}` |
//!
//! [`TelemetryApi::process`] drains the per-connection streams into
//! `watchable_update` messages (`{id, value, timestamp}` per entry), paced
//! by the [`Throttler`].
//!
//! Lock order is datastore, then streamer, the same order datastore
//! observers use.

use crate::config::{ApiConfig, ThrottlingConfig};
use crate::datastore::{self, DatastoreEntry, SharedDatastore};
use crate::error::{Result, TelewatchError};
use crate::streamer::{self, ConnectionId, SharedStreamer};
use crate::throttler::Throttler;
use crate::types::{EntryId, WatchableType, WatchableValue};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// A message produced for one connection
pub type Outgoing = (ConnectionId, Value);

/// One element of a watchable listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchableInfo {
    pub id: EntryId,
    pub display_path: String,
    #[serde(rename = "type")]
    pub watchable_type: WatchableType,
}

impl From<&DatastoreEntry> for WatchableInfo {
    fn from(entry: &DatastoreEntry) -> Self {
        Self {
            id: entry.id(),
            display_path: entry.display_path().to_string(),
            watchable_type: entry.watchable_type(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EchoArgs {
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Default, Deserialize)]
struct ListFilter {
    #[serde(default, rename = "type")]
    types: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ListArgs {
    #[serde(default)]
    max_per_response: Option<usize>,
    #[serde(default)]
    filter: Option<ListFilter>,
}

#[derive(Debug, Deserialize)]
struct WatchablesArgs {
    watchables: Vec<EntryId>,
}

#[derive(Debug, Deserialize)]
struct ValueUpdate {
    watchable: EntryId,
    value: WatchableValue,
}

#[derive(Debug, Deserialize)]
struct WriteArgs {
    updates: Vec<ValueUpdate>,
}

/// JSON API over the datastore and the value streamer
pub struct TelemetryApi {
    datastore: SharedDatastore,
    streamer: SharedStreamer,
    throttler: Throttler,
    config: ApiConfig,
    next_connection: ConnectionId,
}

impl TelemetryApi {
    pub fn new(
        datastore: SharedDatastore,
        streamer: SharedStreamer,
        config: ApiConfig,
        throttling: &ThrottlingConfig,
    ) -> Result<Self> {
        Ok(Self {
            datastore,
            streamer,
            throttler: Throttler::from_config(throttling)?,
            config,
            next_connection: 1,
        })
    }

    pub fn throttler(&self) -> &Throttler {
        &self.throttler
    }

    pub fn throttler_mut(&mut self) -> &mut Throttler {
        &mut self.throttler
    }

    // ==================== Connections ====================

    /// Open a client connection and return its id
    pub fn open_connection(&mut self) -> ConnectionId {
        let conn = self.next_connection;
        self.next_connection += 1;
        streamer::lock(&self.streamer).new_connection(conn);
        tracing::info!("API: client {} connected", conn);
        conn
    }

    /// Close a client connection, dropping its subscriptions and pending stream
    pub fn close_connection(&mut self, conn: ConnectionId) {
        let mut ds = datastore::lock(&self.datastore);
        let dropped = ds.stop_watching_all(conn);
        streamer::lock(&self.streamer).clean_connection(conn);
        tracing::info!("API: client {} disconnected ({} subscriptions dropped)", conn, dropped);
    }

    // ==================== Requests ====================

    /// Handle one raw message from `conn`, returning the replies
    pub fn handle_message(&mut self, conn: ConnectionId, text: &str) -> Vec<Value> {
        match serde_json::from_str::<Value>(text) {
            Ok(value) => self.handle_request(conn, value),
            Err(e) => vec![error_message(None, None, &format!("invalid JSON: {}", e))],
        }
    }

    /// Handle one decoded message from `conn`, returning the replies
    pub fn handle_request(&mut self, conn: ConnectionId, request: Value) -> Vec<Value> {
        let reqid = request.get("reqid").cloned();
        let cmd = match request.get("cmd").and_then(Value::as_str) {
            Some(cmd) => cmd.to_string(),
            None => return vec![error_message(None, reqid, "missing cmd field")],
        };

        tracing::trace!("API: client {} sent {}", conn, cmd);
        let result = match cmd.as_str() {
            "echo" => self.echo(request),
            "get_watchable_count" => Ok(vec![self.watchable_count()]),
            "get_watchable_list" => self.watchable_list(request),
            "subscribe_watchable" => self.subscribe(conn, request),
            "unsubscribe_watchable" => self.unsubscribe(conn, request),
            "write_value" => self.write_value(request),
            other => Err(TelewatchError::Api(format!("unsupported command {}", other))),
        };

        match result {
            Ok(replies) => replies
                .into_iter()
                .map(|reply| with_header(reply, &format!("response_{}", cmd), reqid.clone()))
                .collect(),
            Err(e) => {
                tracing::debug!("API: {} from client {} failed: {}", cmd, conn, e);
                vec![error_message(Some(&cmd), reqid, &e.to_string())]
            }
        }
    }

    fn echo(&self, request: Value) -> Result<Vec<Value>> {
        let args: EchoArgs = serde_json::from_value(request)?;
        Ok(vec![json!({ "payload": args.payload })])
    }

    fn watchable_count(&self) -> Value {
        let ds = datastore::lock(&self.datastore);
        json!({
            "qty": {
                "var": ds.count_by_type(WatchableType::Variable),
                "alias": ds.count_by_type(WatchableType::Alias),
            }
        })
    }

    fn watchable_list(&self, request: Value) -> Result<Vec<Value>> {
        let args: ListArgs = serde_json::from_value(request)?;

        let types = match args.filter {
            Some(filter) if !filter.types.is_empty() => filter
                .types
                .iter()
                .map(|name| {
                    WatchableType::from_api_name(name)
                        .ok_or_else(|| TelewatchError::Api(format!("unknown watchable type {}", name)))
                })
                .collect::<Result<Vec<_>>>()?,
            _ => WatchableType::all().to_vec(),
        };

        let max = match args.max_per_response {
            Some(0) | None => self.config.max_watchables_per_response,
            Some(n) => n,
        }
        .max(1);

        let ds = datastore::lock(&self.datastore);
        let listing: Vec<WatchableInfo> = WatchableType::all()
            .iter()
            .filter(|t| types.contains(*t))
            .flat_map(|t| ds.get_entries_list_by_type(*t))
            .map(WatchableInfo::from)
            .collect();
        drop(ds);

        if listing.is_empty() {
            return Ok(vec![list_chunk(&[], true)]);
        }

        let chunks: Vec<&[WatchableInfo]> = listing.chunks(max).collect();
        let last = chunks.len() - 1;
        Ok(chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| list_chunk(chunk, i == last))
            .collect())
    }

    fn subscribe(&mut self, conn: ConnectionId, request: Value) -> Result<Vec<Value>> {
        let args: WatchablesArgs = serde_json::from_value(request)?;
        let mut ds = datastore::lock(&self.datastore);

        if let Some(unknown) = args.watchables.iter().find(|id| !ds.contains(**id)) {
            return Err(TelewatchError::OutOfRange(format!("unknown watchable {}", unknown)));
        }

        for id in &args.watchables {
            let shared = self.streamer.clone();
            ds.start_watching(*id, conn, move |entry: &DatastoreEntry| {
                streamer::lock(&shared).publish(entry.id(), conn);
            })?;
            // Deliver the current value right away
            if ds.get_entry(*id).and_then(|e| e.value()).is_some() {
                streamer::lock(&self.streamer).publish(*id, conn);
            }
        }

        Ok(vec![json!({ "subscribed": args.watchables })])
    }

    fn unsubscribe(&mut self, conn: ConnectionId, request: Value) -> Result<Vec<Value>> {
        let args: WatchablesArgs = serde_json::from_value(request)?;
        let mut ds = datastore::lock(&self.datastore);
        for id in &args.watchables {
            ds.stop_watching(*id, conn)?;
        }
        Ok(vec![json!({ "unsubscribed": args.watchables })])
    }

    fn write_value(&mut self, request: Value) -> Result<Vec<Value>> {
        let args: WriteArgs = serde_json::from_value(request)?;
        let mut ds = datastore::lock(&self.datastore);

        if let Some(unknown) = args.updates.iter().find(|u| !ds.contains(u.watchable)) {
            return Err(TelewatchError::OutOfRange(format!(
                "unknown watchable {}",
                unknown.watchable
            )));
        }

        let mut accepted = Vec::with_capacity(args.updates.len());
        for update in args.updates {
            ds.update_target_value(update.watchable, update.value)?;
            accepted.push(json!({ "watchable": update.watchable, "success": true }));
        }
        Ok(vec![json!({ "updates": accepted })])
    }

    // ==================== Streaming ====================

    /// Turn pending stream entries into `watchable_update` messages, within
    /// the bandwidth budget. Call periodically.
    pub fn process(&mut self) -> Vec<Outgoing> {
        self.throttler.process();

        let mut out = Vec::new();
        let max = self.config.max_watchables_per_response.max(1);
        let bits_per_entry = self.config.entry_size_bits_estimate;

        let mut ds = datastore::lock(&self.datastore);
        let mut stream = streamer::lock(&self.streamer);
        let mut connections = stream.connection_ids();
        connections.sort_unstable();

        let mut delivered = Vec::new();
        'connections: for conn in connections {
            loop {
                let pending = stream.pending_count(conn).min(max);
                if pending == 0 || stream.is_frozen(conn) {
                    break;
                }
                let estimate = pending as u64 * bits_per_entry;
                if !self.throttler.possible(estimate) {
                    tracing::warn!("API: streaming impossible under the current budget");
                    break 'connections;
                }
                if !self.throttler.allowed(estimate) {
                    break 'connections;
                }

                let chunk = stream.take_stream_chunk(conn, max);
                let updates: Vec<Value> = chunk
                    .iter()
                    .filter_map(|id| {
                        let entry = ds.get_entry(*id)?;
                        Some(json!({
                            "id": id,
                            "value": entry.value()?,
                            "timestamp": entry.last_update_time(),
                        }))
                    })
                    .collect();
                delivered.extend(chunk);
                if updates.is_empty() {
                    continue;
                }

                let message = json!({ "cmd": "watchable_update", "updates": updates });
                let bits = message.to_string().len() as u64 * 8;
                self.throttler.consume_bandwidth(bits);
                out.push((conn, message));
            }
        }

        for id in delivered {
            if !stream.is_still_waiting_stream(id) {
                if let Err(e) = ds.mark_clean(id) {
                    tracing::warn!("API: cannot mark entry {} clean: {}", id, e);
                }
            }
        }

        out
    }
}

fn with_header(reply: Value, cmd: &str, reqid: Option<Value>) -> Value {
    let mut object = match reply {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("payload".to_string(), other);
            map
        }
    };
    object.insert("cmd".to_string(), Value::String(cmd.to_string()));
    if let Some(reqid) = reqid {
        object.insert("reqid".to_string(), reqid);
    }
    Value::Object(object)
}

fn error_message(request_cmd: Option<&str>, reqid: Option<Value>, msg: &str) -> Value {
    with_header(
        json!({ "request_cmd": request_cmd, "msg": msg }),
        "error",
        reqid,
    )
}

fn list_chunk(chunk: &[WatchableInfo], done: bool) -> Value {
    let mut content: BTreeMap<&'static str, Vec<&WatchableInfo>> = WatchableType::all()
        .iter()
        .map(|t| (t.api_name(), Vec::new()))
        .collect();
    for info in chunk {
        content
            .entry(info.watchable_type.api_name())
            .or_default()
            .push(info);
    }
    let qty: BTreeMap<&str, usize> = content.iter().map(|(k, v)| (*k, v.len())).collect();
    json!({ "qty": qty, "content": content, "done": done })
}

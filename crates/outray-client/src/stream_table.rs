//! Registry of live relayed TCP streams
//!
//! Maps a relay-assigned connection id to the channel feeding the local
//! socket's write half. Entries carry a serial so a late removal from a
//! replaced stream never evicts its successor.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Per-stream buffered chunks from the relay awaiting the local socket
const STREAM_CHANNEL_CAPACITY: usize = 256;

struct StreamEntry {
    serial: u64,
    sender: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

/// Handle returned to the task that owns a registered stream
pub struct StreamRegistration {
    pub serial: u64,
    pub receiver: mpsc::Receiver<Bytes>,
    pub cancel: CancellationToken,
}

#[derive(Default)]
pub struct StreamTable {
    entries: Mutex<HashMap<String, StreamEntry>>,
    next_serial: AtomicU64,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StreamEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a stream under `id`, replacing (and closing) any previous one
    pub fn register(&self, id: &str, parent: &CancellationToken) -> StreamRegistration {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let cancel = parent.child_token();

        let previous = self.lock().insert(
            id.to_string(),
            StreamEntry {
                serial,
                sender,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            debug!("Replacing existing stream {}", id);
            previous.cancel.cancel();
        }

        StreamRegistration {
            serial,
            receiver,
            cancel,
        }
    }

    /// Serial and channel feeding the local socket for `id`
    pub fn route(&self, id: &str) -> Option<(u64, mpsc::Sender<Bytes>)> {
        self.lock()
            .get(id)
            .map(|entry| (entry.serial, entry.sender.clone()))
    }

    /// Remove the entry for `id` if it is still the one registered with `serial`.
    ///
    /// Safe to call more than once; only the first call returns `true`.
    pub fn remove(&self, id: &str, serial: u64) -> bool {
        let removed = {
            let mut entries = self.lock();
            match entries.get(id) {
                Some(entry) if entry.serial == serial => entries.remove(id),
                _ => None,
            }
        };

        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Close every stream; returns how many were open
    pub fn close_all(&self) -> usize {
        let drained: Vec<StreamEntry> = self.lock().drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.cancel.cancel();
        }
        drained.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

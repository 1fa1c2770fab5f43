//! Registry of exported audio blobs.
//!
//! A chunk refers to its audio through an [`AudioHandle`] rather than owning
//! the bytes, so hosts can hand the id to a player or exporter and the engine
//! can release every blob in one sweep on `clear()` or destroy.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AudioHandle(u64);

impl AudioHandle {
    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AudioHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "audio:{}", self.0)
    }
}

#[derive(Debug, Default)]
pub struct AudioHandleRegistry {
    next: AtomicU64,
    blobs: Mutex<HashMap<AudioHandle, Arc<[u8]>>>,
}

impl AudioHandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, bytes: Vec<u8>) -> AudioHandle {
        let handle = AudioHandle(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        self.blobs.lock().insert(handle, bytes.into());
        handle
    }

    pub fn get(&self, handle: AudioHandle) -> Option<Arc<[u8]>> {
        self.blobs.lock().get(&handle).cloned()
    }

    /// Release the bytes behind `handle`. Revoking twice is a no-op.
    pub fn revoke(&self, handle: AudioHandle) -> bool {
        self.blobs.lock().remove(&handle).is_some()
    }

    pub fn live_count(&self) -> usize {
        self.blobs.lock().len()
    }
}

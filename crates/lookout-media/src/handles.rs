//! Revocable display handles for media assets.
//!
//! A display handle is a locally-scoped reference used to render an asset
//! without going through the network (the native counterpart of a browser
//! object URL). Handles are bound to named slots: acquiring a handle for a
//! slot that already holds one revokes the old handle first, so at most one
//! handle per slot is ever live.

use crate::asset::MediaAsset;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use uuid::Uuid;

/// An opaque `blob:` style reference to a live asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DisplayHandle(String);

impl DisplayHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DisplayHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mints and revokes handles.
pub trait HandleSink: Send {
    fn create(&mut self, asset: &MediaAsset) -> DisplayHandle;
    fn revoke(&mut self, handle: &DisplayHandle);
}

/// In-process handle registry with acquire/release accounting.
#[derive(Debug, Default)]
pub struct LocalHandles {
    live: HashSet<DisplayHandle>,
    created: u64,
    revoked: u64,
}

impl LocalHandles {
    /// Number of handles currently live.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Total handles ever created.
    pub fn created(&self) -> u64 {
        self.created
    }

    /// Total handles revoked.
    pub fn revoked(&self) -> u64 {
        self.revoked
    }

    pub fn is_live(&self, handle: &DisplayHandle) -> bool {
        self.live.contains(handle)
    }
}

impl HandleSink for LocalHandles {
    fn create(&mut self, asset: &MediaAsset) -> DisplayHandle {
        let handle = DisplayHandle(format!("blob:lookout/{}", Uuid::new_v4()));
        self.live.insert(handle.clone());
        self.created += 1;
        tracing::trace!(handle = %handle, asset = %asset.name(), "display handle created");
        handle
    }

    fn revoke(&mut self, handle: &DisplayHandle) {
        if self.live.remove(handle) {
            self.revoked += 1;
            tracing::trace!(handle = %handle, "display handle revoked");
        }
    }
}

/// Slot-keyed display handles owned by a single view.
///
/// Every handle still live when the owner is dropped is revoked.
pub struct DisplayHandles<K: Eq + Hash, S: HandleSink = LocalHandles> {
    sink: S,
    slots: HashMap<K, DisplayHandle>,
}

impl<K: Eq + Hash + fmt::Debug, S: HandleSink + Default> DisplayHandles<K, S> {
    pub fn new() -> Self {
        Self::with_sink(S::default())
    }
}

impl<K: Eq + Hash + fmt::Debug, S: HandleSink + Default> Default for DisplayHandles<K, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + fmt::Debug, S: HandleSink> DisplayHandles<K, S> {
    pub fn with_sink(sink: S) -> Self {
        Self {
            sink,
            slots: HashMap::new(),
        }
    }

    /// Create a handle for `asset` in `slot`, revoking the slot's previous
    /// handle before the new one is minted.
    pub fn acquire(&mut self, slot: K, asset: &MediaAsset) -> DisplayHandle {
        if let Some(previous) = self.slots.remove(&slot) {
            tracing::debug!(slot = ?slot, handle = %previous, "revoking superseded display handle");
            self.sink.revoke(&previous);
        }
        let handle = self.sink.create(asset);
        self.slots.insert(slot, handle.clone());
        handle
    }

    /// Release a specific handle. Releasing an unknown or already-released
    /// handle is a no-op and returns false.
    pub fn release(&mut self, handle: &DisplayHandle) -> bool {
        let before = self.slots.len();
        self.slots.retain(|_, h| h != handle);
        if self.slots.len() == before {
            return false;
        }
        self.sink.revoke(handle);
        true
    }

    /// Release whatever handle `slot` holds. No-op for an empty slot.
    pub fn release_slot(&mut self, slot: &K) -> bool {
        match self.slots.remove(slot) {
            Some(handle) => {
                self.sink.revoke(&handle);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, slot: &K) -> Option<&DisplayHandle> {
        self.slots.get(slot)
    }

    /// Number of slots holding a live handle.
    pub fn live(&self) -> usize {
        self.slots.len()
    }

    pub fn release_all(&mut self) {
        for (_, handle) in self.slots.drain() {
            self.sink.revoke(&handle);
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

impl<K: Eq + Hash, S: HandleSink> Drop for DisplayHandles<K, S> {
    fn drop(&mut self) {
        for (_, handle) in self.slots.drain() {
            self.sink.revoke(&handle);
        }
    }
}

//! Deferred offload-callback registration.
//!
//! Offload backends that sit behind another device (tunnels, bonds) cannot
//! register flow callbacks at bind time because the ingress block they care
//! about may not exist yet. The indirect registry lets them register per
//! device: if the device already has a bound ingress block the callback is
//! exercised immediately, otherwise it fires when a block is bound later.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::{block::Block, offload::{BlockOffloadRequest, OffloadDevice}};

/// An offload backend interested in a device's ingress block.
pub trait IndirectCallback: Send + Sync {
    /// Fills `req` with the flow callbacks this backend wants attached to
    /// (or detached from) `block`. `req.command` says which.
    fn setup(&self, dev: &Arc<dyn OffloadDevice>, block: &Arc<Block>, req: &mut BlockOffloadRequest);
}

pub(crate) struct IndirEntry {
    pub(crate) ident: u64,
    pub(crate) cb: Arc<dyn IndirectCallback>,
}

/// Registered indirect callbacks, keyed by device identity. The device entry
/// disappears with its last callback.
#[derive(Default)]
pub(crate) struct IndirectRegistry {
    entries: FxHashMap<u64, Vec<IndirEntry>>,
}

impl IndirectRegistry {
    pub(crate) fn add(&mut self, dev: u64, ident: u64, cb: Arc<dyn IndirectCallback>) -> bool {
        let entries = self.entries.entry(dev).or_default();
        if entries.iter().any(|e| e.ident == ident) {
            return false;
        }
        entries.push(IndirEntry { ident, cb });
        true
    }

    pub(crate) fn remove(&mut self, dev: u64, ident: u64) -> Option<Arc<dyn IndirectCallback>> {
        let entries = self.entries.get_mut(&dev)?;
        let pos = entries.iter().position(|e| e.ident == ident)?;
        let entry = entries.remove(pos);
        if entries.is_empty() {
            self.entries.remove(&dev);
        }
        Some(entry.cb)
    }

    pub(crate) fn snapshot(&self, dev: u64) -> Vec<Arc<dyn IndirectCallback>> {
        self.entries
            .get(&dev)
            .map(|entries| entries.iter().map(|e| Arc::clone(&e.cb)).collect())
            .unwrap_or_default()
    }
}

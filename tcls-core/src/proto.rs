//! Filter chain nodes and their counted handles.

use std::{
    fmt,
    ops::Deref,
    sync::{
        atomic::{fence, AtomicU32, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use crate::{
    chain::Chain,
    classifier::{ClassifierInstance, Verdict, WalkControl},
    classify::{ClassResult, Packet, Protocol},
    error::Result,
    offload::FlowCallback,
    registry::{KindHandle, Registry},
};

/// One classifier instance bound to a chain at a priority.
///
/// Nodes form the chain's singly-linked list through lock-free `next`
/// pointers. Lifecycle is governed by the explicit refcount, not by `Arc`
/// drops: the list holds one reference, every [`ProtoHandle`] holds another,
/// and the final release schedules destruction on the registry's worker so
/// kind-owned state is never torn down under a chain lock.
pub struct Proto {
    kind: KindHandle,
    instance: Box<dyn ClassifierInstance>,
    protocol: Protocol,
    prio: u32,
    /// Back-reference; the node owns one chain reference, released on destroy.
    pub(crate) chain: Arc<Chain>,
    registry: Arc<Registry>,
    refcnt: AtomicU32,
    /// Guarded by its own lock so concurrent iterators can observe it while
    /// the chain lock is unlocked.
    deleting: Mutex<bool>,
    pub(crate) next: ArcSwapOption<Proto>,
}

impl fmt::Debug for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proto")
            .field("kind", &self.kind.kind())
            .field("protocol", &self.protocol)
            .field("prio", &self.prio)
            .finish_non_exhaustive()
    }
}

impl Proto {
    /// Builds a node, resolving the kind through the registry (a load may be
    /// triggered; [`Error::Retry`](crate::Error::Retry) propagates) and taking
    /// one reference on the owning chain.
    pub(crate) fn create(
        registry: &Arc<Registry>,
        kind: &str,
        protocol: Protocol,
        prio: u32,
        chain: &Arc<Chain>,
    ) -> Result<ProtoHandle> {
        let kind = registry.lookup_or_load(kind)?;
        let instance = kind.init()?;
        Chain::hold(chain);
        Ok(ProtoHandle {
            proto: Arc::new(Self {
                kind,
                instance,
                protocol,
                prio,
                chain: Arc::clone(chain),
                registry: Arc::clone(registry),
                refcnt: AtomicU32::new(1),
                deleting: Mutex::new(false),
                next: ArcSwapOption::empty(),
            }),
        })
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn prio(&self) -> u32 {
        self.prio
    }

    pub fn kind_name(&self) -> &'static str {
        self.kind.kind()
    }

    /// Matches one packet against this node's instance.
    pub fn classify(&self, packet: &Packet, res: &mut ClassResult) -> Verdict {
        self.instance.classify(packet, res)
    }

    /// Inserts or updates a filter entry, enforcing the chain template.
    pub fn change(&self, handle: u32, config: Bytes) -> Result<()> {
        let template = self.chain.template.lock();
        self.instance.change(handle, config, template.as_ref().map(|t| t.state.as_ref()))
    }

    /// Removes a filter entry. Returns `true` when the node is now empty.
    pub fn delete_filter(&self, handle: u32) -> Result<bool> {
        self.instance.delete(handle)
    }

    /// Whether a filter entry exists at `handle`.
    pub fn get_filter(&self, handle: u32) -> bool {
        self.instance.get(handle)
    }

    /// Renders one filter entry for listing.
    pub fn dump_filter(&self, handle: u32) -> Option<String> {
        self.instance.dump(handle)
    }

    /// Visits every filter entry of this node.
    pub fn walk(&self, visit: &mut dyn FnMut(u32) -> WalkControl) -> bool {
        self.instance.walk(visit)
    }

    pub(crate) fn can_reoffload(&self) -> bool {
        self.instance.can_reoffload()
    }

    pub(crate) fn reoffload(&self, add: bool, cb: &dyn FlowCallback) -> Result<()> {
        self.instance.reoffload(add, cb)
    }

    /// True when the kind has no walk support or the walk visits no entry.
    pub fn is_empty(&self) -> bool {
        let mut found = false;
        let supported = self.instance.walk(&mut |_| {
            found = true;
            WalkControl::Stop
        });
        !supported || !found
    }

    /// Marks the node as unlinked. Iterators observing the flag restart from
    /// the node's priority value instead of trusting its next pointer.
    pub(crate) fn mark_delete(&self) {
        *self.deleting.lock() = true;
    }

    pub fn is_deleting(&self) -> bool {
        *self.deleting.lock()
    }

    pub(crate) fn next_node(&self) -> Option<Arc<Proto>> {
        self.next.load_full()
    }

    pub(crate) fn hold_raw(&self) {
        self.refcnt.fetch_add(1, Ordering::Relaxed);
    }

    fn destroy(&self) {
        trace!(kind = self.kind_name(), prio = self.prio >> 16, "proto destroyed");
        self.instance.destroy();
        Chain::put(&self.chain, false, false);
    }
}

/// A counted reference to a [`Proto`]. Clone acquires, drop releases; the
/// final release defers destruction to the registry's worker thread.
pub struct ProtoHandle {
    proto: Arc<Proto>,
}

impl ProtoHandle {
    /// Acquires a new reference to an existing node.
    pub(crate) fn hold(proto: &Arc<Proto>) -> Self {
        proto.refcnt.fetch_add(1, Ordering::Relaxed);
        Self { proto: Arc::clone(proto) }
    }

    /// Takes over an already-counted reference, e.g. the list's own one after
    /// the node was unlinked.
    pub(crate) fn adopt(proto: Arc<Proto>) -> Self {
        Self { proto }
    }

    pub(crate) fn as_arc(&self) -> &Arc<Proto> {
        &self.proto
    }
}

impl Deref for ProtoHandle {
    type Target = Proto;

    fn deref(&self) -> &Self::Target {
        &self.proto
    }
}

impl Clone for ProtoHandle {
    fn clone(&self) -> Self {
        Self::hold(&self.proto)
    }
}

impl fmt::Debug for ProtoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.proto.fmt(f)
    }
}

impl Drop for ProtoHandle {
    fn drop(&mut self) {
        if self.proto.refcnt.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        fence(Ordering::Acquire);

        // Destruction runs off the chain locks; the job's Arc keeps the node
        // (and through it the chain and block) reachable until it completes.
        let proto = Arc::clone(&self.proto);
        self.proto.registry.defer_destroy(move || proto.destroy());
    }
}

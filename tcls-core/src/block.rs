//! Blocks: shareable containers of filter chains.

use std::{
    fmt,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwap;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use crate::{
    chain::{Chain, ChainHandle, ChainTemplate},
    error::{Error, Result},
    net::Net,
    offload::{FlowCallback, OffloadDevice},
    proto::Proto,
    registry::Registry,
};

/// How an owner attaches a block to its dispatch point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinderType {
    /// A plain scheduler attachment point.
    Scheduler,
    /// The ingress hook of a classify/act dispatcher. These bindings feed the
    /// device-ingress map consulted by the indirect callback registry.
    ClsactIngress,
    /// The egress hook of a classify/act dispatcher.
    ClsactEgress,
}

/// Notified whenever the head of chain 0 changes, so data-path entry points
/// can keep a cached head pointer consistent.
///
/// Called with locks held; implementations must not call back into the block.
pub trait ChainHeadChange: Send + Sync {
    fn head_change(&self, head: Option<&Arc<Proto>>);
}

/// Template request for [`Block::chain_create`].
#[derive(Debug, Clone)]
pub struct TemplateSpec {
    pub kind: String,
    pub config: Bytes,
}

pub(crate) struct Owner {
    pub(crate) id: u64,
    pub(crate) binder: BinderType,
    pub(crate) device: Option<Arc<dyn OffloadDevice>>,
}

#[derive(Default)]
pub(crate) struct BlockState {
    pub(crate) owners: Vec<Owner>,
    pub(crate) chain0_listeners: Vec<Arc<dyn ChainHeadChange>>,
}

#[derive(Default)]
pub(crate) struct OffloadState {
    pub(crate) cbs: Vec<Arc<dyn FlowCallback>>,
}

/// A collection of chains bound to one or more owners.
///
/// Index 0 marks a private block scoped to a single owner; nonzero indices
/// are shared blocks resolved through the namespace table. The chain list is
/// kept as a copy-on-write snapshot so the data path can resolve goto targets
/// without a lock; all structural mutation and chain refcount transitions
/// happen under `state`.
pub struct Block {
    pub(crate) index: u32,
    pub(crate) net: Arc<Net>,
    /// Sorted by chain index. Replaced wholesale under the `state` lock.
    pub(crate) chains: ArcSwap<Vec<Arc<Chain>>>,
    pub(crate) state: Mutex<BlockState>,
    pub(crate) offload: Mutex<OffloadState>,
    pub(crate) refcnt: AtomicU32,
    pub(crate) offloadcnt: AtomicU32,
    pub(crate) nooffloaddevcnt: AtomicU32,
    pub(crate) keep_dst: AtomicBool,
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("index", &self.index)
            .field("refcnt", &self.refcnt.load(Ordering::Relaxed))
            .field("chains", &self.chains.load().len())
            .finish_non_exhaustive()
    }
}

impl Block {
    pub(crate) fn new(index: u32, net: Arc<Net>) -> Arc<Self> {
        trace!(block = index, "block created");
        Arc::new(Self {
            index,
            net,
            chains: ArcSwap::from_pointee(Vec::new()),
            state: Mutex::new(BlockState::default()),
            offload: Mutex::new(OffloadState::default()),
            refcnt: AtomicU32::new(1),
            offloadcnt: AtomicU32::new(0),
            nooffloaddevcnt: AtomicU32::new(0),
            keep_dst: AtomicBool::new(false),
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Whether this block can be attached by multiple owners.
    pub fn is_shared(&self) -> bool {
        self.index != 0
    }

    pub fn net(&self) -> &Arc<Net> {
        &self.net
    }

    /// Lock-free chain lookup used on the data path.
    pub fn lookup_chain(&self, index: u32) -> Option<Arc<Chain>> {
        let chains = self.chains.load();
        chains
            .binary_search_by_key(&index, |c| c.index())
            .ok()
            .map(|pos| Arc::clone(&chains[pos]))
    }

    /// Caller holds the `state` lock.
    pub(crate) fn lookup_chain_locked(&self, index: u32) -> Option<Arc<Chain>> {
        self.lookup_chain(index)
    }

    /// Caller holds the `state` lock.
    fn link_chain_locked(&self, chain: &Arc<Chain>) {
        let cur = self.chains.load();
        let mut next = Vec::with_capacity(cur.len() + 1);
        next.extend(cur.iter().cloned());
        let pos = next.partition_point(|c| c.index() < chain.index());
        next.insert(pos, Arc::clone(chain));
        self.chains.store(Arc::new(next));
    }

    /// Caller holds the `state` lock.
    pub(crate) fn unlink_chain_locked(&self, chain: &Arc<Chain>) {
        let cur = self.chains.load();
        let next: Vec<_> = cur.iter().filter(|c| !Arc::ptr_eq(c, chain)).cloned().collect();
        self.chains.store(Arc::new(next));
    }

    fn chain_get_inner(self: &Arc<Self>, index: u32, create: bool, by_act: bool) -> Result<ChainHandle> {
        let (chain, first_reference) = {
            let _state = self.state.lock();
            let chain = match self.lookup_chain_locked(index) {
                Some(chain) => {
                    chain.refcnt.fetch_add(1, Ordering::Relaxed);
                    chain
                }
                None => {
                    if !create {
                        return Err(Error::ChainNotFound(index));
                    }
                    let chain = Chain::new(index, Arc::clone(self));
                    self.link_chain_locked(&chain);
                    trace!(block = self.index, chain = index, "chain created");
                    chain
                }
            };
            if by_act {
                chain.action_refcnt.fetch_add(1, Ordering::Relaxed);
            }
            // The first non-action reference makes the chain visible.
            let first = !by_act
                && chain.refcnt.load(Ordering::Relaxed)
                    - chain.action_refcnt.load(Ordering::Relaxed)
                    == 1
                && !chain.announced.swap(true, Ordering::Relaxed);
            (chain, first)
        };

        if first_reference {
            self.net.notify_chain_created(self.index, index);
        }
        Ok(ChainHandle::new(chain, by_act))
    }

    /// Looks up a chain by index, creating it when `create` is set.
    pub fn chain_get(self: &Arc<Self>, index: u32, create: bool) -> Result<ChainHandle> {
        self.chain_get_inner(index, create, false)
    }

    /// Action reference: keeps a goto target alive without making the chain
    /// visible to listers.
    pub fn chain_get_by_act(self: &Arc<Self>, index: u32) -> Result<ChainHandle> {
        self.chain_get_inner(index, true, true)
    }

    /// Explicitly creates a chain, optionally attaching a template.
    ///
    /// A chain that already exists and is directly held is a conflict;
    /// action-only placeholders are adopted. The explicit reference persists
    /// until [`Block::chain_delete`].
    pub fn chain_create(
        self: &Arc<Self>,
        registry: &Arc<Registry>,
        index: u32,
        template: Option<&TemplateSpec>,
    ) -> Result<()> {
        // Template kind resolution may load a module; keep it ahead of any
        // state change so failure needs no rollback.
        let template = match template {
            Some(spec) => {
                let kind = registry.lookup_or_load(&spec.kind)?;
                let state = kind.template_create(&spec.config)?;
                Some(ChainTemplate { state, kind })
            }
            None => None,
        };

        let (chain, first_reference) = {
            let _state = self.state.lock();
            let chain = match self.lookup_chain_locked(index) {
                Some(existing) => {
                    if !existing.held_by_acts_only() {
                        return Err(Error::ChainExists(index));
                    }
                    existing.refcnt.fetch_add(1, Ordering::Relaxed);
                    existing
                }
                None => {
                    let chain = Chain::new(index, Arc::clone(self));
                    self.link_chain_locked(&chain);
                    chain
                }
            };
            chain.explicitly_created.store(true, Ordering::Relaxed);
            *chain.template.lock() = template;
            let first = chain.refcnt.load(Ordering::Relaxed)
                - chain.action_refcnt.load(Ordering::Relaxed)
                == 1
                && !chain.announced.swap(true, Ordering::Relaxed);
            (chain, first)
        };

        if first_reference {
            self.net.notify_chain_created(self.index, index);
        }
        trace!(block = self.index, chain = chain.index(), "chain explicitly created");
        Ok(())
    }

    /// Flushes a chain and drops its explicit reference.
    pub fn chain_delete(self: &Arc<Self>, index: u32) -> Result<()> {
        let chain = {
            let _state = self.state.lock();
            let Some(chain) = self.lookup_chain_locked(index) else {
                return Err(Error::ChainNotFound(index));
            };
            // Action placeholders are not user visible.
            if chain.held_by_acts_only() {
                return Err(Error::ChainNotFound(index));
            }
            chain.refcnt.fetch_add(1, Ordering::Relaxed);
            chain
        };

        chain.flush();
        Chain::put_explicitly_created(&chain);
        Chain::put(&chain, false, false);
        Ok(())
    }

    fn next_chain_inner(self: &Arc<Self>, cur: Option<u32>, skip_act_only: bool) -> Option<ChainHandle> {
        let _state = self.state.lock();
        let chains = self.chains.load();
        for chain in chains.iter() {
            if let Some(cur) = cur {
                if chain.index() <= cur {
                    continue;
                }
            }
            if skip_act_only && chain.held_by_acts_only() {
                continue;
            }
            chain.refcnt.fetch_add(1, Ordering::Relaxed);
            return Some(ChainHandle::new(Arc::clone(chain), false));
        }
        None
    }

    /// Visible-chain iteration in index order; action-only placeholders are
    /// skipped.
    pub fn next_chain(self: &Arc<Self>, cur: Option<&ChainHandle>) -> Option<ChainHandle> {
        self.next_chain_inner(cur.map(|c| c.index()), true)
    }

    /// Iteration over every chain, placeholders included.
    pub(crate) fn next_chain_any(self: &Arc<Self>, cur: Option<&ChainHandle>) -> Option<ChainHandle> {
        self.next_chain_inner(cur.map(|c| c.index()), false)
    }

    /// Registers a chain-0 head listener. If chain 0 already exists, the
    /// current head is replayed to the listener before it starts receiving
    /// transitions, so no head is ever missed.
    pub fn head_change_cb_add(&self, listener: Arc<dyn ChainHeadChange>) {
        let chain0 = {
            let mut state = self.state.lock();
            match self.lookup_chain_locked(0) {
                Some(chain0) => {
                    chain0.refcnt.fetch_add(1, Ordering::Relaxed);
                    chain0
                }
                None => {
                    state.chain0_listeners.push(listener);
                    return;
                }
            }
        };

        {
            // Hold the filter lock across replay and registration so no head
            // transition slips between them.
            let _guard = chain0.filter_lock.lock();
            if let Some(head) = chain0.head_snapshot() {
                listener.head_change(Some(&head));
            }
            self.state.lock().chain0_listeners.push(listener);
        }
        Chain::put(&chain0, false, false);
    }

    /// Removes a chain-0 head listener, notifying it with `None` while chain
    /// 0 still exists.
    pub fn head_change_cb_del(&self, listener: &Arc<dyn ChainHeadChange>) {
        let mut state = self.state.lock();
        let Some(pos) = state
            .chain0_listeners
            .iter()
            .position(|l| std::ptr::eq(Arc::as_ptr(l).cast::<()>(), Arc::as_ptr(listener).cast()))
        else {
            return;
        };
        if self.lookup_chain_locked(0).is_some() {
            state.chain0_listeners[pos].head_change(None);
        }
        state.chain0_listeners.remove(pos);
    }

    pub(crate) fn owner_add(
        &self,
        id: u64,
        binder: BinderType,
        device: Option<Arc<dyn OffloadDevice>>,
    ) {
        let mut state = self.state.lock();
        if self.keep_dst.load(Ordering::Relaxed) && binder == BinderType::Scheduler {
            if let Some(dev) = &device {
                dev.keep_dst();
            }
        }
        state.owners.push(Owner { id, binder, device });
    }

    pub(crate) fn owner_del(&self, id: u64, binder: BinderType) {
        let mut state = self.state.lock();
        if let Some(pos) = state.owners.iter().position(|o| o.id == id && o.binder == binder) {
            state.owners.remove(pos);
        }
    }

    /// Marks the block as requiring destination retention and notifies the
    /// devices of existing scheduler owners. Owners added later are notified
    /// at bind time.
    pub fn set_keep_dst(&self) {
        self.keep_dst.store(true, Ordering::Relaxed);
        let state = self.state.lock();
        for owner in &state.owners {
            if owner.binder == BinderType::Scheduler {
                if let Some(dev) = &owner.device {
                    dev.keep_dst();
                }
            }
        }
    }

    pub(crate) fn hold(&self) {
        self.refcnt.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn hold_unless_zero(&self) -> bool {
        let mut cur = self.refcnt.load(Ordering::Relaxed);
        loop {
            if cur == 0 {
                return false;
            }
            match self.refcnt.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(now) => cur = now,
            }
        }
    }

    /// Releases one block reference. The last one removes the block from the
    /// namespace table and flushes every chain; the block itself dies when
    /// its last chain detaches (or immediately when the chain list is empty).
    pub(crate) fn put(this: &Arc<Self>) {
        if this.refcnt.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        if this.is_shared() {
            this.net.remove_block(this);
        }
        if this.chains.load().is_empty() {
            Self::destroyed(this);
        } else {
            this.flush_all_chains();
        }
    }

    /// Last block reference is gone: chains cannot be added concurrently any
    /// more. Explicit references are dropped along the way so explicitly
    /// created chains do not pin the block forever.
    fn flush_all_chains(self: &Arc<Self>) {
        let mut cur = self.next_chain_any(None);
        while let Some(chain) = cur {
            Chain::put_explicitly_created(chain.chain());
            chain.flush();
            cur = self.next_chain_any(Some(&chain));
        }
    }

    pub(crate) fn destroyed(this: &Arc<Self>) {
        trace!(block = this.index, "block destroyed");
    }
}

/// A plain counted block reference obtained from
/// [`Net::block_lookup`](crate::Net::block_lookup).
pub struct BlockHandle {
    block: Arc<Block>,
}

impl BlockHandle {
    pub(crate) fn new(block: Arc<Block>) -> Self {
        Self { block }
    }

    pub fn block(&self) -> &Arc<Block> {
        &self.block
    }
}

impl Clone for BlockHandle {
    fn clone(&self) -> Self {
        self.block.hold();
        Self { block: Arc::clone(&self.block) }
    }
}

impl Deref for BlockHandle {
    type Target = Block;

    fn deref(&self) -> &Self::Target {
        &self.block
    }
}

impl fmt::Debug for BlockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.block.fmt(f)
    }
}

impl Drop for BlockHandle {
    fn drop(&mut self) {
        Block::put(&self.block);
    }
}

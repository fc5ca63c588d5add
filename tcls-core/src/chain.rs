//! Filter chains: priority-ordered node lists with counted lifecycle.

use std::{
    fmt,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tracing::trace;

use crate::{
    block::Block,
    classify::Protocol,
    error::{Error, Result},
    proto::{Proto, ProtoHandle},
    registry::{KindHandle, Registry},
};

/// First priority handed out when a chain has no auto-allocated node yet.
const AUTO_PRIO_BASE: u32 = 0xC000_0000;
/// Everything at or above this priority was auto-allocated.
const AUTO_PRIO_FLOOR: u32 = 0x8000_0000;

/// Template attached to a chain, restricting which kind may populate it.
/// `state` is declared first so it drops while the kind handle still keeps
/// the owning code alive.
pub(crate) struct ChainTemplate {
    pub(crate) state: Box<dyn crate::classifier::TemplateState>,
    pub(crate) kind: KindHandle,
}

/// Requested priority for a new node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrioSpec {
    /// Exact slot; must be nonzero and free.
    At(u32),
    /// Allocate descending from [`AUTO_PRIO_BASE`]: later nodes get lower
    /// values and therefore higher precedence.
    Auto,
}

/// An ordered list of filter nodes within a block.
///
/// The node list is mutated only under `filter_lock`, independently of
/// sibling chains; readers traverse head/next pointers lock-free. The
/// refcount, action refcount and flags are mutated only under the owning
/// block's lock (atomics let unlocked paths read them).
pub struct Chain {
    pub(crate) index: u32,
    pub(crate) block: Arc<Block>,
    pub(crate) head: ArcSwapOption<Proto>,
    pub(crate) filter_lock: Mutex<()>,
    pub(crate) refcnt: AtomicU32,
    pub(crate) action_refcnt: AtomicU32,
    pub(crate) explicitly_created: AtomicBool,
    /// Set while a chain-created event for this chain is outstanding; pairs
    /// creation and removal events exactly once per visible lifetime.
    pub(crate) announced: AtomicBool,
    pub(crate) flushing: AtomicBool,
    pub(crate) template: Mutex<Option<ChainTemplate>>,
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("index", &self.index)
            .field("refcnt", &self.refcnt.load(Ordering::Relaxed))
            .field("action_refcnt", &self.action_refcnt.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Outcome of locating a priority slot. Only one node may occupy a priority.
enum Slot {
    Occupied { node: Arc<Proto> },
    Vacant { prev: Option<Arc<Proto>>, next: Option<Arc<Proto>> },
}

impl Chain {
    pub(crate) fn new(index: u32, block: Arc<Block>) -> Arc<Self> {
        Arc::new(Self {
            index,
            block,
            head: ArcSwapOption::empty(),
            filter_lock: Mutex::new(()),
            refcnt: AtomicU32::new(1),
            action_refcnt: AtomicU32::new(0),
            explicitly_created: AtomicBool::new(false),
            announced: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            template: Mutex::new(None),
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn block(&self) -> &Arc<Block> {
        &self.block
    }

    /// Whether every reference to this chain is an action reference.
    /// Such chains are placeholders for goto targets and stay invisible to
    /// listers.
    pub(crate) fn held_by_acts_only(&self) -> bool {
        self.refcnt.load(Ordering::Relaxed) == self.action_refcnt.load(Ordering::Relaxed)
    }

    pub(crate) fn head_snapshot(&self) -> Option<Arc<Proto>> {
        self.head.load_full()
    }

    /// Acquires a plain reference to an already-referenced chain.
    pub(crate) fn hold(this: &Arc<Self>) {
        let _state = this.block.state.lock();
        this.refcnt.fetch_add(1, Ordering::Relaxed);
    }

    /// Releases one reference of the given flavor.
    ///
    /// The last non-action reference fires the chain-removed event and clears
    /// the flushing flag; refcount zero detaches the chain from the block and
    /// drops the template through its owning kind. If that emptied a block
    /// whose own refcount already reached zero, the block dies with it.
    pub(crate) fn put(this: &Arc<Self>, by_act: bool, explicitly_created: bool) {
        let block = &this.block;
        let fire_removed;
        let destroy;
        let free_block;
        {
            let _state = block.state.lock();
            if explicitly_created && !this.explicitly_created.swap(false, Ordering::Relaxed) {
                // Someone else already dropped the explicit reference.
                return;
            }
            if by_act {
                this.action_refcnt.fetch_sub(1, Ordering::Relaxed);
            }
            let refcnt = this.refcnt.fetch_sub(1, Ordering::Relaxed) - 1;
            let non_act = refcnt - this.action_refcnt.load(Ordering::Relaxed);

            if !by_act && non_act == 0 {
                fire_removed = this.announced.swap(false, Ordering::Relaxed);
                this.flushing.store(false, Ordering::Release);
            } else {
                fire_removed = false;
            }

            destroy = refcnt == 0;
            if destroy {
                block.unlink_chain_locked(this);
                free_block =
                    block.refcnt.load(Ordering::Relaxed) == 0 && block.chains.load().is_empty();
            } else {
                free_block = false;
            }
        }

        if fire_removed {
            block.net.notify_chain_removed(block.index, this.index);
        }
        if destroy {
            debug_assert!(this.head.load().is_none());
            // Release template state while its kind handle is still alive.
            drop(this.template.lock().take());
            trace!(block = block.index, chain = this.index, "chain destroyed");
            if free_block {
                Block::destroyed(block);
            }
        }
    }

    pub(crate) fn put_explicitly_created(this: &Arc<Self>) {
        Self::put(this, false, true);
    }

    /// Finds the node occupying `prio`, or the insertion point for it.
    /// Caller holds `filter_lock`.
    fn locate_locked(&self, prio: u32) -> Slot {
        let mut prev: Option<Arc<Proto>> = None;
        let mut cur = self.head.load_full();
        while let Some(node) = cur {
            if node.prio() >= prio {
                if node.prio() == prio {
                    return Slot::Occupied { node };
                }
                return Slot::Vacant { prev, next: Some(node) };
            }
            cur = node.next_node();
            prev = Some(node);
        }
        Slot::Vacant { prev, next: None }
    }

    /// Exact-slot lookup: the node at (`protocol`, `prio`), a conflict when
    /// the slot holds a different protocol, or
    /// [`Error::FilterNotFound`] when vacant.
    pub fn find_proto(&self, protocol: Protocol, prio: u32) -> Result<ProtoHandle> {
        if prio == 0 {
            return Err(Error::Invalid("priority must be nonzero"));
        }
        let _guard = self.filter_lock.lock();
        match self.locate_locked(prio) {
            Slot::Occupied { node } => {
                if node.protocol() == protocol {
                    Ok(ProtoHandle::hold(&node))
                } else {
                    Err(Error::PrioConflict(prio, node.protocol()))
                }
            }
            Slot::Vacant { .. } => Err(Error::FilterNotFound),
        }
    }

    /// The filter insert path: returns the existing node at the slot or
    /// creates, links and returns a new one.
    ///
    /// Kind resolution and instance init happen without the chain lock (a
    /// module load may block); the insert re-validates afterwards and returns
    /// the concurrent winner when raced. A flushing chain rejects inserts
    /// with [`Error::Retry`].
    pub fn get_or_create_proto(
        self: &Arc<Self>,
        registry: &Arc<Registry>,
        kind: &str,
        protocol: Protocol,
        spec: PrioSpec,
    ) -> Result<ProtoHandle> {
        let prio = {
            let _guard = self.filter_lock.lock();
            if self.flushing.load(Ordering::Acquire) {
                return Err(Error::Retry);
            }
            match spec {
                PrioSpec::At(0) => return Err(Error::Invalid("priority must be nonzero")),
                PrioSpec::At(prio) => match self.locate_locked(prio) {
                    Slot::Occupied { node } => return Self::admit(&node, kind, protocol, prio),
                    Slot::Vacant { .. } => prio,
                },
                PrioSpec::Auto => self.auto_prio_locked()?,
            }
        };

        self.check_template_kind(kind)?;
        // Built without the chain lock; Retry from a kind load propagates.
        let created = Proto::create(registry, kind, protocol, prio, self)?;

        let _guard = self.filter_lock.lock();
        if self.flushing.load(Ordering::Acquire) {
            // `created` drops here; its deferred destroy releases the chain
            // reference it took.
            return Err(Error::Retry);
        }
        match self.locate_locked(prio) {
            // Lost the race; hand back the winner.
            Slot::Occupied { node } => Self::admit(&node, kind, protocol, prio),
            Slot::Vacant { prev, next } => {
                let node = Arc::clone(created.as_arc());
                node.next.store(next);
                // The list takes its own reference.
                node.hold_raw();
                match prev {
                    None => {
                        self.head_change_locked(Some(&node));
                        self.head.store(Some(node));
                    }
                    Some(prev) => prev.next.store(Some(node)),
                }
                trace!(
                    block = self.block.index,
                    chain = self.index,
                    kind,
                    prio = prio >> 16,
                    "proto created"
                );
                Ok(created)
            }
        }
    }

    fn admit(node: &Arc<Proto>, kind: &str, protocol: Protocol, prio: u32) -> Result<ProtoHandle> {
        if node.protocol() != protocol {
            return Err(Error::PrioConflict(prio, node.protocol()));
        }
        if node.kind_name() != kind {
            return Err(Error::KindConflict(prio, node.kind_name().to_owned()));
        }
        if node.is_deleting() {
            return Err(Error::Retry);
        }
        Ok(ProtoHandle::hold(node))
    }

    /// Allocates the next free auto priority: one below the lowest
    /// auto-allocated node, or the base value when none exists yet. Manual
    /// low priorities are ignored. Caller holds `filter_lock`.
    fn auto_prio_locked(&self) -> Result<u32> {
        let mut cur = self.head.load_full();
        while let Some(node) = cur {
            if node.prio() >= AUTO_PRIO_FLOOR {
                let prio = (node.prio() - 1) & 0xFFFF_0000;
                if prio == 0 {
                    return Err(Error::Exhausted);
                }
                return Ok(prio);
            }
            cur = node.next_node();
        }
        Ok(AUTO_PRIO_BASE)
    }

    fn check_template_kind(&self, kind: &str) -> Result<()> {
        let template = self.template.lock();
        match template.as_ref() {
            Some(t) if t.kind.kind() != kind => {
                Err(Error::Unsupported("classifier kind does not match chain template"))
            }
            _ => Ok(()),
        }
    }

    /// Unlinks a node from the list. The list's reference is released outside
    /// the lock.
    pub fn remove_proto(&self, proto: &ProtoHandle) {
        let link = {
            let _guard = self.filter_lock.lock();
            self.unlink_locked(proto.as_arc())
        };
        drop(link);
    }

    /// Unlinks the node only if its instance holds no filter entries.
    /// Returns whether the node was removed.
    pub fn delete_proto_if_empty(&self, proto: &ProtoHandle) -> bool {
        let link = {
            let _guard = self.filter_lock.lock();
            if proto.is_deleting() || !proto.is_empty() {
                return false;
            }
            match self.unlink_locked(proto.as_arc()) {
                Some(link) => link,
                None => return false,
            }
        };
        drop(link);
        true
    }

    /// Caller holds `filter_lock`. Returns the list's reference for the
    /// caller to release off-lock, or `None` when the node is not linked.
    fn unlink_locked(&self, target: &Arc<Proto>) -> Option<ProtoHandle> {
        let mut prev: Option<Arc<Proto>> = None;
        let mut cur = self.head.load_full();
        while let Some(node) = cur {
            if Arc::ptr_eq(&node, target) {
                let next = node.next_node();
                node.mark_delete();
                match prev {
                    None => {
                        self.head_change_locked(next.as_ref());
                        self.head.store(next);
                    }
                    Some(prev) => prev.next.store(next),
                }
                return Some(ProtoHandle::adopt(node));
            }
            cur = node.next_node();
            prev = Some(node);
        }
        None
    }

    /// Detaches the whole node list at once, fires a single head-change(None)
    /// and marks the chain flushing. List references are released outside the
    /// lock; the chain's own refcount is untouched.
    pub fn flush(&self) {
        let detached = {
            let _guard = self.filter_lock.lock();
            let head = self.head.swap(None);
            self.head_change_locked(None);
            self.flushing.store(true, Ordering::Release);
            head
        };

        // Next pointers stay intact so concurrent readers finish their walk.
        let mut cur = detached;
        while let Some(node) = cur {
            let next = node.next_node();
            node.mark_delete();
            drop(ProtoHandle::adopt(node));
            cur = next;
        }
    }

    /// Dump-order iteration. A `cur` node observed deleting restarts the
    /// search from its priority value, because its next pointer no longer
    /// reflects chain order.
    pub fn next_proto(&self, cur: Option<&ProtoHandle>) -> Option<ProtoHandle> {
        let _guard = self.filter_lock.lock();
        let next = match cur {
            None => self.head.load_full(),
            Some(tp) if tp.is_deleting() => {
                let mut node = self.head.load_full();
                loop {
                    match node {
                        Some(n) if n.prio() <= tp.prio() => node = n.next_node(),
                        other => break other,
                    }
                }
            }
            Some(tp) => tp.next_node(),
        };
        next.map(|node| ProtoHandle::hold(&node))
    }

    /// Renders the chain template for listing.
    pub fn template_dump(&self) -> Option<String> {
        self.template.lock().as_ref().and_then(|t| t.state.dump())
    }

    /// Fires the block's chain-0 head listeners. Caller holds `filter_lock`;
    /// the block lock nests inside it.
    pub(crate) fn head_change_locked(&self, head: Option<&Arc<Proto>>) {
        if self.index != 0 {
            return;
        }
        let state = self.block.state.lock();
        for listener in &state.chain0_listeners {
            listener.head_change(head);
        }
    }
}

/// A counted chain reference. Drop releases with the flavor it was acquired
/// with.
pub struct ChainHandle {
    chain: Arc<Chain>,
    by_act: bool,
}

impl ChainHandle {
    pub(crate) fn new(chain: Arc<Chain>, by_act: bool) -> Self {
        Self { chain, by_act }
    }

    pub fn chain(&self) -> &Arc<Chain> {
        &self.chain
    }

    /// See [`Chain::get_or_create_proto`].
    pub fn get_or_create_proto(
        &self,
        registry: &Arc<Registry>,
        kind: &str,
        protocol: Protocol,
        spec: PrioSpec,
    ) -> Result<ProtoHandle> {
        self.chain.get_or_create_proto(registry, kind, protocol, spec)
    }
}

impl Deref for ChainHandle {
    type Target = Chain;

    fn deref(&self) -> &Self::Target {
        &self.chain
    }
}

impl fmt::Debug for ChainHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.chain.fmt(f)
    }
}

impl Drop for ChainHandle {
    fn drop(&mut self) {
        Chain::put(&self.chain, self.by_act, false);
    }
}

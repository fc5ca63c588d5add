//! Namespace-scoped context: the shared-block table, the device-ingress map
//! and the indirect callback registry. Passed explicitly instead of living in
//! a process-wide singleton, so independent namespaces never observe each
//! other.

use std::{fmt, ops::Deref, sync::Arc};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{trace, warn};

use crate::{
    block::{BinderType, Block, BlockHandle, ChainHeadChange},
    error::{Error, Result},
    indirect::{IndirectCallback, IndirectRegistry},
    offload::{BlockOffloadRequest, OffloadCommand, OffloadDevice},
};

/// Observer for chain visibility transitions, standing in for the chain
/// created/removed notifications whose wire encoding is out of scope.
pub trait ChainEvents: Send + Sync {
    fn chain_created(&self, block_index: u32, chain_index: u32) {
        let _ = (block_index, chain_index);
    }
    fn chain_removed(&self, block_index: u32, chain_index: u32) {
        let _ = (block_index, chain_index);
    }
}

/// Everything needed to attach a block to an owner.
pub struct BindInfo {
    /// Identity of the attaching owner (dispatcher).
    pub owner: u64,
    pub binder: BinderType,
    /// Nonzero requests a shared block resolved through the namespace table;
    /// zero creates a private block.
    pub block_index: u32,
    /// Device carrying the attachment point, if any. Enables offload binding.
    pub device: Option<Arc<dyn OffloadDevice>>,
    /// Chain-0 head listener to register for the binding's lifetime.
    pub head_change: Option<Arc<dyn ChainHeadChange>>,
}

impl fmt::Debug for BindInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindInfo")
            .field("owner", &self.owner)
            .field("binder", &self.binder)
            .field("block_index", &self.block_index)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct NetInner {
    /// Shared blocks by index.
    blocks: FxHashMap<u32, Arc<Block>>,
    /// Ingress block currently bound per device.
    dev_ingress: FxHashMap<u64, Arc<Block>>,
    indirect: IndirectRegistry,
}

/// One network namespace's classification state.
pub struct Net {
    inner: Mutex<NetInner>,
    events: Option<Arc<dyn ChainEvents>>,
}

impl fmt::Debug for Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Net").field("blocks", &self.inner.lock().blocks.len()).finish_non_exhaustive()
    }
}

impl Net {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { inner: Mutex::new(NetInner::default()), events: None })
    }

    pub fn with_events(events: Arc<dyn ChainEvents>) -> Arc<Self> {
        Arc::new(Self { inner: Mutex::new(NetInner::default()), events: Some(events) })
    }

    /// Resolves or creates a block and attaches an owner to it.
    ///
    /// Steps run in order: owner entry, destination-retention propagation,
    /// chain-0 head listener, offload bind. A failing step unwinds the ones
    /// before it. The returned binding reverses all of it on drop.
    pub fn block_get(self: &Arc<Self>, info: BindInfo) -> Result<BlockBinding> {
        let BindInfo { owner, binder, block_index, device, head_change } = info;

        let block = if block_index != 0 {
            self.shared_block(block_index)
        } else {
            Block::new(0, Arc::clone(self))
        };

        block.owner_add(owner, binder, device.clone());
        if let Some(listener) = &head_change {
            block.head_change_cb_add(Arc::clone(listener));
        }
        if let Some(dev) = &device {
            if let Err(err) = block.offload_bind(dev, binder) {
                if let Some(listener) = &head_change {
                    block.head_change_cb_del(listener);
                }
                block.owner_del(owner, binder);
                Block::put(&block);
                return Err(err);
            }
        }

        Ok(BlockBinding { block, owner, binder, device, head_change })
    }

    /// Looks up a shared block, taking a plain reference.
    pub fn block_lookup(&self, index: u32) -> Result<BlockHandle> {
        let inner = self.inner.lock();
        let block = inner.blocks.get(&index).ok_or(Error::BlockNotFound(index))?;
        if !block.hold_unless_zero() {
            return Err(Error::BlockNotFound(index));
        }
        Ok(BlockHandle::new(Arc::clone(block)))
    }

    fn shared_block(self: &Arc<Self>, index: u32) -> Arc<Block> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.blocks.get(&index) {
            if existing.hold_unless_zero() {
                return Arc::clone(existing);
            }
            // The table entry is mid-destruction; replace it.
        }
        let block = Block::new(index, Arc::clone(self));
        inner.blocks.insert(index, Arc::clone(&block));
        trace!(block = index, "shared block inserted");
        block
    }

    pub(crate) fn remove_block(&self, block: &Arc<Block>) {
        let mut inner = self.inner.lock();
        if inner.blocks.get(&block.index).is_some_and(|b| Arc::ptr_eq(b, block)) {
            inner.blocks.remove(&block.index);
        }
    }

    /// Registers an indirect offload callback for a device. If the device
    /// already carries a bound ingress block, the callback is exercised
    /// immediately with a bind command.
    pub fn indirect_register(
        &self,
        dev: &Arc<dyn OffloadDevice>,
        ident: u64,
        cb: Arc<dyn IndirectCallback>,
    ) -> Result<()> {
        let bound = {
            let mut inner = self.inner.lock();
            if !inner.indirect.add(dev.id(), ident, Arc::clone(&cb)) {
                return Err(Error::CallbackExists);
            }
            inner.dev_ingress.get(&dev.id()).cloned()
        };

        if let Some(block) = bound {
            block.indirect_command(dev, cb.as_ref(), OffloadCommand::Bind);
        }
        Ok(())
    }

    /// Removes an indirect callback, detaching its flow callbacks from the
    /// currently bound ingress block, if any.
    pub fn indirect_unregister(&self, dev: &Arc<dyn OffloadDevice>, ident: u64) -> Result<()> {
        let (cb, bound) = {
            let mut inner = self.inner.lock();
            let Some(cb) = inner.indirect.remove(dev.id(), ident) else {
                return Err(Error::CallbackNotFound);
            };
            (cb, inner.dev_ingress.get(&dev.id()).cloned())
        };

        if let Some(block) = bound {
            block.indirect_command(dev, cb.as_ref(), OffloadCommand::Unbind);
        }
        Ok(())
    }

    /// A block was bound to the device's ingress: record it and exercise the
    /// registered indirect callbacks.
    pub(crate) fn bind_ingress(&self, dev: &Arc<dyn OffloadDevice>, block: &Arc<Block>) {
        let cbs = {
            let mut inner = self.inner.lock();
            inner.dev_ingress.insert(dev.id(), Arc::clone(block));
            inner.indirect.snapshot(dev.id())
        };
        for cb in cbs {
            block.indirect_command(dev, cb.as_ref(), OffloadCommand::Bind);
        }
    }

    /// Inverse of [`Net::bind_ingress`]; indirect callbacks are notified
    /// before the mapping is dropped.
    pub(crate) fn unbind_ingress(&self, dev: &Arc<dyn OffloadDevice>, block: &Arc<Block>) {
        let cbs = {
            let inner = self.inner.lock();
            inner.indirect.snapshot(dev.id())
        };
        for cb in cbs {
            block.indirect_command(dev, cb.as_ref(), OffloadCommand::Unbind);
        }
        let mut inner = self.inner.lock();
        if inner.dev_ingress.get(&dev.id()).is_some_and(|b| Arc::ptr_eq(b, block)) {
            inner.dev_ingress.remove(&dev.id());
        }
    }

    pub(crate) fn notify_chain_created(&self, block_index: u32, chain_index: u32) {
        if let Some(events) = &self.events {
            events.chain_created(block_index, chain_index);
        }
    }

    pub(crate) fn notify_chain_removed(&self, block_index: u32, chain_index: u32) {
        if let Some(events) = &self.events {
            events.chain_removed(block_index, chain_index);
        }
    }
}

impl Block {
    /// Runs one indirect callback against this block, binding or unbinding
    /// the flow callbacks it produces.
    pub(crate) fn indirect_command(
        self: &Arc<Self>,
        dev: &Arc<dyn OffloadDevice>,
        cb: &dyn IndirectCallback,
        command: OffloadCommand,
    ) {
        let mut req = BlockOffloadRequest::new(command, BinderType::ClsactIngress);
        cb.setup(dev, self, &mut req);
        match command {
            OffloadCommand::Bind => {
                if let Err(err) = self.bind_callbacks(req.callbacks) {
                    warn!(block = self.index, dev = dev.id(), %err, "indirect bind rejected");
                }
            }
            OffloadCommand::Unbind => self.unbind_callbacks(req.callbacks),
        }
    }
}

/// RAII result of [`Net::block_get`]: undoes the listener registration, the
/// owner entry, the offload bind and the block reference, in that order.
pub struct BlockBinding {
    block: Arc<Block>,
    owner: u64,
    binder: BinderType,
    device: Option<Arc<dyn OffloadDevice>>,
    head_change: Option<Arc<dyn ChainHeadChange>>,
}

impl BlockBinding {
    pub fn block(&self) -> &Arc<Block> {
        &self.block
    }
}

impl Deref for BlockBinding {
    type Target = Block;

    fn deref(&self) -> &Self::Target {
        &self.block
    }
}

impl fmt::Debug for BlockBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockBinding")
            .field("block", &self.block.index())
            .field("owner", &self.owner)
            .field("binder", &self.binder)
            .finish_non_exhaustive()
    }
}

impl Drop for BlockBinding {
    fn drop(&mut self) {
        if let Some(listener) = self.head_change.take() {
            self.block.head_change_cb_del(&listener);
        }
        self.block.owner_del(self.owner, self.binder);
        if let Some(dev) = self.device.take() {
            self.block.offload_unbind(&dev, self.binder);
        }
        Block::put(&self.block);
    }
}

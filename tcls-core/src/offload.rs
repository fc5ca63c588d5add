//! Hardware offload binding and rule playback.

use std::{fmt, sync::Arc};

use tracing::{debug, trace, warn};

use crate::{
    block::{BinderType, Block},
    error::{Error, Result},
};

/// Direction of a block offload setup request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffloadCommand {
    Bind,
    Unbind,
}

/// A flow-rule programming callback supplied by an offload backend.
///
/// One callback per hardware pipeline; classifier instances replay their
/// rules through it during [`Block::playback_offloads`].
pub trait FlowCallback: Send + Sync {
    /// Programs (`add`) or removes one rule, identified by the owning kind
    /// and the rule handle.
    fn setup(&self, add: bool, kind: &'static str, handle: u32) -> Result<()>;
}

/// Carries one bind or unbind exchange with a device or indirect backend.
/// The callee appends its flow callbacks; the block then plays existing
/// rules back through them (bind) or tears them down (unbind).
pub struct BlockOffloadRequest {
    pub command: OffloadCommand,
    pub binder: BinderType,
    pub callbacks: Vec<Arc<dyn FlowCallback>>,
}

impl BlockOffloadRequest {
    pub fn new(command: OffloadCommand, binder: BinderType) -> Self {
        Self { command, binder, callbacks: Vec::new() }
    }
}

impl fmt::Debug for BlockOffloadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockOffloadRequest")
            .field("command", &self.command)
            .field("binder", &self.binder)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

/// A network device participating in block binding.
pub trait OffloadDevice: Send + Sync + fmt::Debug {
    /// Stable identity used for owner bookkeeping and the indirect registry.
    fn id(&self) -> u64;

    /// Whether hardware offload is currently enabled on this device.
    fn offload_enabled(&self) -> bool;

    /// Installs or removes the block's offload callbacks on the device.
    /// [`Error::Unsupported`] selects the software-fallback path.
    fn setup_block(&self, req: &mut BlockOffloadRequest) -> Result<()>;

    /// Invoked when a bound block requires destination retention.
    fn keep_dst(&self) {}
}

fn same_cb(a: &Arc<dyn FlowCallback>, b: &Arc<dyn FlowCallback>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast())
}

impl Block {
    /// Filters currently programmed into hardware.
    pub fn offload_in_use(&self) -> bool {
        self.offloadcnt.load(std::sync::atomic::Ordering::Relaxed) > 0
    }

    /// Called by classifier kinds when a rule lands in hardware.
    pub fn offload_inc(&self) {
        self.offloadcnt.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn offload_dec(&self) {
        self.offloadcnt.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
    }

    /// Owners bound without hardware offload support.
    pub fn no_offload_dev_count(&self) -> u32 {
        self.nooffloaddevcnt.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Flow callbacks currently bound to this block.
    pub fn offload_cb_count(&self) -> usize {
        self.offload.lock().cbs.len()
    }

    /// Attempts hardware offload setup for a newly bound device.
    ///
    /// A device that cannot offload falls back to the no-offload counter.
    /// If the block already has offloaded rules the bind is rejected instead:
    /// once offload is in use, every owner must offload.
    pub(crate) fn offload_bind(
        self: &Arc<Self>,
        dev: &Arc<dyn OffloadDevice>,
        binder: BinderType,
    ) -> Result<()> {
        if !dev.offload_enabled() && self.offload_in_use() {
            return Err(Error::Unsupported(
                "device has offload disabled while block has offloaded rules",
            ));
        }

        let mut req = BlockOffloadRequest::new(OffloadCommand::Bind, binder);
        let setup = if dev.offload_enabled() {
            dev.setup_block(&mut req)
        } else {
            Err(Error::Unsupported("offload disabled"))
        };

        match setup {
            Ok(()) => {
                if let Err(err) = self.bind_callbacks(req.callbacks) {
                    // Compensate the device-side bind before reporting.
                    let mut undo = BlockOffloadRequest::new(OffloadCommand::Unbind, binder);
                    let _ = dev.setup_block(&mut undo);
                    return Err(err);
                }
            }
            Err(Error::Unsupported(_)) => {
                if self.offload_in_use() {
                    return Err(Error::Unsupported(
                        "block requires offload support from every bound device",
                    ));
                }
                self.nooffloaddevcnt.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                trace!(block = self.index, dev = dev.id(), "device bound without offload support");
            }
            Err(err) => return Err(err),
        }

        if binder == BinderType::ClsactIngress {
            self.net.bind_ingress(dev, self);
        }
        Ok(())
    }

    /// Inverse of [`Block::offload_bind`]. Indirect backends are notified
    /// before the device teardown.
    pub(crate) fn offload_unbind(self: &Arc<Self>, dev: &Arc<dyn OffloadDevice>, binder: BinderType) {
        if binder == BinderType::ClsactIngress {
            self.net.unbind_ingress(dev, self);
        }

        let mut req = BlockOffloadRequest::new(OffloadCommand::Unbind, binder);
        let teardown = if dev.offload_enabled() {
            dev.setup_block(&mut req)
        } else {
            Err(Error::Unsupported("offload disabled"))
        };

        match teardown {
            Ok(()) => self.unbind_callbacks(req.callbacks),
            Err(Error::Unsupported(_)) => {
                self.nooffloaddevcnt.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
            }
            Err(err) => debug!(block = self.index, dev = dev.id(), %err, "offload teardown failed"),
        }
    }

    /// Binds new flow callbacks, replaying every existing rule through each.
    /// On failure the callbacks bound so far are compensated with a
    /// remove-mode replay before the error is returned.
    pub(crate) fn bind_callbacks(self: &Arc<Self>, cbs: Vec<Arc<dyn FlowCallback>>) -> Result<()> {
        let offload_in_use = self.offload_in_use();
        let mut bound: Vec<Arc<dyn FlowCallback>> = Vec::with_capacity(cbs.len());

        for cb in cbs {
            if self.offload.lock().cbs.iter().any(|c| same_cb(c, &cb)) {
                return Err(Error::Busy("flow callback already bound to this block"));
            }
            if let Err(err) = self.playback_offloads(&cb, true, offload_in_use) {
                for prev in &bound {
                    let _ = self.playback_offloads(prev, false, offload_in_use);
                }
                self.offload
                    .lock()
                    .cbs
                    .retain(|c| !bound.iter().any(|b| same_cb(b, c)));
                return Err(err);
            }
            self.offload.lock().cbs.push(Arc::clone(&cb));
            bound.push(cb);
        }
        Ok(())
    }

    /// Removes flow callbacks, tearing their rules down with a remove-mode
    /// replay. Callbacks not bound to this block are ignored.
    pub(crate) fn unbind_callbacks(self: &Arc<Self>, cbs: Vec<Arc<dyn FlowCallback>>) {
        let offload_in_use = self.offload_in_use();
        for cb in cbs {
            let found = {
                let mut offload = self.offload.lock();
                match offload.cbs.iter().position(|c| same_cb(c, &cb)) {
                    Some(pos) => {
                        offload.cbs.remove(pos);
                        true
                    }
                    None => false,
                }
            };
            if found {
                let _ = self.playback_offloads(&cb, false, offload_in_use);
            }
        }
    }

    /// Walks every chain and node of the block, replaying hardware rules
    /// through `cb`.
    ///
    /// Nodes of kinds without re-offload support fail an add-pass when
    /// offload is in use. A failed add-pass is compensated by replaying the
    /// same walk in remove mode before returning the error; remove-pass
    /// errors are ignored.
    pub fn playback_offloads(
        self: &Arc<Self>,
        cb: &Arc<dyn FlowCallback>,
        add: bool,
        offload_in_use: bool,
    ) -> Result<()> {
        let mut chain = self.next_chain_any(None);
        while let Some(c) = chain {
            let mut proto = c.next_proto(None);
            while let Some(tp) = proto {
                if tp.can_reoffload() {
                    if let Err(err) = tp.reoffload(add, cb.as_ref()) {
                        if add {
                            let _ = self.playback_offloads(cb, false, offload_in_use);
                            return Err(err);
                        }
                        warn!(block = self.index, %err, "offload rule removal failed");
                    }
                } else if add && offload_in_use {
                    let _ = self.playback_offloads(cb, false, offload_in_use);
                    return Err(Error::Unsupported(
                        "classifier kind without re-offload support",
                    ));
                }
                proto = c.next_proto(Some(&tp));
            }
            chain = self.next_chain_any(Some(&c));
        }
        Ok(())
    }
}

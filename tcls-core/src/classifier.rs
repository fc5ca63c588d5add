//! The polymorphic seam between the engine and concrete classifier kinds.
//!
//! A [`Classifier`] is a named match algorithm ("kind") registered with the
//! [`Registry`](crate::Registry). Each configured filter node ("proto") owns
//! one [`ClassifierInstance`] created by its kind, holding the kind-specific
//! match state opaquely. The engine never inspects that state; it only drives
//! the operations below.

use std::fmt;

use bytes::Bytes;

use crate::{
    classify::{ClassResult, Packet},
    error::{Error, Result},
    offload::FlowCallback,
};

/// Outcome of matching one packet against one classifier instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No match; continue with the next node in priority order.
    Continue,
    /// Restart the walk from the original head. Counted against the loop
    /// budget.
    Reclassify,
    /// Jump to the head of the chain with this index. Counted against the
    /// loop budget.
    GotoChain(u32),
    /// Final disposition; the walk ends with this action code.
    Terminal(u32),
}

/// Flow control for [`ClassifierInstance::walk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    /// Keep visiting entries.
    Continue,
    /// End the walk early.
    Stop,
}

/// A named classifier implementation.
///
/// Registered once as `Arc<dyn Classifier>`; the `Arc` strong count doubles as
/// the in-use count that keeps the kind's code reachable while instances or
/// templates still reference it.
pub trait Classifier: Send + Sync + fmt::Debug {
    /// The kind name filters refer to this classifier by.
    fn kind(&self) -> &'static str;

    /// Creates the per-proto match state.
    fn init(&self) -> Result<Box<dyn ClassifierInstance>>;

    /// Creates chain template state restricting what this chain may hold.
    fn template_create(&self, config: &Bytes) -> Result<Box<dyn TemplateState>> {
        let _ = config;
        Err(Error::Unsupported("classifier kind has no chain templates"))
    }

    /// Whether instances tolerate concurrent mutation without the chain lock.
    fn unlocked(&self) -> bool {
        false
    }
}

/// Per-proto state owned by a classifier kind.
///
/// `classify` runs on the data path concurrently with every other operation,
/// including `destroy`: a node is unlinked before its deferred destruction
/// runs, so no new walk can discover it, but an in-flight walk may still call
/// `classify` afterwards. Implementations must keep `classify` safe (return
/// [`Verdict::Continue`]) once destroyed.
pub trait ClassifierInstance: Send + Sync + fmt::Debug {
    /// Matches one packet, filling `res` when returning a terminal verdict.
    fn classify(&self, packet: &Packet, res: &mut ClassResult) -> Verdict;

    /// Inserts or updates the filter entry at `handle`. `template` is the
    /// owning chain's template state, if any.
    fn change(&self, handle: u32, config: Bytes, template: Option<&dyn TemplateState>)
        -> Result<()>;

    /// Removes the entry at `handle`. Returns `true` when the instance is now
    /// empty.
    fn delete(&self, handle: u32) -> Result<bool>;

    /// Whether an entry exists at `handle`.
    fn get(&self, handle: u32) -> bool;

    /// Visits every entry. Returns `false` when the kind does not support
    /// walking; an instance without walk support counts as empty.
    fn walk(&self, visit: &mut dyn FnMut(u32) -> WalkControl) -> bool {
        let _ = visit;
        false
    }

    /// Renders one entry for listing.
    fn dump(&self, handle: u32) -> Option<String> {
        let _ = handle;
        None
    }

    /// Whether this kind can replay its hardware rules through a new callback.
    fn can_reoffload(&self) -> bool {
        false
    }

    /// Replays every hardware rule of this instance through `cb`, programming
    /// (`add`) or removing them. Only called when [`can_reoffload`] is true.
    ///
    /// [`can_reoffload`]: ClassifierInstance::can_reoffload
    fn reoffload(&self, add: bool, cb: &dyn FlowCallback) -> Result<()> {
        let _ = (add, cb);
        Ok(())
    }

    /// Releases kind-owned state. Runs once, on the destroy worker, after the
    /// node was unlinked from its chain.
    fn destroy(&self) {}
}

/// Opaque chain template state, created and interpreted by its owning kind.
///
/// Dropped through the owning kind's code when the chain is destroyed, which
/// is why the chain keeps the kind handle alive alongside it.
pub trait TemplateState: Send + Sync + fmt::Debug {
    /// Renders the template for listing.
    fn dump(&self) -> Option<String> {
        None
    }
}

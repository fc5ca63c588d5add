//! The classifier kind registry.

use std::{fmt, ops::Deref, sync::Arc};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::debug;

use tcls_common::WorkQueue;

use crate::{
    classifier::Classifier,
    error::{Error, Result},
};

/// Loads classifier kinds on demand.
///
/// `load` may block for an unbounded time (it models module loading), so the
/// registry only invokes it from [`Registry::lookup_or_load`], which callers
/// must use without holding any coarse lock.
pub trait KindLoader: Send + Sync {
    /// Attempts to make `name` available, returning once loading finished.
    /// Success is observed through a subsequent lookup, not a return value.
    fn load(&self, name: &str);
}

/// A counted reference to a registered classifier kind.
///
/// Holding (or cloning) a handle keeps the kind's code reachable even if it
/// is unregistered concurrently.
#[derive(Clone)]
pub struct KindHandle {
    kind: Arc<dyn Classifier>,
}

impl Deref for KindHandle {
    type Target = dyn Classifier;

    fn deref(&self) -> &Self::Target {
        self.kind.as_ref()
    }
}

impl fmt::Debug for KindHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KindHandle").field("kind", &self.kind.kind()).finish()
    }
}

/// Maps classifier kind names to their implementations.
///
/// Read-mostly: many concurrent lookups, rare register/unregister. Also owns
/// the worker that runs deferred proto destruction, so that kind-owned state
/// is never torn down under a chain lock and so [`Registry::unregister`] can
/// wait for in-flight destructors before forgetting a kind.
pub struct Registry {
    kinds: RwLock<FxHashMap<&'static str, Arc<dyn Classifier>>>,
    loader: Option<Box<dyn KindLoader>>,
    destroyers: WorkQueue,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("kinds", &self.kinds.read().len()).finish_non_exhaustive()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            kinds: RwLock::new(FxHashMap::default()),
            loader: None,
            destroyers: WorkQueue::new("tcls-destroy"),
        }
    }

    pub fn with_loader(loader: impl KindLoader + 'static) -> Self {
        Self { loader: Some(Box::new(loader)), ..Self::new() }
    }

    /// Registers a classifier kind under its name.
    pub fn register(&self, kind: Arc<dyn Classifier>) -> Result<()> {
        let name = kind.kind();
        let mut kinds = self.kinds.write();
        if kinds.contains_key(name) {
            return Err(Error::DuplicateKind(name.to_owned()));
        }
        kinds.insert(name, kind);
        debug!(kind = name, "classifier kind registered");
        Ok(())
    }

    /// Looks up a kind by name. Never triggers loading.
    pub fn lookup(&self, name: &str) -> Result<KindHandle> {
        self.kinds
            .read()
            .get(name)
            .map(|kind| KindHandle { kind: Arc::clone(kind) })
            .ok_or_else(|| Error::KindNotFound(name.to_owned()))
    }

    /// Looks up a kind, invoking the loader on a miss.
    ///
    /// A successful load is reported as [`Error::Retry`]: loading may have
    /// blocked for a long time, so the caller replays the whole operation
    /// under fresh serialization instead of continuing on stale state.
    pub fn lookup_or_load(&self, name: &str) -> Result<KindHandle> {
        match self.lookup(name) {
            Ok(kind) => Ok(kind),
            Err(_) => {
                let Some(loader) = &self.loader else {
                    return Err(Error::KindNotFound(name.to_owned()));
                };
                loader.load(name);
                self.lookup(name).and(Err(Error::Retry))
            }
        }
    }

    /// Removes a kind. Best effort: pending deferred destructors are awaited,
    /// then the kind is removed unconditionally; outstanding handles keep the
    /// kind's code alive on their own.
    pub fn unregister(&self, name: &str) -> Result<()> {
        // Pending destroy jobs may still call into the kind.
        self.destroyers.flush();
        match self.kinds.write().remove(name) {
            Some(_) => {
                debug!(kind = name, "classifier kind unregistered");
                Ok(())
            }
            None => Err(Error::KindNotFound(name.to_owned())),
        }
    }

    /// Whether the kind is safe for lock-free concurrent mutation.
    pub fn is_unlocked(&self, name: &str) -> bool {
        self.kinds.read().get(name).map(|kind| kind.unlocked()).unwrap_or(false)
    }

    /// Blocks until every destructor deferred so far has completed.
    pub fn flush_destroyers(&self) {
        self.destroyers.flush();
    }

    pub(crate) fn defer_destroy<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.destroyers.defer(f);
    }
}

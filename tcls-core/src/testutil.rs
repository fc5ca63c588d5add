//! Shared doubles for the unit tests: a scriptable classifier kind, a flow
//! callback that counts replays, an offload device and recording listeners.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    block::ChainHeadChange,
    classifier::{Classifier, ClassifierInstance, TemplateState, Verdict, WalkControl},
    classify::{ClassResult, Packet},
    error::{Error, Result},
    net::ChainEvents,
    offload::{BlockOffloadRequest, FlowCallback, OffloadDevice},
    proto::Proto,
};

pub(crate) type ClassifyFn = dyn Fn(&Packet, &mut ClassResult) -> Verdict + Send + Sync;

pub(crate) struct TestKind {
    name: &'static str,
    templates: bool,
    reoffload: bool,
    fail_reoffload: bool,
    walkable: bool,
    classify: Option<Arc<ClassifyFn>>,
    pub(crate) destroyed: Arc<AtomicUsize>,
}

impl std::fmt::Debug for TestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestKind").field("name", &self.name).finish_non_exhaustive()
    }
}

impl TestKind {
    fn build(name: &'static str) -> Self {
        Self {
            name,
            templates: false,
            reoffload: false,
            fail_reoffload: false,
            walkable: true,
            classify: None,
            destroyed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self::build(name))
    }

    pub(crate) fn new_static(name: &str) -> Arc<Self> {
        Self::new(Box::leak(name.to_owned().into_boxed_str()))
    }

    pub(crate) fn scripted(
        name: &'static str,
        f: impl Fn(&Packet, &mut ClassResult) -> Verdict + Send + Sync + 'static,
    ) -> Arc<Self> {
        let mut kind = Self::build(name);
        kind.classify = Some(Arc::new(f));
        Arc::new(kind)
    }

    pub(crate) fn with_templates(name: &'static str) -> Arc<Self> {
        let mut kind = Self::build(name);
        kind.templates = true;
        Arc::new(kind)
    }

    pub(crate) fn with_reoffload(name: &'static str) -> Arc<Self> {
        let mut kind = Self::build(name);
        kind.reoffload = true;
        Arc::new(kind)
    }

    pub(crate) fn failing_reoffload(name: &'static str) -> Arc<Self> {
        let mut kind = Self::build(name);
        kind.reoffload = true;
        kind.fail_reoffload = true;
        Arc::new(kind)
    }

    pub(crate) fn without_walk(name: &'static str) -> Arc<Self> {
        let mut kind = Self::build(name);
        kind.walkable = false;
        Arc::new(kind)
    }
}

impl Classifier for TestKind {
    fn kind(&self) -> &'static str {
        self.name
    }

    fn init(&self) -> Result<Box<dyn ClassifierInstance>> {
        Ok(Box::new(TestInstance {
            kind: self.name,
            entries: Mutex::new(BTreeSet::new()),
            classify: self.classify.clone(),
            reoffload: self.reoffload,
            fail_reoffload: self.fail_reoffload,
            walkable: self.walkable,
            destroyed: AtomicBool::new(false),
            destroy_counter: Arc::clone(&self.destroyed),
        }))
    }

    fn template_create(&self, config: &Bytes) -> Result<Box<dyn TemplateState>> {
        if !self.templates {
            return Err(Error::Unsupported("classifier kind has no chain templates"));
        }
        Ok(Box::new(TestTemplate { config: config.clone() }))
    }
}

#[derive(Debug)]
pub(crate) struct TestTemplate {
    config: Bytes,
}

impl TemplateState for TestTemplate {
    fn dump(&self) -> Option<String> {
        Some(format!("template:{}B", self.config.len()))
    }
}

pub(crate) struct TestInstance {
    kind: &'static str,
    entries: Mutex<BTreeSet<u32>>,
    classify: Option<Arc<ClassifyFn>>,
    reoffload: bool,
    fail_reoffload: bool,
    walkable: bool,
    destroyed: AtomicBool,
    destroy_counter: Arc<AtomicUsize>,
}

impl std::fmt::Debug for TestInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestInstance").field("kind", &self.kind).finish_non_exhaustive()
    }
}

impl ClassifierInstance for TestInstance {
    fn classify(&self, packet: &Packet, res: &mut ClassResult) -> Verdict {
        if self.destroyed.load(Ordering::Relaxed) {
            return Verdict::Continue;
        }
        match &self.classify {
            Some(f) => f(packet, res),
            None => Verdict::Continue,
        }
    }

    fn change(&self, handle: u32, _config: Bytes, _template: Option<&dyn TemplateState>) -> Result<()> {
        self.entries.lock().insert(handle);
        Ok(())
    }

    fn delete(&self, handle: u32) -> Result<bool> {
        let mut entries = self.entries.lock();
        if !entries.remove(&handle) {
            return Err(Error::FilterNotFound);
        }
        Ok(entries.is_empty())
    }

    fn get(&self, handle: u32) -> bool {
        self.entries.lock().contains(&handle)
    }

    fn walk(&self, visit: &mut dyn FnMut(u32) -> WalkControl) -> bool {
        if !self.walkable {
            return false;
        }
        for handle in self.entries.lock().iter() {
            if visit(*handle) == WalkControl::Stop {
                break;
            }
        }
        true
    }

    fn dump(&self, handle: u32) -> Option<String> {
        self.get(handle).then(|| format!("{}#{handle}", self.kind))
    }

    fn can_reoffload(&self) -> bool {
        self.reoffload
    }

    fn reoffload(&self, add: bool, cb: &dyn FlowCallback) -> Result<()> {
        if add && self.fail_reoffload {
            return Err(Error::Unsupported("hardware rejected the rule"));
        }
        for handle in self.entries.lock().iter() {
            cb.setup(add, self.kind, *handle)?;
        }
        Ok(())
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::Relaxed);
        self.destroy_counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// Counts rule programming calls per direction.
#[derive(Default)]
pub(crate) struct CountingCb {
    pub(crate) adds: AtomicUsize,
    pub(crate) removes: AtomicUsize,
}

impl FlowCallback for CountingCb {
    fn setup(&self, add: bool, _kind: &'static str, _handle: u32) -> Result<()> {
        if add {
            self.adds.fetch_add(1, Ordering::SeqCst);
        } else {
            self.removes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// An offload device handing out a fixed set of flow callbacks.
pub(crate) struct TestDevice {
    pub(crate) id: u64,
    pub(crate) enabled: AtomicBool,
    pub(crate) cbs: Mutex<Vec<Arc<dyn FlowCallback>>>,
    pub(crate) keep_dst_calls: AtomicUsize,
}

impl std::fmt::Debug for TestDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestDevice").field("id", &self.id).finish_non_exhaustive()
    }
}

impl TestDevice {
    pub(crate) fn new(id: u64, enabled: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            enabled: AtomicBool::new(enabled),
            cbs: Mutex::new(Vec::new()),
            keep_dst_calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn with_cb(id: u64, cb: Arc<dyn FlowCallback>) -> Arc<Self> {
        let dev = Self::new(id, true);
        dev.cbs.lock().push(cb);
        dev
    }
}

impl OffloadDevice for TestDevice {
    fn id(&self) -> u64 {
        self.id
    }

    fn offload_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn setup_block(&self, req: &mut BlockOffloadRequest) -> Result<()> {
        req.callbacks.extend(self.cbs.lock().iter().cloned());
        Ok(())
    }

    fn keep_dst(&self) {
        self.keep_dst_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records chain visibility transitions.
#[derive(Default)]
pub(crate) struct RecordingEvents {
    pub(crate) created: Mutex<Vec<(u32, u32)>>,
    pub(crate) removed: Mutex<Vec<(u32, u32)>>,
}

impl ChainEvents for RecordingEvents {
    fn chain_created(&self, block_index: u32, chain_index: u32) {
        self.created.lock().push((block_index, chain_index));
    }

    fn chain_removed(&self, block_index: u32, chain_index: u32) {
        self.removed.lock().push((block_index, chain_index));
    }
}

/// Records chain-0 head transitions as the priorities of the new heads.
#[derive(Default)]
pub(crate) struct RecordingHeads {
    pub(crate) heads: Mutex<Vec<Option<u32>>>,
}

impl ChainHeadChange for RecordingHeads {
    fn head_change(&self, head: Option<&Arc<Proto>>) {
        self.heads.lock().push(head.map(|p| p.prio()));
    }
}

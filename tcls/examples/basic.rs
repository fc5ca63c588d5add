use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use tcls::{
    classify, BindInfo, BinderType, ChainHeadChange, ClassResult, Classifier, ClassifierInstance,
    Net, Packet, PrioSpec, Proto, Protocol, Registry, Result, TemplateState, Verdict, ACT_OK,
};

/// A classifier that matches every packet once configured, steering it to the
/// classid given as the filter handle.
#[derive(Debug)]
struct Matchall;

impl Classifier for Matchall {
    fn kind(&self) -> &'static str {
        "matchall"
    }

    fn init(&self) -> Result<Box<dyn ClassifierInstance>> {
        Ok(Box::new(MatchallState { classid: Mutex::new(None) }))
    }
}

#[derive(Debug)]
struct MatchallState {
    classid: Mutex<Option<u32>>,
}

impl ClassifierInstance for MatchallState {
    fn classify(&self, _packet: &Packet, res: &mut ClassResult) -> Verdict {
        match *self.classid.lock() {
            Some(classid) => {
                res.classid = classid;
                Verdict::Terminal(ACT_OK)
            }
            None => Verdict::Continue,
        }
    }

    fn change(&self, handle: u32, _config: Bytes, _template: Option<&dyn TemplateState>) -> Result<()> {
        *self.classid.lock() = Some(handle);
        Ok(())
    }

    fn delete(&self, _handle: u32) -> Result<bool> {
        Ok(self.classid.lock().take().is_none())
    }

    fn get(&self, handle: u32) -> bool {
        *self.classid.lock() == Some(handle)
    }
}

/// Caches the chain-0 head the way a dispatch point would.
#[derive(Default)]
struct HeadCache(Mutex<Option<Arc<Proto>>>);

impl ChainHeadChange for HeadCache {
    fn head_change(&self, head: Option<&Arc<Proto>>) {
        *self.0.lock() = head.cloned();
    }
}

fn main() {
    let _ = tracing_subscriber::fmt::try_init();

    let registry = Arc::new(Registry::new());
    registry.register(Arc::new(Matchall)).unwrap();

    // Attach a private block and keep a cached head for the fast path.
    let cache = Arc::new(HeadCache::default());
    let net = Net::new();
    let binding = net
        .block_get(BindInfo {
            owner: 1,
            binder: BinderType::Scheduler,
            block_index: 0,
            device: None,
            head_change: Some(Arc::clone(&cache) as Arc<dyn ChainHeadChange>),
        })
        .unwrap();

    // One matchall filter on chain 0, steering IPv4 traffic to class 0x10.
    let chain = binding.block().chain_get(0, true).unwrap();
    let node = chain
        .get_or_create_proto(&registry, "matchall", Protocol::IPV4, PrioSpec::Auto)
        .unwrap();
    node.change(0x10, Bytes::new()).unwrap();

    let mut packet = Packet::new(Protocol::IPV4, Bytes::from_static(b"payload"));
    let mut res = ClassResult::default();
    let head = cache.0.lock().clone();
    let verdict = classify(Some(binding.block()), head.as_ref(), &mut packet, &mut res, false);

    println!("verdict: {verdict:?}, classid {:#x}", res.classid);
}

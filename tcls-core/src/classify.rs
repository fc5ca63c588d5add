//! The data-path classification walk.
//!
//! [`classify`] takes no locks: the chain head and the next pointers are
//! `arc-swap` loads, and chain lookup reads a copy-on-write snapshot, so the
//! walk is safe inside non-blocking packet processing contexts.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tracing::warn;

use tcls_common::RateLimit;

use crate::{block::Block, classifier::Verdict, proto::Proto};

/// Accept the packet.
pub const ACT_OK: u32 = 0;
/// Terminal form of [`Verdict::Reclassify`], returned in compat mode.
pub const ACT_RECLASSIFY: u32 = 1;
/// Drop the packet.
pub const ACT_SHOT: u32 = 2;

/// Jumps and reclassifies allowed per packet before it is dropped.
const MAX_RECLASSIFY_LOOP: u32 = 4;

static LOOP_WARN: RateLimit = RateLimit::new(Duration::from_secs(1));
static GOTO_WARN: RateLimit = RateLimit::new(Duration::from_secs(1));

/// An ethertype-style protocol tag on packets and filter nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Protocol(pub u16);

impl Protocol {
    /// Wildcard: a node with this protocol matches every packet.
    pub const ALL: Self = Self(0x0003);
    pub const IPV4: Self = Self(0x0800);
    pub const IPV6: Self = Self(0x86DD);

    /// Whether a node tagged `self` applies to a packet tagged `packet`.
    pub fn matches(&self, packet: Self) -> bool {
        *self == Self::ALL || *self == packet
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// One packet on the classification path.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Protocol tag used for node skipping.
    pub protocol: Protocol,
    /// Opaque payload handed to classifier instances.
    pub data: Bytes,
    /// Chain restart marker left by an earlier partial classification.
    /// Consumed at the start of the walk and updated on every chain jump.
    pub chain_ext: Option<u32>,
}

impl Packet {
    pub fn new(protocol: Protocol, data: Bytes) -> Self {
        Self { protocol, data, chain_ext: None }
    }
}

/// Result holder filled by the matching classifier instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassResult {
    /// Opaque class cookie set by the matching filter.
    pub class: u64,
    /// The class identifier the packet was steered to.
    pub classid: u32,
}

/// Classifies one packet, walking the node list in priority order.
///
/// `head` is the cached head of the starting chain, typically obtained through
/// a chain-0 head-change listener. `block` enables chain jumps and the
/// `chain_ext` fast path; without it a `GotoChain` verdict drops the packet.
///
/// Returns `Some(action)` for a terminal disposition or `None` when the list
/// is exhausted without a match ("continue lookup unspecified"). In
/// `compat_mode` a [`Verdict::Reclassify`] is itself terminal, returned as
/// [`ACT_RECLASSIFY`].
pub fn classify(
    block: Option<&Arc<Block>>,
    head: Option<&Arc<Proto>>,
    packet: &mut Packet,
    res: &mut ClassResult,
    compat_mode: bool,
) -> Option<u32> {
    let mut first = head.cloned();

    // A restart marker from an earlier pass resolves the start chain
    // directly. A stale marker falls back to the normal walk.
    if !compat_mode {
        if let (Some(block), Some(index)) = (block, packet.chain_ext.take()) {
            if let Some(chain) = block.lookup_chain(index) {
                first = chain.head_snapshot();
            }
        }
    }

    let mut limit = 0u32;
    let mut tp = first.clone();
    loop {
        let Some(node) = tp else { return None };

        if !node.protocol().matches(packet.protocol) {
            tp = node.next_node();
            continue;
        }

        match node.classify(packet, res) {
            Verdict::Continue => tp = node.next_node(),
            Verdict::Terminal(code) => return Some(code),
            Verdict::Reclassify if compat_mode => return Some(ACT_RECLASSIFY),
            Verdict::Reclassify => {
                limit += 1;
                if limit >= MAX_RECLASSIFY_LOOP {
                    return Some(loop_overrun(block, &node, packet));
                }
                tp = first.clone();
            }
            Verdict::GotoChain(index) => {
                limit += 1;
                if limit >= MAX_RECLASSIFY_LOOP {
                    return Some(loop_overrun(block, &node, packet));
                }
                let Some(chain) = block.and_then(|b| b.lookup_chain(index)) else {
                    if GOTO_WARN.allow() {
                        warn!(
                            chain = index,
                            protocol = %packet.protocol,
                            "goto target chain does not exist, dropping packet"
                        );
                    }
                    return Some(ACT_SHOT);
                };
                packet.chain_ext = Some(index);
                first = chain.head_snapshot();
                tp = first.clone();
            }
        }
    }
}

#[cold]
fn loop_overrun(block: Option<&Arc<Block>>, node: &Arc<Proto>, packet: &Packet) -> u32 {
    if LOOP_WARN.allow() {
        warn!(
            block = block.map(|b| b.index()),
            prio = node.prio() >> 16,
            protocol = %packet.protocol,
            "classification loop budget exceeded, dropping packet"
        );
    }
    ACT_SHOT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block::BinderType,
        chain::PrioSpec,
        classifier::Verdict,
        error::Result,
        net::{BindInfo, BlockBinding, Net},
        registry::Registry,
        testutil::TestKind,
    };

    fn bind(net: &Arc<Net>) -> BlockBinding {
        net.block_get(BindInfo {
            owner: 1,
            binder: BinderType::Scheduler,
            block_index: 1,
            device: None,
            head_change: None,
        })
        .unwrap()
    }

    fn registry() -> Arc<Registry> {
        let registry = Arc::new(Registry::new());
        registry.register(TestKind::new("pass")).unwrap();
        registry
            .register(TestKind::scripted("accept", |_, res| {
                res.classid = 5;
                Verdict::Terminal(ACT_OK)
            }))
            .unwrap();
        registry.register(TestKind::scripted("drop", |_, _| Verdict::Terminal(ACT_SHOT))).unwrap();
        registry.register(TestKind::scripted("again", |_, _| Verdict::Reclassify)).unwrap();
        registry
    }

    fn goto_kind(name: &'static str, target: u32) -> Arc<TestKind> {
        TestKind::scripted(name, move |_, _| Verdict::GotoChain(target))
    }

    fn add_node(
        binding: &BlockBinding,
        registry: &Arc<Registry>,
        chain: u32,
        kind: &str,
        protocol: Protocol,
        prio: u32,
    ) -> Result<()> {
        let chain = binding.block().chain_get(chain, true)?;
        chain.get_or_create_proto(registry, kind, protocol, PrioSpec::At(prio))?;
        Ok(())
    }

    fn head(binding: &BlockBinding, chain: u32) -> Option<Arc<Proto>> {
        binding.block().lookup_chain(chain).and_then(|c| c.head_snapshot())
    }

    #[test]
    fn walks_in_priority_order_until_terminal() {
        let net = Net::new();
        let registry = registry();
        let binding = bind(&net);
        add_node(&binding, &registry, 0, "pass", Protocol::ALL, 0x0001_0000).unwrap();
        add_node(&binding, &registry, 0, "accept", Protocol::ALL, 0x0002_0000).unwrap();
        add_node(&binding, &registry, 0, "drop", Protocol::ALL, 0x0003_0000).unwrap();

        let mut packet = Packet::new(Protocol::IPV4, Bytes::new());
        let mut res = ClassResult::default();
        let verdict = classify(
            Some(binding.block()),
            head(&binding, 0).as_ref(),
            &mut packet,
            &mut res,
            false,
        );
        assert_eq!(verdict, Some(ACT_OK));
        assert_eq!(res.classid, 5);
    }

    #[test]
    fn protocol_mismatch_skips_nodes() {
        let net = Net::new();
        let registry = registry();
        let binding = bind(&net);
        add_node(&binding, &registry, 0, "drop", Protocol::IPV6, 0x0001_0000).unwrap();
        add_node(&binding, &registry, 0, "accept", Protocol::ALL, 0x0002_0000).unwrap();

        let mut packet = Packet::new(Protocol::IPV4, Bytes::new());
        let mut res = ClassResult::default();
        let verdict = classify(
            Some(binding.block()),
            head(&binding, 0).as_ref(),
            &mut packet,
            &mut res,
            false,
        );
        assert_eq!(verdict, Some(ACT_OK));
    }

    #[test]
    fn exhausted_list_returns_none() {
        let net = Net::new();
        let registry = registry();
        let binding = bind(&net);
        add_node(&binding, &registry, 0, "pass", Protocol::ALL, 0x0001_0000).unwrap();

        let mut packet = Packet::new(Protocol::IPV4, Bytes::new());
        let mut res = ClassResult::default();
        let verdict = classify(
            Some(binding.block()),
            head(&binding, 0).as_ref(),
            &mut packet,
            &mut res,
            false,
        );
        assert_eq!(verdict, None);
        assert!(classify(None, None, &mut packet, &mut res, false).is_none());
    }

    #[test]
    fn three_jumps_then_terminal_is_allowed() {
        let net = Net::new();
        let registry = registry();
        registry.register(goto_kind("goto1", 1)).unwrap();
        registry.register(goto_kind("goto2", 2)).unwrap();
        registry.register(goto_kind("goto3", 3)).unwrap();
        let binding = bind(&net);
        add_node(&binding, &registry, 0, "goto1", Protocol::ALL, 0x0001_0000).unwrap();
        add_node(&binding, &registry, 1, "goto2", Protocol::ALL, 0x0001_0000).unwrap();
        add_node(&binding, &registry, 2, "goto3", Protocol::ALL, 0x0001_0000).unwrap();
        add_node(&binding, &registry, 3, "accept", Protocol::ALL, 0x0001_0000).unwrap();

        let mut packet = Packet::new(Protocol::IPV4, Bytes::new());
        let mut res = ClassResult::default();
        let verdict = classify(
            Some(binding.block()),
            head(&binding, 0).as_ref(),
            &mut packet,
            &mut res,
            false,
        );
        assert_eq!(verdict, Some(ACT_OK));
    }

    #[test]
    fn fourth_consecutive_jump_drops_the_packet() {
        let net = Net::new();
        let registry = registry();
        registry.register(goto_kind("ping", 1)).unwrap();
        registry.register(goto_kind("pong", 0)).unwrap();
        let binding = bind(&net);
        add_node(&binding, &registry, 0, "ping", Protocol::ALL, 0x0001_0000).unwrap();
        add_node(&binding, &registry, 1, "pong", Protocol::ALL, 0x0001_0000).unwrap();

        let mut packet = Packet::new(Protocol::IPV4, Bytes::new());
        let mut res = ClassResult::default();
        let verdict = classify(
            Some(binding.block()),
            head(&binding, 0).as_ref(),
            &mut packet,
            &mut res,
            false,
        );
        assert_eq!(verdict, Some(ACT_SHOT));
    }

    #[test]
    fn reclassify_counts_against_the_same_budget() {
        let net = Net::new();
        let registry = registry();
        let binding = bind(&net);
        add_node(&binding, &registry, 0, "again", Protocol::ALL, 0x0001_0000).unwrap();

        let mut packet = Packet::new(Protocol::IPV4, Bytes::new());
        let mut res = ClassResult::default();
        let verdict = classify(
            Some(binding.block()),
            head(&binding, 0).as_ref(),
            &mut packet,
            &mut res,
            false,
        );
        assert_eq!(verdict, Some(ACT_SHOT));
    }

    #[test]
    fn compat_mode_makes_reclassify_terminal() {
        let net = Net::new();
        let registry = registry();
        let binding = bind(&net);
        add_node(&binding, &registry, 0, "again", Protocol::ALL, 0x0001_0000).unwrap();

        let mut packet = Packet::new(Protocol::IPV4, Bytes::new());
        let mut res = ClassResult::default();
        let verdict = classify(
            Some(binding.block()),
            head(&binding, 0).as_ref(),
            &mut packet,
            &mut res,
            true,
        );
        assert_eq!(verdict, Some(ACT_RECLASSIFY));
    }

    #[test]
    fn unresolved_goto_target_drops_the_packet() {
        let net = Net::new();
        let registry = registry();
        registry.register(goto_kind("nowhere", 42)).unwrap();
        let binding = bind(&net);
        add_node(&binding, &registry, 0, "nowhere", Protocol::ALL, 0x0001_0000).unwrap();

        let mut packet = Packet::new(Protocol::IPV4, Bytes::new());
        let mut res = ClassResult::default();
        let verdict = classify(
            Some(binding.block()),
            head(&binding, 0).as_ref(),
            &mut packet,
            &mut res,
            false,
        );
        assert_eq!(verdict, Some(ACT_SHOT));
    }

    #[test]
    fn chain_ext_resumes_at_the_marked_chain() {
        let net = Net::new();
        let registry = registry();
        let binding = bind(&net);
        add_node(&binding, &registry, 0, "drop", Protocol::ALL, 0x0001_0000).unwrap();
        add_node(&binding, &registry, 1, "accept", Protocol::ALL, 0x0001_0000).unwrap();

        let mut packet = Packet::new(Protocol::IPV4, Bytes::new());
        packet.chain_ext = Some(1);
        let mut res = ClassResult::default();
        let verdict = classify(
            Some(binding.block()),
            head(&binding, 0).as_ref(),
            &mut packet,
            &mut res,
            false,
        );
        assert_eq!(verdict, Some(ACT_OK));

        // A stale marker falls back to the supplied head.
        packet.chain_ext = Some(9);
        let verdict = classify(
            Some(binding.block()),
            head(&binding, 0).as_ref(),
            &mut packet,
            &mut res,
            false,
        );
        assert_eq!(verdict, Some(ACT_SHOT));
    }
}

//! A concurrent traffic-classification engine.
//!
//! Packets are classified by walking priority-ordered lists of classifier
//! instances ("protos") grouped into chains, which in turn live in shareable
//! blocks bound to one or more dispatch points. The data-path walk is
//! lock-free; lifecycle is driven by explicit reference counts so teardown is
//! safe under concurrent lookup, mutation and hardware-offload replay.

#![doc(issue_tracker_base_url = "https://github.com/chainbound/tcls-rs/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod error;
pub use error::{Error, Result};

pub mod classifier;
pub use classifier::{Classifier, ClassifierInstance, TemplateState, Verdict, WalkControl};

pub mod classify;
pub use classify::{classify, ClassResult, Packet, Protocol, ACT_OK, ACT_RECLASSIFY, ACT_SHOT};

pub mod registry;
pub use registry::{KindHandle, KindLoader, Registry};

pub mod proto;
pub use proto::{Proto, ProtoHandle};

pub mod chain;
pub use chain::{Chain, ChainHandle, PrioSpec};

pub mod block;
pub use block::{BinderType, Block, BlockHandle, ChainHeadChange, TemplateSpec};

pub mod net;
pub use net::{BindInfo, BlockBinding, ChainEvents, Net};

pub mod offload;
pub use offload::{BlockOffloadRequest, FlowCallback, OffloadCommand, OffloadDevice};

pub mod indirect;
pub use indirect::IndirectCallback;

pub use bytes::Bytes;

#[cfg(test)]
pub(crate) mod testutil;

//! Shared building blocks for the tcls crates.

#![doc(issue_tracker_base_url = "https://github.com/chainbound/tcls-rs/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod work;
pub use work::WorkQueue;

mod ratelimit;
pub use ratelimit::RateLimit;

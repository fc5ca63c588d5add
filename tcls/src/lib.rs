#![doc(issue_tracker_base_url = "https://github.com/chainbound/tcls-rs/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub use tcls_core::*;

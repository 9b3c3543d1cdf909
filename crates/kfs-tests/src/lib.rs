//! KFS Test & Validation Infrastructure
//!
//! Cross-crate tests for the KFS protocol codec and the metaserver operation
//! log: crash/restart scenarios against real directories, codec round trips
//! for every operation kind, and property-based tests.

pub mod harness;
pub mod proptest_codec;
pub mod proptest_wal;


pub use harness::{create_request, sample_replies, sample_requests, MetaTestEnv, RunningLog};

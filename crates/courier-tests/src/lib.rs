//! Courier test and validation infrastructure
//!
//! Shared fixtures for driving several client instances against one feed,
//! bus and marker store, plus the cross-crate scenarios that use them.

pub mod harness;

#[cfg(test)]
mod pipeline_tests;
#[cfg(test)]
mod reconnect_tests;

pub use harness::{
    init_test_tracing, message_event, InMemoryGateway, Instance, RecordingHandler,
    RecordingSurface, SharedWorld, TestEnv, TEST_SECRET,
};

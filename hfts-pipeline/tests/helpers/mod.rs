//! Test Helper Utilities
//!
//! Shared utilities for the hfts-pipeline integration tests

#![allow(dead_code)]

pub mod signal_generator;
pub mod store_utils;

pub use signal_generator::{
    archive_minutes, minute_blocks, propagation_delay_ms, ramp_offsets, synthetic_minute,
    test_config, BASE_MINUTE, RECEIVER_GRID,
};
pub use store_utils::{memory_store, tree_digest};

//! # HFTS Pipeline Library (hfts-pipeline)
//!
//! Three-phase time-alignment pipeline for WWV/WWVH/CHU receivers.
//!
//! **Phase 1:** immutable raw-sample archive ([`archive`])
//!
//! **Phase 2:** per-minute analysis: tone/marker detection ([`detect`]),
//! station discrimination ([`discriminate`]), propagation solving
//! ([`solver`]), appended to a versioned clock-offset series ([`series`])
//!
//! **Phase 3:** UTC-corrected, decimated products ([`product`])
//!
//! [`pipeline`] runs the phases live; [`reprocess`] replays them against the
//! archive under a new algorithm version.

pub mod analysis;
pub mod archive;
pub mod detect;
pub mod discriminate;
pub mod pipeline;
pub mod product;
pub mod reprocess;
pub mod series;
pub mod solver;
pub mod synthetic;

pub use hfts_common::{Error, Result};

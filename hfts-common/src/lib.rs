//! # HFTS Common Library
//!
//! Shared code for the HF time-standard pipeline crates including:
//! - Error taxonomy and severity classification
//! - Configuration loading (TOML bootstrap + root folder resolution)
//! - Pipeline event types and EventBus
//! - Data model shared between archive, analysis and product stages
//! - Receiver/transmitter geometry (Maidenhead grid, great circle)
//! - Database schema initialisation for offset series and records

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod geo;
pub mod model;
pub mod time;

pub use error::{Error, Result, Severity};
pub use model::{
    ClockOffsetMeasurement, Confidence, DiscriminationRecord, DominantStation, GapRecord,
    PropagationMode, Provenance, QualityGrade, SampleBlock, Station,
};

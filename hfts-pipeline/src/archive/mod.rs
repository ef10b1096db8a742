//! Raw sample archive
//!
//! Single-writer, multi-reader store of complex baseband samples, one sealed
//! segment per system-time minute. Segments are written once and never
//! touched again; downstream analysis can only read them.
//!
//! ```text
//! <root>/archive/<channel>/<YYYYMMDD>/<HHMM>.iq    interleaved f32 LE I/Q
//! <root>/archive/<channel>/<YYYYMMDD>/<HHMM>.json  SegmentManifest
//! ```
//!
//! The manifest is written last, so its presence is the "minute fully
//! written" signal for later stages.

pub mod format;
pub mod reader;
pub mod writer;

pub use format::{archive_id, ArchiveLayout, BlockSpan, SegmentManifest};
pub use reader::{ArchiveReader, ArchiveSegment};
pub use writer::{ArchiveWriter, SealedSegment};

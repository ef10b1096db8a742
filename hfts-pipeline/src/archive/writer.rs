//! Archive writer (ingestion side)
//!
//! Accumulates incoming blocks for the current system-time minute and seals
//! the minute once a block for a later minute arrives (or on flush). Blocks
//! straddling a minute boundary are split. Discontinuities become GapRecords;
//! nothing is ever interpolated or zero-filled here.

use super::format::{
    archive_id, encode_samples, digest_hex, validate_channel_name, write_once, ArchiveLayout,
    BlockSpan, SegmentManifest, FORMAT_VERSION,
};
use hfts_common::model::{GapRecord, SampleBlock};
use hfts_common::time::{minute_floor, SECONDS_PER_MINUTE};
use hfts_common::{Error, Result};
use num_complex::Complex32;
use std::path::Path;
use tracing::{debug, info, warn};

/// Summary of a segment that has just been sealed
#[derive(Debug, Clone, PartialEq)]
pub struct SealedSegment {
    pub archive_id: String,
    pub channel: String,
    pub minute_start: i64,
    pub sample_count: u64,
    pub gap_count: usize,
}

struct PendingSegment {
    minute_start: i64,
    samples: Vec<Complex32>,
    spans: Vec<BlockSpan>,
    gaps: Vec<GapRecord>,
}

impl PendingSegment {
    fn new(minute_start: i64, sample_rate: u32) -> Self {
        Self {
            minute_start,
            samples: Vec::with_capacity(sample_rate as usize * SECONDS_PER_MINUTE as usize),
            spans: Vec::new(),
            gaps: Vec::new(),
        }
    }

    fn append(&mut self, block: &SampleBlock, contiguous: bool) {
        let offset = self.samples.len() as u64;
        self.samples.extend_from_slice(&block.samples);
        match self.spans.last_mut() {
            Some(span) if contiguous => span.sample_count += block.sample_count() as u64,
            _ => self.spans.push(BlockSpan {
                system_time_start: block.system_time_start,
                sample_offset: offset,
                sample_count: block.sample_count() as u64,
            }),
        }
    }
}

/// Single writer for one channel's archive
pub struct ArchiveWriter {
    layout: ArchiveLayout,
    channel: String,
    sample_rate: u32,
    pending: Option<PendingSegment>,
    /// System time where the next sample is expected
    expected_next: Option<f64>,
    /// Set by an explicit gap notice; the next block opens a new span
    span_break: bool,
    /// Sealed during a call that then reported a seal failure
    undelivered: Vec<SealedSegment>,
    /// First seal failure of the current call
    seal_error: Option<Error>,
}

impl ArchiveWriter {
    pub fn open(data_root: &Path, channel: &str, sample_rate: u32) -> Result<Self> {
        validate_channel_name(channel)?;
        if sample_rate == 0 {
            return Err(Error::InvalidInput("Sample rate must be positive".to_string()));
        }
        let layout = ArchiveLayout::new(data_root);
        std::fs::create_dir_all(layout.channel_dir(channel))?;
        info!(
            "Archive writer opened for {} at {} Hz ({})",
            channel,
            sample_rate,
            layout.channel_dir(channel).display()
        );
        Ok(Self {
            layout,
            channel: channel.to_string(),
            sample_rate,
            pending: None,
            expected_next: None,
            span_break: false,
            undelivered: Vec::new(),
            seal_error: None,
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// System time of the newest sample accepted so far
    pub fn latest_time(&self) -> Option<f64> {
        self.expected_next
    }

    /// Append a block; returns every segment sealed as a consequence
    ///
    /// A failed seal never drops the rest of the block: the samples for
    /// later minutes are still placed, and the failure is returned once the
    /// block is fully accepted. Segments sealed by that same call are then
    /// handed out by [`ArchiveWriter::take_undelivered`] or the next call.
    pub fn push_block(&mut self, block: &SampleBlock) -> Result<Vec<SealedSegment>> {
        let sealed = self.accept_block(block)?;
        self.deliver(sealed)
    }

    fn accept_block(&mut self, block: &SampleBlock) -> Result<Vec<SealedSegment>> {
        if block.sample_rate != self.sample_rate {
            return Err(Error::InvalidInput(format!(
                "Block sample rate {} does not match channel rate {}",
                block.sample_rate, self.sample_rate
            )));
        }
        if block.samples.is_empty() {
            return Ok(Vec::new());
        }

        let half_sample = 0.5 / self.sample_rate as f64;
        let mut contiguous = false;
        if let Some(expected) = self.expected_next {
            let jump = block.system_time_start - expected;
            if jump < -half_sample {
                return Err(Error::InvalidInput(format!(
                    "Block at {:.6} overlaps already archived data ending {:.6}",
                    block.system_time_start, expected
                )));
            }
            if jump > half_sample {
                let gap = GapRecord {
                    system_time: expected,
                    duration: jump,
                    samples_lost: (jump * self.sample_rate as f64).round() as u64,
                };
                warn!(
                    "{}: inferred gap of {} samples at {:.6}",
                    self.channel, gap.samples_lost, expected
                );
                let mut sealed = self.record_gap(gap);
                self.span_break = false;
                sealed.extend(self.append_split(block, false));
                return Ok(sealed);
            }
            contiguous = !self.span_break;
        }

        self.span_break = false;
        Ok(self.append_split(block, contiguous))
    }

    /// Record an explicit gap notification from the ingestion collaborator
    pub fn note_gap(&mut self, gap: GapRecord) -> Result<Vec<SealedSegment>> {
        let sealed = self.record_gap(gap);
        let gap_end = gap.system_time + gap.duration;
        self.expected_next = Some(match self.expected_next {
            Some(expected) => expected.max(gap_end),
            None => gap_end,
        });
        self.span_break = true;
        self.deliver(sealed)
    }

    /// Seal whatever is pending (shutdown or end of a recording)
    pub fn flush(&mut self) -> Result<Option<SealedSegment>> {
        match self.pending.take() {
            Some(pending) => self.seal(pending).map(Some),
            None => Ok(None),
        }
    }

    /// Segments sealed by a call that returned a seal failure
    pub fn take_undelivered(&mut self) -> Vec<SealedSegment> {
        std::mem::take(&mut self.undelivered)
    }

    fn deliver(&mut self, sealed: Vec<SealedSegment>) -> Result<Vec<SealedSegment>> {
        let mut out = std::mem::take(&mut self.undelivered);
        out.extend(sealed);
        match self.seal_error.take() {
            Some(e) => {
                self.undelivered = out;
                Err(e)
            }
            None => Ok(out),
        }
    }

    fn record_gap(&mut self, gap: GapRecord) -> Vec<SealedSegment> {
        let minute = minute_floor(gap.system_time);
        let mut sealed = Vec::new();
        match &self.pending {
            Some(p) if p.minute_start < minute => {
                if let Some(s) = self.roll_to(minute) {
                    sealed.push(s);
                }
            }
            Some(p) if p.minute_start > minute => {
                warn!(
                    "{}: late gap notice for sealed minute {}, attaching to {}",
                    self.channel, minute, p.minute_start
                );
            }
            Some(_) => {}
            None => self.pending = Some(PendingSegment::new(minute, self.sample_rate)),
        }
        if let Some(p) = self.pending.as_mut() {
            p.gaps.push(gap);
        }
        sealed
    }

    fn append_split(&mut self, block: &SampleBlock, contiguous: bool) -> Vec<SealedSegment> {
        let mut sealed = Vec::new();
        let mut remaining = block.clone();
        let mut contiguous = contiguous;

        while !remaining.samples.is_empty() {
            // Nudge by a quarter sample so a block starting exactly on a
            // boundary is attributed to the new minute.
            let quarter = 0.25 / self.sample_rate as f64;
            let minute = minute_floor(remaining.system_time_start + quarter);
            let minute_end = (minute + SECONDS_PER_MINUTE) as f64;
            let split = (((minute_end - remaining.system_time_start) * self.sample_rate as f64)
                .round()
                .max(1.0) as usize)
                .min(remaining.sample_count());

            let piece = remaining.slice(0, split);
            let needs_roll = self
                .pending
                .as_ref()
                .map(|p| p.minute_start != minute)
                .unwrap_or(true);
            if needs_roll {
                if let Some(s) = self.roll_to(minute) {
                    sealed.push(s);
                }
                contiguous = contiguous
                    && self
                        .pending
                        .as_ref()
                        .map(|p| !p.spans.is_empty())
                        .unwrap_or(false);
            }
            if let Some(p) = self.pending.as_mut() {
                p.append(&piece, contiguous);
            }
            self.expected_next = Some(piece.end_time());
            contiguous = true;
            remaining = remaining.slice(split, remaining.sample_count());
        }

        sealed
    }

    /// Seal the pending segment (if any) and open one for `minute`
    ///
    /// The new minute is opened even when sealing the old one fails; the
    /// failure is kept for the caller in `seal_error`.
    fn roll_to(&mut self, minute: i64) -> Option<SealedSegment> {
        let previous = match self.pending.take() {
            Some(p) if p.minute_start == minute => {
                self.pending = Some(p);
                return None;
            }
            other => other,
        };
        self.pending = Some(PendingSegment::new(minute, self.sample_rate));
        match previous.map(|p| self.seal(p)) {
            Some(Ok(sealed)) => Some(sealed),
            Some(Err(e)) => {
                if self.seal_error.is_some() {
                    warn!("{}: further seal failure in the same call: {}", self.channel, e);
                } else {
                    self.seal_error = Some(e);
                }
                None
            }
            None => None,
        }
    }

    fn seal(&self, pending: PendingSegment) -> Result<SealedSegment> {
        let payload = encode_samples(&pending.samples);
        let id = archive_id(&self.channel, pending.minute_start);
        let manifest = SegmentManifest {
            format_version: FORMAT_VERSION,
            archive_id: id.clone(),
            channel: self.channel.clone(),
            minute_start: pending.minute_start,
            sample_rate: self.sample_rate,
            sample_count: pending.samples.len() as u64,
            spans: pending.spans,
            gaps: pending.gaps,
            sha256: digest_hex(&payload),
        };

        let payload_path = self.layout.payload_path(&self.channel, pending.minute_start);
        let manifest_path = self.layout.manifest_path(&self.channel, pending.minute_start);
        if manifest_path.exists() {
            return Err(Error::ArchiveImmutable(manifest_path.display().to_string()));
        }
        if !self.settle_orphan_payload(&payload_path, &manifest.sha256)? {
            write_once(&payload_path, &payload)?;
        }
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;
        write_once(&manifest_path, &manifest_bytes)?;

        debug!(
            "Sealed {} ({} samples, {} spans, {} gaps)",
            id,
            manifest.sample_count,
            manifest.spans.len(),
            manifest.gaps.len()
        );

        Ok(SealedSegment {
            archive_id: id,
            channel: self.channel.clone(),
            minute_start: manifest.minute_start,
            sample_count: manifest.sample_count,
            gap_count: manifest.gaps.len(),
        })
    }

    /// Deal with a payload left by a seal that never wrote its manifest
    ///
    /// Readers only see minutes with a manifest, so such a payload was never
    /// part of the archive. Returns true when it already holds exactly
    /// `digest` and can be kept; any other orphan is removed.
    fn settle_orphan_payload(&self, payload_path: &Path, digest: &str) -> Result<bool> {
        let existing = match std::fs::read(payload_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if digest_hex(&existing) == digest {
            info!(
                "{}: adopting payload {} left without a manifest",
                self.channel,
                payload_path.display()
            );
            return Ok(true);
        }
        warn!(
            "{}: removing incomplete payload {} ({} bytes, no manifest)",
            self.channel,
            payload_path.display(),
            existing.len()
        );
        std::fs::remove_file(payload_path)?;
        Ok(false)
    }
}

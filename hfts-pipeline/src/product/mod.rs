//! Phase-3: UTC-corrected, decimated products
//!
//! A product minute is a pure function of the archived samples and one
//! offset-series version. Output files contain no wall-clock data, so
//! regenerating the same (minute, version) yields identical bytes.
//!
//! Layout: `<root>/products/<channel>/<version>/<YYYYMMDD>/<HHMM>.bin` with a
//! `<HHMM>.json` manifest. Payload records are little-endian
//! `(f64 utc_time, f32 I, f32 Q)`.

pub mod decimate;

pub use decimate::DecimationPlan;

use crate::archive::format::{digest_hex, validate_channel_name, write_replace};
use crate::archive::ArchiveReader;
use crate::series::{ClockOffsetSeries, OffsetLookup};
use byteorder::{ByteOrder, LittleEndian};
use hfts_common::model::{ProcessingPhase, Provenance};
use hfts_common::time::{day_component, hhmm_component, minute_floor, SECONDS_PER_MINUTE};
use hfts_common::{Error, Result};
use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

pub const PRODUCT_FORMAT_VERSION: u32 = 1;

const BYTES_PER_RECORD: usize = 16;

/// How the offsets applied to a product minute were obtained
///
/// A minute rendered from held offsets may render differently once a later
/// measurement brackets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetBasis {
    Interpolated,
    Held,
    /// Some samples interpolated, some held
    Mixed,
}

impl OffsetBasis {
    fn from_counts(held: u64, total: u64) -> Self {
        match held {
            0 => OffsetBasis::Interpolated,
            h if h == total => OffsetBasis::Held,
            _ => OffsetBasis::Mixed,
        }
    }
}

/// Manifest of one corrected minute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductManifest {
    pub format_version: u32,
    pub channel: String,
    /// System-time minute the samples were taken from
    pub minute_start: i64,
    pub input_sample_rate: u32,
    pub decimation_factor: u32,
    pub stage_factors: Vec<u32>,
    pub output_sample_rate: f64,
    pub output_samples: u64,
    pub first_system_time: f64,
    pub first_utc_time: f64,
    pub offset_ms_first: f64,
    pub offset_ms_last: f64,
    /// Output samples whose offset came from a held (not bracketed) lookup
    pub held_samples: u64,
    pub offset_basis: OffsetBasis,
    /// Fraction of the input minute that was present
    pub input_coverage: f64,
    pub provenance: Provenance,
    pub sha256: String,
}

/// One UTC-tagged, decimated minute
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectedProduct {
    pub manifest: ProductManifest,
    pub utc_times: Vec<f64>,
    pub samples: Vec<Complex32>,
}

impl CorrectedProduct {
    pub fn version(&self) -> &str {
        &self.manifest.provenance.offset_series_version
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        encode_records(&self.utc_times, &self.samples)
    }
}

fn encode_records(utc_times: &[f64], samples: &[Complex32]) -> Vec<u8> {
    let mut bytes = vec![0u8; samples.len() * BYTES_PER_RECORD];
    for ((chunk, t), z) in bytes
        .chunks_exact_mut(BYTES_PER_RECORD)
        .zip(utc_times)
        .zip(samples)
    {
        LittleEndian::write_f64(&mut chunk[0..8], *t);
        LittleEndian::write_f32(&mut chunk[8..12], z.re);
        LittleEndian::write_f32(&mut chunk[12..16], z.im);
    }
    bytes
}

fn decode_records(bytes: &[u8]) -> Result<(Vec<f64>, Vec<Complex32>)> {
    if bytes.len() % BYTES_PER_RECORD != 0 {
        return Err(Error::ArchiveCorruption(format!(
            "Product payload length {} is not a whole number of records",
            bytes.len()
        )));
    }
    let mut times = Vec::with_capacity(bytes.len() / BYTES_PER_RECORD);
    let mut samples = Vec::with_capacity(bytes.len() / BYTES_PER_RECORD);
    for chunk in bytes.chunks_exact(BYTES_PER_RECORD) {
        times.push(LittleEndian::read_f64(&chunk[0..8]));
        samples.push(Complex32::new(
            LittleEndian::read_f32(&chunk[8..12]),
            LittleEndian::read_f32(&chunk[12..16]),
        ));
    }
    Ok((times, samples))
}

/// Outcome of a batch run over a range
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RangeSummary {
    pub written: Vec<i64>,
    /// Minutes with archived data but no usable offset
    pub offset_unavailable: Vec<i64>,
    /// Minutes not present in the archive
    pub not_archived: Vec<i64>,
    /// Archived minutes whose segment failed verification
    pub unreadable: Vec<i64>,
}

/// Builds corrected products from the archive and an offset series
#[derive(Debug, Clone)]
pub struct ProductGenerator {
    reader: ArchiveReader,
    products_root: PathBuf,
    plan: DecimationPlan,
}

impl ProductGenerator {
    pub fn new(data_root: &Path, decimation_factor: u32) -> Result<Self> {
        Ok(Self {
            reader: ArchiveReader::new(data_root),
            products_root: data_root.join("products"),
            plan: DecimationPlan::new(decimation_factor)?,
        })
    }

    pub fn plan(&self) -> &DecimationPlan {
        &self.plan
    }

    pub fn payload_path(&self, channel: &str, version: &str, minute_start: i64) -> PathBuf {
        self.day_dir(channel, version, minute_start)
            .join(format!("{}.bin", hhmm_component(minute_start)))
    }

    pub fn manifest_path(&self, channel: &str, version: &str, minute_start: i64) -> PathBuf {
        self.day_dir(channel, version, minute_start)
            .join(format!("{}.json", hhmm_component(minute_start)))
    }

    fn day_dir(&self, channel: &str, version: &str, minute_start: i64) -> PathBuf {
        self.products_root
            .join(channel)
            .join(version)
            .join(day_component(minute_start))
    }

    pub fn exists(&self, channel: &str, version: &str, minute_start: i64) -> bool {
        self.manifest_path(channel, version, minute_start).is_file()
    }

    /// Compute a product minute without writing it
    ///
    /// Fails with `DataUnavailable` when the minute is not archived or any
    /// output sample lacks an offset, and with `ArchiveCorruption` when the
    /// minute's own segment fails verification.
    pub fn generate_minute(
        &self,
        channel: &str,
        series: &ClockOffsetSeries,
        minute_start: i64,
    ) -> Result<CorrectedProduct> {
        validate_channel_name(channel)?;
        let own = self.reader.read_minute(channel, minute_start)?;
        let fs = own.manifest.sample_rate;
        let margin = self.plan.margin_samples() as i64;
        let minute_first = minute_start * fs as i64;
        let minute_len = SECONDS_PER_MINUTE * fs as i64;
        let grid_first = minute_first - margin;
        let grid_len = (minute_len + 2 * margin) as usize;
        let grid_end = grid_first + grid_len as i64;

        // Neighbours only feed the filter edges; an unusable one stays zero
        let mut segments = Vec::new();
        let mut neighbour = minute_floor(grid_first as f64 / fs as f64);
        while neighbour * (fs as i64) < grid_end {
            if neighbour != minute_start && self.reader.has_minute(channel, neighbour) {
                match self.reader.read_minute(channel, neighbour) {
                    Ok(segment) if segment.manifest.sample_rate == fs => segments.push(segment),
                    Ok(_) => warn!(
                        channel,
                        minute = neighbour,
                        "Skipping neighbour with different sample rate"
                    ),
                    Err(e) => warn!(
                        channel,
                        minute_start,
                        neighbour,
                        "Neighbour unusable for filter margin: {}",
                        e
                    ),
                }
            }
            neighbour += SECONDS_PER_MINUTE;
        }
        let source_archive_id = own.manifest.archive_id.clone();
        let input_coverage = own.manifest.coverage();
        segments.push(own);

        // Lay the minute and its neighbours' edges onto one grid
        let mut grid = vec![Complex32::new(0.0, 0.0); grid_len];
        for segment in &segments {
            for block in segment.blocks() {
                let start = (block.system_time_start * fs as f64).round() as i64 - grid_first;
                for (i, z) in block.samples.iter().enumerate() {
                    let idx = start + i as i64;
                    if idx >= 0 && (idx as usize) < grid_len {
                        grid[idx as usize] = *z;
                    }
                }
            }
        }

        let (out_first, decimated) = self.plan.apply(grid_first, &grid);
        let total = self.plan.total_factor as i64;

        let mut utc_times = Vec::new();
        let mut samples = Vec::new();
        let mut offsets = Vec::new();
        let mut held = 0u64;
        for (k, z) in decimated.iter().enumerate() {
            let abs = (out_first + k as i64) * total;
            if abs < minute_first || abs >= minute_first + minute_len {
                continue;
            }
            let system_time = abs as f64 / fs as f64;
            let lookup = series.lookup(system_time);
            let offset_ms = match lookup {
                OffsetLookup::Interpolated { offset_ms, .. } => offset_ms,
                OffsetLookup::Held { offset_ms, .. } => {
                    held += 1;
                    offset_ms
                }
                OffsetLookup::Unavailable => {
                    return Err(Error::DataUnavailable(format!(
                        "No offset for {} at system time {:.3} in {}",
                        channel,
                        system_time,
                        series.version()
                    )))
                }
            };
            utc_times.push(system_time - offset_ms / 1000.0);
            samples.push(*z);
            offsets.push(offset_ms);
        }

        let payload = encode_records(&utc_times, &samples);
        let output_sample_rate = fs as f64 / total as f64;
        let manifest = ProductManifest {
            format_version: PRODUCT_FORMAT_VERSION,
            channel: channel.to_string(),
            minute_start,
            input_sample_rate: fs,
            decimation_factor: self.plan.total_factor,
            stage_factors: self.plan.stage_factors(),
            output_sample_rate,
            output_samples: samples.len() as u64,
            first_system_time: utc_times
                .first()
                .zip(offsets.first())
                .map(|(u, o)| u + o / 1000.0)
                .unwrap_or(minute_start as f64),
            first_utc_time: utc_times.first().copied().unwrap_or(minute_start as f64),
            offset_ms_first: offsets.first().copied().unwrap_or(0.0),
            offset_ms_last: offsets.last().copied().unwrap_or(0.0),
            held_samples: held,
            offset_basis: OffsetBasis::from_counts(held, samples.len() as u64),
            input_coverage,
            provenance: Provenance {
                source_archive_id,
                offset_series_version: series.version().to_string(),
                processing_phase: ProcessingPhase::CorrectedProduct,
            },
            sha256: digest_hex(&payload),
        };
        debug!(
            channel,
            minute_start,
            version = series.version(),
            samples = samples.len(),
            "Generated corrected minute"
        );
        Ok(CorrectedProduct {
            manifest,
            utc_times,
            samples,
        })
    }

    /// Write a product, replacing any previous rendering of the same minute
    pub fn write(&self, product: &CorrectedProduct) -> Result<PathBuf> {
        let m = &product.manifest;
        let version = product.version();
        let payload_path = self.payload_path(&m.channel, version, m.minute_start);
        write_replace(&payload_path, &product.encode_payload())?;
        let manifest_json = serde_json::to_vec_pretty(m)?;
        write_replace(
            &self.manifest_path(&m.channel, version, m.minute_start),
            &manifest_json,
        )?;
        Ok(payload_path)
    }

    pub fn generate_and_write(
        &self,
        channel: &str,
        series: &ClockOffsetSeries,
        minute_start: i64,
    ) -> Result<CorrectedProduct> {
        let product = self.generate_minute(channel, series, minute_start)?;
        self.write(&product)?;
        Ok(product)
    }

    /// Read a written product back, verifying its digest
    pub fn read(&self, channel: &str, version: &str, minute_start: i64) -> Result<CorrectedProduct> {
        let manifest_path = self.manifest_path(channel, version, minute_start);
        if !manifest_path.is_file() {
            return Err(Error::DataUnavailable(format!(
                "No product {}/{} for minute {}",
                channel, version, minute_start
            )));
        }
        let manifest: ProductManifest = serde_json::from_slice(&std::fs::read(&manifest_path)?)?;
        let payload = std::fs::read(self.payload_path(channel, version, minute_start))?;
        if digest_hex(&payload) != manifest.sha256 {
            return Err(Error::ArchiveCorruption(format!(
                "Product digest mismatch for {}",
                manifest_path.display()
            )));
        }
        let (utc_times, samples) = decode_records(&payload)?;
        if samples.len() as u64 != manifest.output_samples {
            return Err(Error::ArchiveCorruption(format!(
                "{} declares {} samples, payload holds {}",
                manifest_path.display(),
                manifest.output_samples,
                samples.len()
            )));
        }
        Ok(CorrectedProduct {
            manifest,
            utc_times,
            samples,
        })
    }

    /// Batch mode: (re)generate every archived minute in `[start, end)`
    ///
    /// Minutes without a usable offset or with a corrupt segment are listed,
    /// not fatal; write failures abort the run.
    pub fn generate_range(
        &self,
        channel: &str,
        series: &ClockOffsetSeries,
        start: i64,
        end: i64,
    ) -> Result<RangeSummary> {
        let mut summary = RangeSummary::default();
        let mut minute = minute_floor(start as f64);
        while minute < end {
            if !self.reader.has_minute(channel, minute) {
                summary.not_archived.push(minute);
            } else {
                match self.generate_and_write(channel, series, minute) {
                    Ok(_) => summary.written.push(minute),
                    Err(Error::DataUnavailable(reason)) => {
                        debug!(channel, minute, "{}", reason);
                        summary.offset_unavailable.push(minute);
                    }
                    Err(e @ Error::ArchiveCorruption(_)) => {
                        error!(channel, minute, "No product, segment unreadable: {}", e);
                        summary.unreadable.push(minute);
                    }
                    Err(e) => return Err(e),
                }
            }
            minute += SECONDS_PER_MINUTE;
        }
        info!(
            channel,
            version = series.version(),
            written = summary.written.len(),
            unavailable = summary.offset_unavailable.len(),
            "Product range complete"
        );
        Ok(summary)
    }
}

//! Synthetic recording generator
//!
//! Builds receiver-side recordings of WWV/WWVH with a known clock offset per
//! minute, using the solver's own propagation delays so the only error left
//! is the detector's.

use hfts_common::config::{ChannelConfig, PipelineConfig};
use hfts_common::model::{SampleBlock, Station};
use hfts_common::time::SECONDS_PER_MINUTE;
use hfts_pipeline::archive::{ArchiveWriter, SealedSegment};
use hfts_pipeline::solver::PropagationSolver;
use hfts_pipeline::synthetic::{SyntheticMinute, SyntheticStation};
use std::path::Path;

/// 2024-03-01 12:00:00 UTC, minute 0 of the hour
pub const BASE_MINUTE: i64 = 1_709_294_400;

/// Mid-continent receiver: WWV one F hop away, WWVH three
pub const RECEIVER_GRID: &str = "EM12";

/// Single-channel configuration at the test receiver
pub fn test_config(
    channel: &str,
    frequency_mhz: f64,
    sample_rate: u32,
    decimation_factor: u32,
) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.receiver.grid_square = RECEIVER_GRID.to_string();
    config.channels = vec![ChannelConfig {
        name: channel.to_string(),
        frequency_mhz,
        sample_rate,
    }];
    config.product.decimation_factor = decimation_factor;
    config
}

pub fn propagation_delay_ms(config: &PipelineConfig, channel: &str, station: Station) -> f64 {
    let channel = config.channel(channel).unwrap();
    let solver = PropagationSolver::new(
        config.receiver.location().unwrap(),
        channel.frequency_mhz,
        config.solver.clone(),
    );
    solver.solve(station).unwrap().propagation_delay_ms
}

/// Offsets falling linearly from `start_ms` at minute 0 to 0 at the last minute
pub fn ramp_offsets(minutes: usize, start_ms: f64) -> Vec<f64> {
    let last = (minutes.max(2) - 1) as f64;
    (0..minutes)
        .map(|k| start_ms * (1.0 - k as f64 / last))
        .collect()
}

/// One minute with every candidate station of the channel; the first
/// candidate is strong, the others weak
pub fn synthetic_minute(
    config: &PipelineConfig,
    channel: &str,
    minute_start: i64,
    offset_ms: f64,
) -> SyntheticMinute {
    let channel_config = config.channel(channel).unwrap();
    let mut minute = SyntheticMinute::new(minute_start, channel_config.sample_rate, offset_ms)
        .with_seed(minute_start as u64);
    for (i, station) in channel_config.candidate_stations().into_iter().enumerate() {
        let amplitude = if i == 0 { 0.3 } else { 0.05 };
        minute = minute.with_station(SyntheticStation::new(
            station,
            propagation_delay_ms(config, channel, station),
            amplitude,
        ));
    }
    minute
}

/// The minute cut into blocks of `block_s` seconds
pub fn minute_blocks(minute: &SyntheticMinute, block_s: f64) -> Vec<SampleBlock> {
    let start = minute.minute_start as f64;
    let end = start + SECONDS_PER_MINUTE as f64;
    let mut blocks = Vec::new();
    let mut t = start;
    while t < end {
        let next = (t + block_s).min(end);
        blocks.push(minute.block_range(t, next));
        t = next;
    }
    blocks
}

/// Write consecutive minutes straight into the archive
pub fn archive_minutes(
    root: &Path,
    config: &PipelineConfig,
    channel: &str,
    first_minute: i64,
    offsets_ms: &[f64],
) -> Vec<SealedSegment> {
    let sample_rate = config.channel(channel).unwrap().sample_rate;
    let mut writer = ArchiveWriter::open(root, channel, sample_rate).unwrap();
    let mut sealed = Vec::new();
    for (k, offset_ms) in offsets_ms.iter().enumerate() {
        let minute_start = first_minute + k as i64 * SECONDS_PER_MINUTE;
        let minute = synthetic_minute(config, channel, minute_start, *offset_ms);
        for block in minute_blocks(&minute, 15.0) {
            sealed.extend(writer.push_block(&block).unwrap());
        }
    }
    sealed.extend(writer.flush().unwrap());
    sealed
}

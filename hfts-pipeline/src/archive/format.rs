//! On-disk segment format
//!
//! Sample payload: interleaved little-endian `f32` (I, Q) pairs.
//! Manifest: JSON, carrying the SHA-256 of the payload.

use byteorder::{ByteOrder, LittleEndian};
use hfts_common::model::GapRecord;
use hfts_common::time::{day_component, hhmm_component};
use hfts_common::{Error, Result};
use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const FORMAT_VERSION: u32 = 1;

/// Bytes per complex sample on disk
pub const BYTES_PER_SAMPLE: usize = 8;

/// Contiguous run of samples inside a segment
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlockSpan {
    pub system_time_start: f64,
    pub sample_offset: u64,
    pub sample_count: u64,
}

/// Sidecar describing one sealed minute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentManifest {
    pub format_version: u32,
    pub archive_id: String,
    pub channel: String,
    pub minute_start: i64,
    pub sample_rate: u32,
    pub sample_count: u64,
    pub spans: Vec<BlockSpan>,
    pub gaps: Vec<GapRecord>,
    pub sha256: String,
}

impl SegmentManifest {
    /// Fraction of the minute actually covered by samples
    pub fn coverage(&self) -> f64 {
        let expected = self.sample_rate as f64 * 60.0;
        if expected <= 0.0 {
            return 0.0;
        }
        (self.sample_count as f64 / expected).min(1.0)
    }
}

/// Stable identifier of a segment: `<channel>@<minute_start>`
pub fn archive_id(channel: &str, minute_start: i64) -> String {
    format!("{}@{}", channel, minute_start)
}

/// Path arithmetic for archive segments
#[derive(Debug, Clone)]
pub struct ArchiveLayout {
    root: PathBuf,
}

impl ArchiveLayout {
    /// `data_root` is the pipeline root; segments live under `archive/`
    pub fn new(data_root: &Path) -> Self {
        Self {
            root: data_root.join("archive"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn channel_dir(&self, channel: &str) -> PathBuf {
        self.root.join(channel)
    }

    pub fn day_dir(&self, channel: &str, minute_start: i64) -> PathBuf {
        self.channel_dir(channel).join(day_component(minute_start))
    }

    pub fn payload_path(&self, channel: &str, minute_start: i64) -> PathBuf {
        self.day_dir(channel, minute_start)
            .join(format!("{}.iq", hhmm_component(minute_start)))
    }

    pub fn manifest_path(&self, channel: &str, minute_start: i64) -> PathBuf {
        self.day_dir(channel, minute_start)
            .join(format!("{}.json", hhmm_component(minute_start)))
    }
}

/// Reject channel names that would escape the archive directory
pub fn validate_channel_name(channel: &str) -> Result<()> {
    if channel.is_empty()
        || channel.contains('/')
        || channel.contains('\\')
        || channel.contains("..")
    {
        return Err(Error::InvalidInput(format!(
            "Channel name not usable as a path component: {:?}",
            channel
        )));
    }
    Ok(())
}

pub fn encode_samples(samples: &[Complex32]) -> Vec<u8> {
    let mut bytes = vec![0u8; samples.len() * BYTES_PER_SAMPLE];
    for (chunk, sample) in bytes.chunks_exact_mut(BYTES_PER_SAMPLE).zip(samples) {
        LittleEndian::write_f32(&mut chunk[0..4], sample.re);
        LittleEndian::write_f32(&mut chunk[4..8], sample.im);
    }
    bytes
}

pub fn decode_samples(bytes: &[u8]) -> Result<Vec<Complex32>> {
    if bytes.len() % BYTES_PER_SAMPLE != 0 {
        return Err(Error::ArchiveCorruption(format!(
            "Payload length {} is not a whole number of samples",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|chunk| {
            Complex32::new(
                LittleEndian::read_f32(&chunk[0..4]),
                LittleEndian::read_f32(&chunk[4..8]),
            )
        })
        .collect())
}

pub fn digest_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Write `bytes` to `target` only if `target` does not exist yet
///
/// Data goes to a temp file first, then is hard-linked into place; the link
/// fails atomically when the target already exists.
pub fn write_once(target: &Path, bytes: &[u8]) -> Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| Error::Internal(format!("No parent for {}", target.display())))?;
    std::fs::create_dir_all(parent)?;

    let tmp = temp_path(target);
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    let linked = std::fs::hard_link(&tmp, target);
    let _ = std::fs::remove_file(&tmp);
    match linked {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(Error::ArchiveImmutable(
            target.display().to_string(),
        )),
        Err(e) => Err(e.into()),
    }
}

/// Atomically replace `target` (used for regenerable derived artifacts)
pub fn write_replace(target: &Path, bytes: &[u8]) -> Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| Error::Internal(format!("No parent for {}", target.display())))?;
    std::fs::create_dir_all(parent)?;

    let tmp = temp_path(target);
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, target)?;
    Ok(())
}

fn temp_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));
    target.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_codec_preserves_values() {
        let samples = vec![
            Complex32::new(0.25, -1.5),
            Complex32::new(f32::MIN_POSITIVE, 3.0e7),
        ];
        let bytes = encode_samples(&samples);
        assert_eq!(bytes.len(), 16);
        assert_eq!(decode_samples(&bytes).unwrap(), samples);
    }

    #[test]
    fn test_truncated_payload_is_corruption() {
        let result = decode_samples(&[0u8; 13]);
        assert!(matches!(result, Err(Error::ArchiveCorruption(_))));
    }

    #[test]
    fn test_layout_paths() {
        let layout = ArchiveLayout::new(Path::new("/data"));
        // 2024-03-01 12:44:00 UTC
        let path = layout.payload_path("WWV_10", 1_709_297_040);
        assert_eq!(path, PathBuf::from("/data/archive/WWV_10/20240301/1244.iq"));
    }

    #[test]
    fn test_write_once_refuses_second_write() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a").join("seg.iq");
        write_once(&target, b"first").unwrap();
        let second = write_once(&target, b"second");
        assert!(matches!(second, Err(Error::ArchiveImmutable(_))));
        assert_eq!(std::fs::read(&target).unwrap(), b"first");
    }

    #[test]
    fn test_channel_name_validation() {
        assert!(validate_channel_name("WWV_10_MHz").is_ok());
        assert!(validate_channel_name("../etc").is_err());
        assert!(validate_channel_name("").is_err());
    }
}

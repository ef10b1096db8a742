//! Live pipeline over an hour of synthetic WWV
//!
//! The receiver clock starts 50 ms fast and converges linearly to UTC over
//! 60 minutes. Every minute must be recovered within 1 ms at grade A or B,
//! and every minute must end with a corrected product.

mod helpers;

use helpers::*;
use hfts_common::events::{EventBus, PipelineEvent};
use hfts_common::model::QualityGrade;
use hfts_common::time::SECONDS_PER_MINUTE;
use hfts_pipeline::pipeline::{MinuteStage, Orchestrator};
use hfts_pipeline::product::ProductGenerator;
use std::sync::Arc;

const CHANNEL: &str = "WWV_20";

#[tokio::test]
async fn test_offset_ramp_recovered_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(CHANNEL, 20.0, 4000, 400);
    let store = memory_store().await;
    let events = Arc::new(EventBus::new(4096));
    let mut rx = events.subscribe();

    let orchestrator =
        Orchestrator::new(config.clone(), dir.path(), store.clone(), Arc::clone(&events)).unwrap();
    let handle = orchestrator.start_channel(CHANNEL).await.unwrap();

    let offsets = ramp_offsets(60, 50.0);
    for (k, offset_ms) in offsets.iter().enumerate() {
        let minute_start = BASE_MINUTE + k as i64 * SECONDS_PER_MINUTE;
        let minute = synthetic_minute(&config, CHANNEL, minute_start, *offset_ms);
        for block in minute_blocks(&minute, 10.0) {
            handle.push_block(block).unwrap();
        }
    }
    let status = handle.shutdown().await.unwrap();
    assert_eq!(status.counts.get(&MinuteStage::ProductWritten), Some(&60));

    let series = store.load(CHANNEL, "v1", 120.0).await.unwrap();
    assert_eq!(series.len(), 60);
    for (k, expected) in offsets.iter().enumerate() {
        let utc = (BASE_MINUTE + k as i64 * SECONDS_PER_MINUTE) as f64;
        let m = series.at_minute(utc).unwrap();
        assert!(
            m.quality_grade <= QualityGrade::B,
            "minute {} graded {} ({:?} ms)",
            k,
            m.quality_grade,
            m.uncertainty_ms
        );
        assert!(
            (m.clock_offset_ms - expected).abs() < 1.0,
            "minute {}: measured {:.3} ms, injected {:.3} ms",
            k,
            m.clock_offset_ms,
            expected
        );
    }
    assert_eq!(series.grade_distribution(None).fraction_ab(), 1.0);

    // Products carry UTC tags consistent with the injected offset
    let generator = ProductGenerator::new(dir.path(), 400).unwrap();
    for (k, expected) in offsets.iter().enumerate() {
        let minute_start = BASE_MINUTE + k as i64 * SECONDS_PER_MINUTE;
        let product = generator.read(CHANNEL, "v1", minute_start).unwrap();
        assert_eq!(product.samples.len(), 600);
        let applied_ms = (product.manifest.first_system_time - product.utc_times[0]) * 1000.0;
        assert!(
            (applied_ms - expected).abs() < 2.0,
            "minute {}: applied {:.3} ms, injected {:.3} ms",
            k,
            applied_ms,
            expected
        );
        assert_eq!(product.manifest.provenance.offset_series_version, "v1");
    }

    let mut analyzed = 0;
    let mut alerts = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            PipelineEvent::MinuteAnalyzed { .. } => analyzed += 1,
            PipelineEvent::Alert { .. } => alerts += 1,
            _ => {}
        }
    }
    assert_eq!(analyzed, 60);
    assert_eq!(alerts, 0);
}

#[tokio::test]
async fn test_shared_frequency_names_dominant_station() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config("WWV_10", 10.0, 4000, 400);
    let store = memory_store().await;
    let orchestrator =
        Orchestrator::new(config.clone(), dir.path(), store.clone(), Arc::new(EventBus::new(64)))
            .unwrap();
    let handle = orchestrator.start_channel("WWV_10").await.unwrap();

    // Minutes 3..6 of the hour: no ID or test-signal minutes
    for k in 3..6 {
        let minute_start = BASE_MINUTE + k * SECONDS_PER_MINUTE;
        let minute = synthetic_minute(&config, "WWV_10", minute_start, -8.0);
        handle.push_block(minute.minute_block()).unwrap();
    }
    handle.shutdown().await.unwrap();

    let records = store.load_discrimination("WWV_10", "v1").await.unwrap();
    assert_eq!(records.len(), 3);
    for record in &records {
        assert_eq!(record.dominant_station.as_str(), "WWV");
    }
    let series = store.load("WWV_10", "v1", 120.0).await.unwrap();
    for m in series.measurements() {
        assert!((m.clock_offset_ms + 8.0).abs() < 1.0, "{}", m.clock_offset_ms);
    }
}

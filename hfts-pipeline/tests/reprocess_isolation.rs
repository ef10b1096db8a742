//! Reprocessing under a new version leaves older versions and the archive
//! untouched

mod helpers;

use helpers::*;
use hfts_common::model::QualityGrade;
use hfts_common::Error;
use hfts_pipeline::reprocess::{BatchReprocessor, ReprocessPhases, ReprocessRequest};
use hfts_pipeline::series::SeriesStore;

const CHANNEL: &str = "WWV_20";
const MINUTES: usize = 5;

fn request(version: &str) -> ReprocessRequest {
    ReprocessRequest::new(
        CHANNEL,
        BASE_MINUTE,
        BASE_MINUTE + 60 * MINUTES as i64,
        version,
    )
}

async fn setup() -> (tempfile::TempDir, SeriesStore) {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(CHANNEL, 20.0, 4000, 400);
    archive_minutes(dir.path(), &config, CHANNEL, BASE_MINUTE, &[12.0; MINUTES]);
    (dir, memory_store().await)
}

#[tokio::test]
async fn test_new_version_leaves_old_artifacts_unchanged() {
    let (dir, store) = setup().await;
    let archive_before = tree_digest(&dir.path().join("archive"));

    let config = test_config(CHANNEL, 20.0, 4000, 400);
    let v1 = BatchReprocessor::new(config.clone(), dir.path(), store.clone()).unwrap();
    let summary = v1.run(&request("v1")).await.unwrap();
    assert_eq!(summary.minutes_analyzed, MINUTES);
    assert_eq!(summary.products.as_ref().unwrap().written.len(), MINUTES);

    let v1_measurements = store.measurements(CHANNEL, "v1").await.unwrap();
    let v1_records = store.load_discrimination(CHANNEL, "v1").await.unwrap();
    let v1_products = tree_digest(&dir.path().join("products").join(CHANNEL).join("v1"));

    // Only a Phase-2 threshold changes
    let mut changed = config.clone();
    changed.detector.detection_snr_db = 12.0;
    let v2 = BatchReprocessor::new(changed, dir.path(), store.clone()).unwrap();
    let summary = v2.run(&request("v2")).await.unwrap();
    assert_eq!(summary.minutes_analyzed, MINUTES);

    assert_eq!(tree_digest(&dir.path().join("archive")), archive_before);
    assert_eq!(store.measurements(CHANNEL, "v1").await.unwrap(), v1_measurements);
    assert_eq!(store.load_discrimination(CHANNEL, "v1").await.unwrap(), v1_records);
    assert_eq!(
        tree_digest(&dir.path().join("products").join(CHANNEL).join("v1")),
        v1_products
    );

    let versions = store.versions(CHANNEL).await.unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].parameters["detector"]["detection_snr_db"], 6.0);
    assert_eq!(versions[1].parameters["detector"]["detection_snr_db"], 12.0);
    assert_eq!(versions[1].parameters["algorithm_version"], "v2");
    assert_eq!(store.measurements(CHANNEL, "v2").await.unwrap().len(), MINUTES);
}

#[tokio::test]
async fn test_second_writer_on_same_version_conflicts() {
    let (dir, store) = setup().await;
    let config = test_config(CHANNEL, 20.0, 4000, 400);
    let reprocessor = BatchReprocessor::new(config, dir.path(), store).unwrap();

    let mut first = request("v1");
    first.phases = ReprocessPhases::Analysis;
    let summary = reprocessor.run(&first).await.unwrap();

    // A different writer is refused
    let result = reprocessor.run(&first).await;
    assert!(matches!(result, Err(Error::VersionConflict(_))));

    // The original writer resumes and finds nothing left to do
    let mut resume = first.clone();
    resume.owner = summary.owner;
    let resumed = reprocessor.run(&resume).await.unwrap();
    assert_eq!(resumed.minutes_analyzed, 0);
    assert_eq!(resumed.minutes_skipped, MINUTES);
}

#[tokio::test]
async fn test_sealed_version_rejects_further_work() {
    let (dir, store) = setup().await;
    let config = test_config(CHANNEL, 20.0, 4000, 400);
    let reprocessor = BatchReprocessor::new(config, dir.path(), store).unwrap();

    let mut sealed = request("v1");
    sealed.phases = ReprocessPhases::Analysis;
    sealed.seal = true;
    let summary = reprocessor.run(&sealed).await.unwrap();

    let mut again = sealed.clone();
    again.owner = summary.owner;
    assert!(matches!(
        reprocessor.run(&again).await,
        Err(Error::VersionConflict(_))
    ));

    // Products can still be rendered from a sealed series
    let mut products = request("v1");
    products.phases = ReprocessPhases::Products;
    let rendered = reprocessor.run(&products).await.unwrap();
    assert_eq!(rendered.products.unwrap().written.len(), MINUTES);
}

#[tokio::test]
async fn test_products_for_unknown_version_unavailable() {
    let (dir, store) = setup().await;
    let config = test_config(CHANNEL, 20.0, 4000, 400);
    let reprocessor = BatchReprocessor::new(config, dir.path(), store).unwrap();
    let mut products = request("v9");
    products.phases = ReprocessPhases::Products;
    assert!(matches!(
        reprocessor.run(&products).await,
        Err(Error::DataUnavailable(_))
    ));
}

#[tokio::test]
async fn test_corrupt_minute_is_recorded_x_and_run_completes() {
    let (dir, store) = setup().await;
    let corrupt = BASE_MINUTE + 60;
    let path = hfts_pipeline::archive::ArchiveReader::new(dir.path())
        .layout()
        .payload_path(CHANNEL, corrupt);
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[4096] ^= 0x10;
    std::fs::write(&path, bytes).unwrap();

    let config = test_config(CHANNEL, 20.0, 4000, 400);
    let reprocessor = BatchReprocessor::new(config, dir.path(), store.clone()).unwrap();
    let summary = reprocessor.run(&request("v1")).await.unwrap();

    assert_eq!(summary.minutes_analyzed, MINUTES);
    assert_eq!(summary.unreadable, 1);
    assert_eq!(summary.x_grade, 1);
    let products = summary.products.unwrap();
    assert_eq!(products.unreadable, vec![corrupt]);
    assert_eq!(products.written.len(), MINUTES - 1);

    let measurements = store.measurements(CHANNEL, "v1").await.unwrap();
    assert_eq!(measurements.len(), MINUTES);
    for m in &measurements {
        let bad = (m.utc_time - corrupt as f64).abs() < 1.0;
        assert_eq!(m.quality_grade == QualityGrade::X, bad, "minute {}", m.utc_time);
    }

    // Resuming does not retry the recorded X minute
    let mut resume = request("v1");
    resume.phases = ReprocessPhases::Analysis;
    resume.owner = summary.owner;
    let resumed = reprocessor.run(&resume).await.unwrap();
    assert_eq!(resumed.minutes_skipped, MINUTES);
}

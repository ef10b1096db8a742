//! Live pipeline orchestration
//!
//! Each channel runs three tokio tasks:
//!
//! - **ingest** owns the [`ArchiveWriter`] and seals minutes; it never waits
//!   on analysis
//! - **analysis** runs Phase-2 for each sealed minute in order, closing
//!   minutes that never arrive with an X-grade record
//! - **product** runs Phase-3 once the offset series covers a minute
//!
//! Tasks wake each other through unbounded mpsc notices, but the work itself
//! is read back from the archive and the series store. After a restart,
//! [`Orchestrator::recover`] rebuilds the per-minute state from disk alone.

pub mod state;

pub use state::{AnalysisStep, ChannelStatus, ChannelTracker, MinuteStage};

use crate::analysis::{load_window, AnalysisParams, Analyzer, MinuteAnalysis};
use crate::archive::{ArchiveReader, ArchiveWriter, SealedSegment};
use crate::product::ProductGenerator;
use crate::series::{ClockOffsetSeries, SeriesStore, SeriesWriter};
use hfts_common::config::{ChannelConfig, PipelineConfig};
use hfts_common::events::{EventBus, PipelineEvent};
use hfts_common::model::{GapRecord, SampleBlock};
use hfts_common::time::{minute_floor, SECONDS_PER_MINUTE};
use hfts_common::{Error, Result, Severity};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Series database file under the root folder
pub const DATABASE_FILE: &str = "hfts.db";

/// Input from the ingestion collaborator
#[derive(Debug, Clone)]
pub enum IngestMessage {
    Block(SampleBlock),
    Gap(GapRecord),
}

/// Wake-up notice between stages
#[derive(Debug, Clone, Copy)]
enum StageNotice {
    Archived(i64),
    Analyzed(i64),
    Clock,
}

/// State shared by one channel's tasks
#[derive(Clone)]
struct ChannelContext {
    channel: ChannelConfig,
    version: String,
    data_root: PathBuf,
    analysis_timeout_s: f64,
    product_latency_s: f64,
    tracker: Arc<RwLock<ChannelTracker>>,
    series: Arc<RwLock<ClockOffsetSeries>>,
    events: Arc<EventBus>,
}

impl ChannelContext {
    fn name(&self) -> &str {
        &self.channel.name
    }

    /// Log an error at its severity; alerts also go out on the event bus
    fn report(&self, context: &str, err: &Error) {
        match err.severity() {
            Severity::Alert => {
                error!(channel = %self.channel.name, "{}: {}", context, err);
                self.events.emit_lossy(PipelineEvent::Alert {
                    channel: self.channel.name.clone(),
                    message: format!("{}: {}", context, err),
                });
            }
            Severity::RecordAndContinue | Severity::Retry => {
                warn!(channel = %self.channel.name, "{}: {}", context, err);
            }
        }
    }
}

/// Runs the live pipeline for configured channels
pub struct Orchestrator {
    config: Arc<PipelineConfig>,
    data_root: PathBuf,
    store: SeriesStore,
    events: Arc<EventBus>,
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        data_root: &Path,
        store: SeriesStore,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            data_root: data_root.to_path_buf(),
            store,
            events,
        })
    }

    /// Open the series database under `data_root`
    pub async fn open(config: PipelineConfig, data_root: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_root)?;
        let store = SeriesStore::open(&data_root.join(DATABASE_FILE)).await?;
        Self::new(config, data_root, store, Arc::new(EventBus::default()))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn store(&self) -> &SeriesStore {
        &self.store
    }

    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    pub fn version(&self) -> &str {
        &self.config.pipeline.algorithm_version
    }

    fn channel_config(&self, name: &str) -> Result<ChannelConfig> {
        self.config
            .channel(name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("Unknown channel {}", name)))
    }

    /// Owner token for this installation's writer of (channel, version)
    ///
    /// Persisted so a restarted pipeline resumes its own series instead of
    /// conflicting with itself.
    pub fn owner_token(&self, channel: &str, version: &str) -> Result<Uuid> {
        let path = self
            .data_root
            .join("series")
            .join(channel)
            .join(format!("{}.owner", version));
        match std::fs::read_to_string(&path) {
            Ok(content) => Uuid::parse_str(content.trim()).map_err(|e| {
                Error::Config(format!("Unreadable owner token {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let token = Uuid::new_v4();
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, token.to_string())?;
                debug!(channel, version, token = %token, "Created owner token");
                Ok(token)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Rebuild a channel's minute states from the archive, the series and
    /// the written products
    pub async fn recover(&self, channel: &str) -> Result<ChannelTracker> {
        let channel = self.channel_config(channel)?;
        let version = self.version().to_string();
        let reader = ArchiveReader::new(&self.data_root);
        let generator =
            ProductGenerator::new(&self.data_root, self.config.product.decimation_factor)?;

        let archived = reader.list_minutes(&channel.name)?;
        let recorded: BTreeSet<i64> = self
            .store
            .minutes_recorded(&channel.name, &version, i64::MIN / 2, i64::MAX / 2)
            .await?
            .into_iter()
            .collect();

        let mut tracker = ChannelTracker::new();
        for &minute in &archived {
            if !recorded.contains(&minute) {
                tracker.archived(minute);
            } else if generator.exists(&channel.name, &version, minute) {
                tracker.advance(minute, MinuteStage::ProductWritten)?;
            } else {
                tracker.advance(minute, MinuteStage::OffsetAvailable)?;
            }
        }
        for &minute in recorded.iter().filter(|m| !archived.contains(m)) {
            tracker.advance(minute, MinuteStage::TimedOut)?;
        }
        if let Some(last) = recorded.iter().next_back() {
            tracker.resume_at(last + SECONDS_PER_MINUTE);
        }
        if let Some(last) = archived.last() {
            tracker.observe_clock((last + SECONDS_PER_MINUTE) as f64);
        }

        tracker.prune();
        let counts = tracker.counts();
        info!(
            channel = %channel.name,
            version = %version,
            archived = archived.len(),
            recorded = recorded.len(),
            pending_analysis = counts.get(&MinuteStage::Analyzing).copied().unwrap_or(0),
            pending_products = counts.get(&MinuteStage::OffsetAvailable).copied().unwrap_or(0),
            "Recovered channel state"
        );
        Ok(tracker)
    }

    /// Claim the channel's series version and start its three tasks
    pub async fn start_channel(&self, name: &str) -> Result<ChannelHandle> {
        let channel = self.channel_config(name)?;
        let version = self.version().to_string();
        let params = AnalysisParams::from_config(&self.config);
        let owner = self.owner_token(&channel.name, &version)?;

        let series_writer = match self
            .store
            .claim_as(&channel.name, &version, owner, &params.to_json()?)
            .await
        {
            Ok(writer) => writer,
            Err(e) => {
                if e.severity() == Severity::Alert {
                    self.events.emit_lossy(PipelineEvent::Alert {
                        channel: channel.name.clone(),
                        message: e.to_string(),
                    });
                }
                return Err(e);
            }
        };

        let tracker = self.recover(&channel.name).await?;
        let series = self
            .store
            .load(&channel.name, &version, self.config.series.staleness_window_s())
            .await?;
        let archive_writer = ArchiveWriter::open(&self.data_root, &channel.name, channel.sample_rate)?;
        let analyzer = Arc::new(Analyzer::new(
            channel.clone(),
            self.config.receiver.location()?,
            params,
        ));
        let generator = Arc::new(ProductGenerator::new(
            &self.data_root,
            self.config.product.decimation_factor,
        )?);

        let ctx = ChannelContext {
            channel: channel.clone(),
            version: version.clone(),
            data_root: self.data_root.clone(),
            analysis_timeout_s: self.config.pipeline.analysis_timeout_s,
            product_latency_s: self.config.pipeline.product_latency_s,
            tracker: Arc::new(RwLock::new(tracker)),
            series: Arc::new(RwLock::new(series)),
            events: Arc::clone(&self.events),
        };

        let (ingest_tx, ingest_rx) = mpsc::unbounded_channel();
        let (analysis_tx, analysis_rx) = mpsc::unbounded_channel();
        let (product_tx, product_rx) = mpsc::unbounded_channel();

        let mut tasks = Vec::new();
        let ingest_ctx = ctx.clone();
        tasks.push(tokio::spawn(async move {
            run_ingest(ingest_ctx, archive_writer, ingest_rx, analysis_tx).await;
        }));
        let analysis_ctx = ctx.clone();
        tasks.push(tokio::spawn(async move {
            run_analysis(analysis_ctx, analyzer, series_writer, analysis_rx, product_tx).await;
        }));
        let product_ctx = ctx.clone();
        tasks.push(tokio::spawn(async move {
            run_product(product_ctx, generator, product_rx).await;
        }));

        info!(channel = %channel.name, version = %version, "Channel pipeline started");
        Ok(ChannelHandle {
            channel: channel.name,
            version,
            ingest_tx,
            tracker: ctx.tracker,
            tasks,
        })
    }
}

/// Handle on one running channel
pub struct ChannelHandle {
    channel: String,
    version: String,
    ingest_tx: mpsc::UnboundedSender<IngestMessage>,
    tracker: Arc<RwLock<ChannelTracker>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChannelHandle {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn push_block(&self, block: SampleBlock) -> Result<()> {
        self.send(IngestMessage::Block(block))
    }

    pub fn note_gap(&self, gap: GapRecord) -> Result<()> {
        self.send(IngestMessage::Gap(gap))
    }

    fn send(&self, message: IngestMessage) -> Result<()> {
        self.ingest_tx
            .send(message)
            .map_err(|_| Error::Internal(format!("Ingest task for {} has stopped", self.channel)))
    }

    pub async fn stage(&self, minute_start: i64) -> Option<MinuteStage> {
        self.tracker.read().await.stage(minute_start)
    }

    pub async fn status(&self) -> ChannelStatus {
        let tracker = self.tracker.read().await;
        ChannelStatus {
            channel: self.channel.clone(),
            version: self.version.clone(),
            clock: tracker.clock(),
            counts: tracker.counts(),
        }
    }

    /// Stop ingestion, seal the open minute and let the downstream stages
    /// finish everything already archived
    pub async fn shutdown(self) -> Result<ChannelStatus> {
        let ChannelHandle {
            channel,
            version,
            ingest_tx,
            tracker,
            tasks,
        } = self;
        drop(ingest_tx);
        for task in tasks {
            task.await
                .map_err(|e| Error::Internal(format!("{} task failed: {}", channel, e)))?;
        }
        let tracker = tracker.read().await;
        info!(channel = %channel, version = %version, "Channel pipeline stopped");
        Ok(ChannelStatus {
            channel,
            version,
            clock: tracker.clock(),
            counts: tracker.counts(),
        })
    }
}

async fn run_ingest(
    ctx: ChannelContext,
    mut writer: ArchiveWriter,
    mut rx: mpsc::UnboundedReceiver<IngestMessage>,
    analysis_tx: mpsc::UnboundedSender<StageNotice>,
) {
    while let Some(message) = rx.recv().await {
        let result = match &message {
            IngestMessage::Block(block) => {
                if !block.samples.is_empty() {
                    let first = minute_floor(block.system_time_start);
                    let last = minute_floor(block.time_of(block.sample_count() - 1));
                    ctx.tracker.write().await.ingesting(first, last);
                }
                writer.push_block(block)
            }
            IngestMessage::Gap(gap) => writer.note_gap(*gap),
        };
        match result {
            Ok(sealed) => {
                for segment in sealed {
                    on_sealed(&ctx, &segment, &analysis_tx).await;
                }
            }
            Err(e) => {
                ctx.report("Ingest failed", &e);
                for segment in writer.take_undelivered() {
                    on_sealed(&ctx, &segment, &analysis_tx).await;
                }
            }
        }
        if let Some(latest) = writer.latest_time() {
            ctx.tracker.write().await.observe_clock(latest);
        }
        let _ = analysis_tx.send(StageNotice::Clock);
    }

    match writer.flush() {
        Ok(Some(segment)) => on_sealed(&ctx, &segment, &analysis_tx).await,
        Ok(None) => {}
        Err(e) => ctx.report("Final flush failed", &e),
    }
    for segment in writer.take_undelivered() {
        on_sealed(&ctx, &segment, &analysis_tx).await;
    }
    debug!(channel = %ctx.name(), "Ingest task finished");
}

async fn on_sealed(
    ctx: &ChannelContext,
    segment: &SealedSegment,
    analysis_tx: &mpsc::UnboundedSender<StageNotice>,
) {
    let accepted = ctx.tracker.write().await.archived(segment.minute_start);
    if !accepted {
        warn!(
            channel = %ctx.name(),
            minute_start = segment.minute_start,
            "Segment sealed after its minute was closed; reprocess to include it"
        );
    }
    info!(
        channel = %ctx.name(),
        minute_start = segment.minute_start,
        samples = segment.sample_count,
        gaps = segment.gap_count,
        "Minute archived"
    );
    ctx.events.emit_lossy(PipelineEvent::MinuteArchived {
        channel: segment.channel.clone(),
        minute_start: segment.minute_start,
        archive_id: segment.archive_id.clone(),
        sample_count: segment.sample_count,
        gap_count: segment.gap_count,
    });
    let _ = analysis_tx.send(StageNotice::Archived(segment.minute_start));
}

async fn run_analysis(
    ctx: ChannelContext,
    analyzer: Arc<Analyzer>,
    writer: SeriesWriter,
    mut rx: mpsc::UnboundedReceiver<StageNotice>,
    product_tx: mpsc::UnboundedSender<StageNotice>,
) {
    loop {
        loop {
            let step = ctx
                .tracker
                .write()
                .await
                .next_analysis_step(ctx.analysis_timeout_s);
            let Some(step) = step else { break };
            if let Err(e) = analysis_step(&ctx, &analyzer, &writer, step, &product_tx).await {
                // Recording failed: the series can no longer be trusted to
                // this writer, so stop rather than skip minutes
                ctx.report("Recording analysis result failed", &e);
                return;
            }
        }
        match rx.recv().await {
            Some(notice) => debug!(channel = %ctx.name(), ?notice, "Analysis woken"),
            None => break,
        }
    }
    debug!(channel = %ctx.name(), "Analysis task finished");
}

async fn analysis_step(
    ctx: &ChannelContext,
    analyzer: &Arc<Analyzer>,
    writer: &SeriesWriter,
    step: AnalysisStep,
    product_tx: &mpsc::UnboundedSender<StageNotice>,
) -> Result<()> {
    let (minute_start, analysis, stage) = match step {
        AnalysisStep::Analyze(minute_start) => {
            let reader = ArchiveReader::new(&ctx.data_root);
            let channel = ctx.channel.name.clone();
            let worker = Arc::clone(analyzer);
            let result = tokio::task::spawn_blocking(move || {
                let window = load_window(&reader, &channel, minute_start, worker.pre_margin_s())?;
                Ok::<_, Error>(worker.analyze(&window))
            })
            .await
            .map_err(|e| Error::Internal(format!("Analysis worker failed: {}", e)))?;
            let analysis = match result {
                Ok(analysis) => analysis,
                Err(e) => {
                    ctx.report(&format!("Minute {} unreadable", minute_start), &e);
                    MinuteAnalysis::unreadable(minute_start, &e)
                }
            };
            (minute_start, analysis, MinuteStage::OffsetAvailable)
        }
        AnalysisStep::TimeOut(minute_start) => {
            warn!(
                channel = %ctx.name(),
                minute_start,
                timeout_s = ctx.analysis_timeout_s,
                "No segment before deadline, recording X"
            );
            (minute_start, MinuteAnalysis::timed_out(minute_start), MinuteStage::TimedOut)
        }
    };

    let record = analysis.discrimination_record(&ctx.channel.name, &ctx.version);
    writer.append_minute(&analysis.measurement, &record).await?;
    if let Err(e) = ctx.series.write().await.insert(analysis.measurement.clone()) {
        warn!(channel = %ctx.name(), "{}", e);
    }
    {
        let mut tracker = ctx.tracker.write().await;
        tracker.advance(minute_start, stage)?;
        tracker.prune();
    }

    let m = &analysis.measurement;
    if stage == MinuteStage::TimedOut {
        ctx.events.emit_lossy(PipelineEvent::MinuteTimedOut {
            channel: ctx.channel.name.clone(),
            version: ctx.version.clone(),
            minute_start,
        });
    } else {
        match &analysis.failure {
            Some(reason) => warn!(channel = %ctx.name(), minute_start, "X-grade minute: {}", reason),
            None => info!(
                channel = %ctx.name(),
                minute_start,
                offset_ms = m.clock_offset_ms,
                grade = %m.quality_grade,
                station = ?m.station,
                "Minute analyzed"
            ),
        }
        ctx.events.emit_lossy(PipelineEvent::MinuteAnalyzed {
            channel: ctx.channel.name.clone(),
            version: ctx.version.clone(),
            minute_start,
            quality_grade: m.quality_grade,
            dominant_station: analysis.discrimination.dominant_station,
            clock_offset_ms: m.is_usable().then_some(m.clock_offset_ms),
        });
    }
    let _ = product_tx.send(StageNotice::Analyzed(minute_start));
    Ok(())
}

async fn run_product(
    ctx: ChannelContext,
    generator: Arc<ProductGenerator>,
    mut rx: mpsc::UnboundedReceiver<StageNotice>,
) {
    loop {
        product_pass(&ctx, &generator, false).await;
        match rx.recv().await {
            Some(notice) => debug!(channel = %ctx.name(), ?notice, "Product stage woken"),
            None => break,
        }
    }
    // Upstream finished: settle every remaining minute
    product_pass(&ctx, &generator, true).await;
    debug!(channel = %ctx.name(), "Product task finished");
}

async fn product_pass(ctx: &ChannelContext, generator: &Arc<ProductGenerator>, force: bool) {
    let candidates = ctx
        .tracker
        .read()
        .await
        .product_candidates(ctx.product_latency_s, force);
    if candidates.is_empty() {
        return;
    }
    let series = Arc::new(ctx.series.read().await.clone());

    for minute_start in candidates {
        {
            let mut tracker = ctx.tracker.write().await;
            if tracker.stage(minute_start) == Some(MinuteStage::OffsetAvailable) {
                if let Err(e) = tracker.advance(minute_start, MinuteStage::ProductPending) {
                    ctx.report("Product state", &e);
                    continue;
                }
            }
        }

        let worker = Arc::clone(generator);
        let snapshot = Arc::clone(&series);
        let channel = ctx.channel.name.clone();
        let result = tokio::task::spawn_blocking(move || {
            worker.generate_and_write(&channel, &snapshot, minute_start)
        })
        .await
        .unwrap_or_else(|e| Err(Error::Internal(format!("Product worker failed: {}", e))));

        let mut tracker = ctx.tracker.write().await;
        let next = match result {
            Ok(product) => {
                info!(
                    channel = %ctx.name(),
                    minute_start,
                    samples = product.manifest.output_samples,
                    held = product.manifest.held_samples,
                    basis = ?product.manifest.offset_basis,
                    "Product written"
                );
                ctx.events.emit_lossy(PipelineEvent::ProductWritten {
                    channel: ctx.channel.name.clone(),
                    version: ctx.version.clone(),
                    minute_start,
                    output_samples: product.manifest.output_samples,
                });
                Some(MinuteStage::ProductWritten)
            }
            Err(Error::DataUnavailable(reason)) => {
                if force || tracker.product_deadline_passed(minute_start, ctx.product_latency_s) {
                    warn!(channel = %ctx.name(), minute_start, "No product: {}", reason);
                    Some(MinuteStage::NoProduct)
                } else {
                    debug!(channel = %ctx.name(), minute_start, "Product waiting: {}", reason);
                    None
                }
            }
            Err(e) => {
                ctx.report(&format!("Product for minute {} failed", minute_start), &e);
                Some(MinuteStage::NoProduct)
            }
        };
        if let Some(next) = next {
            if let Err(e) = tracker.advance(minute_start, next) {
                ctx.report("Product state", &e);
            }
            let pruned = tracker.prune();
            if pruned > 0 {
                debug!(channel = %ctx.name(), pruned, "Settled minutes folded");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{SyntheticMinute, SyntheticStation};
    use hfts_common::config::ChannelConfig;
    use hfts_common::model::{QualityGrade, Station};

    const BASE: i64 = 1_709_294_400;

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.receiver.grid_square = "EM12".to_string();
        config.channels = vec![ChannelConfig {
            name: "WWV_20".to_string(),
            frequency_mhz: 20.0,
            sample_rate: 4000,
        }];
        config.product.decimation_factor = 400;
        config
    }

    async fn orchestrator(root: &Path) -> Orchestrator {
        let store = SeriesStore::in_memory().await.unwrap();
        Orchestrator::new(config(), root, store, Arc::new(EventBus::new(256))).unwrap()
    }

    fn minute_block(minute: i64) -> SampleBlock {
        SyntheticMinute::new(minute, 4000, 5.0)
            .with_station(SyntheticStation::new(Station::Wwv, 8.0, 0.3))
            .minute_block()
    }

    #[tokio::test]
    async fn test_minutes_flow_through_all_stages() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path()).await;
        let mut events = orch.events().subscribe();
        let handle = orch.start_channel("WWV_20").await.unwrap();

        for k in 0..3 {
            handle.push_block(minute_block(BASE + k * 60)).unwrap();
        }
        let status = handle.shutdown().await.unwrap();
        assert_eq!(status.counts.get(&MinuteStage::ProductWritten), Some(&3));

        let measurements = orch.store().measurements("WWV_20", "v1").await.unwrap();
        assert_eq!(measurements.len(), 3);
        assert!(measurements.iter().all(|m| m.quality_grade != QualityGrade::X));

        let mut archived = 0;
        let mut written = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                PipelineEvent::MinuteArchived { .. } => archived += 1,
                PipelineEvent::ProductWritten { .. } => written += 1,
                _ => {}
            }
        }
        assert_eq!(archived, 3);
        assert_eq!(written, 3);
    }

    #[tokio::test]
    async fn test_missing_minute_is_x_grade() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path()).await;
        let handle = orch.start_channel("WWV_20").await.unwrap();

        // Minute BASE+60 never arrives
        handle.push_block(minute_block(BASE)).unwrap();
        for k in 2..5 {
            handle.push_block(minute_block(BASE + k * 60)).unwrap();
        }
        handle.shutdown().await.unwrap();

        let series = orch.store().load("WWV_20", "v1", 120.0).await.unwrap();
        let missing = series.at_minute((BASE + 60) as f64).unwrap();
        assert_eq!(missing.quality_grade, QualityGrade::X);
        assert_eq!(series.len(), 5);
    }

    #[tokio::test]
    async fn test_restart_resumes_own_series() {
        let dir = tempfile::tempdir().unwrap();
        let store = SeriesStore::open(&dir.path().join(DATABASE_FILE)).await.unwrap();
        let events = Arc::new(EventBus::new(64));

        let orch = Orchestrator::new(config(), dir.path(), store.clone(), Arc::clone(&events)).unwrap();
        let handle = orch.start_channel("WWV_20").await.unwrap();
        handle.push_block(minute_block(BASE)).unwrap();
        handle.shutdown().await.unwrap();

        let orch = Orchestrator::new(config(), dir.path(), store.clone(), events).unwrap();
        let tracker = orch.recover("WWV_20").await.unwrap();
        assert_eq!(tracker.stage(BASE), Some(MinuteStage::ProductWritten));

        let handle = orch.start_channel("WWV_20").await.unwrap();
        handle.push_block(minute_block(BASE + 60)).unwrap();
        handle.shutdown().await.unwrap();
        assert_eq!(store.measurements("WWV_20", "v1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_foreign_writer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path()).await;
        orch.store().claim("WWV_20", "v1", "{}").await.unwrap();
        let mut alerts = orch.events().subscribe();
        let result = orch.start_channel("WWV_20").await;
        assert!(matches!(result, Err(Error::VersionConflict(_))));
        assert!(matches!(alerts.try_recv(), Ok(PipelineEvent::Alert { .. })));
    }

    #[tokio::test]
    async fn test_unknown_channel() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path()).await;
        assert!(matches!(orch.start_channel("nope").await, Err(Error::Config(_))));
    }
}

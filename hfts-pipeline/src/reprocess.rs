//! Batch reprocessing against the raw archive
//!
//! Replays Phase-2 and/or Phase-3 for a channel and time range under a
//! target algorithm version. The archive is only ever read; results land in
//! the target version's own series and product tree, so existing versions
//! are untouched. Re-running an interrupted job with the same owner token
//! skips the minutes already recorded.

use crate::analysis::{load_window, AnalysisParams, Analyzer, MinuteAnalysis};
use crate::archive::ArchiveReader;
use crate::product::{ProductGenerator, RangeSummary};
use crate::series::{GradeDistribution, SeriesStore, SeriesWriter};
use hfts_common::config::PipelineConfig;
use hfts_common::model::QualityGrade;
use hfts_common::time::{minute_floor, SECONDS_PER_MINUTE};
use hfts_common::{Error, Result, Severity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Phases a reprocessing run covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReprocessPhases {
    /// Phase-2 only
    Analysis,
    /// Phase-3 only, from an existing series version
    Products,
    Both,
}

impl ReprocessPhases {
    pub fn analysis(&self) -> bool {
        matches!(self, ReprocessPhases::Analysis | ReprocessPhases::Both)
    }

    pub fn products(&self) -> bool {
        matches!(self, ReprocessPhases::Products | ReprocessPhases::Both)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReprocessRequest {
    pub channel: String,
    /// System-time range `[start, end)`, widened to whole minutes
    pub start: i64,
    pub end: i64,
    pub target_version: String,
    pub phases: ReprocessPhases,
    /// Resume a version previously claimed with this token
    pub owner: Option<Uuid>,
    /// Close the version to further appends when done
    pub seal: bool,
}

impl ReprocessRequest {
    pub fn new(channel: &str, start: i64, end: i64, target_version: &str) -> Self {
        Self {
            channel: channel.to_string(),
            start,
            end,
            target_version: target_version.to_string(),
            phases: ReprocessPhases::Both,
            owner: None,
            seal: false,
        }
    }

    /// Minute starts covered by the request
    pub fn minutes(&self) -> impl Iterator<Item = i64> {
        let first = minute_floor(self.start as f64);
        let end = self.end;
        (0..)
            .map(move |k| first + k * SECONDS_PER_MINUTE)
            .take_while(move |m| *m < end)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReprocessSummary {
    pub channel: String,
    pub version: String,
    pub owner: Option<Uuid>,
    pub minutes_analyzed: usize,
    /// Already recorded in the target version
    pub minutes_skipped: usize,
    pub not_archived: usize,
    /// Archived but failed to load (recorded as X)
    pub unreadable: usize,
    pub x_grade: usize,
    /// Target version's grades over the requested range
    pub grades: GradeDistribution,
    pub products: Option<RangeSummary>,
}

/// Runs reprocessing jobs
pub struct BatchReprocessor {
    config: PipelineConfig,
    data_root: PathBuf,
    store: SeriesStore,
    reader: ArchiveReader,
}

impl BatchReprocessor {
    pub fn new(config: PipelineConfig, data_root: &Path, store: SeriesStore) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            data_root: data_root.to_path_buf(),
            store,
            reader: ArchiveReader::new(data_root),
        })
    }

    pub fn store(&self) -> &SeriesStore {
        &self.store
    }

    pub async fn run(&self, request: &ReprocessRequest) -> Result<ReprocessSummary> {
        if request.end <= request.start {
            return Err(Error::InvalidInput(format!(
                "Empty reprocessing range {}..{}",
                request.start, request.end
            )));
        }
        if request.target_version.trim().is_empty() {
            return Err(Error::InvalidInput("Target version must not be empty".to_string()));
        }
        let channel = self
            .config
            .channel(&request.channel)
            .cloned()
            .ok_or_else(|| Error::Config(format!("Unknown channel {}", request.channel)))?;

        info!(
            channel = %channel.name,
            version = %request.target_version,
            start = request.start,
            end = request.end,
            phases = ?request.phases,
            "Reprocessing started"
        );

        let mut summary = ReprocessSummary {
            channel: channel.name.clone(),
            version: request.target_version.clone(),
            ..Default::default()
        };

        if request.phases.analysis() {
            let mut params = AnalysisParams::from_config(&self.config);
            params.algorithm_version = request.target_version.clone();
            let params_json = params.to_json()?;
            let writer = match request.owner {
                Some(owner) => {
                    self.store
                        .claim_as(&channel.name, &request.target_version, owner, &params_json)
                        .await?
                }
                None => {
                    self.store
                        .claim(&channel.name, &request.target_version, &params_json)
                        .await?
                }
            };
            summary.owner = Some(writer.owner());
            let analyzer = Arc::new(Analyzer::new(
                channel.clone(),
                self.config.receiver.location()?,
                params,
            ));
            self.analyze_range(request, &analyzer, &writer, &mut summary)
                .await?;
            if request.seal {
                writer.seal().await?;
            }
        }

        let series = self
            .store
            .load(
                &channel.name,
                &request.target_version,
                self.config.series.staleness_window_s(),
            )
            .await?;
        summary.grades = series.grade_distribution_in(
            minute_floor(request.start as f64) as f64,
            request.end as f64,
        );

        if request.phases.products() {
            let generator =
                ProductGenerator::new(&self.data_root, self.config.product.decimation_factor)?;
            let channel_name = channel.name.clone();
            let (start, end) = (request.start, request.end);
            let range = tokio::task::spawn_blocking(move || {
                generator.generate_range(&channel_name, &series, start, end)
            })
            .await
            .map_err(|e| Error::Internal(format!("Product worker failed: {}", e)))??;
            summary.products = Some(range);
        }

        info!(
            channel = %summary.channel,
            version = %summary.version,
            analyzed = summary.minutes_analyzed,
            skipped = summary.minutes_skipped,
            unreadable = summary.unreadable,
            x_grade = summary.x_grade,
            fraction_ab = summary.grades.fraction_ab(),
            "Reprocessing complete"
        );
        Ok(summary)
    }

    async fn analyze_range(
        &self,
        request: &ReprocessRequest,
        analyzer: &Arc<Analyzer>,
        writer: &SeriesWriter,
        summary: &mut ReprocessSummary,
    ) -> Result<()> {
        let channel = writer.channel().to_string();
        let first = minute_floor(request.start as f64);
        let recorded: BTreeSet<i64> = self
            .store
            .minutes_recorded(&channel, writer.version(), first, request.end)
            .await?
            .into_iter()
            .collect();

        for minute_start in request.minutes() {
            if recorded.contains(&minute_start) {
                summary.minutes_skipped += 1;
                continue;
            }
            if !self.reader.has_minute(&channel, minute_start) {
                debug!(channel = %channel, minute_start, "Not archived");
                summary.not_archived += 1;
                continue;
            }

            let reader = self.reader.clone();
            let worker = Arc::clone(analyzer);
            let name = channel.clone();
            let result = tokio::task::spawn_blocking(move || {
                let window = load_window(&reader, &name, minute_start, worker.pre_margin_s())?;
                Ok::<_, Error>(worker.analyze(&window))
            })
            .await
            .map_err(|e| Error::Internal(format!("Analysis worker failed: {}", e)))?;
            let analysis = match result {
                Ok(analysis) => analysis,
                Err(e) => {
                    if e.severity() == Severity::Alert {
                        error!(channel = %channel, minute_start, "Minute unreadable: {}", e);
                    } else {
                        warn!(channel = %channel, minute_start, "Minute unreadable: {}", e);
                    }
                    summary.unreadable += 1;
                    MinuteAnalysis::unreadable(minute_start, &e)
                }
            };

            if let Some(reason) = &analysis.failure {
                warn!(channel = %channel, minute_start, "X-grade minute: {}", reason);
            }
            if analysis.measurement.quality_grade == QualityGrade::X {
                summary.x_grade += 1;
            }
            let record = analysis.discrimination_record(&channel, writer.version());
            writer.append_minute(&analysis.measurement, &record).await?;
            summary.minutes_analyzed += 1;
        }
        Ok(())
    }
}

//! SQLite persistence for offset series
//!
//! Measurement and discrimination rows are only ever INSERTed. Writing to a
//! (channel, version) requires a claim; the claim's owner token is checked
//! inside the same transaction as every append, so two writers can never
//! interleave rows in one version.

use super::ClockOffsetSeries;
use hfts_common::db::{init_database, init_memory_database};
use hfts_common::model::{
    ClockOffsetMeasurement, Confidence, DiscriminationRecord, DominantStation, PropagationMode,
    QualityGrade, Station,
};
use hfts_common::{Error, Result};
use serde::Serialize;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

/// Catalogue entry for one series version
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesVersionInfo {
    pub channel: String,
    pub version: String,
    pub owner: String,
    pub parameters: serde_json::Value,
    pub created_at: String,
    pub sealed: bool,
    pub measurement_count: i64,
}

type MeasurementRow = (
    f64,
    f64,
    f64,
    Option<String>,
    Option<String>,
    String,
    Option<f64>,
    String,
    Option<f64>,
    i64,
);

fn measurement_from_row(row: MeasurementRow) -> Result<ClockOffsetMeasurement> {
    let (
        system_time,
        utc_time,
        clock_offset_ms,
        station,
        propagation_mode,
        confidence,
        uncertainty_ms,
        quality_grade,
        snr_db,
        verified,
    ) = row;
    let corrupt = |what: &str, value: &str| {
        Error::Internal(format!("Unrecognised {} '{}' in offset_measurements", what, value))
    };
    Ok(ClockOffsetMeasurement {
        system_time,
        utc_time,
        clock_offset_ms,
        station: match station {
            Some(s) => Some(Station::parse(&s).ok_or_else(|| corrupt("station", &s))?),
            None => None,
        },
        propagation_mode: match propagation_mode {
            Some(p) => Some(PropagationMode::parse(&p).ok_or_else(|| corrupt("mode", &p))?),
            None => None,
        },
        confidence: Confidence::parse(&confidence)
            .ok_or_else(|| corrupt("confidence", &confidence))?,
        uncertainty_ms,
        quality_grade: QualityGrade::parse(&quality_grade)
            .ok_or_else(|| corrupt("grade", &quality_grade))?,
        snr_db,
        verified: verified != 0,
    })
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|d| d.is_unique_violation())
        .unwrap_or(false)
}

/// Handle on the series database
#[derive(Clone)]
pub struct SeriesStore {
    pool: SqlitePool,
}

impl SeriesStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(db_path: &Path) -> Result<Self> {
        Ok(Self::new(init_database(db_path).await?))
    }

    pub async fn in_memory() -> Result<Self> {
        Ok(Self::new(init_memory_database().await?))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Claim a version with a fresh owner token
    pub async fn claim(&self, channel: &str, version: &str, parameters: &str) -> Result<SeriesWriter> {
        self.claim_as(channel, version, Uuid::new_v4(), parameters)
            .await
    }

    /// Claim (or resume) a version as `owner`
    ///
    /// Resuming with the original token is allowed so a restarted writer can
    /// continue its own series. Any other token, or a sealed version, is a
    /// [`Error::VersionConflict`].
    pub async fn claim_as(
        &self,
        channel: &str,
        version: &str,
        owner: Uuid,
        parameters: &str,
    ) -> Result<SeriesWriter> {
        let mut tx = self.pool.begin().await?;
        let existing: Option<(String, i64)> = sqlx::query_as(
            "SELECT owner, sealed FROM series_versions WHERE channel = ? AND version = ?",
        )
        .bind(channel)
        .bind(version)
        .fetch_optional(&mut *tx)
        .await?;

        match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO series_versions (channel, version, owner, parameters)
                    VALUES (?, ?, ?, ?)
                    "#,
                )
                .bind(channel)
                .bind(version)
                .bind(owner.to_string())
                .bind(parameters)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        Error::VersionConflict(format!("{}/{} claimed concurrently", channel, version))
                    } else {
                        Error::Database(e)
                    }
                })?;
                info!(channel, version, owner = %owner, "Claimed new series version");
            }
            Some((_, sealed)) if sealed != 0 => {
                return Err(Error::VersionConflict(format!(
                    "{}/{} is sealed",
                    channel, version
                )));
            }
            Some((existing_owner, _)) if existing_owner != owner.to_string() => {
                return Err(Error::VersionConflict(format!(
                    "{}/{} is owned by another writer",
                    channel, version
                )));
            }
            Some(_) => {
                info!(channel, version, owner = %owner, "Resumed series version");
            }
        }
        tx.commit().await?;

        Ok(SeriesWriter {
            store: self.clone(),
            channel: channel.to_string(),
            version: version.to_string(),
            owner,
        })
    }

    pub async fn version_exists(&self, channel: &str, version: &str) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM series_versions WHERE channel = ? AND version = ?")
                .bind(channel)
                .bind(version)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    /// All versions for a channel, oldest first
    pub async fn versions(&self, channel: &str) -> Result<Vec<SeriesVersionInfo>> {
        let rows: Vec<(String, String, String, String, String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT v.channel, v.version, v.owner, v.parameters, v.created_at, v.sealed,
                   (SELECT COUNT(*) FROM offset_measurements m
                    WHERE m.channel = v.channel AND m.version = v.version)
            FROM series_versions v
            WHERE v.channel = ?
            ORDER BY v.created_at, v.version
            "#,
        )
        .bind(channel)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(
                |(channel, version, owner, parameters, created_at, sealed, count)| {
                    Ok(SeriesVersionInfo {
                        channel,
                        version,
                        owner,
                        parameters: serde_json::from_str(&parameters)?,
                        created_at,
                        sealed: sealed != 0,
                        measurement_count: count,
                    })
                },
            )
            .collect()
    }

    /// Measurements of one version in UTC order
    pub async fn measurements(
        &self,
        channel: &str,
        version: &str,
    ) -> Result<Vec<ClockOffsetMeasurement>> {
        let rows: Vec<MeasurementRow> = sqlx::query_as(
            r#"
            SELECT system_time, utc_time, clock_offset_ms, station, propagation_mode,
                   confidence, uncertainty_ms, quality_grade, snr_db, verified
            FROM offset_measurements
            WHERE channel = ? AND version = ?
            ORDER BY utc_time
            "#,
        )
        .bind(channel)
        .bind(version)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(measurement_from_row).collect()
    }

    /// Load a version for lookups
    pub async fn load(
        &self,
        channel: &str,
        version: &str,
        staleness_window_s: f64,
    ) -> Result<ClockOffsetSeries> {
        if !self.version_exists(channel, version).await? {
            return Err(Error::DataUnavailable(format!(
                "No offset series {}/{}",
                channel, version
            )));
        }
        let measurements = self.measurements(channel, version).await?;
        debug!(channel, version, count = measurements.len(), "Loaded offset series");
        ClockOffsetSeries::from_measurements(channel, version, staleness_window_s, measurements)
    }

    /// UTC minutes already recorded in `[start, end)`
    pub async fn minutes_recorded(
        &self,
        channel: &str,
        version: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<i64>> {
        let rows: Vec<(f64,)> = sqlx::query_as(
            r#"
            SELECT utc_time FROM offset_measurements
            WHERE channel = ? AND version = ? AND utc_time >= ? AND utc_time < ?
            ORDER BY utc_time
            "#,
        )
        .bind(channel)
        .bind(version)
        .bind(start as f64)
        .bind(end as f64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(t,)| t.round() as i64).collect())
    }

    pub async fn load_discrimination(
        &self,
        channel: &str,
        version: &str,
    ) -> Result<Vec<DiscriminationRecord>> {
        let rows: Vec<(i64, String, String, f64, String)> = sqlx::query_as(
            r#"
            SELECT minute_utc, dominant_station, confidence, margin_db, evidence
            FROM discrimination_records
            WHERE channel = ? AND version = ?
            ORDER BY minute_utc
            "#,
        )
        .bind(channel)
        .bind(version)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(minute_utc, dominant, confidence, margin_db, evidence)| {
                let dominant_station: DominantStation =
                    serde_json::from_value(serde_json::Value::String(dominant))?;
                Ok(DiscriminationRecord {
                    channel: channel.to_string(),
                    version: version.to_string(),
                    minute_utc,
                    dominant_station,
                    confidence: Confidence::parse(&confidence).ok_or_else(|| {
                        Error::Internal(format!("Unrecognised confidence '{}'", confidence))
                    })?,
                    margin_db,
                    evidence: serde_json::from_str(&evidence)?,
                })
            })
            .collect()
    }

    /// Write measurements and discrimination records as JSON lines
    ///
    /// Each line carries a `record` tag (`measurement` or `discrimination`).
    /// Returns the number of lines written.
    pub async fn export_jsonl<W: Write>(
        &self,
        channel: &str,
        version: &str,
        out: &mut W,
    ) -> Result<usize> {
        let mut lines = 0;
        for m in self.measurements(channel, version).await? {
            let mut value = serde_json::to_value(&m)?;
            if let serde_json::Value::Object(map) = &mut value {
                map.insert("record".into(), "measurement".into());
                map.insert("channel".into(), channel.into());
                map.insert("version".into(), version.into());
            }
            serde_json::to_writer(&mut *out, &value)?;
            out.write_all(b"\n")?;
            lines += 1;
        }
        for r in self.load_discrimination(channel, version).await? {
            let mut value = serde_json::to_value(&r)?;
            if let serde_json::Value::Object(map) = &mut value {
                map.insert("record".into(), "discrimination".into());
            }
            serde_json::to_writer(&mut *out, &value)?;
            out.write_all(b"\n")?;
            lines += 1;
        }
        Ok(lines)
    }
}

/// Exclusive append handle for one (channel, version)
pub struct SeriesWriter {
    store: SeriesStore,
    channel: String,
    version: String,
    owner: Uuid,
}

impl SeriesWriter {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    pub fn store(&self) -> &SeriesStore {
        &self.store
    }

    async fn check_claim(&self, tx: &mut Transaction<'_, Sqlite>) -> Result<()> {
        let row: Option<(String, i64)> = sqlx::query_as(
            "SELECT owner, sealed FROM series_versions WHERE channel = ? AND version = ?",
        )
        .bind(&self.channel)
        .bind(&self.version)
        .fetch_optional(&mut **tx)
        .await?;
        match row {
            Some((owner, 0)) if owner == self.owner.to_string() => Ok(()),
            Some((_, 0)) => Err(Error::VersionConflict(format!(
                "{}/{} is owned by another writer",
                self.channel, self.version
            ))),
            Some(_) => Err(Error::VersionConflict(format!(
                "{}/{} is sealed",
                self.channel, self.version
            ))),
            None => Err(Error::VersionConflict(format!(
                "{}/{} was never claimed",
                self.channel, self.version
            ))),
        }
    }

    async fn insert_measurement(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        m: &ClockOffsetMeasurement,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO offset_measurements (
                channel, version, system_time, utc_time, clock_offset_ms, station,
                propagation_mode, confidence, uncertainty_ms, quality_grade, snr_db, verified
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&self.channel)
        .bind(&self.version)
        .bind(m.system_time)
        .bind(m.utc_time)
        .bind(m.clock_offset_ms)
        .bind(m.station.map(|s| s.as_str()))
        .bind(m.propagation_mode.map(|p| p.as_str()))
        .bind(m.confidence.as_str())
        .bind(m.uncertainty_ms.filter(|u| u.is_finite()))
        .bind(m.quality_grade.as_str())
        .bind(m.snr_db.filter(|s| s.is_finite()))
        .bind(m.verified as i64)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::VersionConflict(format!(
                    "{}/{} already has a measurement for {}",
                    self.channel, self.version, m.utc_time
                ))
            } else {
                Error::Database(e)
            }
        })?;
        Ok(())
    }

    async fn insert_discrimination(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        r: &DiscriminationRecord,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO discrimination_records (
                channel, version, minute_utc, dominant_station, confidence, margin_db, evidence
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&self.channel)
        .bind(&self.version)
        .bind(r.minute_utc)
        .bind(r.dominant_station.as_str())
        .bind(r.confidence.as_str())
        .bind(r.margin_db)
        .bind(serde_json::to_string(&r.evidence)?)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::VersionConflict(format!(
                    "{}/{} already has a discrimination record for {}",
                    self.channel, self.version, r.minute_utc
                ))
            } else {
                Error::Database(e)
            }
        })?;
        Ok(())
    }

    pub async fn append(&self, m: &ClockOffsetMeasurement) -> Result<()> {
        let mut tx = self.store.pool.begin().await?;
        self.check_claim(&mut tx).await?;
        self.insert_measurement(&mut tx, m).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn append_discrimination(&self, r: &DiscriminationRecord) -> Result<()> {
        let mut tx = self.store.pool.begin().await?;
        self.check_claim(&mut tx).await?;
        self.insert_discrimination(&mut tx, r).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Measurement and its discrimination record, atomically
    pub async fn append_minute(
        &self,
        m: &ClockOffsetMeasurement,
        r: &DiscriminationRecord,
    ) -> Result<()> {
        let mut tx = self.store.pool.begin().await?;
        self.check_claim(&mut tx).await?;
        self.insert_measurement(&mut tx, m).await?;
        self.insert_discrimination(&mut tx, r).await?;
        tx.commit().await?;
        debug!(
            channel = %self.channel,
            version = %self.version,
            utc_time = m.utc_time,
            grade = %m.quality_grade,
            "Appended measurement"
        );
        Ok(())
    }

    /// Close the version to further appends
    pub async fn seal(self) -> Result<()> {
        let mut tx = self.store.pool.begin().await?;
        self.check_claim(&mut tx).await?;
        sqlx::query("UPDATE series_versions SET sealed = 1 WHERE channel = ? AND version = ?")
            .bind(&self.channel)
            .bind(&self.version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(channel = %self.channel, version = %self.version, "Sealed series version");
        Ok(())
    }
}

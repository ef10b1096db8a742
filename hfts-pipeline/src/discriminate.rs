//! WWV/WWVH station discrimination
//!
//! Each piece of evidence casts a signed vote in dB-equivalent units
//! (positive favours WWV, negative WWVH). Votes are clamped, weighted by the
//! evidence type's reliability and summed. The verdict is a pure function
//! of the evidence and the configuration: no state, no tie-break toward a
//! preferred station.

use hfts_common::config::DiscriminatorConfig;
use hfts_common::model::{Confidence, DominantStation, Station};
use serde::{Deserialize, Serialize};

/// One contributing observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Evidence {
    /// Minute-marker tone SNRs; a station not detected counts as 0 dB
    ToneSnr {
        wwv_db: Option<f64>,
        wwvh_db: Option<f64>,
    },
    /// BCD correlation amplitudes at the two predicted lags
    BcdAmplitude {
        wwv_amplitude: f64,
        wwvh_amplitude: f64,
        noise: f64,
        ratio_db: Option<f64>,
        valid_windows: usize,
    },
    /// 440 Hz identification tone heard in its scheduled minute
    StationIdTone { station: Station, snr_db: f64 },
    /// Multitone test signal heard in its scheduled minute
    TestSignal {
        station: Station,
        tones_detected: usize,
        tones_evaluated: usize,
    },
    /// 500/600 Hz schedule tone SNRs
    ToneSchedule {
        wwv_db: Option<f64>,
        wwvh_db: Option<f64>,
    },
}

impl Evidence {
    pub fn kind(&self) -> &'static str {
        match self {
            Evidence::ToneSnr { .. } => "tone_snr",
            Evidence::BcdAmplitude { .. } => "bcd_amplitude",
            Evidence::StationIdTone { .. } => "station_id_tone",
            Evidence::TestSignal { .. } => "test_signal",
            Evidence::ToneSchedule { .. } => "tone_schedule",
        }
    }

    /// The same observation with WWV and WWVH exchanged
    pub fn mirrored(&self) -> Evidence {
        let swap = |s: Station| s.counterpart().unwrap_or(s);
        match self.clone() {
            Evidence::ToneSnr { wwv_db, wwvh_db } => Evidence::ToneSnr {
                wwv_db: wwvh_db,
                wwvh_db: wwv_db,
            },
            Evidence::BcdAmplitude {
                wwv_amplitude,
                wwvh_amplitude,
                noise,
                ratio_db,
                valid_windows,
            } => Evidence::BcdAmplitude {
                wwv_amplitude: wwvh_amplitude,
                wwvh_amplitude: wwv_amplitude,
                noise,
                ratio_db: ratio_db.map(|r| -r),
                valid_windows,
            },
            Evidence::StationIdTone { station, snr_db } => Evidence::StationIdTone {
                station: swap(station),
                snr_db,
            },
            Evidence::TestSignal {
                station,
                tones_detected,
                tones_evaluated,
            } => Evidence::TestSignal {
                station: swap(station),
                tones_detected,
                tones_evaluated,
            },
            Evidence::ToneSchedule { wwv_db, wwvh_db } => Evidence::ToneSchedule {
                wwv_db: wwvh_db,
                wwvh_db: wwv_db,
            },
        }
    }

    /// Raw vote in dB and the weight it carries; `None` if unusable
    fn raw_vote(&self, config: &DiscriminatorConfig) -> Option<(f64, f64)> {
        let presence = |station: Station| match station {
            Station::Wwv => Some(config.presence_vote_db),
            Station::Wwvh => Some(-config.presence_vote_db),
            Station::Chu => None,
        };
        match self {
            Evidence::ToneSnr { wwv_db, wwvh_db } => {
                if wwv_db.is_none() && wwvh_db.is_none() {
                    return None;
                }
                Some((
                    wwv_db.unwrap_or(0.0) - wwvh_db.unwrap_or(0.0),
                    config.weight_tone_snr,
                ))
            }
            Evidence::BcdAmplitude {
                ratio_db,
                valid_windows,
                ..
            } => {
                if *valid_windows == 0 {
                    return None;
                }
                ratio_db.map(|r| (r, config.weight_bcd))
            }
            Evidence::StationIdTone { station, .. } => {
                presence(*station).map(|v| (v, config.weight_station_id))
            }
            Evidence::TestSignal {
                station,
                tones_detected,
                tones_evaluated,
            } => {
                if *tones_evaluated == 0 || tones_detected * 2 < *tones_evaluated {
                    return None;
                }
                presence(*station).map(|v| (v, config.weight_test_signal))
            }
            Evidence::ToneSchedule { wwv_db, wwvh_db } => {
                if wwv_db.is_none() && wwvh_db.is_none() {
                    return None;
                }
                Some((
                    wwv_db.unwrap_or(0.0) - wwvh_db.unwrap_or(0.0),
                    config.weight_tone_schedule,
                ))
            }
        }
    }
}

/// A weighted vote as it entered the sum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub kind: String,
    pub raw_db: f64,
    pub clamped_db: f64,
    pub weight: f64,
    pub weighted_db: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscriminationResult {
    pub dominant_station: DominantStation,
    pub confidence: Confidence,
    /// Net weighted vote; positive favours WWV
    pub margin_db: f64,
    pub votes: Vec<Vote>,
    pub evidence: Vec<Evidence>,
}

impl DiscriminationResult {
    /// Verdict for a channel only one station can use
    pub fn single_station(station: Station, confidence: Confidence) -> Self {
        let dominant_station = match station {
            Station::Wwv => DominantStation::Wwv,
            Station::Wwvh => DominantStation::Wwvh,
            Station::Chu => DominantStation::NoEvidence,
        };
        Self {
            dominant_station,
            confidence,
            margin_db: 0.0,
            votes: Vec::new(),
            evidence: Vec::new(),
        }
    }

    pub fn no_evidence() -> Self {
        Self {
            dominant_station: DominantStation::NoEvidence,
            confidence: Confidence::Low,
            margin_db: 0.0,
            votes: Vec::new(),
            evidence: Vec::new(),
        }
    }

    /// Verdict that should widen the uncertainty of the offset
    pub fn is_ambiguous(&self) -> bool {
        matches!(
            self.dominant_station,
            DominantStation::Balanced | DominantStation::NoEvidence
        ) || self.confidence == Confidence::Low
    }

    /// Raw evidence as stored alongside the verdict
    pub fn evidence_json(&self) -> serde_json::Value {
        serde_json::json!({
            "evidence": self.evidence,
            "votes": self.votes,
        })
    }
}

/// Fuse evidence into a verdict
pub fn discriminate(evidence: &[Evidence], config: &DiscriminatorConfig) -> DiscriminationResult {
    let votes: Vec<Vote> = evidence
        .iter()
        .filter_map(|e| {
            let (raw_db, weight) = e.raw_vote(config)?;
            if !raw_db.is_finite() {
                return None;
            }
            let clamped_db = raw_db.clamp(-config.max_vote_db, config.max_vote_db);
            Some(Vote {
                kind: e.kind().to_string(),
                raw_db,
                clamped_db,
                weight,
                weighted_db: clamped_db * weight,
            })
        })
        .collect();

    if votes.is_empty() {
        return DiscriminationResult {
            evidence: evidence.to_vec(),
            ..DiscriminationResult::no_evidence()
        };
    }

    let net: f64 = votes.iter().map(|v| v.weighted_db).sum();
    let threshold = config.dominance_threshold_db;
    let usable = votes.len();

    let (dominant_station, confidence) = if net.abs() < threshold {
        let confidence = if usable >= 3 && net.abs() < threshold / 2.0 {
            Confidence::High
        } else if usable >= 2 {
            Confidence::Medium
        } else {
            Confidence::Low
        };
        (DominantStation::Balanced, confidence)
    } else {
        let sign = net.signum();
        let corroborating = votes
            .iter()
            .filter(|v| {
                // A zero vote leans toward neither station
                v.clamped_db != 0.0
                    && v.clamped_db.signum() == sign
                    && v.clamped_db.abs() >= config.corroboration_min_db
            })
            .count();
        let strong_margin = net.abs() >= 2.0 * threshold;
        let confidence = match (strong_margin, corroborating >= 2) {
            (true, true) => Confidence::High,
            (true, false) | (false, true) => Confidence::Medium,
            (false, false) => Confidence::Low,
        };
        let dominant = if net > 0.0 {
            DominantStation::Wwv
        } else {
            DominantStation::Wwvh
        };
        (dominant, confidence)
    };

    DiscriminationResult {
        dominant_station,
        confidence,
        margin_db: net,
        votes,
        evidence: evidence.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DiscriminatorConfig {
        DiscriminatorConfig::default()
    }

    fn mirror_all(evidence: &[Evidence]) -> Vec<Evidence> {
        evidence.iter().map(Evidence::mirrored).collect()
    }

    #[test]
    fn test_no_evidence_is_none() {
        let result = discriminate(&[], &config());
        assert_eq!(result.dominant_station, DominantStation::NoEvidence);

        let unusable = [Evidence::ToneSnr {
            wwv_db: None,
            wwvh_db: None,
        }];
        let result = discriminate(&unusable, &config());
        assert_eq!(result.dominant_station, DominantStation::NoEvidence);
        assert_eq!(result.evidence.len(), 1);
    }

    #[test]
    fn test_equal_evidence_is_balanced() {
        let evidence = [
            Evidence::ToneSnr {
                wwv_db: Some(20.0),
                wwvh_db: Some(20.0),
            },
            Evidence::ToneSchedule {
                wwv_db: Some(15.0),
                wwvh_db: Some(15.0),
            },
            Evidence::BcdAmplitude {
                wwv_amplitude: 1.0,
                wwvh_amplitude: 1.0,
                noise: 0.1,
                ratio_db: Some(0.0),
                valid_windows: 40,
            },
        ];
        let result = discriminate(&evidence, &config());
        assert_eq!(result.dominant_station, DominantStation::Balanced);
        assert_eq!(result.confidence, Confidence::High);
    }

    #[test]
    fn test_strong_corroborated_wwv() {
        let evidence = [
            Evidence::ToneSnr {
                wwv_db: Some(30.0),
                wwvh_db: Some(8.0),
            },
            Evidence::BcdAmplitude {
                wwv_amplitude: 4.0,
                wwvh_amplitude: 0.5,
                noise: 0.2,
                ratio_db: Some(16.0),
                valid_windows: 44,
            },
        ];
        let result = discriminate(&evidence, &config());
        assert_eq!(result.dominant_station, DominantStation::Wwv);
        assert_eq!(result.confidence, Confidence::High);
        assert!(result.margin_db > 6.0);
    }

    #[test]
    fn test_votes_are_clamped() {
        let evidence = [Evidence::ToneSnr {
            wwv_db: Some(80.0),
            wwvh_db: None,
        }];
        let result = discriminate(&evidence, &config());
        assert_eq!(result.votes[0].clamped_db, 20.0);
        assert_eq!(result.margin_db, 20.0);
        // Large margin but a single source
        assert_eq!(result.confidence, Confidence::Medium);
    }

    #[test]
    fn test_missing_station_snr_counts_as_zero() {
        let evidence = [Evidence::ToneSnr {
            wwv_db: None,
            wwvh_db: Some(9.0),
        }];
        let result = discriminate(&evidence, &config());
        assert_eq!(result.dominant_station, DominantStation::Wwvh);
        assert_eq!(result.margin_db, -9.0);
    }

    #[test]
    fn test_swapping_evidence_flips_verdict_and_keeps_confidence() {
        let cases: Vec<Vec<Evidence>> = vec![
            vec![
                Evidence::ToneSnr {
                    wwv_db: Some(25.0),
                    wwvh_db: Some(10.0),
                },
                Evidence::StationIdTone {
                    station: Station::Wwvh,
                    snr_db: 12.0,
                },
            ],
            vec![
                Evidence::ToneSnr {
                    wwv_db: Some(7.0),
                    wwvh_db: None,
                },
                Evidence::TestSignal {
                    station: Station::Wwv,
                    tones_detected: 3,
                    tones_evaluated: 4,
                },
                Evidence::ToneSchedule {
                    wwv_db: Some(3.0),
                    wwvh_db: Some(11.0),
                },
            ],
            vec![Evidence::BcdAmplitude {
                wwv_amplitude: 1.0,
                wwvh_amplitude: 1.4,
                noise: 0.1,
                ratio_db: Some(-2.6),
                valid_windows: 30,
            }],
        ];

        for evidence in cases {
            let original = discriminate(&evidence, &config());
            let swapped = discriminate(&mirror_all(&evidence), &config());
            assert_eq!(
                swapped.dominant_station,
                original.dominant_station.mirrored(),
                "{:?}",
                evidence
            );
            assert_eq!(swapped.confidence, original.confidence);
            assert!((swapped.margin_db + original.margin_db).abs() < 1e-9);
        }
    }

    #[test]
    fn test_zero_vote_never_corroborates() {
        let config = DiscriminatorConfig {
            corroboration_min_db: 0.0,
            ..config()
        };
        let evidence = vec![
            Evidence::ToneSnr {
                wwv_db: Some(14.0),
                wwvh_db: Some(10.0),
            },
            Evidence::ToneSchedule {
                wwv_db: Some(15.0),
                wwvh_db: Some(15.0),
            },
        ];
        let original = discriminate(&evidence, &config);
        let swapped = discriminate(&mirror_all(&evidence), &config);
        assert_eq!(original.dominant_station, DominantStation::Wwv);
        assert_eq!(swapped.dominant_station, DominantStation::Wwvh);
        assert_eq!(original.confidence, Confidence::Low);
        assert_eq!(swapped.confidence, original.confidence);
    }

    #[test]
    fn test_chu_presence_is_ignored() {
        let evidence = [Evidence::StationIdTone {
            station: Station::Chu,
            snr_db: 30.0,
        }];
        let result = discriminate(&evidence, &config());
        assert_eq!(result.dominant_station, DominantStation::NoEvidence);
    }
}

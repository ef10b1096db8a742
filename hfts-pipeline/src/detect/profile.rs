//! Per-station broadcast format

use hfts_common::model::Station;

/// Timing-signal layout of one transmitter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StationProfile {
    pub station: Station,
    /// Marker and tick tone frequency
    pub tone_hz: f64,
    /// Minute marker length in seconds
    pub marker_s: f64,
    /// Second tick length in seconds
    pub tick_s: f64,
    /// Seconds without a tick
    pub skipped_ticks: &'static [u32],
    /// Minute-of-hour carrying the 440 Hz identification tone
    pub station_id_minute: Option<u32>,
    /// Minute-of-hour carrying the multitone test signal
    pub test_signal_minute: Option<u32>,
    /// Broadcasts the WWV-format 100 Hz time code
    pub has_bcd: bool,
}

const WWV_SKIPPED: [u32; 2] = [29, 59];
const CHU_SKIPPED: [u32; 10] = [29, 51, 52, 53, 54, 55, 56, 57, 58, 59];

impl StationProfile {
    pub fn for_station(station: Station) -> StationProfile {
        match station {
            Station::Wwv => StationProfile {
                station,
                tone_hz: 1000.0,
                marker_s: 0.8,
                tick_s: 0.005,
                skipped_ticks: &WWV_SKIPPED,
                station_id_minute: Some(2),
                test_signal_minute: Some(8),
                has_bcd: true,
            },
            Station::Wwvh => StationProfile {
                station,
                tone_hz: 1200.0,
                marker_s: 0.8,
                tick_s: 0.005,
                skipped_ticks: &WWV_SKIPPED,
                station_id_minute: Some(1),
                test_signal_minute: Some(44),
                has_bcd: true,
            },
            Station::Chu => StationProfile {
                station,
                tone_hz: 1000.0,
                marker_s: 0.5,
                tick_s: 0.3,
                skipped_ticks: &CHU_SKIPPED,
                station_id_minute: None,
                test_signal_minute: None,
                has_bcd: false,
            },
        }
    }

    /// Seconds 1..=59 that carry a tick
    pub fn tick_seconds(&self) -> impl Iterator<Item = u32> + '_ {
        (1..60).filter(move |s| !self.skipped_ticks.contains(s))
    }

    /// Scheduled steady tone for a minute (WWV 500 Hz even / 600 Hz odd,
    /// WWVH the other way round); `None` in minutes without a schedule tone
    pub fn schedule_tone_hz(&self, minute_of_hour: u32) -> Option<f64> {
        if schedule_excluded(minute_of_hour) {
            return None;
        }
        let even = minute_of_hour % 2 == 0;
        match (self.station, even) {
            (Station::Wwv, true) | (Station::Wwvh, false) => Some(500.0),
            (Station::Wwv, false) | (Station::Wwvh, true) => Some(600.0),
            (Station::Chu, _) => None,
        }
    }
}

/// Minutes where the 500/600 Hz schedule gives no station evidence
pub fn schedule_excluded(minute_of_hour: u32) -> bool {
    matches!(minute_of_hour, 0 | 1 | 2 | 8 | 29 | 30 | 43..=51 | 59)
}

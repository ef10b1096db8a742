//! Receiver and transmitter geometry
//!
//! Receiver position comes from a Maidenhead grid square (centre of the
//! square or subsquare). Distances are great-circle on a spherical earth.

use crate::model::Station;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Mean earth radius used throughout the propagation model
pub const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Degrees north
    pub latitude: f64,
    /// Degrees east
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Haversine great-circle distance in km
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = lat2 - lat1;
        let dlon = (other.longitude - self.longitude).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
    }
}

/// Nominal transmitter sites
pub fn transmitter_location(station: Station) -> GeoPoint {
    match station {
        // Fort Collins, Colorado
        Station::Wwv => GeoPoint::new(40.6781, -105.0469),
        // Kekaha, Kauai, Hawaii
        Station::Wwvh => GeoPoint::new(21.9871, -159.7627),
        // Ottawa, Ontario
        Station::Chu => GeoPoint::new(45.2950, -75.7581),
    }
}

/// Centre of a 4- or 6-character Maidenhead locator
pub fn grid_square_to_point(grid: &str) -> Result<GeoPoint> {
    let chars: Vec<char> = grid.trim().chars().collect();
    if chars.len() != 4 && chars.len() != 6 {
        return Err(Error::Config(format!(
            "Grid square must have 4 or 6 characters: {:?}",
            grid
        )));
    }

    let field = |c: char| -> Result<f64> {
        let c = c.to_ascii_uppercase();
        if ('A'..='R').contains(&c) {
            Ok((c as u8 - b'A') as f64)
        } else {
            Err(Error::Config(format!("Invalid grid field letter {:?} in {}", c, grid)))
        }
    };
    let digit = |c: char| -> Result<f64> {
        c.to_digit(10)
            .map(|d| d as f64)
            .ok_or_else(|| Error::Config(format!("Invalid grid digit {:?} in {}", c, grid)))
    };
    let subsquare = |c: char| -> Result<f64> {
        let c = c.to_ascii_lowercase();
        if ('a'..='x').contains(&c) {
            Ok((c as u8 - b'a') as f64)
        } else {
            Err(Error::Config(format!("Invalid grid subsquare {:?} in {}", c, grid)))
        }
    };

    let mut longitude = field(chars[0])? * 20.0 - 180.0 + digit(chars[2])? * 2.0;
    let mut latitude = field(chars[1])? * 10.0 - 90.0 + digit(chars[3])?;

    if chars.len() == 6 {
        longitude += subsquare(chars[4])? * (2.0 / 24.0) + 1.0 / 24.0;
        latitude += subsquare(chars[5])? * (1.0 / 24.0) + 1.0 / 48.0;
    } else {
        longitude += 1.0;
        latitude += 0.5;
    }

    Ok(GeoPoint::new(latitude, longitude))
}

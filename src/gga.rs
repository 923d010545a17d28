//! NMEA GGA position reports
//!
//! Casters serving network RTK solutions need the rover position, sent
//! upstream as a GGA sentence (see [NtripClient::send_gga](crate::NtripClient::send_gga)).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use geoutils::Location;
use strum::Display;

/// GGA fix quality indicator
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum FixQuality {
    Invalid = 0,
    #[default]
    Gps = 1,
    Dgps = 2,
    Pps = 3,
    RtkFixed = 4,
    RtkFloat = 5,
    Estimated = 6,
}

/// GGA sentence builder
#[derive(Clone, PartialEq, Debug)]
pub struct GgaSentence {
    pub location: Location,
    /// Altitude above mean sea level, metres
    pub altitude: f64,
    pub satellites: u8,
    pub fix: FixQuality,
    pub hdop: f32,
    /// UTC time of day
    pub time: Duration,
}

impl GgaSentence {
    /// Creates a GGA report for `location` stamped with the current UTC time
    pub fn new(location: Location) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();

        Self {
            location,
            altitude: 0.0,
            satellites: 12,
            fix: FixQuality::Gps,
            hdop: 1.0,
            time: Duration::from_millis((now.as_millis() % 86_400_000) as u64),
        }
    }

    pub fn with_altitude(mut self, altitude: f64) -> Self {
        self.altitude = altitude;
        self
    }

    pub fn with_satellites(mut self, satellites: u8) -> Self {
        self.satellites = satellites;
        self
    }

    pub fn with_fix(mut self, fix: FixQuality) -> Self {
        self.fix = fix;
        self
    }

    pub fn with_hdop(mut self, hdop: f32) -> Self {
        self.hdop = hdop;
        self
    }

    pub fn with_time(mut self, time: Duration) -> Self {
        self.time = time;
        self
    }

    /// Renders `$GPGGA,...*CS\r\n`
    pub fn to_sentence(&self) -> String {
        let secs = self.time.as_secs() % 86_400;
        let centis = self.time.subsec_millis() / 10;

        let (lat, ns) = angle(self.location.latitude(), 2, 'N', 'S');
        let (lon, ew) = angle(self.location.longitude(), 3, 'E', 'W');

        let body = format!(
            "GPGGA,{:02}{:02}{:02}.{:02},{},{},{},{},{},{:02},{:.2},{:.1},M,0.0,M,,",
            secs / 3600,
            (secs / 60) % 60,
            secs % 60,
            centis,
            lat,
            ns,
            lon,
            ew,
            self.fix as u8,
            self.satellites,
            self.hdop,
            self.altitude,
        );

        format!("${}*{:02X}\r\n", body, checksum(&body))
    }
}

/// XOR of every byte between `$` and `*`
pub fn checksum(body: &str) -> u8 {
    body.bytes().fold(0, |acc, b| acc ^ b)
}

/// Formats decimal degrees as `d..dmm.mmmmm` with a hemisphere letter
fn angle(degrees: f64, width: usize, pos: char, neg: char) -> (String, char) {
    // Work in 1e-5 minutes so rounding never produces 60 minutes
    let units = (degrees.abs() * 60.0 * 100_000.0).round() as u64;
    let deg = units / 6_000_000;
    let minutes = units % 6_000_000;

    let hemisphere = if degrees < 0.0 { neg } else { pos };

    (
        format!(
            "{:0width$}{:02}.{:05}",
            deg,
            minutes / 100_000,
            minutes % 100_000,
            width = width
        ),
        hemisphere,
    )
}

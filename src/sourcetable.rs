//! Caster source tables
//!
//! A caster answers a request for `/` with its source table: a few HTTP
//! style header lines followed by `STR` (stream), `CAS` (caster) and `NET`
//! records and a closing `ENDSOURCETABLE`.

use std::str::FromStr;

use geoutils::Location;
use isocountry::CountryCode;
use reqwest::Method;
use strum::{Display, EnumString, VariantNames};
use tracing::{debug, warn};

use crate::{config::NtripConfig, credentials::NtripCredentials, ClientError};

/// Parsed caster source table
#[derive(Clone, PartialEq, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SourceTable {
    pub server: Option<String>,
    pub date: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<usize>,

    pub streams: Vec<Stream>,
    pub casters: Vec<Caster>,

    /// Set once `ENDSOURCETABLE` was seen
    pub complete: bool,
}

/// `STR` record describing one mountpoint
#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Stream {
    pub mountpoint: String,
    pub identifier: String,
    pub format: Format,
    pub format_details: Vec<String>,
    pub carrier: Carrier,
    pub nav_systems: Vec<Constellation>,
    pub network: String,
    pub country: Option<CountryCode>,
    pub location: Location,
    /// Client must send NMEA GGA sentences
    pub nmea: bool,
    /// Network (rather than single base) solution
    pub network_solution: bool,
    pub generator: String,
    pub authentication: Authentication,
    pub fee: bool,
    pub bitrate: Option<u32>,
}

/// `CAS` record describing another caster
#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Caster {
    pub host: String,
    pub port: u16,
    pub identifier: String,
    pub operator: String,
    pub nmea: bool,
    pub country: Option<CountryCode>,
    pub location: Location,
}

/// Stream data formats
#[derive(Clone, PartialEq, Debug, EnumString, Display, VariantNames)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Format {
    #[strum(serialize = "RTCM 2.3")]
    Rtcm2_3,
    #[strum(serialize = "RTCM 3")]
    Rtcm3,
    #[strum(serialize = "RTCM 3.0")]
    Rtcm3_0,
    #[strum(serialize = "RTCM 3.1")]
    Rtcm3_1,
    #[strum(serialize = "RTCM 3.2")]
    Rtcm3_2,
    #[strum(serialize = "RTCM 3.3")]
    Rtcm3_3,
    #[strum(serialize = "SPARTN")]
    Spartn,
    #[strum(serialize = "RAW")]
    Raw,
    #[strum(serialize = "CMRx")]
    CMRx,
    #[strum(serialize = "UNKNOWN")]
    Unknown,
}

/// Carrier phase content
#[derive(Clone, Copy, PartialEq, Debug, Default, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Carrier {
    #[default]
    None,
    L1,
    L1L2,
}

impl Carrier {
    fn parse(s: &str) -> Self {
        match s.trim() {
            "1" => Carrier::L1,
            "2" => Carrier::L1L2,
            _ => Carrier::None,
        }
    }
}

/// GNSS constellations
#[derive(Clone, PartialEq, Debug, EnumString, Display, VariantNames)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Constellation {
    #[strum(serialize = "GPS")]
    Gps,
    #[strum(serialize = "GLO", serialize = "GLONASS")]
    Glonass,
    #[strum(serialize = "GAL", serialize = "Galileo")]
    Galileo,
    #[strum(serialize = "BDS", serialize = "BeiDou")]
    BeiDou,
    #[strum(serialize = "QZS", serialize = "QZSS")]
    Qzss,
    #[strum(serialize = "SBAS")]
    Sbas,
    #[strum(serialize = "IRNSS", serialize = "NavIC")]
    Irnss,
    #[strum(serialize = "UNKNOWN")]
    Unknown,
}

/// Stream access control
#[derive(Clone, Copy, PartialEq, Debug, Default, EnumString, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Authentication {
    #[default]
    #[strum(serialize = "N")]
    None,
    #[strum(serialize = "B")]
    Basic,
    #[strum(serialize = "D")]
    Digest,
}

fn flag(field: Option<&&str>) -> bool {
    matches!(field.map(|s| s.trim()), Some("1") | Some("Y"))
}

fn coordinate(field: Option<&&str>) -> f64 {
    field.and_then(|s| s.trim().parse().ok()).unwrap_or(0.0)
}

fn country(field: Option<&&str>) -> Option<CountryCode> {
    field.and_then(|s| CountryCode::for_alpha3(s.trim()).ok())
}

impl SourceTable {
    /// Parses a source table from its lines
    pub fn parse<'a>(lines: impl Iterator<Item = &'a str>) -> Self {
        let mut table = SourceTable::default();

        for line in lines.map(str::trim) {
            if let Some(v) = line.strip_prefix("Server: ") {
                table.server = Some(v.to_string());
            } else if let Some(v) = line.strip_prefix("Date: ") {
                table.date = Some(v.to_string());
            } else if let Some(v) = line.strip_prefix("Content-Type: ") {
                table.content_type = Some(v.to_string());
            } else if let Some(v) = line.strip_prefix("Content-Length: ") {
                table.content_length = v.parse().ok();
            } else if line.starts_with("STR;") {
                match Stream::parse(line) {
                    Some(s) => table.streams.push(s),
                    None => debug!("Skipping STR record: {}", line),
                }
            } else if line.starts_with("CAS;") {
                match Caster::parse(line) {
                    Some(c) => table.casters.push(c),
                    None => debug!("Skipping CAS record: {}", line),
                }
            } else if line.starts_with("ENDSOURCETABLE") {
                table.complete = true;
                break;
            }
        }

        if !table.complete {
            warn!("Source table ended without ENDSOURCETABLE");
        }

        table
    }

    pub fn stream(&self, mountpoint: &str) -> Option<&Stream> {
        self.streams.iter().find(|s| s.mountpoint == mountpoint)
    }

    /// Finds the closest stream within `max_distance` metres of `location`
    pub fn find_nearest(&self, location: &Location, max_distance: f64) -> Option<(&Stream, f64)> {
        self.streams
            .iter()
            .filter_map(|s| {
                let d = s.location.distance_to(location).ok()?.meters();
                debug!("Distance to {}: {:.3} km", s.mountpoint, d / 1000.0);
                Some((s, d))
            })
            .filter(|(_, d)| *d <= max_distance)
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }
}

impl Stream {
    /// Parses an `STR` record
    pub fn parse(record: &str) -> Option<Self> {
        let parts: Vec<&str> = record.trim_end().split(';').collect();
        if parts.len() < 3 || parts[0] != "STR" || parts[1].is_empty() {
            return None;
        }

        let format = parts
            .get(3)
            .and_then(|s| Format::from_str(s.trim()).ok())
            .unwrap_or(Format::Unknown);

        let format_details = parts
            .get(4)
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.split(',').map(|m| m.trim().to_string()).collect())
            .unwrap_or_default();

        let nav_systems = parts
            .get(6)
            .filter(|s| !s.trim().is_empty())
            .map(|s| {
                s.split('+')
                    .map(|c| Constellation::from_str(c.trim()).unwrap_or(Constellation::Unknown))
                    .collect()
            })
            .unwrap_or_default();

        Some(Stream {
            mountpoint: parts[1].to_string(),
            identifier: parts[2].trim().to_string(),
            format,
            format_details,
            carrier: parts.get(5).map(|s| Carrier::parse(s)).unwrap_or_default(),
            nav_systems,
            network: parts.get(7).map(|s| s.trim().to_string()).unwrap_or_default(),
            country: country(parts.get(8)),
            location: Location::new(coordinate(parts.get(9)), coordinate(parts.get(10))),
            nmea: flag(parts.get(11)),
            network_solution: flag(parts.get(12)),
            generator: parts.get(13).map(|s| s.trim().to_string()).unwrap_or_default(),
            authentication: parts
                .get(15)
                .and_then(|s| Authentication::from_str(s.trim()).ok())
                .unwrap_or_default(),
            fee: flag(parts.get(16)),
            bitrate: parts.get(17).and_then(|s| s.trim().parse().ok()),
        })
    }

    /// Whether the caster expects GGA position reports for this stream
    pub fn requires_gga(&self) -> bool {
        self.nmea
    }
}

impl Caster {
    /// Parses a `CAS` record
    pub fn parse(record: &str) -> Option<Self> {
        let parts: Vec<&str> = record.trim_end().split(';').collect();
        if parts.len() < 3 || parts[0] != "CAS" {
            return None;
        }

        Some(Caster {
            host: parts[1].to_string(),
            port: parts[2].trim().parse().ok()?,
            identifier: parts.get(3).map(|s| s.trim().to_string()).unwrap_or_default(),
            operator: parts.get(4).map(|s| s.trim().to_string()).unwrap_or_default(),
            nmea: flag(parts.get(5)),
            country: country(parts.get(6)),
            location: Location::new(coordinate(parts.get(7)), coordinate(parts.get(8))),
        })
    }
}

/// Downloads and parses the source table of the caster in `config`
pub async fn fetch_sourcetable(
    config: &NtripConfig,
    creds: &NtripCredentials,
) -> Result<SourceTable, ClientError> {
    let client = reqwest::Client::builder()
        .http1_ignore_invalid_headers_in_responses(true)
        .http09_responses()
        .user_agent(creds.user_agent.as_str())
        .build()?;

    let proto = if config.use_tls { "https" } else { "http" };
    let url = format!("{}://{}:{}/", proto, config.host, config.port);

    debug!("Fetching source table from {}", url);

    let mut req = client
        .request(Method::GET, &url)
        .header("Ntrip-Version", "Ntrip/2.0");
    if creds.use_auth {
        req = req.basic_auth(&creds.user, Some(&creds.pass));
    }

    let res = client.execute(req.build()?).await?;

    debug!("Source table response: {:?}", res.status());

    if !res.status().is_success() {
        return Err(ClientError::UnexpectedResponse(res.status().to_string()));
    }

    let body = res.text().await?;
    let table = SourceTable::parse(body.lines());

    debug!(
        "Source table lists {} streams, {} casters",
        table.streams.len(),
        table.casters.len()
    );

    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "SOURCETABLE 200 OK\r
Server: NTRIP SNIP/2.0\r
Date: Wed, 26 Jun 2024 12:00:00 GMT\r
Content-Type: text/plain; charset=utf-8\r
Content-Length: 1234\r
\r
CAS;rtk2go.com;2101;RTK2GO;SNIP;0;USA;47.61;-122.33;0.0.0.0;0;http://rtk2go.com\r
STR;warrakam;Is near: Sydney, New South Wales;RTCM 3;1004(1), 1005(10), 1230(30);2;;SNIP;AUS;-36.37;144.46;1;0;SNIP;none;B;N;11740;\r
STR;VargaRTKhr;Is near: Zagreb, Zagreb;RTCM 3.2;1006(1),1033(1),1074(1),1084(1),1094(1),1124(1),1230(1);;GPS+GLO+GAL+BDS;SNIP;HRV;46.44;16.50;0;0;sNTRIP;none;N;N;0;\r
STR;broken\r
ENDSOURCETABLE\r
";

    fn setup_logging() {
        let _ = tracing_subscriber::FmtSubscriber::builder()
            .compact()
            .without_time()
            .with_max_level(tracing::level_filters::LevelFilter::DEBUG)
            .try_init();
    }

    #[test]
    fn parse_stream_record() {
        setup_logging();

        let info = "STR;VargaRTKhr;Is near: Zagreb, Zagreb;RTCM 3.2;1006(1),1033(1),1074(1),1084(1),1094(1),1124(1),1230(1);;GPS+GLO+GAL+BDS;SNIP;HRV;46.44;16.50;1;0;sNTRIP;none;B;N;0;\n";

        let stream = Stream::parse(info).unwrap();

        assert_eq!(stream.mountpoint, "VargaRTKhr");
        assert_eq!(stream.identifier, "Is near: Zagreb, Zagreb");
        assert_eq!(stream.format, Format::Rtcm3_2);
        assert_eq!(stream.format_details.len(), 7);
        assert_eq!(stream.carrier, Carrier::None);
        assert_eq!(
            stream.nav_systems,
            vec![
                Constellation::Gps,
                Constellation::Glonass,
                Constellation::Galileo,
                Constellation::BeiDou
            ]
        );
        assert_eq!(stream.network, "SNIP");
        assert_eq!(stream.country, Some(CountryCode::for_alpha3("HRV").unwrap()));
        assert!((stream.location.latitude() - 46.44).abs() < 0.001);
        assert!((stream.location.longitude() - 16.50).abs() < 0.001);
        assert!(stream.requires_gga());
        assert_eq!(stream.generator, "sNTRIP");
        assert_eq!(stream.authentication, Authentication::Basic);
        assert!(!stream.fee);
        assert_eq!(stream.bitrate, Some(0));
    }

    #[test]
    fn parse_full_table() {
        setup_logging();

        let table = SourceTable::parse(TABLE.lines());

        assert_eq!(table.server.as_deref(), Some("NTRIP SNIP/2.0"));
        assert_eq!(table.content_length, Some(1234));
        assert!(table.complete);

        assert_eq!(table.streams.len(), 2);
        assert_eq!(table.streams[0].carrier, Carrier::L1L2);
        assert!(table.streams[0].requires_gga());
        assert!(!table.stream("VargaRTKhr").unwrap().requires_gga());

        assert_eq!(table.casters.len(), 1);
        assert_eq!(table.casters[0].host, "rtk2go.com");
        assert_eq!(table.casters[0].port, 2101);
        assert_eq!(table.casters[0].identifier, "RTK2GO");
        assert_eq!(table.casters[0].operator, "SNIP");
    }

    #[test]
    fn nearest_stream_within_range() {
        let table = SourceTable::parse(TABLE.lines());

        let zagreb = Location::new(45.81, 15.98);
        let (stream, d) = table.find_nearest(&zagreb, 100_000.0).unwrap();
        assert_eq!(stream.mountpoint, "VargaRTKhr");
        assert!(d < 100_000.0);

        // Nothing within 10 km of Paris
        let paris = Location::new(48.85, 2.35);
        assert!(table.find_nearest(&paris, 10_000.0).is_none());
    }

    #[tokio::test]
    #[ignore = "Requires network access"]
    async fn fetch_rtk2go() {
        setup_logging();

        let config = NtripConfig::from_provider(crate::config::RtcmProvider::Rtk2Go);
        let table = fetch_sourcetable(&config, &NtripCredentials::default())
            .await
            .unwrap();

        assert!(!table.streams.is_empty());
    }
}

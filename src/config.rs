//! Client configuration objects

use std::{str::FromStr, time::Duration};

use strum::{Display, EnumString, VariantNames};

use crate::ClientError;

/// NTRIP (Networked Transport of RTCM via Internet Protocol) configuration
#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NtripConfig {
    /// Host name or IP address of the NTRIP caster
    #[cfg_attr(
        feature = "clap",
        clap(long = "ntrip-host", env = "NTRIP_HOST", default_value = "rtk2go.com")
    )]
    pub host: String,

    /// Port number of the NTRIP caster
    #[cfg_attr(
        feature = "clap",
        clap(long = "ntrip-port", env = "NTRIP_PORT", default_value_t = 2101)
    )]
    pub port: u16,

    /// Mountpoint to request correction data from
    #[cfg_attr(
        feature = "clap",
        clap(long = "ntrip-mount", env = "NTRIP_MOUNT", default_value = "")
    )]
    pub mountpoint: String,

    /// The caster expects periodic GGA position reports
    #[cfg_attr(
        feature = "clap",
        clap(long = "ntrip-gga", env = "NTRIP_GGA", default_value_t = false)
    )]
    pub gga_necessary: bool,

    /// Use TLS / SSL for the NTRIP connection
    #[cfg_attr(
        feature = "clap",
        clap(long = "ntrip-use-tls", env = "NTRIP_USE_TLS", default_value_t = false)
    )]
    pub use_tls: bool,
}

impl Default for NtripConfig {
    /// Builds a default [NtripConfig] ready to connect to [RtcmProvider::Centipede] network.
    /// The network does not requires SSL. No mountpoint is selected.
    fn default() -> Self {
        Self::from_provider(RtcmProvider::Centipede)
    }
}

impl NtripConfig {
    /// Generate a connection URL ("host:port") from the NtripConfig
    pub fn url(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Prepares an [NtripConfig] for one of our predefined [RtcmProvider]s
    pub fn from_provider(network: RtcmProvider) -> Self {
        Self {
            host: network.host().to_string(),
            port: network.port(),
            mountpoint: String::new(),
            gga_necessary: false,
            use_tls: network.uses_tls(),
        }
    }

    /// Copies and returns [NtripConfig] with updated "host" IP address
    pub fn with_host(&self, address: &str) -> Self {
        let mut s = self.clone();
        s.host = address.to_string();
        s
    }

    /// Copies and returns [NtripConfig] with updated port number
    pub fn with_port(&self, port: u16) -> Self {
        let mut s = self.clone();
        s.port = port;
        s
    }

    /// Copies and returns [NtripConfig] with updated mountpoint
    pub fn with_mountpoint(&self, mountpoint: &str) -> Self {
        let mut s = self.clone();
        s.mountpoint = mountpoint.trim_start_matches('/').to_string();
        s
    }

    /// Copies and returns [NtripConfig] announcing whether GGA reports are needed
    pub fn with_gga(&self, necessary: bool) -> Self {
        let mut s = self.clone();
        s.gga_necessary = necessary;
        s
    }

    /// Copies and returns [NtripConfig] with TLS/SSL active
    pub fn with_tls(&self) -> Self {
        let mut s = self.clone();
        s.use_tls = true;
        s
    }

    /// Copies and returns [NtripConfig] without TLS/SSL active
    pub fn without_tls(&self) -> Self {
        let mut s = self.clone();
        s.use_tls = false;
        s
    }

    /// Checks the configuration is complete enough to open a session
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.host.is_empty() {
            return Err(ClientError::InvalidConfig("empty host"));
        }
        if self.port == 0 {
            return Err(ClientError::InvalidPort);
        }
        if self.mountpoint.is_empty() {
            return Err(ClientError::InvalidConfig("empty mountpoint"));
        }
        Ok(())
    }
}

/// Common RTCM data providers
#[derive(Clone, PartialEq, Debug, EnumString, Display, VariantNames)]
pub enum RtcmProvider {
    /// Land Information New Zealand
    ///
    /// Note: requires credentials
    #[strum(serialize = "linz")]
    Linz,
    /// RTK2GO.com free service
    #[strum(serialize = "rtk2go")]
    Rtk2Go,
    /// Positioning Australia
    ///
    /// Note: requires credentials and TLS
    #[strum(serialize = "posau")]
    PosAu,
    /// Centipede FR
    #[strum(serialize = "centipede")]
    Centipede,
}

impl RtcmProvider {
    /// Fetch the hostname for the provider
    pub fn host(&self) -> &str {
        match self {
            RtcmProvider::Linz => "positionz-rt.linz.govt.nz",
            RtcmProvider::Rtk2Go => "rtk2go.com",
            RtcmProvider::PosAu => "ntrip.data.gnss.ga.gov.au",
            RtcmProvider::Centipede => "caster.centipede.fr",
        }
    }

    /// Fetch the TCP port for the provider
    pub fn port(&self) -> u16 {
        match self {
            RtcmProvider::PosAu => 443,
            _ => 2101,
        }
    }

    /// Returns true if this [RtcmProvider] requires TLS/SSL.
    pub fn uses_tls(&self) -> bool {
        matches!(self, RtcmProvider::PosAu)
    }
}

/// Parse an [NtripConfig] from a URL string
///
/// For example:
/// ```
/// # use gnss_correction_client::config::NtripConfig;
///
/// let cfg = "ntrip://rtk2go.com:2101/ARGOACU".parse::<NtripConfig>().unwrap();
///
/// assert_eq!(cfg.host, "rtk2go.com");
/// assert_eq!(cfg.port, 2101);
/// assert_eq!(cfg.mountpoint, "ARGOACU");
/// assert_eq!(cfg.use_tls, false);
/// ```
///
/// This also matches on [RtcmProvider]'s for convenience.
/// ```
/// # use gnss_correction_client::config::NtripConfig;
///
/// let cfg = "linz".parse::<NtripConfig>().unwrap();
///
/// assert_eq!(cfg.host, "positionz-rt.linz.govt.nz");
/// assert_eq!(cfg.port, 2101);
/// assert_eq!(cfg.use_tls, false);
/// ```
impl FromStr for NtripConfig {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(provider) = RtcmProvider::from_str(s) {
            return Ok(NtripConfig::from_provider(provider));
        }

        let (proto, rest) = match s.split_once("://") {
            Some((proto @ ("http" | "https" | "ntrip"), rest)) => (proto, rest),
            Some(_) => return Err(ClientError::InvalidUrl),
            None => ("ntrip", s),
        };

        // Optional "/mountpoint" suffix
        let (authority, mountpoint) = match rest.split_once('/') {
            Some((authority, mount)) => (authority, mount.trim_end_matches('/')),
            None => (rest, ""),
        };

        let (host, port) = match authority.split_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>().map_err(|_| ClientError::InvalidPort)?,
            ),
            None if proto == "https" => (authority, 443),
            None => (authority, 2101),
        };

        if host.is_empty() {
            return Err(ClientError::InvalidUrl);
        }

        Ok(NtripConfig {
            host: host.to_string(),
            port,
            mountpoint: mountpoint.to_string(),
            gga_necessary: false,
            use_tls: proto == "https" || port == 443,
        })
    }
}

/// Publish/subscribe delivery guarantee
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum QoS {
    #[default]
    #[strum(serialize = "0")]
    AtMostOnce,
    #[strum(serialize = "1")]
    AtLeastOnce,
    #[strum(serialize = "2")]
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = ClientError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(ClientError::InvalidQos(other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> u8 {
        qos as u8
    }
}

/// Default chunk capacity of the broker engine inbound buffer
pub const DEFAULT_CHUNK_CAPACITY: usize = 1024;

/// MQTT broker session configuration
#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MqttConfig {
    /// Broker host name or IP address
    #[cfg_attr(feature = "clap", clap(long = "mqtt-host", env = "MQTT_HOST"))]
    pub host: String,

    /// Broker port
    #[cfg_attr(
        feature = "clap",
        clap(long = "mqtt-port", env = "MQTT_PORT", default_value_t = 8883)
    )]
    pub port: u16,

    /// Client identifier presented to the broker
    #[cfg_attr(
        feature = "clap",
        clap(long = "mqtt-client-id", env = "MQTT_CLIENT_ID", default_value = "")
    )]
    pub client_id: String,

    /// Use TLS / SSL for the broker connection
    #[cfg_attr(
        feature = "clap",
        clap(long = "mqtt-use-tls", env = "MQTT_USE_TLS", default_value_t = true)
    )]
    pub use_tls: bool,

    /// Topics carrying correction data
    #[cfg_attr(feature = "clap", clap(long = "mqtt-topic", env = "MQTT_TOPICS"))]
    pub topics: Vec<String>,

    /// Inbound chunk capacity of the broker engine, in bytes
    #[cfg_attr(
        feature = "clap",
        clap(long = "mqtt-chunk-capacity", default_value_t = DEFAULT_CHUNK_CAPACITY)
    )]
    pub chunk_capacity: usize,

    /// Number of chunks the reassembly queue holds
    #[cfg_attr(feature = "clap", clap(long = "mqtt-queue-slots", default_value_t = 8))]
    pub queue_slots: usize,

    /// Hard disconnect when no complete message arrives within the message timeout
    #[cfg_attr(feature = "clap", clap(long = "mqtt-watchdog", default_value_t = false))]
    pub enable_watchdog: bool,

    /// Message watchdog timeout, in seconds
    #[cfg_attr(
        feature = "clap",
        clap(long = "mqtt-message-timeout", default_value_t = 10)
    )]
    pub message_timeout_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 8883,
            client_id: String::new(),
            use_tls: true,
            topics: Vec::new(),
            chunk_capacity: DEFAULT_CHUNK_CAPACITY,
            queue_slots: 8,
            enable_watchdog: false,
            message_timeout_secs: 10,
        }
    }
}

impl MqttConfig {
    /// Creates an [MqttConfig] for the given broker with default tuning
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..Default::default()
        }
    }

    /// Copies and returns [MqttConfig] with updated client identifier
    pub fn with_client_id(&self, client_id: &str) -> Self {
        let mut s = self.clone();
        s.client_id = client_id.to_string();
        s
    }

    /// Copies and returns [MqttConfig] with an additional topic
    pub fn with_topic(&self, topic: &str) -> Self {
        let mut s = self.clone();
        s.topics.push(topic.to_string());
        s
    }

    /// Copies and returns [MqttConfig] with updated queue depth
    pub fn with_queue_slots(&self, slots: usize) -> Self {
        let mut s = self.clone();
        s.queue_slots = slots;
        s
    }

    /// Copies and returns [MqttConfig] with the message watchdog enabled
    pub fn with_watchdog(&self, timeout: Duration) -> Self {
        let mut s = self.clone();
        s.enable_watchdog = true;
        s.message_timeout_secs = timeout.as_secs();
        s
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout_secs)
    }

    /// Checks the configuration before a session is created
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.host.is_empty() {
            return Err(ClientError::InvalidConfig("empty broker host"));
        }
        if self.port == 0 {
            return Err(ClientError::InvalidPort);
        }
        if self.chunk_capacity == 0 {
            return Err(ClientError::InvalidConfig("zero chunk capacity"));
        }
        if self.queue_slots == 0 {
            return Err(ClientError::InvalidConfig("zero queue slots"));
        }
        Ok(())
    }
}

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use serde::{self, Deserialize, Deserializer, Serialize, Serializer};
use toml;

struct Defaults {}

impl Defaults {
    fn listen_address() -> IpAddr {
        IpAddr::from(Ipv4Addr::UNSPECIFIED)
    }

    fn source_port() -> u16 {
        5000
    }

    fn intercept() -> bool {
        false
    }

    fn split_af() -> bool {
        true
    }

    fn heartbeat() -> u64 {
        300
    }

    fn retry_interval() -> u64 {
        30
    }

    fn max_retries() -> u32 {
        10
    }

    fn dial_timeout() -> u64 {
        10
    }

    fn publisher_kind() -> PublisherKind {
        PublisherKind::Log
    }

    fn publisher() -> PublisherSpec {
        PublisherSpec {
            kind: Defaults::publisher_kind(),
            path: None,
        }
    }
}

/// Config (toml) representation of the collector
#[derive(Clone, Debug, Deserialize)]
pub(super) struct ServerConfigSpec {
    // Address & port routers connect to
    #[serde(default = "Defaults::listen_address")]
    pub(super) listen_address: IpAddr,
    #[serde(default = "Defaults::source_port")]
    pub(super) source_port: u16,

    // Local port of the real collector, used in intercept mode
    pub(super) destination_port: Option<u16>,
    // Mirror every message to the destination collector
    #[serde(default = "Defaults::intercept")]
    pub(super) intercept: bool,
    // Publish IPv4 & IPv6 peers on separate topics
    #[serde(default = "Defaults::split_af")]
    pub(super) split_af: bool,

    // Router (host:port) to dial instead of waiting for it to connect
    pub(super) passive_router: Option<String>,
    // Seconds between forced reconnects of the passive connection
    #[serde(default = "Defaults::heartbeat")]
    pub(super) heartbeat: u64,
    // Backoff is `attempt * retry_interval` seconds
    #[serde(default = "Defaults::retry_interval")]
    pub(super) retry_interval: u64,
    #[serde(default = "Defaults::max_retries")]
    pub(super) max_retries: u32,
    #[serde(default = "Defaults::dial_timeout")]
    pub(super) dial_timeout: u64,

    #[serde(default = "Defaults::publisher")]
    pub(super) publisher: PublisherSpec,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct PublisherSpec {
    #[serde(default = "Defaults::publisher_kind")]
    pub(super) kind: PublisherKind,
    // Output file for the JSON publisher, stdout if missing
    pub(super) path: Option<PathBuf>,
}

impl ServerConfigSpec {
    pub(super) fn from_file(path: &str) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Self::parse(&contents)
    }

    pub(super) fn parse(contents: &str) -> io::Result<Self> {
        toml::from_str(contents).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

/// Where parsed records are published
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PublisherKind {
    /// Write each record to the log
    Log,
    /// Write records as JSON lines
    Json,
}

impl fmt::Display for PublisherKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let display = match self {
            PublisherKind::Log => "log",
            PublisherKind::Json => "json",
        };
        write!(f, "{}", display)
    }
}

impl Serialize for PublisherKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PublisherKind {
    fn deserialize<D>(deserializer: D) -> Result<PublisherKind, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.to_lowercase().as_str() {
            "log" => Ok(PublisherKind::Log),
            "json" => Ok(PublisherKind::Json),
            _ => Err(serde::de::Error::custom(format!(
                "Unsupported publisher: '{}'",
                s
            ))),
        }
    }
}

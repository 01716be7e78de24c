mod file;

pub use file::PublisherKind;

use std::io::{self, Error, ErrorKind, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// In-Memory Server representation of the collector config
///   Immutable once the Server is built
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub listen_address: IpAddr,
    pub source_port: u16,
    pub destination_port: Option<u16>,
    pub intercept: bool,
    pub split_af: bool,
    pub heartbeat: Duration,
    pub passive_router: Option<String>,
    pub retry: RetryPolicy,
    pub publisher: PublisherConfig,
}

/// Backoff settings for the passive connection
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Backoff unit, multiplied by the attempt number
    pub interval: Duration,
    pub max_attempts: u32,
    pub dial_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_attempts: 10,
            dial_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PublisherConfig {
    pub kind: PublisherKind,
    pub path: Option<PathBuf>,
}

/// Values given on the command line, applied on top of the config file
#[derive(Debug, Default)]
pub struct ConfigOverrides {
    pub listen_address: Option<IpAddr>,
    pub source_port: Option<u16>,
    pub destination_port: Option<u16>,
    pub intercept: bool,
    pub split_af: Option<bool>,
    pub passive_router: Option<String>,
    pub heartbeat: Option<u64>,
    pub json_path: Option<PathBuf>,
}

impl ServerConfig {
    /// Load from an optional config file, then apply command line overrides
    pub fn load(path: Option<&str>, overrides: ConfigOverrides) -> Result<Self> {
        let mut spec = match path {
            Some(path) => file::ServerConfigSpec::from_file(path)?,
            None => file::ServerConfigSpec::parse("")?,
        };
        if let Some(addr) = overrides.listen_address {
            spec.listen_address = addr;
        }
        if let Some(port) = overrides.source_port {
            spec.source_port = port;
        }
        if let Some(port) = overrides.destination_port {
            spec.destination_port = Some(port);
        }
        if overrides.intercept {
            spec.intercept = true;
        }
        if let Some(split_af) = overrides.split_af {
            spec.split_af = split_af;
        }
        if let Some(router) = overrides.passive_router {
            spec.passive_router = Some(router);
        }
        if let Some(heartbeat) = overrides.heartbeat {
            spec.heartbeat = heartbeat;
        }
        if let Some(path) = overrides.json_path {
            spec.publisher.kind = PublisherKind::Json;
            spec.publisher.path = Some(path);
        }
        Self::from_spec(spec)
    }

    fn from_spec(spec: file::ServerConfigSpec) -> Result<Self> {
        if spec.intercept && spec.destination_port.is_none() {
            return Err(invalid("intercept mode requires a destination_port"));
        }
        if spec.heartbeat == 0 {
            return Err(invalid("heartbeat must be at least 1 second"));
        }
        if spec.max_retries == 0 {
            return Err(invalid("max_retries must be at least 1"));
        }
        let passive_router = spec.passive_router.filter(|r| !r.trim().is_empty());

        Ok(Self {
            listen_address: spec.listen_address,
            source_port: spec.source_port,
            destination_port: spec.destination_port,
            intercept: spec.intercept,
            split_af: spec.split_af,
            heartbeat: Duration::from_secs(spec.heartbeat),
            passive_router,
            retry: RetryPolicy {
                interval: Duration::from_secs(spec.retry_interval),
                max_attempts: spec.max_retries,
                dial_timeout: Duration::from_secs(spec.dial_timeout),
            },
            publisher: PublisherConfig {
                kind: spec.publisher.kind,
                path: spec.publisher.path,
            },
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_address, self.source_port)
    }

    /// Destination collector address, only when intercepting
    pub fn intercept_addr(&self) -> Option<SocketAddr> {
        match (self.intercept, self.destination_port) {
            (true, Some(port)) => Some(SocketAddr::new(IpAddr::from(Ipv4Addr::LOCALHOST), port)),
            _ => None,
        }
    }
}

fn invalid(reason: &str) -> io::Error {
    Error::new(ErrorKind::InvalidInput, reason)
}

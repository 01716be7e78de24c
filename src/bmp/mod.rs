mod codec;
mod peer_header;

pub use codec::{Frame, FrameCodec, FrameError, FrameReader};
pub use peer_header::PeerHeader;

use std::convert::TryFrom;
use std::error;
use std::fmt;

use byteorder::{ByteOrder, NetworkEndian};
use serde::{Serialize, Serializer};

/// The only BMP version accepted on the wire (RFC 7854)
pub const BMP_VERSION: u8 = 3;

/// BMP Common Header
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |    Version    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                        Message Length                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |   Msg. Type   |
/// +---------------+
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CommonHeader {
    pub version: u8,
    /// Total message length, header included
    pub message_length: u32,
    pub message_type: MessageType,
}

impl CommonHeader {
    pub const LENGTH: usize = 6;

    /// Parse the first `CommonHeader::LENGTH` bytes of `buf`
    pub fn parse(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < Self::LENGTH {
            return Err(HeaderError::Truncated(buf.len()));
        }
        let version = buf[0];
        if version != BMP_VERSION {
            return Err(HeaderError::Version(version));
        }
        let message_length = NetworkEndian::read_u32(&buf[1..5]);
        if (message_length as usize) < Self::LENGTH {
            return Err(HeaderError::Length(message_length));
        }
        let message_type = MessageType::try_from(buf[5])?;
        Ok(Self {
            version,
            message_length,
            message_type,
        })
    }

    /// Number of bytes following the common header
    pub fn body_length(&self) -> usize {
        self.message_length as usize - Self::LENGTH
    }

    pub fn encode(&self) -> [u8; 6] {
        let mut buf = [0u8; Self::LENGTH];
        buf[0] = self.version;
        NetworkEndian::write_u32(&mut buf[1..5], self.message_length);
        buf[5] = self.message_type.into();
        buf
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    RouteMonitoring,
    StatisticsReport,
    PeerDown,
    PeerUp,
    Initiation,
    Termination,
    RouteMirroring,
}

impl MessageType {
    /// Message types that carry a Per-Peer Header after the Common Header
    pub fn has_peer_header(self) -> bool {
        !matches!(self, MessageType::Initiation | MessageType::Termination)
    }

    pub fn topic(self) -> &'static str {
        use MessageType::*;
        match self {
            RouteMonitoring => "route_monitoring",
            StatisticsReport => "statistics_report",
            PeerDown => "peer_down",
            PeerUp => "peer_up",
            Initiation => "initiation",
            Termination => "termination",
            RouteMirroring => "route_mirroring",
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = HeaderError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use MessageType::*;
        let message_type = match value {
            0 => RouteMonitoring,
            1 => StatisticsReport,
            2 => PeerDown,
            3 => PeerUp,
            4 => Initiation,
            5 => Termination,
            6 => RouteMirroring,
            _ => return Err(HeaderError::MessageType(value)),
        };
        Ok(message_type)
    }
}

impl From<MessageType> for u8 {
    fn from(message_type: MessageType) -> u8 {
        use MessageType::*;
        match message_type {
            RouteMonitoring => 0,
            StatisticsReport => 1,
            PeerDown => 2,
            PeerUp => 3,
            Initiation => 4,
            Termination => 5,
            RouteMirroring => 6,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use MessageType::*;
        let word = match self {
            RouteMonitoring => "Route Monitoring",
            StatisticsReport => "Statistics Report",
            PeerDown => "Peer Down",
            PeerUp => "Peer Up",
            Initiation => "Initiation",
            Termination => "Termination",
            RouteMirroring => "Route Mirroring",
        };
        write!(f, "{}", word)
    }
}

impl Serialize for MessageType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.topic())
    }
}

#[derive(Debug, PartialEq)]
pub enum HeaderError {
    /// Not enough bytes for a header. [received]
    Truncated(usize),
    /// Unsupported BMP version. [version]
    Version(u8),
    /// Declared length is shorter than the header itself. [length]
    Length(u32),
    /// Unknown message type. [type]
    MessageType(u8),
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Malformed BMP header: ")?;
        match self {
            HeaderError::Truncated(len) => write!(f, "only {} bytes available", len),
            HeaderError::Version(v) => {
                write!(f, "invalid version (expected {}, found {})", BMP_VERSION, v)
            }
            HeaderError::Length(l) => write!(f, "message length {} shorter than header", l),
            HeaderError::MessageType(t) => write!(f, "invalid message type {}", t),
        }
    }
}

impl error::Error for HeaderError {}

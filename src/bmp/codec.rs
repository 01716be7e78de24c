use std::cmp;
use std::error;
use std::fmt;
use std::io;

use bytes::{Buf, Bytes, BytesMut};
use log::{trace, warn};
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, FramedRead};

use super::CommonHeader;

/// Upper bound on a single up-front buffer reservation
const MAX_RESERVE: usize = 64 * 1024;

pub type FrameReader<T> = FramedRead<T, FrameCodec>;

/// A complete BMP message, exactly `header.message_length` bytes
/// with the Common Header as the first bytes
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: CommonHeader,
    pub bytes: Bytes,
}

impl Frame {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn body(&self) -> &[u8] {
        &self.bytes[CommonHeader::LENGTH..]
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

/// Splits a BMP byte stream into `Frame`s
///
/// A header that fails to parse is not fatal: its 6 bytes are dropped
/// and decoding resumes at the next 6 bytes.
#[derive(Debug, Default)]
pub struct FrameCodec {
    // Header of the frame currently waiting on its body
    pending: Option<CommonHeader>,
    skipped: u64,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reader<T: AsyncRead>(stream: T) -> FrameReader<T> {
        FramedRead::new(stream, Self::new())
    }

    /// Count of malformed headers discarded so far
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, FrameError> {
        loop {
            let header = match self.pending {
                Some(header) => header,
                None => {
                    if buf.len() < CommonHeader::LENGTH {
                        return Ok(None);
                    }
                    match CommonHeader::parse(&buf[..CommonHeader::LENGTH]) {
                        Ok(header) => {
                            self.pending = Some(header);
                            header
                        }
                        Err(err) => {
                            warn!("{}, skipping {} bytes", err, CommonHeader::LENGTH);
                            buf.advance(CommonHeader::LENGTH);
                            self.skipped += 1;
                            continue;
                        }
                    }
                }
            };

            let length = header.message_length as usize;
            if buf.len() < length {
                buf.reserve(cmp::min(length - buf.len(), MAX_RESERVE));
                return Ok(None);
            }
            self.pending = None;
            trace!("Framed {} ({} bytes)", header.message_type, length);
            let bytes = buf.split_to(length).freeze();
            return Ok(Some(Frame { header, bytes }));
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, FrameError> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let expected = self
            .pending
            .map(|h| h.message_length as usize)
            .unwrap_or(CommonHeader::LENGTH);
        Err(FrameError::ShortRead {
            expected,
            received: buf.len(),
        })
    }
}

#[derive(Debug)]
pub enum FrameError {
    /// Stream ended inside a message. [expected, received]
    ShortRead { expected: usize, received: usize },
    /// Transport failure while reading
    Io(io::Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FrameError::ShortRead { expected, received } => write!(
                f,
                "Stream closed mid-message ({} of {} bytes)",
                received, expected
            ),
            FrameError::Io(err) => write!(f, "Read failed: {}", err),
        }
    }
}

impl From<io::Error> for FrameError {
    fn from(error: io::Error) -> Self {
        FrameError::Io(error)
    }
}

impl error::Error for FrameError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            FrameError::Io(err) => Some(err),
            _ => None,
        }
    }
}

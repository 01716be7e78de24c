//! Per-connection parse & publish pipeline
//!
//! Every connection worker gets its own `Pipeline`: a parser stage turning
//! framed buffers into `Record`s and a producer stage handing records to the
//! shared `Publisher`. Both stages are fed by single-slot queues so a slow
//! publisher stalls the worker that feeds it, and nothing else.

mod publisher;

pub use publisher::{from_config, JsonPublisher, LogPublisher, PublishError, Publisher};
#[cfg(test)]
pub(crate) use publisher::testing;

use std::error;
use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{error, trace, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::bmp::{CommonHeader, HeaderError, MessageType, PeerHeader};
use crate::session::SessionError;
use crate::utils::serialize_hex;

/// Depth of the intake & record queues
const QUEUE_DEPTH: usize = 1;

/// A framed BMP message, ready for publishing
#[derive(Debug, Clone, Serialize)]
pub struct Record {
    pub collected_at: DateTime<Utc>,
    pub message_type: MessageType,
    pub length: usize,
    pub peer: Option<PeerHeader>,
    #[serde(serialize_with = "serialize_hex")]
    pub raw: Bytes,
}

impl Record {
    pub fn parse(raw: Bytes) -> Result<Self, ParseError> {
        let header = CommonHeader::parse(&raw)?;
        if raw.len() != header.message_length as usize {
            return Err(ParseError::Length(header.message_length, raw.len()));
        }
        let peer = if header.message_type.has_peer_header() {
            Some(PeerHeader::parse(&raw[CommonHeader::LENGTH..]).map_err(ParseError::PeerHeader)?)
        } else {
            None
        };
        Ok(Self {
            collected_at: Utc::now(),
            message_type: header.message_type,
            length: raw.len(),
            peer,
            raw,
        })
    }

    /// Topic to publish on, `bmpd.<type>[_v4|_v6]`
    pub fn topic(&self, split_af: bool) -> String {
        let base = format!("bmpd.{}", self.message_type.topic());
        match (&self.peer, split_af) {
            (Some(peer), true) if peer.is_ipv6() => format!("{}_v6", base),
            (Some(_), true) => format!("{}_v4", base),
            _ => base,
        }
    }
}

#[derive(Debug)]
pub enum ParseError {
    Header(HeaderError),
    /// Declared length doesn't match the buffer. [declared, actual]
    Length(u32, usize),
    PeerHeader(io::Error),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParseError::Header(err) => write!(f, "{}", err),
            ParseError::Length(declared, actual) => write!(
                f,
                "Message length mismatch (declared={}, actual={})",
                declared, actual
            ),
            ParseError::PeerHeader(err) => write!(f, "Truncated Per-Peer Header: {}", err),
        }
    }
}

impl From<HeaderError> for ParseError {
    fn from(error: HeaderError) -> Self {
        ParseError::Header(error)
    }
}

impl error::Error for ParseError {}

/// Intake side of a running pipeline, owned by a single worker
///
/// Dropping it signals both stages to stop (exactly once each).
pub struct Pipeline {
    intake: mpsc::Sender<Bytes>,
    parser_stop: Option<oneshot::Sender<()>>,
    producer_stop: Option<oneshot::Sender<()>>,
}

impl Pipeline {
    pub fn spawn(publisher: Arc<dyn Publisher>, split_af: bool) -> Self {
        let (intake, intake_rx) = mpsc::channel(QUEUE_DEPTH);
        let (records, records_rx) = mpsc::channel(QUEUE_DEPTH);
        let (parser_stop, parser_stop_rx) = oneshot::channel();
        let (producer_stop, producer_stop_rx) = oneshot::channel();
        tokio::spawn(parser(intake_rx, records, parser_stop_rx));
        tokio::spawn(producer(records_rx, publisher, split_af, producer_stop_rx));
        Self {
            intake,
            parser_stop: Some(parser_stop),
            producer_stop: Some(producer_stop),
        }
    }

    /// Hand a framed message to the parser, waiting while the pipeline is busy
    pub async fn send(&self, message: Bytes) -> Result<(), SessionError> {
        self.intake
            .send(message)
            .await
            .map_err(|_| SessionError::PipelineClosed)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Some(stop) = self.parser_stop.take() {
            let _ = stop.send(());
        }
        if let Some(stop) = self.producer_stop.take() {
            let _ = stop.send(());
        }
    }
}

// Stages check their queue before the stop signal, so anything already
// handed off is published before exiting.
async fn parser(
    mut intake: mpsc::Receiver<Bytes>,
    records: mpsc::Sender<Record>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            message = intake.recv() => match message {
                Some(raw) => match Record::parse(raw) {
                    Ok(record) => {
                        if records.send(record).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("Dropping message: {}", err),
                },
                None => break,
            },
            _ = &mut stop => break,
        }
    }
    trace!("Parser stopped");
}

async fn producer(
    mut records: mpsc::Receiver<Record>,
    publisher: Arc<dyn Publisher>,
    split_af: bool,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            record = records.recv() => match record {
                Some(record) => publish(publisher.as_ref(), &record, split_af).await,
                None => break,
            },
            _ = &mut stop => {
                // Parser may still hold a record, its queue closes once it exits
                while let Some(record) = records.recv().await {
                    publish(publisher.as_ref(), &record, split_af).await;
                }
                break;
            }
        }
    }
    trace!("Producer stopped");
}

async fn publish(publisher: &dyn Publisher, record: &Record, split_af: bool) {
    let topic = record.topic(split_af);
    if let Err(err) = publisher.publish(&topic, record).await {
        error!("Failed to publish to {}: {}", topic, err);
    }
}

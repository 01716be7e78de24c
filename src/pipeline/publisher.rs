use std::error;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, info};
use serde::Serialize;

use super::Record;
use crate::config::{PublisherConfig, PublisherKind};

/// Destination for records leaving the pipeline
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, record: &Record) -> Result<(), PublishError>;

    /// Flush & release the publisher, records published afterwards are refused
    fn stop(&self);
}

/// Build the publisher selected in the config
pub fn from_config(config: &PublisherConfig) -> io::Result<Arc<dyn Publisher>> {
    let publisher: Arc<dyn Publisher> = match config.kind {
        PublisherKind::Log => Arc::new(LogPublisher::default()),
        PublisherKind::Json => match &config.path {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                info!("Publishing records to {}", path.display());
                Arc::new(JsonPublisher::new(Box::new(file)))
            }
            None => Arc::new(JsonPublisher::new(Box::new(io::stdout()))),
        },
    };
    Ok(publisher)
}

#[derive(Debug)]
pub enum PublishError {
    /// Publisher was stopped
    Stopped,
    Encode(serde_json::Error),
    Io(io::Error),
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PublishError::Stopped => write!(f, "Publisher stopped"),
            PublishError::Encode(err) => write!(f, "Encoding failed: {}", err),
            PublishError::Io(err) => write!(f, "Write failed: {}", err),
        }
    }
}

impl From<io::Error> for PublishError {
    fn from(error: io::Error) -> Self {
        PublishError::Io(error)
    }
}

impl From<serde_json::Error> for PublishError {
    fn from(error: serde_json::Error) -> Self {
        PublishError::Encode(error)
    }
}

impl error::Error for PublishError {}

/// Writes a one-line summary of each record to the log
#[derive(Debug, Default)]
pub struct LogPublisher {
    published: AtomicU64,
}

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, topic: &str, record: &Record) -> Result<(), PublishError> {
        self.published.fetch_add(1, Ordering::Relaxed);
        match &record.peer {
            Some(peer) => debug!(
                "[{}] {} from {} (AS{}, {} bytes)",
                topic, record.message_type, peer.address, peer.asn, record.length
            ),
            None => debug!("[{}] {} ({} bytes)", topic, record.message_type, record.length),
        }
        Ok(())
    }

    fn stop(&self) {
        info!(
            "Log publisher stopped after {} records",
            self.published.load(Ordering::Relaxed)
        );
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    topic: &'a str,
    #[serde(flatten)]
    record: &'a Record,
}

type SharedWriter = Arc<Mutex<Option<BufWriter<Box<dyn Write + Send>>>>>;

/// Writes records as JSON lines
///
/// Writes happen on the blocking pool so a slow disk only holds up the
/// pipelines waiting on it.
pub struct JsonPublisher {
    writer: SharedWriter,
}

impl JsonPublisher {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Some(BufWriter::new(writer)))),
        }
    }
}

fn write_line(writer: &SharedWriter, mut line: Vec<u8>) -> Result<(), PublishError> {
    line.push(b'\n');
    let mut guard = writer.lock().map_err(|_| PublishError::Stopped)?;
    let writer = guard.as_mut().ok_or(PublishError::Stopped)?;
    writer.write_all(&line)?;
    writer.flush()?;
    Ok(())
}

#[async_trait]
impl Publisher for JsonPublisher {
    async fn publish(&self, topic: &str, record: &Record) -> Result<(), PublishError> {
        let line = serde_json::to_vec(&Envelope { topic, record })?;
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || write_line(&writer, line))
            .await
            .map_err(|err| PublishError::Io(io::Error::new(io::ErrorKind::Other, err)))?
    }

    fn stop(&self) {
        if let Ok(mut guard) = self.writer.lock() {
            if let Some(mut writer) = guard.take() {
                if let Err(err) = writer.flush() {
                    debug!("Failed to flush JSON publisher: {}", err);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use super::*;

    /// Keeps every published record in memory
    #[derive(Debug, Default)]
    pub(crate) struct MemoryPublisher {
        records: Mutex<Vec<(String, Record)>>,
        stopped: AtomicBool,
    }

    impl MemoryPublisher {
        pub(crate) fn records(&self) -> Vec<(String, Record)> {
            self.records.lock().unwrap().clone()
        }

        pub(crate) fn is_stopped(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }

        /// Wait (up to a few seconds) for at least `count` records
        pub(crate) async fn wait_for(&self, count: usize) -> Vec<(String, Record)> {
            for _ in 0..300 {
                if self.records.lock().unwrap().len() >= count {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            self.records()
        }
    }

    #[async_trait]
    impl Publisher for MemoryPublisher {
        async fn publish(&self, topic: &str, record: &Record) -> Result<(), PublishError> {
            if self.is_stopped() {
                return Err(PublishError::Stopped);
            }
            self.records
                .lock()
                .unwrap()
                .push((topic.to_string(), record.clone()));
            Ok(())
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }
}

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use futures::future;
use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use super::{MessageCounts, RetryNotifier, SessionError, TeardownRx};
use crate::bmp::FrameCodec;
use crate::config::ServerConfig;
use crate::pipeline::{Pipeline, Publisher};
use crate::utils::{format_elapsed_time, get_elapsed_time};

/// Drives a single BMP connection: frames messages off the wire, mirrors
/// them to the destination collector (intercept mode) and feeds them to a
/// dedicated pipeline
#[derive(Clone)]
pub struct Worker {
    intercept: Option<SocketAddr>,
    publisher: Arc<dyn Publisher>,
    split_af: bool,
}

impl Worker {
    pub fn new(config: &ServerConfig, publisher: Arc<dyn Publisher>) -> Self {
        Self::with_publisher(publisher, config.intercept_addr(), config.split_af)
    }

    pub fn with_publisher(
        publisher: Arc<dyn Publisher>,
        intercept: Option<SocketAddr>,
        split_af: bool,
    ) -> Self {
        Self {
            intercept,
            publisher,
            split_af,
        }
    }

    pub fn spawn<S>(
        &self,
        stream: S,
        peer: String,
        retry: Option<RetryNotifier>,
        teardown: Option<TeardownRx>,
    ) -> JoinHandle<()>
    where
        S: AsyncRead + Unpin + Send + 'static,
    {
        let worker = self.clone();
        tokio::spawn(async move {
            match worker.run(stream, &peer, retry, teardown).await {
                Ok(()) => info!("Session ended with {}", peer),
                Err(err) => error!("{} ({})", err, peer),
            }
        })
    }

    /// Serve `stream` until it fails or is torn down
    ///
    /// Passive connections pass a `RetryNotifier` that is fired once when
    /// the connection is lost, and a teardown receiver the manager can use
    /// to close the connection. A clean close by the peer returns Ok.
    pub async fn run<S>(
        &self,
        stream: S,
        peer: &str,
        retry: Option<RetryNotifier>,
        teardown: Option<TeardownRx>,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + Unpin + Send,
    {
        let result = self.serve(stream, peer, teardown).await;
        if let Some(retry) = retry {
            match &result {
                Ok(()) => retry.notify(format!("Session ended with {}", peer)).await,
                Err(err) if err.is_retryable() => retry.notify(err.to_string()).await,
                Err(_) => (),
            }
        }
        result
    }

    async fn serve<S>(
        &self,
        stream: S,
        peer: &str,
        teardown: Option<TeardownRx>,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + Unpin + Send,
    {
        let destination = match self.intercept {
            Some(addr) => {
                let destination = TcpStream::connect(addr)
                    .await
                    .map_err(|err| SessionError::InterceptDial(addr, err.to_string()))?;
                debug!("Connected to destination {}, intercepting {}", addr, peer);
                Some(destination)
            }
            None => None,
        };

        let connect_time = Utc::now();
        let mut counts = MessageCounts::new();
        let result = self
            .read_loop(stream, peer, destination, teardown, &mut counts)
            .await;
        debug!(
            "All done with {} after {} [received={}, mirrored={}]",
            peer,
            format_elapsed_time(get_elapsed_time(connect_time)),
            counts.received(),
            counts.mirrored()
        );
        result
    }

    async fn read_loop<S>(
        &self,
        stream: S,
        peer: &str,
        mut destination: Option<TcpStream>,
        teardown: Option<TeardownRx>,
        counts: &mut MessageCounts,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + Unpin + Send,
    {
        // Dropped (stopping both stages) on every way out of this fn
        let pipeline = Pipeline::spawn(Arc::clone(&self.publisher), self.split_af);
        let mut frames = FrameCodec::reader(stream);

        // A dropped sender is not a teardown request
        let teardown = async move {
            match teardown {
                Some(rx) => {
                    if rx.await.is_err() {
                        future::pending::<()>().await;
                    }
                }
                None => future::pending::<()>().await,
            }
        };
        tokio::pin!(teardown);

        loop {
            let frame = tokio::select! {
                _ = &mut teardown => {
                    info!("Received teardown, closing connection with {}", peer);
                    return Err(SessionError::TornDown);
                }
                frame = frames.next() => frame,
            };
            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => return Err(err.into()),
                None => return Ok(()),
            };
            counts.increment_received();

            if let Some(destination) = destination.as_mut() {
                if let Err(err) = destination.write_all(&frame.bytes).await {
                    warn!("Failed to mirror {} from {}", frame.header.message_type, peer);
                    return Err(SessionError::Write(err.to_string()));
                }
                counts.increment_mirrored();
            }
            pipeline.send(frame.into_bytes()).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::{mpsc, oneshot};
    use tokio::time::timeout;

    use super::*;
    use crate::pipeline::testing::MemoryPublisher;
    use crate::pipeline::{PublishError, Record};
    use crate::session::{RetryRequest, Teardown};

    fn message(message_type: u8, body: &[u8]) -> Vec<u8> {
        let mut msg = vec![3];
        msg.extend_from_slice(&((body.len() + 6) as u32).to_be_bytes());
        msg.push(message_type);
        msg.extend_from_slice(body);
        msg
    }

    fn worker(intercept: Option<SocketAddr>) -> (Worker, Arc<MemoryPublisher>) {
        let publisher = Arc::new(MemoryPublisher::default());
        let worker = Worker::with_publisher(publisher.clone(), intercept, false);
        (worker, publisher)
    }

    fn notifier() -> (RetryNotifier, mpsc::Receiver<RetryRequest>) {
        let (tx, rx) = mpsc::channel(1);
        (RetryNotifier::new(7, tx), rx)
    }

    #[tokio::test]
    async fn test_intercept_mirrors_and_publishes() {
        let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = destination.local_addr().unwrap();
        let mirrored = tokio::spawn(async move {
            let (mut conn, _) = destination.accept().await.unwrap();
            let mut received = vec![];
            conn.read_to_end(&mut received).await.unwrap();
            received
        });

        let (worker, publisher) = worker(Some(dest_addr));
        let msg = message(4, &[0, 1, 0, 4, b't', b'e', b's', b't']);
        let (local, mut router) = duplex(1024);
        router.write_all(&msg).await.unwrap();
        drop(router);

        let result = worker.run(local, "router", None, None).await;
        assert!(result.is_ok());
        assert_eq!(mirrored.await.unwrap(), msg);

        let published = publisher.wait_for(1).await;
        assert_eq!(published.len(), 1);
        assert_eq!(&published[0].1.raw[..], &msg[..]);
    }

    #[tokio::test]
    async fn test_mirror_keeps_order() {
        let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = destination.local_addr().unwrap();
        let mirrored = tokio::spawn(async move {
            let (mut conn, _) = destination.accept().await.unwrap();
            let mut received = vec![];
            conn.read_to_end(&mut received).await.unwrap();
            received
        });

        let (worker, publisher) = worker(Some(dest_addr));
        let first = message(4, &[1; 4]);
        let second = message(5, &[2; 4]);
        let (local, mut router) = duplex(1024);
        router.write_all(&first).await.unwrap();
        router.write_all(&second).await.unwrap();
        drop(router);

        worker.run(local, "router", None, None).await.unwrap();
        assert_eq!(mirrored.await.unwrap(), [&first[..], &second[..]].concat());
        let published: Vec<_> = publisher
            .wait_for(2)
            .await
            .into_iter()
            .map(|(_, record)| record.raw.to_vec())
            .collect();
        assert_eq!(published, vec![first, second]);
    }

    #[tokio::test]
    async fn test_intercept_dial_failure() {
        let dest_addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let (worker, _publisher) = worker(Some(dest_addr));
        let (retry, mut retry_rx) = notifier();
        let (local, _router) = duplex(64);

        let result = worker.run(local, "router", Some(retry), None).await;
        assert!(matches!(result, Err(SessionError::InterceptDial(addr, _)) if addr == dest_addr));
        // Intercept failures are not retried
        assert!(retry_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_short_body_not_forwarded() {
        let (worker, publisher) = worker(None);
        let (retry, mut retry_rx) = notifier();
        let msg = message(0, &[0; 42]);
        let (local, mut router) = duplex(1024);
        router.write_all(&msg[..20]).await.unwrap();
        drop(router);

        let result = worker.run(local, "router", Some(retry), None).await;
        assert!(matches!(result, Err(SessionError::ShortRead(_))));
        let request = retry_rx.recv().await.unwrap();
        assert_eq!(request.id, 7);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(publisher.records().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_header_skipped() {
        let (worker, publisher) = worker(None);
        let msg = message(5, &[9; 6]);
        let (local, mut router) = duplex(1024);
        router.write_all(&[2, 0, 0, 0, 12, 5]).await.unwrap();
        router.write_all(&msg).await.unwrap();
        drop(router);

        worker.run(local, "router", None, None).await.unwrap();
        let published = publisher.wait_for(1).await;
        assert_eq!(published.len(), 1);
        assert_eq!(&published[0].1.raw[..], &msg[..]);
    }

    #[tokio::test]
    async fn test_teardown_closes_connection() {
        let (worker, _publisher) = worker(None);
        let (retry, mut retry_rx) = notifier();
        let (teardown_tx, teardown_rx) = oneshot::channel();
        let (local, mut router) = duplex(1024);

        let handle = tokio::spawn(async move {
            worker
                .run(local, "router", Some(retry), Some(teardown_rx))
                .await
        });
        teardown_tx.send(Teardown).unwrap();

        assert!(matches!(handle.await.unwrap(), Err(SessionError::TornDown)));
        let request = retry_rx.recv().await.unwrap();
        assert_eq!(request.id, 7);
        // Router side sees the connection closed
        let mut buf = [0u8; 8];
        assert_eq!(router.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dropped_teardown_sender_keeps_reading() {
        let (worker, publisher) = worker(None);
        let (teardown_tx, teardown_rx) = oneshot::channel::<Teardown>();
        let (local, mut router) = duplex(1024);
        drop(teardown_tx);

        let handle =
            tokio::spawn(async move { worker.run(local, "router", None, Some(teardown_rx)).await });
        let msg = message(4, &[]);
        router.write_all(&msg).await.unwrap();
        assert_eq!(publisher.wait_for(1).await.len(), 1);
        drop(router);
        assert!(handle.await.unwrap().is_ok());
    }

    /// Never finishes publishing
    #[derive(Default)]
    struct StalledPublisher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Publisher for StalledPublisher {
        async fn publish(&self, _topic: &str, _record: &Record) -> Result<(), PublishError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            future::pending::<()>().await;
            Ok(())
        }

        fn stop(&self) {}
    }

    #[tokio::test]
    async fn test_stalled_publisher_stalls_reads() {
        let publisher = Arc::new(StalledPublisher::default());
        let worker = Worker::with_publisher(publisher.clone(), None, false);
        let (local, mut router) = duplex(64);
        let handle = tokio::spawn(async move { worker.run(local, "router", None, None).await });

        let written = Arc::new(AtomicUsize::new(0));
        let writer = {
            let written = written.clone();
            tokio::spawn(async move {
                let msg = message(4, &[]);
                for _ in 0..1000 {
                    router.write_all(&msg).await.unwrap();
                    written.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        // Writer can't get far ahead of the single message being published
        assert!(timeout(Duration::from_millis(200), writer).await.is_err());
        assert!(written.load(Ordering::SeqCst) < 100);
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
        handle.abort();
    }
}

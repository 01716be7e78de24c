use std::io::Result;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::pipeline::Publisher;
use crate::session::{PassiveManager, SessionError, TcpConnector, Worker};

/// BMP collector front-end: accepts routers on the listen address and,
/// when configured, keeps a connection to a passive router
pub struct Server {
    config: ServerConfig,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    publisher: Arc<dyn Publisher>,
    worker: Worker,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    stopped: AtomicBool,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    pub async fn bind(config: ServerConfig, publisher: Arc<dyn Publisher>) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr()).await?;
        let local_addr = listener.local_addr()?;
        info!("Listening for BMP connections on {}", local_addr);
        if let Some(addr) = config.intercept_addr() {
            info!("Intercepting messages to destination {}", addr);
        }
        let worker = Worker::new(&config, Arc::clone(&publisher));
        let (stop_tx, stop_rx) = watch::channel(false);
        Ok(Self {
            config,
            listener: Some(listener),
            local_addr,
            publisher,
            worker,
            stop_tx,
            stop_rx,
            stopped: AtomicBool::new(false),
            tasks: Vec::with_capacity(2),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawn the accept loop and the passive manager (if a passive router is configured)
    pub fn start(&mut self) {
        if self.stopped.load(Ordering::SeqCst) {
            warn!("Server already stopped, not starting");
            return;
        }
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => {
                warn!("Server already started");
                return;
            }
        };
        self.tasks.push(tokio::spawn(accept_loop(
            listener,
            self.worker.clone(),
            self.stop_rx.clone(),
        )));

        if let Some(router) = &self.config.passive_router {
            let connector = TcpConnector::new(router.clone(), self.config.retry.dial_timeout);
            let manager = PassiveManager::new(
                connector,
                self.worker.clone(),
                self.config.heartbeat,
                self.config.retry,
                self.stop_rx.clone(),
            );
            self.tasks.push(tokio::spawn(manager.run()));
        }
    }

    /// Stop the publisher and signal the accept loop & passive manager
    ///
    /// Only the first call has any effect. Connections already accepted
    /// are left to run until their routers hang up.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            debug!("Server already stopped");
            return;
        }
        info!("Stopping server on {}", self.local_addr);
        self.publisher.stop();
        if self.stop_tx.send(true).is_err() {
            debug!("No tasks listening for stop");
        }
    }

    /// Wait for the accept loop and passive manager to exit
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(err) = task.await {
                error!("Server task failed: {}", err);
            }
        }
    }
}

async fn accept_loop(listener: TcpListener, worker: Worker, mut stop: watch::Receiver<bool>) {
    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            // Sender gone means the Server was dropped
            changed = stop.changed() => if changed.is_err() {
                break;
            },
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!("Accepted connection from {}", addr);
                    worker.spawn(stream, addr.to_string(), None, None);
                }
                Err(err) => error!("{}", SessionError::Accept(err.to_string())),
            },
        }
    }
    info!("Stopped accepting connections");
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    use super::*;
    use crate::config::ConfigOverrides;
    use crate::pipeline::testing::MemoryPublisher;

    fn config(overrides: ConfigOverrides) -> ServerConfig {
        ServerConfig::load(
            None,
            ConfigOverrides {
                listen_address: Some(IpAddr::from(Ipv4Addr::LOCALHOST)),
                source_port: Some(0),
                ..overrides
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_intercept_end_to_end() {
        let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest_port = destination.local_addr().unwrap().port();
        let mirrored = tokio::spawn(async move {
            let (mut conn, _) = destination.accept().await.unwrap();
            let mut received = vec![];
            conn.read_to_end(&mut received).await.unwrap();
            received
        });

        let publisher = Arc::new(MemoryPublisher::default());
        let config = config(ConfigOverrides {
            destination_port: Some(dest_port),
            intercept: true,
            ..Default::default()
        });
        let mut server = Server::bind(config, publisher.clone()).await.unwrap();
        server.start();

        // Initiation message with a sysName TLV
        let msg = [3, 0, 0, 0, 14, 4, 0, 2, 0, 4, b'r', b't', b'r', b'1'];
        let mut router = TcpStream::connect(server.local_addr()).await.unwrap();
        router.write_all(&msg).await.unwrap();
        router.shutdown().await.unwrap();
        drop(router);

        assert_eq!(mirrored.await.unwrap(), msg.to_vec());
        let published = publisher.wait_for(1).await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "bmpd.initiation");
        assert_eq!(&published[0].1.raw[..], &msg[..]);

        server.stop();
        timeout(Duration::from_secs(5), server.join()).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let publisher = Arc::new(MemoryPublisher::default());
        let mut server = Server::bind(config(ConfigOverrides::default()), publisher.clone())
            .await
            .unwrap();
        server.start();
        assert!(server.local_addr().port() > 0);

        server.stop();
        assert!(publisher.is_stopped());
        server.stop();
        assert!(publisher.is_stopped());
        timeout(Duration::from_secs(5), server.join()).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_ends_passive_manager() {
        let router = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let publisher = Arc::new(MemoryPublisher::default());
        let config = config(ConfigOverrides {
            passive_router: Some(router),
            ..Default::default()
        });
        let mut server = Server::bind(config, publisher).await.unwrap();
        server.start();
        // Let the first dial fail and the manager settle into backoff
        tokio::time::sleep(Duration::from_millis(100)).await;

        server.stop();
        timeout(Duration::from_secs(5), server.join()).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_keeps_accepted_connections() {
        let publisher = Arc::new(MemoryPublisher::default());
        let mut server = Server::bind(config(ConfigOverrides::default()), publisher.clone())
            .await
            .unwrap();
        server.start();
        let mut router = TcpStream::connect(server.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.stop();
        timeout(Duration::from_secs(5), server.join()).await.unwrap();
        // Connection stays open, reads time out instead of hitting EOF
        let mut buf = [0u8; 8];
        assert!(timeout(Duration::from_millis(100), router.read(&mut buf))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_dropped_server_stops_accepting() {
        let publisher = Arc::new(MemoryPublisher::default());
        let mut server = Server::bind(config(ConfigOverrides::default()), publisher)
            .await
            .unwrap();
        server.start();
        let addr = server.local_addr();
        let tasks = std::mem::take(&mut server.tasks);
        drop(server);

        for task in tasks {
            timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        }
        // Listener went away with the accept loop
        assert!(TcpStream::connect(addr).await.is_err());
    }
}

use std::fmt;
use std::time::Duration;

use futures::future;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};

use super::{
    Connector, RetryNotifier, RetryRequest, RetryState, Teardown, TeardownTx, Worker,
};
use crate::config::RetryPolicy;

enum State {
    /// Ready to dial (immediately)
    Dialing,
    /// Worker is serving connection `id`
    Connected { id: u64, teardown: TeardownTx },
    /// Teardown sent to connection `id`, waiting on its retry request
    TearingDown { id: u64 },
    /// Waiting before the next dial
    Backoff(Instant),
    /// Out of attempts until the next heartbeat
    Dormant,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            State::Dialing => write!(f, "Dialing"),
            State::Connected { id, .. } => write!(f, "Connected [{}]", id),
            State::TearingDown { id } => write!(f, "TearingDown [{}]", id),
            State::Backoff(_) => write!(f, "Backoff"),
            State::Dormant => write!(f, "Dormant"),
        }
    }
}

/// Keeps a single outbound connection to a passive router alive
///
/// Failed dials and lost connections are retried with a linear backoff
/// until the attempts run out. Every heartbeat resets the attempts and
/// forces a fresh connection.
pub struct PassiveManager<C: Connector> {
    connector: C,
    worker: Worker,
    heartbeat: Duration,
    retry: RetryState,
    stop: watch::Receiver<bool>,
    // Id of the most recently spawned connection
    connections: u64,
}

impl<C: Connector> PassiveManager<C> {
    pub fn new(
        connector: C,
        worker: Worker,
        heartbeat: Duration,
        policy: RetryPolicy,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            connector,
            worker,
            heartbeat,
            retry: RetryState::new(policy),
            stop,
            connections: 0,
        }
    }

    pub async fn run(mut self) {
        let (retry_tx, mut retry_rx) = mpsc::channel::<RetryRequest>(1);
        let mut heartbeat = interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stop = self.stop.clone();
        let mut state = State::Dialing;
        info!("Starting passive connection to {}", self.connector.target());

        loop {
            if *stop.borrow() {
                break;
            }
            if let State::Dialing = state {
                state = tokio::select! {
                    _ = stop.changed() => break,
                    next = self.dial(&retry_tx) => next,
                };
                continue;
            }

            let backoff = match &state {
                State::Backoff(deadline) => future::Either::Left(sleep_until(*deadline)),
                _ => future::Either::Right(future::pending::<()>()),
            };
            state = tokio::select! {
                _ = stop.changed() => break,
                _ = heartbeat.tick() => self.on_heartbeat(state),
                Some(request) = retry_rx.recv() => self.on_retry(state, request),
                _ = backoff => State::Dialing,
            };
            debug!("Passive connection to {}: {}", self.connector.target(), state);
        }
        info!("Stopped passive connection to {}", self.connector.target());
    }

    async fn dial(&mut self, retry_tx: &mpsc::Sender<RetryRequest>) -> State {
        debug!(
            "Connecting to passive router {} ({})",
            self.connector.target(),
            self.retry
        );
        match self.connector.connect().await {
            Ok((stream, peer)) => {
                self.connections += 1;
                let id = self.connections;
                info!("Connected to passive router {}", peer);
                let (teardown, teardown_rx) = oneshot::channel();
                let notifier = RetryNotifier::new(id, retry_tx.clone());
                self.worker
                    .spawn(stream, peer, Some(notifier), Some(teardown_rx));
                State::Connected { id, teardown }
            }
            Err(err) => {
                error!("{}", err);
                self.schedule_retry()
            }
        }
    }

    fn schedule_retry(&mut self) -> State {
        match self.retry.schedule_next() {
            Some(delay) => {
                info!(
                    "Retrying connection to passive router {} in {}s",
                    self.connector.target(),
                    delay.as_secs()
                );
                State::Backoff(Instant::now() + delay)
            }
            None => {
                error!(
                    "Failed to connect to passive router {} after {} attempts, waiting for heartbeat",
                    self.connector.target(),
                    self.retry.max_attempts()
                );
                State::Dormant
            }
        }
    }

    fn on_heartbeat(&mut self, state: State) -> State {
        self.retry.reset();
        match state {
            State::Connected { id, teardown } => {
                info!("Heartbeat, reconnecting to {}", self.connector.target());
                match teardown.send(Teardown) {
                    Ok(()) => State::TearingDown { id },
                    // Worker exited without asking for a retry
                    Err(_) => State::Dialing,
                }
            }
            State::Dormant => {
                info!("Heartbeat, resuming connection to {}", self.connector.target());
                State::Dialing
            }
            // Worker never answered the last teardown
            State::TearingDown { id } => {
                warn!("No reply to teardown from connection {}, redialing", id);
                State::Dialing
            }
            other => other,
        }
    }

    fn on_retry(&mut self, state: State, request: RetryRequest) -> State {
        match state {
            State::Connected { id, .. } if id == request.id => {
                warn!("Passive connection lost: {}", request.reason);
                self.schedule_retry()
            }
            State::TearingDown { id } if id == request.id => State::Dialing,
            other => {
                debug!("Ignoring retry from stale connection {}", request.id);
                other
            }
        }
    }
}

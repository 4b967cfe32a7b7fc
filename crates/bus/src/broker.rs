use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;
use zeromq::prelude::*;
use zeromq::{RouterSocket, ZmqMessage};

use crate::error::BusError;
use crate::message::Message;
use crate::metrics::MetricsCollector;
use crate::protocol::{Command, FailureKind, Op, Outcome, Reply};
use crate::router::Router;
use crate::traits::InboundOptions;
use crate::transport::Transport;

/// Configuration for the bus broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Endpoint the ROUTER socket binds; clients connect their DEALER here.
    pub endpoint: Transport,
    /// Topic exchanges declared at startup.
    pub exchanges: Vec<String>,
    /// Durable queues declared at startup so producers can send before
    /// their consumers attach.
    pub queues: Vec<String>,
    /// Optional HTTP port for `/metrics` and `/health`.
    pub metrics_port: Option<u16>,
    /// Ephemeral queues with no parked fetch and no client activity for
    /// this long are deleted.
    pub ephemeral_idle_timeout: Duration,
}

impl BrokerConfig {
    pub fn local() -> Self {
        Self {
            endpoint: Transport::ipc("bus"),
            exchanges: Vec::new(),
            queues: Vec::new(),
            metrics_port: None,
            ephemeral_idle_timeout: Duration::from_secs(300),
        }
    }

    pub fn tcp(host: &str, port: u16) -> Self {
        Self {
            endpoint: Transport::tcp(host, port),
            ..Self::local()
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::local()
    }
}

/// Upper bound on the time between idle-queue sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// A long-polling `Fetch` that found its queue empty.
#[derive(Debug)]
struct Waiter {
    identity: Vec<u8>,
    fetch_id: Uuid,
}

/// Everything the broker loop mutates. Kept free of sockets so command
/// handling can be tested directly.
#[derive(Debug, Default)]
pub(crate) struct BrokerState {
    router: Router,
    waiters: HashMap<String, VecDeque<Waiter>>,
    /// Last client activity on each ephemeral queue.
    last_seen: HashMap<String, Instant>,
}

/// A reply addressed to a peer identity.
type Outgoing = (Vec<u8>, Reply);

impl BrokerState {
    pub(crate) fn new(config: &BrokerConfig) -> Result<Self, BusError> {
        let mut router = Router::new();
        for name in &config.exchanges {
            router.declare_exchange(name)?;
        }
        for name in &config.queues {
            router.declare_queue(name)?;
        }
        Ok(Self {
            router,
            waiters: HashMap::new(),
            last_seen: HashMap::new(),
        })
    }

    /// Apply one command and return every reply it produces: the answer to
    /// the sender (absent for a parked `Fetch`) plus deliveries to other
    /// peers whose fetches it satisfied.
    pub(crate) fn handle(&mut self, identity: Vec<u8>, command: Command) -> Vec<Outgoing> {
        let mut out = Vec::new();
        let request_id = command.request_id;

        let outcome = match command.op {
            Op::Ping => Some(Outcome::Pong),
            Op::DeclareQueue { name } => Some(done_or_failed(self.router.declare_queue(&name))),
            Op::DeclareExchange { name } => {
                Some(done_or_failed(self.router.declare_exchange(&name)))
            }
            Op::Open { address, ephemeral } => {
                let opened = self.router.open(&address, InboundOptions { ephemeral });
                Some(match opened {
                    Ok(queue) => {
                        self.mark_active(&queue);
                        Outcome::Opened {
                            ephemeral: self.router.is_ephemeral(&queue),
                            queue,
                        }
                    }
                    Err(e) => Outcome::from_error(&e),
                })
            }
            Op::Send {
                destination,
                message,
            } => Some(match self.router.route(&destination, message) {
                Ok(queues) => {
                    for queue in queues {
                        self.drain(&queue, &mut out);
                    }
                    Outcome::Done
                }
                Err(e) => Outcome::from_error(&e),
            }),
            Op::Fetch { queue } => match self.pop_active(&queue) {
                Ok(Some(message)) => Some(Outcome::Delivered { message }),
                Ok(None) => {
                    self.waiters.entry(queue).or_default().push_back(Waiter {
                        identity: identity.clone(),
                        fetch_id: request_id,
                    });
                    None
                }
                Err(e) => Some(Outcome::from_error(&e)),
            },
            Op::Cancel { fetch_id } => Some(Outcome::Cancelled {
                fetch_id,
                pending: self.withdraw(fetch_id),
            }),
            Op::Requeue { queue, message } => {
                self.mark_active(&queue);
                if self.router.requeue(&queue, message) {
                    self.drain(&queue, &mut out);
                } else {
                    tracing::warn!(queue = %queue, "requeue target no longer exists, message dropped");
                }
                Some(Outcome::Done)
            }
            Op::Delete { queue } => {
                if let Some(dropped) = self.router.delete_queue(&queue) {
                    tracing::debug!(queue = %queue, dropped, "deleted queue");
                }
                self.last_seen.remove(&queue);
                for waiter in self.waiters.remove(&queue).unwrap_or_default() {
                    out.push((
                        waiter.identity,
                        Reply {
                            request_id: waiter.fetch_id,
                            outcome: Outcome::Failed {
                                kind: FailureKind::Closed,
                                detail: queue.clone(),
                            },
                        },
                    ));
                }
                Some(Outcome::Done)
            }
        };

        if let Some(outcome) = outcome {
            out.push((
                identity,
                Reply {
                    request_id,
                    outcome,
                },
            ));
        }
        out
    }

    /// Hand queued messages to parked fetches, oldest waiter first.
    fn drain(&mut self, queue: &str, out: &mut Vec<Outgoing>) {
        let Some(waiters) = self.waiters.get_mut(queue) else {
            return;
        };
        while !waiters.is_empty() {
            let Ok(Some(message)) = self.router.pop(queue) else {
                break;
            };
            if let Some(waiter) = waiters.pop_front() {
                out.push((
                    waiter.identity,
                    Reply {
                        request_id: waiter.fetch_id,
                        outcome: Outcome::Delivered { message },
                    },
                ));
            }
        }
        if waiters.is_empty() {
            self.waiters.remove(queue);
        }
    }

    /// Remove a parked fetch. Returns whether it was still parked.
    fn withdraw(&mut self, fetch_id: Uuid) -> bool {
        let mut found = false;
        self.waiters.retain(|_, waiters| {
            let before = waiters.len();
            waiters.retain(|w| w.fetch_id != fetch_id);
            found |= waiters.len() != before;
            !waiters.is_empty()
        });
        found
    }

    /// Record client activity on `queue`, then pop from it.
    fn pop_active(&mut self, queue: &str) -> Result<Option<Message>, BusError> {
        self.mark_active(queue);
        self.router.pop(queue)
    }

    fn mark_active(&mut self, queue: &str) {
        if self.router.is_ephemeral(queue) {
            self.last_seen.insert(queue.to_string(), Instant::now());
        }
    }

    /// Delete ephemeral queues idle for at least `ttl` as of `now`.
    ///
    /// A queue with a parked fetch has a live consumer and counts as active.
    /// Returns the names of the deleted queues.
    pub(crate) fn sweep_idle(&mut self, now: Instant, ttl: Duration) -> Vec<String> {
        let mut expired = Vec::new();
        for queue in self.router.ephemeral_queues() {
            if self.waiters.contains_key(&queue) {
                self.last_seen.insert(queue, now);
                continue;
            }
            let seen = *self.last_seen.entry(queue.clone()).or_insert(now);
            if now.saturating_duration_since(seen) >= ttl {
                expired.push(queue);
            }
        }
        for queue in &expired {
            let dropped = self.router.delete_queue(queue).unwrap_or_default();
            self.last_seen.remove(queue);
            tracing::info!(queue = %queue, dropped, "expired idle ephemeral queue");
        }
        expired
    }

    pub(crate) fn queue_count(&self) -> usize {
        self.router.queue_count()
    }
}

fn done_or_failed(result: Result<(), BusError>) -> Outcome {
    match result {
        Ok(()) => Outcome::Done,
        Err(e) => Outcome::from_error(&e),
    }
}

/// Central routing broker: owns every queue and exchange and serves
/// [`ZmqBus`](crate::ZmqBus) clients over a single ROUTER socket.
pub struct BusBroker {
    config: BrokerConfig,
    collector: MetricsCollector,
    shutdown: Arc<AtomicBool>,
}

impl BusBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            collector: MetricsCollector::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn collector(&self) -> &MetricsCollector {
        &self.collector
    }

    /// Signal the broker to shut down gracefully.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Run the broker loop until shutdown is signalled.
    pub async fn run(&self) -> Result<(), BusError> {
        let mut state = BrokerState::new(&self.config)?;

        let endpoint = &self.config.endpoint;
        endpoint
            .ensure_ipc_dir()
            .map_err(|e| BusError::Transport(e.to_string()))?;
        endpoint
            .remove_stale_socket()
            .map_err(|e| BusError::Transport(e.to_string()))?;

        let mut socket = RouterSocket::new();
        socket.bind(&endpoint.endpoint()).await?;
        tracing::info!(
            endpoint = %endpoint,
            exchanges = ?self.config.exchanges,
            queues = ?self.config.queues,
            "bus broker bound"
        );

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let _http_handle = self.config.metrics_port.map(|port| {
            crate::metrics::spawn_metrics_server(port, self.collector.clone(), shutdown_rx)
        });

        let idle_ttl = self.config.ephemeral_idle_timeout;
        let sweep_every = idle_ttl.min(SWEEP_INTERVAL);
        let mut last_sweep = Instant::now();

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                tracing::info!("bus broker shutting down");
                break;
            }

            if last_sweep.elapsed() >= sweep_every {
                last_sweep = Instant::now();
                if !state.sweep_idle(last_sweep, idle_ttl).is_empty() {
                    self.collector.set_queue_count(state.queue_count()).await;
                }
            }

            // Use a timeout so we periodically check the shutdown flag.
            let msg = match tokio::time::timeout(Duration::from_millis(100), socket.recv()).await {
                Ok(Ok(msg)) => msg,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "broker recv error");
                    continue;
                }
                Err(_) => continue,
            };

            let Some((identity, command)) = decode_frames(&msg) else {
                continue;
            };
            self.record(&command).await;

            for (peer, reply) in state.handle(identity, command) {
                self.record_outcome(&reply.outcome).await;
                if let Err(e) = send_reply(&mut socket, peer, &reply).await {
                    tracing::warn!(error = %e, request_id = %reply.request_id, "broker send error");
                }
            }
            self.collector.set_queue_count(state.queue_count()).await;
        }

        let _ = shutdown_tx.send(true);
        tracing::info!("bus broker stopped");
        Ok(())
    }

    async fn record(&self, command: &Command) {
        match &command.op {
            Op::Send {
                destination,
                message,
            } => {
                self.collector
                    .record_send(destination, message.payload_len() as u64)
                    .await;
            }
            Op::Requeue { .. } => self.collector.record_requeue().await,
            _ => {}
        }
        tracing::trace!(request_id = %command.request_id, op = ?command.op, "broker command");
    }

    async fn record_outcome(&self, outcome: &Outcome) {
        match outcome {
            Outcome::Delivered { .. } => self.collector.record_delivery().await,
            Outcome::Failed {
                kind: FailureKind::UnknownDestination,
                detail,
            } => self.collector.record_unroutable(detail).await,
            _ => {}
        }
    }
}

/// ROUTER recv frames: `[identity, command]`, possibly with empty delimiter
/// frames in between depending on the peer.
fn decode_frames(msg: &ZmqMessage) -> Option<(Vec<u8>, Command)> {
    let frames: Vec<_> = msg.iter().collect();
    let identity = frames.first()?.as_ref().to_vec();
    let body = frames[1..].iter().find(|f| !f.as_ref().is_empty())?;

    match Command::from_bytes(body.as_ref()) {
        Ok(command) => Some((identity, command)),
        Err(e) => {
            tracing::warn!(error = %e, "dropping undecodable command frame");
            None
        }
    }
}

async fn send_reply(socket: &mut RouterSocket, peer: Vec<u8>, reply: &Reply) -> Result<(), BusError> {
    let mut zmq_msg = ZmqMessage::from(peer);
    zmq_msg.push_back(reply.to_bytes()?.into());
    socket.send(zmq_msg).await?;
    Ok(())
}

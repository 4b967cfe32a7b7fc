//! Networked [`Bus`] implementation talking to a [`BusBroker`](crate::BusBroker).
//!
//! A single DEALER socket is owned by a background task that alternates
//! between sending queued commands and dispatching replies by `request_id`,
//! so send and recv never contend for the socket.
//!
//! A receive that times out withdraws its long-polling `Fetch`. If the broker
//! had already answered it, the delivery is pushed back to the head of its
//! queue instead of being dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use zeromq::prelude::*;
use zeromq::{DealerSocket, ZmqMessage};

use crate::error::BusError;
use crate::message::Message;
use crate::protocol::{Command, Op, Outcome, Reply};
use crate::traits::{Bus, Inbound, InboundOptions, Outbound};
use crate::transport::Transport;

/// How long non-fetch commands wait for the broker.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

struct Waiting {
    tx: oneshot::Sender<Outcome>,
    /// Set for fetches: where to return a delivery if the caller is gone.
    fetch_queue: Option<String>,
}

#[derive(Default)]
struct Pending {
    calls: HashMap<Uuid, Waiting>,
    /// Fetches given up by their receiver, mapped to the queue a late
    /// delivery must be returned to.
    abandoned: HashMap<Uuid, String>,
}

struct Inner {
    send_tx: mpsc::Sender<Command>,
    pending: Arc<Mutex<Pending>>,
    command_timeout: Duration,
    loop_handle: tokio::task::JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.loop_handle.abort();
    }
}

/// Cheaply cloneable connection to a bus broker.
#[derive(Clone)]
pub struct ZmqBus {
    inner: Arc<Inner>,
}

impl ZmqBus {
    /// Connect a DEALER socket to the broker's ROUTER endpoint.
    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn connect(transport: &Transport) -> Result<Self, BusError> {
        Self::connect_with_timeout(transport, DEFAULT_COMMAND_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        transport: &Transport,
        command_timeout: Duration,
    ) -> Result<Self, BusError> {
        let mut socket = DealerSocket::new();
        let endpoint = transport.endpoint();
        info!(endpoint = %endpoint, "connecting DEALER socket to bus broker");
        socket.connect(&endpoint).await?;

        let pending = Arc::new(Mutex::new(Pending::default()));
        let (send_tx, send_rx) = mpsc::channel::<Command>(256);

        let loop_pending = Arc::clone(&pending);
        let loop_handle = tokio::spawn(async move {
            Self::event_loop(socket, send_rx, loop_pending).await;
        });

        Ok(Self {
            inner: Arc::new(Inner {
                send_tx,
                pending,
                command_timeout,
                loop_handle,
            }),
        })
    }

    async fn event_loop(
        mut socket: DealerSocket,
        mut send_rx: mpsc::Receiver<Command>,
        pending: Arc<Mutex<Pending>>,
    ) {
        loop {
            tokio::select! {
                Some(command) = send_rx.recv() => {
                    if let Err(e) = Self::send_command(&mut socket, &command).await {
                        warn!(error = %e, request_id = %command.request_id, "DEALER send failed");
                    }
                }
                result = socket.recv() => {
                    match result {
                        Ok(zmq_msg) => {
                            if let Some(requeue) = Self::dispatch_reply(&pending, zmq_msg).await {
                                if let Err(e) = Self::send_command(&mut socket, &requeue).await {
                                    warn!(error = %e, "failed to requeue abandoned delivery");
                                }
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "DEALER recv loop ending");
                            break;
                        }
                    }
                }
                else => break,
            }
        }
    }

    async fn send_command(socket: &mut DealerSocket, command: &Command) -> Result<(), BusError> {
        let zmq_msg = ZmqMessage::from(command.to_bytes()?);
        socket.send(zmq_msg).await?;
        Ok(())
    }

    /// Route a reply to its caller. Returns a `Requeue` command when the
    /// reply is a delivery nobody is waiting for any more.
    async fn dispatch_reply(pending: &Mutex<Pending>, zmq_msg: ZmqMessage) -> Option<Command> {
        let frame = zmq_msg.iter().find(|f| !f.as_ref().is_empty())?;
        let reply = match Reply::from_bytes(frame.as_ref()) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "failed to decode broker reply");
                return None;
            }
        };

        let mut map = pending.lock().await;

        if let Outcome::Cancelled { fetch_id, .. } = &reply.outcome {
            // Any delivery for this fetch was sent before this reply.
            map.abandoned.remove(fetch_id);
        }

        if let Some(waiting) = map.calls.remove(&reply.request_id) {
            return match waiting.tx.send(reply.outcome) {
                Ok(()) => None,
                // The receiving future was dropped without withdrawing.
                Err(Outcome::Delivered { message }) => waiting
                    .fetch_queue
                    .map(|queue| Command::new(Op::Requeue { queue, message })),
                Err(_) => None,
            };
        }

        if let Some(queue) = map.abandoned.remove(&reply.request_id) {
            if let Outcome::Delivered { message } = reply.outcome {
                debug!(queue = %queue, "requeueing delivery for abandoned fetch");
                return Some(Command::new(Op::Requeue { queue, message }));
            }
            return None;
        }

        debug!(request_id = %reply.request_id, "reply for unknown request");
        None
    }

    async fn enqueue(&self, command: Command) -> Result<(), BusError> {
        self.inner
            .send_tx
            .send(command)
            .await
            .map_err(|_| BusError::Transport("bus client event loop closed".into()))
    }

    /// Send a command and wait for its reply.
    async fn call(&self, op: Op) -> Result<Outcome, BusError> {
        let command = Command::new(op);
        let id = command.request_id;
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.calls.insert(
            id,
            Waiting {
                tx,
                fetch_queue: None,
            },
        );

        if let Err(e) = self.enqueue(command).await {
            self.inner.pending.lock().await.calls.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.command_timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(BusError::Transport("reply channel closed unexpectedly".into())),
            Err(_) => {
                self.inner.pending.lock().await.calls.remove(&id);
                Err(BusError::Timeout(self.inner.command_timeout))
            }
        }
    }

    async fn call_done(&self, op: Op) -> Result<(), BusError> {
        match self.call(op).await? {
            Outcome::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Round-trip a ping through the broker.
    pub async fn ping(&self) -> Result<(), BusError> {
        match self.call(Op::Ping).await? {
            Outcome::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn declare_queue(&self, name: &str) -> Result<(), BusError> {
        self.call_done(Op::DeclareQueue { name: name.into() }).await
    }

    pub async fn declare_exchange(&self, name: &str) -> Result<(), BusError> {
        self.call_done(Op::DeclareExchange { name: name.into() }).await
    }

    /// Long-poll `queue` for at most `timeout`.
    async fn fetch(&self, queue: &str, timeout: Duration) -> Result<Option<Message>, BusError> {
        let command = Command::new(Op::Fetch {
            queue: queue.to_string(),
        });
        let fetch_id = command.request_id;
        let (tx, mut rx) = oneshot::channel();
        self.inner.pending.lock().await.calls.insert(
            fetch_id,
            Waiting {
                tx,
                fetch_queue: Some(queue.to_string()),
            },
        );
        self.enqueue(command).await?;

        let outcome = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                return Err(BusError::Transport("reply channel closed unexpectedly".into()))
            }
            Err(_) => {
                let still_pending = {
                    let mut map = self.inner.pending.lock().await;
                    let parked = map.calls.remove(&fetch_id).is_some();
                    if parked {
                        map.abandoned.insert(fetch_id, queue.to_string());
                    }
                    parked
                };
                if still_pending {
                    self.enqueue(Command::new(Op::Cancel { fetch_id })).await?;
                    return Ok(None);
                }
                // The reply raced the timeout and is already in the channel.
                match rx.try_recv() {
                    Ok(outcome) => outcome,
                    Err(_) => return Ok(None),
                }
            }
        };

        match outcome {
            Outcome::Delivered { message } => Ok(Some(message)),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(outcome: Outcome) -> BusError {
    match outcome {
        Outcome::Failed { kind, detail } => (kind, detail).into(),
        other => BusError::Transport(format!("unexpected broker reply: {other:?}")),
    }
}

#[async_trait]
impl Bus for ZmqBus {
    async fn open_outbound(&self, destination: &str) -> Result<Box<dyn Outbound>, BusError> {
        Ok(Box::new(ZmqOutbound {
            bus: self.clone(),
            destination: destination.to_string(),
        }))
    }

    async fn open_inbound(
        &self,
        address: &str,
        options: InboundOptions,
    ) -> Result<Box<dyn Inbound>, BusError> {
        let outcome = self
            .call(Op::Open {
                address: address.to_string(),
                ephemeral: options.ephemeral,
            })
            .await?;
        match outcome {
            Outcome::Opened { queue, ephemeral } => {
                debug!(address, queue = %queue, ephemeral, "opened inbound");
                Ok(Box::new(ZmqInbound {
                    bus: self.clone(),
                    queue,
                    ephemeral,
                    closed: AtomicBool::new(false),
                }))
            }
            other => Err(unexpected(other)),
        }
    }
}

struct ZmqOutbound {
    bus: ZmqBus,
    destination: String,
}

#[async_trait]
impl Outbound for ZmqOutbound {
    fn destination(&self) -> &str {
        &self.destination
    }

    async fn send(&self, message: Message) -> Result<(), BusError> {
        self.bus
            .call_done(Op::Send {
                destination: self.destination.clone(),
                message,
            })
            .await
    }
}

struct ZmqInbound {
    bus: ZmqBus,
    queue: String,
    ephemeral: bool,
    closed: AtomicBool,
}

#[async_trait]
impl Inbound for ZmqInbound {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Message>, BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed(self.queue.clone()));
        }
        self.bus.fetch(&self.queue, timeout).await
    }

    async fn close(&self) -> Result<(), BusError> {
        if self.closed.swap(true, Ordering::SeqCst) || !self.ephemeral {
            return Ok(());
        }
        self.bus
            .call_done(Op::Delete {
                queue: self.queue.clone(),
            })
            .await
    }
}

impl Drop for ZmqInbound {
    fn drop(&mut self) {
        if self.ephemeral && !self.closed.swap(true, Ordering::SeqCst) {
            // Fire-and-forget; the broker's reply is ignored as unknown.
            let delete = Command::new(Op::Delete {
                queue: self.queue.clone(),
            });
            if self.bus.inner.send_tx.try_send(delete).is_err() {
                warn!(queue = %self.queue, "could not delete ephemeral queue on drop");
            }
        }
    }
}

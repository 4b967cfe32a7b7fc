//! In-process bus backed by a [`Router`] behind a mutex.
//!
//! Used by tests and by deployments that run the task database stub and the
//! controller in one process. Receivers block on a shared [`Notify`] that is
//! fired after every successful route.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::BusError;
use crate::message::Message;
use crate::router::Router;
use crate::traits::{Bus, Inbound, InboundOptions, Outbound};

/// Counters exposed for tests and diagnostics.
#[derive(Debug, Default)]
pub struct BusStats {
    pub inbounds_opened: AtomicU64,
    pub inbounds_closed: AtomicU64,
    pub messages_routed: AtomicU64,
}

struct Shared {
    router: Mutex<Router>,
    notify: Notify,
    stats: BusStats,
}

impl Shared {
    fn router(&self) -> Result<MutexGuard<'_, Router>, BusError> {
        self.router
            .lock()
            .map_err(|_| BusError::Transport("router lock poisoned".into()))
    }
}

/// Cheaply cloneable handle to an in-process bus.
#[derive(Clone)]
pub struct MemoryBus {
    shared: Arc<Shared>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                router: Mutex::new(Router::new()),
                notify: Notify::new(),
                stats: BusStats::default(),
            }),
        }
    }

    /// Declare a durable queue up front so producers can send before any
    /// consumer has attached.
    pub fn declare_queue(&self, name: &str) -> Result<(), BusError> {
        self.shared.router()?.declare_queue(name)
    }

    pub fn declare_exchange(&self, name: &str) -> Result<(), BusError> {
        self.shared.router()?.declare_exchange(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.shared
            .router()
            .map(|r| r.has_queue(name))
            .unwrap_or(false)
    }

    pub fn queue_len(&self, name: &str) -> Option<usize> {
        self.shared.router().ok().and_then(|r| r.queue_len(name))
    }

    pub fn stats(&self) -> &BusStats {
        &self.shared.stats
    }

    /// Inbounds opened but not yet closed.
    pub fn open_inbounds(&self) -> u64 {
        let stats = &self.shared.stats;
        stats.inbounds_opened.load(Ordering::SeqCst) - stats.inbounds_closed.load(Ordering::SeqCst)
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn open_outbound(&self, destination: &str) -> Result<Box<dyn Outbound>, BusError> {
        Ok(Box::new(MemoryOutbound {
            shared: Arc::clone(&self.shared),
            destination: destination.to_string(),
        }))
    }

    async fn open_inbound(
        &self,
        address: &str,
        options: InboundOptions,
    ) -> Result<Box<dyn Inbound>, BusError> {
        let (queue, ephemeral) = {
            let mut router = self.shared.router()?;
            let queue = router.open(address, options)?;
            let ephemeral = router.is_ephemeral(&queue);
            (queue, ephemeral)
        };
        self.shared
            .stats
            .inbounds_opened
            .fetch_add(1, Ordering::SeqCst);
        debug!(address, queue = %queue, ephemeral, "opened in-memory inbound");

        Ok(Box::new(MemoryInbound {
            shared: Arc::clone(&self.shared),
            queue,
            ephemeral,
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryOutbound {
    shared: Arc<Shared>,
    destination: String,
}

#[async_trait]
impl Outbound for MemoryOutbound {
    fn destination(&self) -> &str {
        &self.destination
    }

    async fn send(&self, message: Message) -> Result<(), BusError> {
        let delivered = self.shared.router()?.route(&self.destination, message)?;
        self.shared
            .stats
            .messages_routed
            .fetch_add(1, Ordering::Relaxed);
        if !delivered.is_empty() {
            self.shared.notify.notify_waiters();
        }
        Ok(())
    }
}

struct MemoryInbound {
    shared: Arc<Shared>,
    queue: String,
    ephemeral: bool,
    closed: AtomicBool,
}

impl MemoryInbound {
    /// Mark closed and release the queue if it is ephemeral. Returns false
    /// when the inbound had already been released.
    fn release(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if self.ephemeral {
            match self.shared.router.lock() {
                Ok(mut router) => {
                    if let Some(dropped) = router.delete_queue(&self.queue) {
                        if dropped > 0 {
                            warn!(queue = %self.queue, dropped, "deleted ephemeral queue with undelivered messages");
                        }
                    }
                }
                Err(_) => warn!(queue = %self.queue, "router lock poisoned, ephemeral queue leaked"),
            }
        }
        self.shared
            .stats
            .inbounds_closed
            .fetch_add(1, Ordering::SeqCst);
        true
    }
}

#[async_trait]
impl Inbound for MemoryInbound {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Message>, BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed(self.queue.clone()));
        }
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register interest before checking the queue so a route that
            // lands between the check and the await still wakes us.
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = self.shared.router()?.pop(&self.queue)?;
            if next.is_some() {
                return Ok(next);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn close(&self) -> Result<(), BusError> {
        if self.release() {
            debug!(queue = %self.queue, "closed in-memory inbound");
        }
        Ok(())
    }
}

impl Drop for MemoryInbound {
    fn drop(&mut self) {
        self.release();
    }
}

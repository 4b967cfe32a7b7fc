//! Destination routing table shared by the in-memory bus and the broker.
//!
//! Two kinds of destinations exist:
//! - **queues**: point-to-point buffers. Messages stay queued until a
//!   receiver pops them, which is what gives durable delivery to consumers
//!   that are temporarily away.
//! - **exchanges**: topic fan-out. Each binding attaches a queue with a
//!   subject-prefix filter; a routed message is copied into every queue
//!   whose filter matches. An exchange with no bindings drops the message.
//!
//! The router does no I/O and never blocks; callers wrap it in a lock and
//! wake their own waiters based on the queue names [`Router::route`] returns.

use std::collections::{HashMap, VecDeque};

use uuid::Uuid;

use crate::address::{subject_matches, Address};
use crate::error::BusError;
use crate::message::Message;
use crate::traits::InboundOptions;

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<Message>,
    ephemeral: bool,
}

#[derive(Debug, Clone)]
struct Binding {
    queue: String,
    filter: Option<String>,
}

#[derive(Debug, Default)]
pub struct Router {
    queues: HashMap<String, QueueState>,
    exchanges: HashMap<String, Vec<Binding>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a durable queue. Re-declaring an existing queue is a no-op.
    pub fn declare_queue(&mut self, name: &str) -> Result<(), BusError> {
        self.ensure_queue(name, false)
    }

    /// Declare a topic exchange. Re-declaring is a no-op.
    pub fn declare_exchange(&mut self, name: &str) -> Result<(), BusError> {
        if self.queues.contains_key(name) {
            return Err(BusError::Rejected(format!(
                "cannot declare exchange '{name}': a queue with that name exists"
            )));
        }
        self.exchanges.entry(name.to_string()).or_default();
        Ok(())
    }

    fn ensure_queue(&mut self, name: &str, ephemeral: bool) -> Result<(), BusError> {
        if self.exchanges.contains_key(name) {
            return Err(BusError::Rejected(format!(
                "cannot declare queue '{name}': an exchange with that name exists"
            )));
        }
        self.queues.entry(name.to_string()).or_insert_with(|| QueueState {
            messages: VecDeque::new(),
            ephemeral,
        });
        Ok(())
    }

    pub fn is_exchange(&self, name: &str) -> bool {
        self.exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    pub fn is_ephemeral(&self, queue: &str) -> bool {
        self.queues.get(queue).is_some_and(|q| q.ephemeral)
    }

    /// Names of every ephemeral queue currently declared.
    pub fn ephemeral_queues(&self) -> Vec<String> {
        self.queues
            .iter()
            .filter(|(_, q)| q.ephemeral)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Resolve an inbound address to the queue that should be consumed.
    ///
    /// Exchange addresses get a private ephemeral queue bound with the
    /// address's subject filter; anything else names a queue, declared on
    /// demand with the requested durability.
    pub fn open(&mut self, raw_address: &str, options: InboundOptions) -> Result<String, BusError> {
        let address = Address::parse(raw_address)?;
        if self.is_exchange(&address.name) {
            return self.subscribe(&address.name, address.subject_filter.as_deref());
        }
        self.ensure_queue(&address.name, options.ephemeral)?;
        Ok(address.name)
    }

    /// Bind a fresh ephemeral queue to `exchange` and return its name.
    /// The exchange is declared if it does not exist yet.
    pub fn subscribe(&mut self, exchange: &str, filter: Option<&str>) -> Result<String, BusError> {
        self.declare_exchange(exchange)?;
        let queue = format!("{exchange}.sub.{}", Uuid::new_v4().simple());
        self.ensure_queue(&queue, true)?;
        if let Some(bindings) = self.exchanges.get_mut(exchange) {
            bindings.push(Binding {
                queue: queue.clone(),
                filter: filter.map(str::to_string),
            });
        }
        Ok(queue)
    }

    /// Deliver `message` to `destination` and return the queues that received it.
    pub fn route(&mut self, destination: &str, message: Message) -> Result<Vec<String>, BusError> {
        if let Some(state) = self.queues.get_mut(destination) {
            state.messages.push_back(message);
            return Ok(vec![destination.to_string()]);
        }

        let bindings = self
            .exchanges
            .get(destination)
            .ok_or_else(|| BusError::UnknownDestination(destination.to_string()))?;

        let targets: Vec<String> = bindings
            .iter()
            .filter(|b| subject_matches(b.filter.as_deref(), &message.subject))
            .map(|b| b.queue.clone())
            .collect();

        for queue in &targets {
            if let Some(state) = self.queues.get_mut(queue) {
                state.messages.push_back(message.clone());
            }
        }
        Ok(targets)
    }

    /// Take the oldest message from `queue`.
    pub fn pop(&mut self, queue: &str) -> Result<Option<Message>, BusError> {
        self.queues
            .get_mut(queue)
            .map(|state| state.messages.pop_front())
            .ok_or_else(|| BusError::Closed(queue.to_string()))
    }

    /// Put a message back at the head of `queue`. Returns false when the
    /// queue no longer exists and the message had to be dropped.
    pub fn requeue(&mut self, queue: &str, message: Message) -> bool {
        match self.queues.get_mut(queue) {
            Some(state) => {
                state.messages.push_front(message);
                true
            }
            None => false,
        }
    }

    /// Remove a queue and every exchange binding pointing at it.
    /// Returns the number of undelivered messages discarded.
    pub fn delete_queue(&mut self, queue: &str) -> Option<usize> {
        let state = self.queues.remove(queue)?;
        for bindings in self.exchanges.values_mut() {
            bindings.retain(|b| b.queue != queue);
        }
        Some(state.messages.len())
    }

    pub fn queue_len(&self, queue: &str) -> Option<usize> {
        self.queues.get(queue).map(|q| q.messages.len())
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }
}

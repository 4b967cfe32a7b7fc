use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BusError;
use crate::message::Message;

/// How an inbound destination should be declared when it is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboundOptions {
    /// Delete the destination (and anything still queued in it) once the
    /// receiver is closed. Used for per-call RPC reply queues.
    pub ephemeral: bool,
}

impl InboundOptions {
    pub fn durable() -> Self {
        Self { ephemeral: false }
    }

    pub fn ephemeral() -> Self {
        Self { ephemeral: true }
    }
}

/// Sending side of a channel, bound to one destination (queue or exchange).
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Name of the destination this sender delivers to.
    fn destination(&self) -> &str;

    /// Deliver a message. Fails with [`BusError::UnknownDestination`] when
    /// nothing is declared under the destination name.
    async fn send(&self, message: Message) -> Result<(), BusError>;

    /// Release any transport resources. Safe to call more than once.
    async fn close(&self) -> Result<(), BusError> {
        Ok(())
    }
}

/// Receiving side of a channel.
#[async_trait]
pub trait Inbound: Send + Sync {
    /// Name of the queue this receiver consumes from. For exchange
    /// subscriptions this is the private queue created for the binding.
    fn queue(&self) -> &str;

    /// Wait up to `timeout` for the next message. `Ok(None)` means the
    /// timeout elapsed with nothing to deliver.
    async fn receive(&self, timeout: Duration) -> Result<Option<Message>, BusError>;

    /// Stop consuming. Ephemeral destinations are deleted. Idempotent.
    async fn close(&self) -> Result<(), BusError>;
}

/// A connection to a message bus that hands out senders and receivers.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn open_outbound(&self, destination: &str) -> Result<Box<dyn Outbound>, BusError>;

    /// Open a receiver on `address` (`queue`, or `exchange/subject-prefix`).
    ///
    /// Queues are declared on demand. Opening on an exchange creates a
    /// private, always-ephemeral queue bound with the subject filter.
    async fn open_inbound(
        &self,
        address: &str,
        options: InboundOptions,
    ) -> Result<Box<dyn Inbound>, BusError>;
}

/// Blanket implementation so `Arc<dyn Bus>` can be used directly.
#[async_trait]
impl<T: Bus + ?Sized> Bus for Arc<T> {
    async fn open_outbound(&self, destination: &str) -> Result<Box<dyn Outbound>, BusError> {
        (**self).open_outbound(destination).await
    }

    async fn open_inbound(
        &self,
        address: &str,
        options: InboundOptions,
    ) -> Result<Box<dyn Inbound>, BusError> {
        (**self).open_inbound(address, options).await
    }
}

//! Command protocol spoken between [`ZmqBus`](crate::ZmqBus) clients and the
//! [`BusBroker`](crate::BusBroker).
//!
//! ## Framing (zeromq-rs 0.4)
//!
//! - DEALER sends: `[command]`
//! - ROUTER receives: `[identity, command]`
//! - ROUTER sends: `[identity, reply]`
//! - DEALER receives: `[reply]`
//!
//! Both frames are MessagePack. Every command carries a `request_id` that the
//! broker echoes in its reply, so one DEALER can have many commands in
//! flight (in particular several long-polling `Fetch`es).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BusError;
use crate::message::Message;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub request_id: Uuid,
    pub op: Op,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    Ping,
    DeclareQueue { name: String },
    DeclareExchange { name: String },
    /// Resolve an inbound address to a queue name (see [`Router::open`](crate::router::Router::open)).
    Open { address: String, ephemeral: bool },
    Send { destination: String, message: Message },
    /// Long poll: answered with `Delivered` once the queue has a message.
    Fetch { queue: String },
    /// Withdraw a pending `Fetch`. Answered with `Cancelled`; `pending =
    /// false` means the fetch had already been answered and the client must
    /// requeue the delivery it abandoned.
    Cancel { fetch_id: Uuid },
    Requeue { queue: String, message: Message },
    Delete { queue: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub request_id: Uuid,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Pong,
    Done,
    Opened { queue: String, ephemeral: bool },
    Delivered { message: Message },
    Cancelled { fetch_id: Uuid, pending: bool },
    Failed { kind: FailureKind, detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnknownDestination,
    InvalidAddress,
    Closed,
    Rejected,
}

impl Outcome {
    pub fn from_error(err: &BusError) -> Self {
        let (kind, detail) = match err {
            BusError::UnknownDestination(d) => (FailureKind::UnknownDestination, d.clone()),
            BusError::InvalidAddress(a) => (FailureKind::InvalidAddress, a.clone()),
            BusError::Closed(q) => (FailureKind::Closed, q.clone()),
            other => (FailureKind::Rejected, other.to_string()),
        };
        Outcome::Failed { kind, detail }
    }
}

impl From<(FailureKind, String)> for BusError {
    fn from((kind, detail): (FailureKind, String)) -> Self {
        match kind {
            FailureKind::UnknownDestination => BusError::UnknownDestination(detail),
            FailureKind::InvalidAddress => BusError::InvalidAddress(detail),
            FailureKind::Closed => BusError::Closed(detail),
            FailureKind::Rejected => BusError::Rejected(detail),
        }
    }
}

impl Command {
    pub fn new(op: Op) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            op,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

impl Reply {
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

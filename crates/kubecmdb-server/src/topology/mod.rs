//! Broker Channel Topology
//!
//! ```text
//! <source>  ──(*)──▶  <source>.headers  ──(x-match: clusterId=A)──▶  queue "A"
//!                                       ──(x-match: clusterId=B)──▶  queue "B"
//! ```
//!
//! One headers exchange per deployment receives every change event from the
//! upstream source exchange. Each owned cluster gets an exclusive,
//! auto-deleting queue named after the cluster ID and bound on its
//! `clusterId` header, consumed with a prefetch of one.
//!
//! `Broker` is the transport seam: `amqp` talks to RabbitMQ through `lapin`,
//! `memory` is an in-process broker for tests.

pub mod amqp;
mod consumer;
pub mod memory;

pub use amqp::AmqpBroker;
pub use consumer::{ChannelTopology, MessageHandler};
pub use memory::MemoryBroker;

use crate::error::BrokerError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use kubecmdb_core::HeaderMap;

/// A broker message, transport-neutral.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventMessage {
    pub routing_key: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Acknowledges one delivery on the channel it arrived on.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;
}

pub struct Delivery {
    pub message: EventMessage,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(message: EventMessage, acker: Box<dyn Acknowledger>) -> Self {
        Self { message, acker }
    }

    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Queue and exchange operations the synchronizer relies on.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare `headers_exchange` and bind it from the source exchange.
    async fn ensure_exchange(&self, headers_exchange: &str) -> Result<(), BrokerError>;

    /// Declare the exclusive, durable, auto-delete queue for a cluster.
    async fn declare_queue(&self, cluster_id: &str) -> Result<(), BrokerError>;

    /// Bind the cluster's queue to `exchange` on its `clusterId` header.
    async fn bind_queue(&self, cluster_id: &str, exchange: &str) -> Result<(), BrokerError>;

    /// Start an exclusive consumer with prefetch 1 on the cluster's queue.
    async fn consume(&self, cluster_id: &str) -> Result<DeliveryStream, BrokerError>;

    /// Publish to the source exchange with the message's routing key.
    async fn publish(&self, message: &EventMessage) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

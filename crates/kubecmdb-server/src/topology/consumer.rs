//! ChannelTopology
//!
//! Per-cluster queue setup and the consume loop. Each delivery is handed to
//! the handler and acknowledged once the handler returns, whatever the
//! outcome; failures are dealt with by republishing, never by broker-level
//! requeue.

use super::{Broker, EventMessage};
use crate::error::BrokerError;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Handles one delivery; acknowledgement happens after it returns.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &EventMessage);
}

#[derive(Clone)]
pub struct ChannelTopology {
    broker: Arc<dyn Broker>,
    headers_exchange: String,
}

impl ChannelTopology {
    pub fn new(broker: Arc<dyn Broker>, headers_exchange: impl Into<String>) -> Self {
        Self {
            broker,
            headers_exchange: headers_exchange.into(),
        }
    }

    pub fn headers_exchange(&self) -> &str {
        &self.headers_exchange
    }

    pub async fn ensure_exchange(&self) -> Result<(), BrokerError> {
        self.broker.ensure_exchange(&self.headers_exchange).await
    }

    pub async fn declare_queue(&self, cluster_id: &str) -> Result<(), BrokerError> {
        self.broker.declare_queue(cluster_id).await
    }

    pub async fn bind_queue(&self, cluster_id: &str) -> Result<(), BrokerError> {
        self.broker
            .bind_queue(cluster_id, &self.headers_exchange)
            .await
    }

    pub async fn publish(&self, message: &EventMessage) -> Result<(), BrokerError> {
        self.broker.publish(message).await
    }

    pub async fn close(&self) -> Result<(), BrokerError> {
        self.broker.close().await
    }

    /// Set up the cluster's queue and consume it until `cancel` fires.
    ///
    /// Returns `Ok` on cancellation and an error when the consumer or its
    /// channel goes away.
    pub async fn start_consumer(
        &self,
        cluster_id: &str,
        handler: &dyn MessageHandler,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError> {
        self.ensure_exchange().await?;
        self.declare_queue(cluster_id).await?;
        self.bind_queue(cluster_id).await?;
        let mut deliveries = self.broker.consume(cluster_id).await?;
        info!(cluster_id = %cluster_id, exchange = %self.headers_exchange, "Consumer started");

        loop {
            let delivery = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(cluster_id = %cluster_id, "Consumer cancelled");
                    return Ok(());
                }
                next = deliveries.next() => next,
            };

            let delivery = match delivery {
                Some(delivery) => delivery?,
                None => return Err(BrokerError::ConsumerClosed(cluster_id.to_string())),
            };
            handler.handle(&delivery.message).await;
            delivery.ack().await?;
        }
    }
}

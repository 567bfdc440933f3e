//! In-process broker
//!
//! Emulates the headers-exchange routing: a message reaches the queue whose
//! binding matches its `clusterId` header. Each queue admits one consumer at
//! a time, like an exclusive AMQP consumer, and every publish and ack is
//! recorded for assertions.

use super::{Acknowledger, Broker, Delivery, DeliveryStream, EventMessage};
use crate::error::BrokerError;
use async_trait::async_trait;
use kubecmdb_core::headers::HEADER_CLUSTER_ID;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

struct Queue {
    sender: mpsc::UnboundedSender<EventMessage>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<EventMessage>>>,
    bound: bool,
    consuming: Arc<AtomicBool>,
}

impl Queue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            bound: false,
            consuming: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[derive(Default)]
pub struct MemoryBroker {
    exchanges: Mutex<HashSet<String>>,
    queues: Mutex<HashMap<String, Queue>>,
    published: Mutex<Vec<EventMessage>>,
    acks: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a message the way the upstream producer would.
    pub async fn inject(&self, message: EventMessage) {
        self.route(message).await;
    }

    /// Messages published through `Broker::publish`, oldest first.
    pub async fn published(&self) -> Vec<EventMessage> {
        self.published.lock().await.clone()
    }

    pub fn ack_count(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }

    pub async fn has_exchange(&self, name: &str) -> bool {
        self.exchanges.lock().await.contains(name)
    }

    pub async fn consumer_count(&self, cluster_id: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(cluster_id)
            .map_or(0, |q| usize::from(q.consuming.load(Ordering::SeqCst)))
    }

    /// Clusters with an active consumer.
    pub async fn consuming(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .queues
            .lock()
            .await
            .iter()
            .filter(|(_, q)| q.consuming.load(Ordering::SeqCst))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Wait until a consumer is attached to the cluster's queue.
    pub async fn wait_for_consumer(&self, cluster_id: &str) {
        loop {
            if let Some(queue) = self.queues.lock().await.get(cluster_id) {
                if queue.consuming.load(Ordering::SeqCst) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    async fn route(&self, message: EventMessage) {
        let cluster_id = message
            .headers
            .get(HEADER_CLUSTER_ID)
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let queues = self.queues.lock().await;
        if let Some(queue) = cluster_id.and_then(|id| queues.get(&id)) {
            if queue.bound {
                let _ = queue.sender.send(message);
            }
        }
    }

    fn check_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }
}

struct MemoryAck {
    acks: Arc<AtomicUsize>,
}

#[async_trait]
impl Acknowledger for MemoryAck {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Releases the queue's consumer slot when the stream is dropped.
struct ConsumerSlot(Arc<AtomicBool>);

impl Drop for ConsumerSlot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ensure_exchange(&self, headers_exchange: &str) -> Result<(), BrokerError> {
        self.check_open()?;
        self.exchanges
            .lock()
            .await
            .insert(headers_exchange.to_string());
        Ok(())
    }

    async fn declare_queue(&self, cluster_id: &str) -> Result<(), BrokerError> {
        self.check_open()?;
        self.queues
            .lock()
            .await
            .entry(cluster_id.to_string())
            .or_insert_with(Queue::new);
        Ok(())
    }

    async fn bind_queue(&self, cluster_id: &str, exchange: &str) -> Result<(), BrokerError> {
        self.check_open()?;
        if !self.exchanges.lock().await.contains(exchange) {
            return Err(BrokerError::ConsumerClosed(format!("no exchange {exchange}")));
        }
        let mut queues = self.queues.lock().await;
        let queue = queues
            .get_mut(cluster_id)
            .ok_or_else(|| BrokerError::ConsumerClosed(cluster_id.to_string()))?;
        queue.bound = true;
        Ok(())
    }

    async fn consume(&self, cluster_id: &str) -> Result<DeliveryStream, BrokerError> {
        self.check_open()?;
        let queues = self.queues.lock().await;
        let queue = queues
            .get(cluster_id)
            .ok_or_else(|| BrokerError::ConsumerClosed(cluster_id.to_string()))?;
        if queue.consuming.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::QueueLocked(cluster_id.to_string()));
        }

        let slot = ConsumerSlot(queue.consuming.clone());
        let receiver = queue.receiver.clone();
        let acks = self.acks.clone();
        let stream = futures::stream::unfold(
            (slot, receiver, acks),
            |(slot, receiver, acks)| async move {
                let message = receiver.lock().await.recv().await?;
                let delivery = Delivery::new(message, Box::new(MemoryAck { acks: acks.clone() }));
                Some((Ok(delivery), (slot, receiver, acks)))
            },
        );
        Ok(Box::pin(stream))
    }

    async fn publish(&self, message: &EventMessage) -> Result<(), BrokerError> {
        self.check_open()?;
        self.published.lock().await.push(message.clone());
        self.route(message.clone()).await;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        self.queues.lock().await.clear();
        Ok(())
    }
}

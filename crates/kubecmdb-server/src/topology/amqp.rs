//! AMQP broker over `lapin`
//!
//! One connection per process, opened lazily and re-opened when it reports
//! closed. Declarations and publishes share a control channel; every
//! consumer gets its own channel so prefetch 1 applies per cluster.

use super::{Acknowledger, Broker, Delivery, DeliveryStream, EventMessage};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use futures::StreamExt;
use kubecmdb_core::headers::HEADER_CLUSTER_ID;
use kubecmdb_core::{HeaderMap, HeaderValue};
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeBindOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Binding key from the source exchange; matches every event.
const SOURCE_BINDING_KEY: &str = "*";

pub struct AmqpBroker {
    url: String,
    source_exchange: String,
    connect_timeout: Duration,
    connection: Mutex<Option<Arc<Connection>>>,
    control: Mutex<Option<Channel>>,
}

impl AmqpBroker {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            url: config.url.clone(),
            source_exchange: config.source_exchange.clone(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            connection: Mutex::new(None),
            control: Mutex::new(None),
        }
    }

    /// Open the connection now, retrying with exponential backoff until the
    /// connect timeout elapses.
    pub async fn connect(&self) -> Result<(), BrokerError> {
        self.connection().await.map(|_| ())
    }

    async fn connection(&self) -> Result<Arc<Connection>, BrokerError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            if conn.status().connected() {
                return Ok(conn.clone());
            }
            warn!("Broker connection closed, reconnecting");
        }

        let policy = ExponentialBackoff {
            max_elapsed_time: Some(self.connect_timeout),
            ..ExponentialBackoff::default()
        };
        let url = self.url.clone();
        let conn = backoff::future::retry(policy, || async {
            Connection::connect(&url, ConnectionProperties::default())
                .await
                .map_err(|e| {
                    warn!(error = %e, "Broker connection attempt failed");
                    backoff::Error::transient(e)
                })
        })
        .await?;
        info!("Connected to broker");

        let conn = Arc::new(conn);
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn control_channel(&self) -> Result<Channel, BrokerError> {
        let mut guard = self.control.lock().await;
        if let Some(channel) = guard.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }
        let channel = self.connection().await?.create_channel().await?;
        *guard = Some(channel.clone());
        Ok(channel)
    }
}

struct AmqpAck(Acker);

#[async_trait]
impl Acknowledger for AmqpAck {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn ensure_exchange(&self, headers_exchange: &str) -> Result<(), BrokerError> {
        let channel = self.control_channel().await?;
        channel
            .exchange_declare(
                headers_exchange,
                ExchangeKind::Headers,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .exchange_bind(
                headers_exchange,
                &self.source_exchange,
                SOURCE_BINDING_KEY,
                ExchangeBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, cluster_id: &str) -> Result<(), BrokerError> {
        self.control_channel()
            .await?
            .queue_declare(
                cluster_id,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, cluster_id: &str, exchange: &str) -> Result<(), BrokerError> {
        let mut args = FieldTable::default();
        args.insert(
            ShortString::from("x-match"),
            AMQPValue::LongString(LongString::from("all")),
        );
        args.insert(
            ShortString::from(HEADER_CLUSTER_ID),
            AMQPValue::LongString(LongString::from(cluster_id)),
        );
        self.control_channel()
            .await?
            .queue_bind(cluster_id, exchange, "", QueueBindOptions::default(), args)
            .await?;
        Ok(())
    }

    async fn consume(&self, cluster_id: &str) -> Result<DeliveryStream, BrokerError> {
        let channel = self.connection().await?.create_channel().await?;
        channel.basic_qos(1, BasicQosOptions::default()).await?;
        let consumer = channel
            .basic_consume(
                cluster_id,
                &format!("kubecmdb-{cluster_id}"),
                BasicConsumeOptions {
                    exclusive: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        let stream = consumer.map(|delivery| -> Result<Delivery, BrokerError> {
            let delivery = delivery?;
            let message = EventMessage {
                routing_key: delivery.routing_key.as_str().to_string(),
                headers: delivery
                    .properties
                    .headers()
                    .as_ref()
                    .map(from_field_table)
                    .unwrap_or_default(),
                body: delivery.data,
            };
            Ok(Delivery::new(message, Box::new(AmqpAck(delivery.acker))))
        });
        Ok(Box::pin(stream))
    }

    async fn publish(&self, message: &EventMessage) -> Result<(), BrokerError> {
        let properties = BasicProperties::default().with_headers(to_field_table(&message.headers));
        self.control_channel()
            .await?
            .basic_publish(
                &self.source_exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if let Some(conn) = self.connection.lock().await.take() {
            if conn.status().connected() {
                conn.close(200, "shutdown").await?;
            }
        }
        self.control.lock().await.take();
        Ok(())
    }
}

fn from_field_table(table: &FieldTable) -> HeaderMap {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(s) => {
                    HeaderValue::Str(String::from_utf8_lossy(s.as_bytes()).into_owned())
                }
                AMQPValue::ShortString(s) => HeaderValue::Str(s.as_str().to_string()),
                AMQPValue::Boolean(b) => HeaderValue::Bool(*b),
                AMQPValue::ShortShortInt(n) => HeaderValue::Int(i64::from(*n)),
                AMQPValue::ShortShortUInt(n) => HeaderValue::Int(i64::from(*n)),
                AMQPValue::ShortInt(n) => HeaderValue::Int(i64::from(*n)),
                AMQPValue::ShortUInt(n) => HeaderValue::Int(i64::from(*n)),
                AMQPValue::LongInt(n) => HeaderValue::Int(i64::from(*n)),
                AMQPValue::LongUInt(n) => HeaderValue::Int(i64::from(*n)),
                AMQPValue::LongLongInt(n) => HeaderValue::Int(*n),
                _ => return None,
            };
            Some((key.as_str().to_string(), value))
        })
        .collect()
}

/// Integers that fit are sent as 32-bit, matching the `republish` header.
fn to_field_table(headers: &HeaderMap) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        let value = match value {
            HeaderValue::Str(s) => AMQPValue::LongString(LongString::from(s.as_str())),
            HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
            HeaderValue::Int(n) => match i32::try_from(*n) {
                Ok(n) => AMQPValue::LongInt(n),
                Err(_) => AMQPValue::LongLongInt(*n),
            },
        };
        table.insert(ShortString::from(key.as_str()), value);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubecmdb_core::headers::HEADER_REPUBLISH;

    #[test]
    fn test_header_conversion() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_CLUSTER_ID.into(), HeaderValue::from("BCS-K8S-40001"));
        headers.insert(HEADER_REPUBLISH.into(), HeaderValue::Int(3));

        let table = to_field_table(&headers);
        assert_eq!(
            table.inner().get(&ShortString::from(HEADER_REPUBLISH)),
            Some(&AMQPValue::LongInt(3))
        );
        assert_eq!(from_field_table(&table), headers);
    }

    #[test]
    fn test_unsupported_values_are_skipped() {
        let mut table = FieldTable::default();
        table.insert(ShortString::from("void"), AMQPValue::Void);
        table.insert(ShortString::from("flag"), AMQPValue::Boolean(true));

        let headers = from_field_table(&table);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("flag"), Some(&HeaderValue::Bool(true)));
    }
}

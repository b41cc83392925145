//! Kafka backend (`rdkafka`)
//!
//! Producer sends keyed records so the broker's partitioner keeps every
//! message of one URL on one partition. Consumers run with auto-commit on and
//! auto offset store off: an offset only becomes eligible for commit once the
//! stage dispatcher calls [`Subscription::commit`] after publishing the outcome.

use crate::error::{BrokerError, Result};
use crate::message::{Delivery, Message};
use crate::{Broker, Subscription};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::Message as _;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// Connection settings for the Kafka backend
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Bootstrap servers, e.g. `["localhost:9092"]`
    pub brokers: Vec<String>,
    pub session_timeout_ms: u32,
    pub message_timeout_ms: u32,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            session_timeout_ms: 6000,
            message_timeout_ms: 5000,
        }
    }
}

impl KafkaConfig {
    fn bootstrap(&self) -> Result<String> {
        if self.brokers.is_empty() {
            return Err(BrokerError::Config("broker list cannot be empty".to_string()));
        }
        Ok(self.brokers.join(","))
    }
}

pub struct KafkaBroker {
    config: KafkaConfig,
    producer: FutureProducer,
}

impl KafkaBroker {
    /// Create the producer and verify the cluster is reachable
    pub fn connect(config: KafkaConfig) -> Result<Self> {
        let bootstrap = config.bootstrap()?;
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &bootstrap)
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .set("enable.idempotence", "true")
            .create()?;

        producer
            .client()
            .fetch_metadata(None, Timeout::After(Duration::from_secs(10)))
            .map_err(|e| BrokerError::Connection(format!("cannot reach {}: {}", bootstrap, e)))?;

        info!(brokers = %bootstrap, "Connected to Kafka");
        Ok(Self { config, producer })
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn publish(&self, topic: &str, message: Message) -> Result<()> {
        let mut headers = OwnedHeaders::new_with_capacity(message.headers.len());
        for (name, value) in &message.headers {
            headers = headers.insert(Header {
                key: name.as_str(),
                value: Some(value.as_slice()),
            });
        }

        let record = FutureRecord::to(topic)
            .key(&message.key)
            .payload(&message.value)
            .headers(headers);

        self.producer
            .send(record, Timeout::After(Duration::from_millis(u64::from(self.config.message_timeout_ms))))
            .await
            .map_err(|(err, _)| BrokerError::Publish {
                topic: topic.to_string(),
                reason: err.to_string(),
            })?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn Subscription>> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.bootstrap()?)
            .set("group.id", group)
            .set("session.timeout.ms", self.config.session_timeout_ms.to_string())
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;
        consumer.subscribe(&[topic])?;

        debug!(topic, group, "Subscribed to Kafka topic");
        Ok(Box::new(KafkaSubscription { consumer }))
    }

    async fn close_topic(&self, _topic: &str) -> Result<()> {
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.producer
            .flush(Timeout::After(Duration::from_secs(10)))
            .map_err(BrokerError::from)
    }
}

struct KafkaSubscription {
    consumer: StreamConsumer,
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn next(&self) -> Result<Option<Delivery>> {
        let msg = self
            .consumer
            .recv()
            .await
            .map_err(|e| BrokerError::Receive(e.to_string()))?;

        let mut headers = BTreeMap::new();
        if let Some(borrowed) = msg.headers() {
            for header in borrowed.iter() {
                if let Some(value) = header.value {
                    headers.insert(header.key.to_string(), value.to_vec());
                }
            }
        }

        Ok(Some(Delivery {
            topic: msg.topic().to_string(),
            partition: u32::try_from(msg.partition())
                .map_err(|_| BrokerError::Receive(format!("negative partition {}", msg.partition())))?,
            offset: u64::try_from(msg.offset())
                .map_err(|_| BrokerError::Receive(format!("negative offset {}", msg.offset())))?,
            message: Message {
                key: msg.key().map(<[u8]>::to_vec).unwrap_or_default(),
                value: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                headers,
            },
        }))
    }

    async fn commit(&self, delivery: &Delivery) -> Result<()> {
        // librdkafka stores offset + 1 as the next position
        self.consumer
            .store_offset(&delivery.topic, delivery.partition as i32, delivery.offset as i64)
            .map_err(|e| BrokerError::Commit(e.to_string()))
    }
}

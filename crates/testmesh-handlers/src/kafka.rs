//! `kafka.produce` and `kafka.consume` handlers.

use async_trait::async_trait;
use rdkafka::Message;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use testmesh_core::handler::{ActionHandler, CallEnvelope, ConfigView, Output};
use testmesh_core::{Error, Result};

const PRODUCE_TIMEOUT: Duration = Duration::from_secs(30);

fn brokers_from(view: &ConfigView<'_>) -> Result<String> {
    match view.require_value("brokers")? {
        Value::String(s) => Ok(s.clone()),
        Value::Array(items) => {
            let parts: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
            if parts.len() != items.len() {
                return Err(Error::InvalidConfig(
                    "field `brokers` must be a string or array of strings".into(),
                ));
            }
            Ok(parts.join(","))
        }
        other => Err(Error::InvalidConfig(format!(
            "field `brokers` must be a string or array of strings, got {other}"
        ))),
    }
}

fn payload_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Produces a single message and waits for the broker's ack.
///
/// Config: `{ brokers, topic, key?, payload, headers? }`. Output:
/// `{ topic, partition, offset, key, duration_ms }`.
pub struct KafkaProduceHandler {
    producers: Mutex<HashMap<String, FutureProducer>>,
}

impl KafkaProduceHandler {
    pub fn new() -> Self {
        Self {
            producers: Mutex::new(HashMap::new()),
        }
    }

    async fn producer(&self, brokers: &str) -> Result<FutureProducer> {
        let mut producers = self.producers.lock().await;
        if let Some(producer) = producers.get(brokers) {
            return Ok(producer.clone());
        }
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(|e| Error::Handler(format!("failed to create Kafka producer: {e}")))?;
        producers.insert(brokers.to_string(), producer.clone());
        Ok(producer)
    }
}

impl Default for KafkaProduceHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionHandler for KafkaProduceHandler {
    fn name(&self) -> &str {
        "kafka.produce"
    }

    async fn execute(&self, envelope: &CallEnvelope, config: &Value) -> Result<Output> {
        let view = ConfigView::new(config);
        let brokers = brokers_from(&view)?;
        let topic = view.require_str("topic")?;
        let key = view.scalar_string_opt("key")?;
        let payload = payload_text(view.require_value("payload")?);

        let producer = self.producer(&brokers).await?;

        let mut record: FutureRecord<'_, str, str> =
            FutureRecord::to(topic).payload(payload.as_str());
        if let Some(key) = key.as_deref() {
            record = record.key(key);
        }
        if let Some(headers) = view.object_opt("headers")? {
            let mut owned = OwnedHeaders::new();
            for (name, value) in headers {
                let text = payload_text(value);
                owned = owned.insert(Header {
                    key: name,
                    value: Some(text.as_str()),
                });
            }
            record = record.headers(owned);
        }

        let started = Instant::now();
        let delivery = tokio::select! {
            _ = envelope.cancel.cancelled() => return Err(Error::Cancelled),
            delivery = producer.send(record, Timeout::After(PRODUCE_TIMEOUT)) => delivery,
        };
        let (partition, offset) =
            delivery.map_err(|(e, _)| Error::Handler(format!("produce failed: {e}")))?;

        let mut output = Output::new();
        output.insert("topic".into(), json!(topic));
        output.insert("partition".into(), json!(partition));
        output.insert("offset".into(), json!(offset));
        output.insert("key".into(), key.map(Value::String).unwrap_or(Value::Null));
        output.insert(
            "duration_ms".into(),
            json!(started.elapsed().as_millis() as u64),
        );
        Ok(output)
    }
}

/// Consumes up to `count` messages or until `timeout` elapses.
///
/// Config: `{ brokers, topic, group_id?, timeout?, count?, from_beginning? }`.
/// Output: `{ messages, count, duration_ms }` with each message carrying
/// `{ topic, partition, offset, key, value, timestamp }`.
pub struct KafkaConsumeHandler;

#[async_trait]
impl ActionHandler for KafkaConsumeHandler {
    fn name(&self) -> &str {
        "kafka.consume"
    }

    async fn execute(&self, envelope: &CallEnvelope, config: &Value) -> Result<Output> {
        let view = ConfigView::new(config);
        let brokers = brokers_from(&view)?;
        let topic = view.require_str("topic")?;
        let group_id = view
            .str_opt("group_id")?
            .map(String::from)
            .unwrap_or_else(|| format!("testmesh-{}", uuid::Uuid::new_v4()));
        let timeout_text = view.str_opt("timeout")?.unwrap_or("5s");
        let timeout = humantime::parse_duration(timeout_text)
            .map_err(|e| Error::InvalidConfig(format!("invalid timeout `{timeout_text}`: {e}")))?;
        let count = view.u64_opt("count")?.unwrap_or(1).max(1) as usize;
        let from_beginning = view.bool_opt("from_beginning")?.unwrap_or(false);

        // One consumer per call: consume steps are rare and group offsets
        // make pooled consumers observable across executions.
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("group.id", &group_id)
            .set(
                "auto.offset.reset",
                if from_beginning { "earliest" } else { "latest" },
            )
            .set("enable.auto.commit", "true")
            .create()
            .map_err(|e| Error::Handler(format!("failed to create Kafka consumer: {e}")))?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| Error::Handler(format!("failed to subscribe to `{topic}`: {e}")))?;

        let started = Instant::now();
        let deadline = started + timeout;
        let mut messages = Vec::with_capacity(count);

        while messages.len() < count {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };

            let received = tokio::select! {
                _ = envelope.cancel.cancelled() => return Err(Error::Cancelled),
                received = tokio::time::timeout(remaining, consumer.recv()) => received,
            };

            match received {
                Err(_) => break, // timeout elapsed
                Ok(Err(e)) => return Err(Error::Handler(format!("consume failed: {e}"))),
                Ok(Ok(message)) => {
                    let key = message
                        .key()
                        .map(|k| String::from_utf8_lossy(k).into_owned());
                    let value = message
                        .payload()
                        .map(|p| {
                            let text = String::from_utf8_lossy(p).into_owned();
                            serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text))
                        })
                        .unwrap_or(Value::Null);

                    messages.push(json!({
                        "topic": message.topic(),
                        "partition": message.partition(),
                        "offset": message.offset(),
                        "key": key,
                        "value": value,
                        "timestamp": message.timestamp().to_millis(),
                    }));
                }
            }
        }

        let mut output = Output::new();
        output.insert("count".into(), json!(messages.len()));
        output.insert("messages".into(), Value::Array(messages));
        output.insert(
            "duration_ms".into(),
            json!(started.elapsed().as_millis() as u64),
        );
        Ok(output)
    }
}

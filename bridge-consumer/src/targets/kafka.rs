use std::time::Duration;

use async_trait::async_trait;
use bridge_common::config::KafkaConnectionConfig;
use bridge_common::delivery::Delivery;
use bytes::Bytes;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tracing::{debug, error};

use crate::error::TargetError;
use crate::targets::Target;

/// Publishes each message to a configured topic. Only byte-array header
/// values travel; Kafka record headers carry raw bytes.
pub struct KafkaTarget {
    producer: FutureProducer,
    topic: String,
}

impl KafkaTarget {
    pub fn new(connection: &KafkaConnectionConfig, topic: String) -> Result<Self, TargetError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", connection.servers.join(","))
            .set("client.id", &connection.client_id)
            .set("message.timeout.ms", connection.timeout.as_millis().to_string())
            .set("compression.codec", &connection.compress)
            .set("acks", &connection.ack)
            .set("message.send.max.retries", connection.retry.to_string());

        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer = client_config
            .create()
            .map_err(|err| TargetError::Fatal(format!("failed to create kafka producer: {err}")))?;

        Ok(KafkaTarget { producer, topic })
    }
}

#[async_trait]
impl Target for KafkaTarget {
    async fn handle(&self, delivery: &Delivery) -> Result<Option<Bytes>, TargetError> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &delivery.headers {
            if let Some(bytes) = value.as_bytes() {
                headers = headers.insert(Header {
                    key,
                    value: Some(bytes),
                });
            }
        }

        let key: Option<&str> = None;
        let record = FutureRecord {
            topic: self.topic.as_str(),
            partition: None,
            payload: Some(delivery.body.as_ref()),
            key,
            timestamp: None,
            headers: Some(headers),
        };

        match self.producer.send(record, Timeout::Never).await {
            Ok((partition, offset)) => {
                debug!(partition, offset, "pushed to kafka");
                Ok(None)
            }
            Err((err, _)) => {
                error!(error = %err, topic = %self.topic, "failed pushing");
                Err(TargetError::Transient("failed pushing".to_owned()))
            }
        }
    }

    async fn terminate(&self) -> Result<(), TargetError> {
        self.producer
            .flush(Duration::from_secs(30))
            .map_err(|err| TargetError::Transient(format!("failed flushing producer: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_builds_from_connection_options() {
        let connection = KafkaConnectionConfig {
            servers: vec!["localhost:9092".to_owned()],
            client_id: "bridge".to_owned(),
            timeout: Duration::from_secs(10),
            ack: "1".to_owned(),
            compress: "gzip".to_owned(),
            retry: 3,
        };

        // Producer construction is offline; connectivity only matters on send.
        assert!(KafkaTarget::new(&connection, "events".to_owned()).is_ok());
    }
}

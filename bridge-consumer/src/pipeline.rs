//! Post-target stage: a target's response bytes can describe follow-up
//! publishes, which the pipeline emits as new messages.

use bridge_common::config::{PipelineConfig, RabbitMqTargetConfig};
use bridge_common::delivery::Headers;
use lapin::{Channel, Connection};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::error;

use crate::broker;
use crate::error::{BridgeError, TargetError};

/// One follow-up publish: `subject` is the routing key, `message` the
/// JSON-encoded body, `context` the headers.
#[derive(Debug, Deserialize)]
pub struct PublishMessage {
    pub subject: String,
    pub message: serde_json::Value,
    #[serde(default)]
    pub context: Headers,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum Envelope {
    #[serde(rename = "publish.message")]
    Message(PublishMessage),
    #[serde(rename = "publish.messages")]
    Messages { messages: Vec<PublishMessage> },
}

impl Envelope {
    fn into_messages(self) -> Vec<PublishMessage> {
        match self {
            Envelope::Message(message) => vec![message],
            Envelope::Messages { messages } => messages,
        }
    }
}

/// The closed set of pipeline kinds.
pub enum Pipeline {
    RabbitMq(RabbitMqPipeline),
}

impl Pipeline {
    pub fn new(config: &PipelineConfig, stop: mpsc::Sender<bool>) -> Result<Pipeline, BridgeError> {
        match config.kind.as_str() {
            "rabbitmq" => {
                let rabbitmq = config.rabbitmq.clone().ok_or_else(|| {
                    BridgeError::UnsupportedPipeline(
                        "rabbitmq pipeline without a rabbitmq section".to_owned(),
                    )
                })?;
                Ok(Pipeline::RabbitMq(RabbitMqPipeline::new(rabbitmq, stop)))
            }
            other => Err(BridgeError::UnsupportedPipeline(other.to_owned())),
        }
    }

    pub async fn start(&mut self) -> Result<(), TargetError> {
        match self {
            Pipeline::RabbitMq(pipeline) => pipeline.start().await,
        }
    }

    /// Parse the response envelope and emit every publish it describes.
    /// `false` on any parse or publish error; the worker treats that as a
    /// handler failure.
    pub async fn invoke(&self, data: &[u8]) -> bool {
        match self {
            Pipeline::RabbitMq(pipeline) => pipeline.invoke(data).await,
        }
    }

    pub async fn terminate(&self) -> Result<(), TargetError> {
        match self {
            Pipeline::RabbitMq(pipeline) => pipeline.terminate().await,
        }
    }
}

pub struct RabbitMqPipeline {
    config: RabbitMqTargetConfig,
    stop: mpsc::Sender<bool>,
    connection: Option<Connection>,
    channel: Option<Channel>,
}

impl RabbitMqPipeline {
    fn new(config: RabbitMqTargetConfig, stop: mpsc::Sender<bool>) -> Self {
        RabbitMqPipeline {
            config,
            stop,
            connection: None,
            channel: None,
        }
    }

    async fn start(&mut self) -> Result<(), TargetError> {
        let kind = broker::exchange_kind(&self.config.kind)
            .map_err(|err| TargetError::Fatal(err.to_string()))?;

        let connection = broker::connect(&self.config.url, self.stop.clone())
            .await
            .map_err(|err| TargetError::Fatal(format!("failed to make connection: {err}")))?;

        let channel = broker::channel(&connection, kind, &self.config.exchange)
            .await
            .map_err(|err| TargetError::Fatal(format!("failed to make channel: {err}")))?;

        self.connection = Some(connection);
        self.channel = Some(channel);

        Ok(())
    }

    async fn invoke(&self, data: &[u8]) -> bool {
        let Some(channel) = self.channel.as_ref() else {
            error!("pipeline was not started");
            return false;
        };

        let envelope: Envelope = match serde_json::from_slice(data) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(error = %err, "failed to parse pipeline response");
                return false;
            }
        };

        for publish in envelope.into_messages() {
            let body = match serde_json::to_vec(&publish.message) {
                Ok(body) => body,
                Err(err) => {
                    error!(error = %err, subject = %publish.subject, "failed to encode message");
                    return false;
                }
            };

            let properties = broker::publish_properties(None, &publish.context);
            if let Err(err) = broker::publish(
                channel,
                &self.config.exchange,
                &publish.subject,
                &body,
                properties,
            )
            .await
            {
                error!(
                    error = %err,
                    subject = %publish.subject,
                    "failed to push message to rabbitmq"
                );
                return false;
            }
        }

        true
    }

    async fn terminate(&self) -> Result<(), TargetError> {
        if let Some(channel) = &self.channel {
            channel
                .close(200, "terminating")
                .await
                .map_err(|err| TargetError::Transient(err.to_string()))?;
        }

        if let Some(connection) = &self.connection {
            connection
                .close(200, "terminating")
                .await
                .map_err(|err| TargetError::Transient(err.to_string()))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bridge_common::delivery::HeaderValue;

    use super::*;

    #[test]
    fn single_message_envelope() {
        let raw = br#"{"type":"publish.message","subject":"a.b","message":{"x":1},"context":{"X-UUID":"u1"}}"#;

        let envelope: Envelope = serde_json::from_slice(raw).unwrap();
        let messages = envelope.into_messages();

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].subject, "a.b");
        assert_eq!(messages[0].message["x"], 1);
        assert_eq!(
            messages[0].context.get("X-UUID"),
            Some(&HeaderValue::Text("u1".to_owned()))
        );
    }

    #[test]
    fn multi_message_envelope_keeps_order() {
        let raw = br#"{"type":"publish.messages","messages":[
            {"subject":"a","message":{"x":1},"context":{}},
            {"subject":"b","message":{"x":2},"context":{}}
        ]}"#;

        let envelope: Envelope = serde_json::from_slice(raw).unwrap();
        let messages = envelope.into_messages();

        assert_eq!(
            messages.iter().map(|m| m.subject.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
    }

    #[test]
    fn unknown_envelope_type_is_a_parse_error() {
        let raw = br#"{"type":"publish.everything","subject":"a"}"#;
        assert!(serde_json::from_slice::<Envelope>(raw).is_err());
    }

    #[test]
    fn context_defaults_to_empty() {
        let raw = br#"{"type":"publish.message","subject":"a","message":{}}"#;
        let envelope: Envelope = serde_json::from_slice(raw).unwrap();
        assert!(envelope.into_messages()[0].context.is_empty());
    }
}

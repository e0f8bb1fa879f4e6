use async_trait::async_trait;
use bridge_common::config::RabbitMqTargetConfig;
use bridge_common::delivery::Delivery;
use bytes::Bytes;
use lapin::{Channel, Connection};
use tokio::sync::mpsc;
use tracing::error;

use crate::broker;
use crate::error::TargetError;
use crate::targets::Target;

/// Republishes each message to another broker's exchange, keeping the
/// original routing key, body, content type and headers.
pub struct RabbitMqTarget {
    config: RabbitMqTargetConfig,
    stop: mpsc::Sender<bool>,
    connection: Option<Connection>,
    channel: Option<Channel>,
}

impl RabbitMqTarget {
    pub fn new(config: RabbitMqTargetConfig, stop: mpsc::Sender<bool>) -> Self {
        RabbitMqTarget {
            config,
            stop,
            connection: None,
            channel: None,
        }
    }
}

#[async_trait]
impl Target for RabbitMqTarget {
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

    async fn handle(&self, delivery: &Delivery) -> Result<Option<Bytes>, TargetError> {
        let channel = self
            .channel
            .as_ref()
            .ok_or_else(|| TargetError::Fatal("target was not started".to_owned()))?;

        let properties =
            broker::publish_properties(delivery.content_type.as_deref(), &delivery.headers);

        broker::publish(
            channel,
            &self.config.exchange,
            &delivery.routing_key,
            &delivery.body,
            properties,
        )
        .await
        .map_err(|err| {
            error!(error = %err, exchange = %self.config.exchange, "failed pushing");
            TargetError::Transient("failed pushing".to_owned())
        })?;

        Ok(None)
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

//! Target sinks: where a service delivers each surviving message.

use async_trait::async_trait;
use bridge_common::config::ServiceConfig;
use bridge_common::delivery::Delivery;
use bytes::Bytes;

use crate::app::Application;
use crate::error::{BridgeError, TargetError};

mod http;
mod kafka;
mod lambda;
mod process;
mod rabbitmq;

pub use http::HttpTarget;
pub use kafka::KafkaTarget;
pub use lambda::LambdaTarget;
pub use process::ProcessTarget;
pub use rabbitmq::RabbitMqTarget;

pub(crate) use http::ROOT_JWT;

/// One sink for one service. `start` and `terminate` bracket the target's
/// external resources; `handle` delivers a single message and may hand
/// response bytes to the pipeline.
#[async_trait]
pub trait Target: Send + Sync {
    async fn start(&mut self) -> Result<(), TargetError> {
        Ok(())
    }

    async fn handle(&self, delivery: &Delivery) -> Result<Option<Bytes>, TargetError>;

    async fn terminate(&self) -> Result<(), TargetError> {
        Ok(())
    }
}

/// Build the target a service is configured with. No `target` section means
/// the conventional HTTP microservice target.
pub fn new_target(
    app: &Application,
    service: &ServiceConfig,
) -> Result<Box<dyn Target>, BridgeError> {
    let Some(target) = &service.target else {
        return Ok(Box::new(HttpTarget::new(app, service)));
    };

    match target.kind.as_str() {
        "http" => Ok(Box::new(HttpTarget::new(app, service))),

        "rabbitmq" => {
            let config = target.rabbitmq.clone().ok_or_else(|| {
                BridgeError::UnsupportedTarget("rabbitmq target without a rabbitmq section".into())
            })?;
            Ok(Box::new(RabbitMqTarget::new(config, app.stop_sender())))
        }

        "kafka" => {
            let config = target.kafka.as_ref().ok_or_else(|| {
                BridgeError::UnsupportedTarget("kafka target without a kafka section".into())
            })?;
            let connection = app.kafka_connection(config.connection_name()).ok_or_else(|| {
                BridgeError::UnsupportedTarget(format!(
                    "kafka connection {} is not configured",
                    config.connection_name()
                ))
            })?;
            Ok(Box::new(KafkaTarget::new(connection, config.topic.clone())?))
        }

        "lambda" => {
            let (client, config) = app.lambda().ok_or_else(|| {
                BridgeError::UnsupportedTarget("lambda target without lambda configuration".into())
            })?;
            Ok(Box::new(LambdaTarget::new(
                client.clone(),
                service.name.clone(),
                &config.invocation_type,
            )))
        }

        "process" => {
            let config = target.process.clone().ok_or_else(|| {
                BridgeError::UnsupportedTarget("process target without a process section".into())
            })?;
            Ok(Box::new(ProcessTarget::new(config)))
        }

        other => Err(BridgeError::UnsupportedTarget(other.to_owned())),
    }
}

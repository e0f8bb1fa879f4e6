use bridge_common::config::ConfigError;
use thiserror::Error;

/// Errors a target reports back to the worker driving it.
#[derive(Error, Debug)]
pub enum TargetError {
    /// Delivery failed but a later attempt may succeed; the worker requeues
    /// with backoff.
    #[error("target failed handling the message: {0}")]
    Transient(String),
    /// The target cannot operate at all. Fatal to the worker.
    #[error("target is unusable: {0}")]
    Fatal(String),
}

/// Errors that abort a worker loop. Per-message failures never do; they are
/// absorbed by the retry and dead-letter machinery.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("broker error while acknowledging or publishing")]
    Broker(#[from] lapin::Error),
    #[error("dead-letter notification was rejected with status {0}")]
    DeadLetterNotification(u16),
    #[error(transparent)]
    Target(#[from] TargetError),
}

/// Errors raised while assembling and starting the application.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed reading config file")]
    ConfigFile(#[from] std::io::Error),
    #[error("no rabbitmq connection configured")]
    NoBrokerConnection,
    #[error("unsupported target: {0}")]
    UnsupportedTarget(String),
    #[error("unsupported pipeline: {0}")]
    UnsupportedPipeline(String),
    #[error("unsupported exchange kind: {0}")]
    UnsupportedExchangeKind(String),
    #[error("broker error")]
    Broker(#[from] lapin::Error),
    #[error(transparent)]
    Target(#[from] TargetError),
}

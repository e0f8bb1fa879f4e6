//! Application assembly: shared process-wide resources, worker startup and
//! graceful termination.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use bridge_common::config::{AppConfig, KafkaConnectionConfig, LambdaConfig, ServiceConfig};
use bridge_common::health::HealthRegistry;
use bridge_common::retry::{RetrySchedule, RetryState};
use lapin::{Connection, Consumer, ExchangeKind};
use reqwest::header;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::broker;
use crate::dead_letter::DeadLetterHandler;
use crate::error::BridgeError;
use crate::pipeline::Pipeline;
use crate::service::{ServiceWorker, WorkerRole};
use crate::targets::{self, Target};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

struct WorkerHandle {
    terminate: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Owns the broker connection pool, the shared HTTP and lambda clients, and
/// every worker task spawned from the configuration.
pub struct Application {
    config: Arc<AppConfig>,
    environment: String,
    http_client: reqwest::Client,
    lambda: Option<(aws_sdk_lambda::Client, LambdaConfig)>,
    connections: HashMap<String, Connection>,
    health: HealthRegistry,
    stop: mpsc::Sender<bool>,
    workers: Vec<WorkerHandle>,
}

impl Application {
    /// Build the shared resources. Returns the application plus the
    /// receiving end of the stop channel the driver waits on; broken broker
    /// connections and fatal workers push sentinels onto it.
    pub async fn new(
        config: AppConfig,
    ) -> Result<(Application, mpsc::Receiver<bool>), BridgeError> {
        let (stop, stop_rx) = mpsc::channel(8);
        let config = Arc::new(config);

        let mut connections = HashMap::new();
        for (name, connection) in &config.rabbitmq {
            connections.insert(
                name.clone(),
                broker::connect(&connection.url, stop.clone()).await?,
            );
        }

        let app = Application {
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_owned()),
            http_client: build_http_client(&config),
            lambda: config
                .lambda
                .as_ref()
                .map(|lambda| (build_lambda_client(lambda), lambda.clone())),
            connections,
            health: HealthRegistry::new(),
            stop,
            workers: Vec::new(),
            config,
        };

        Ok((app, stop_rx))
    }

    pub fn health(&self) -> HealthRegistry {
        self.health.clone()
    }

    pub(crate) fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    pub(crate) fn service_url_pattern(&self) -> &str {
        &self.config.http_client.service_url_pattern
    }

    pub(crate) fn environment(&self) -> &str {
        &self.environment
    }

    pub(crate) fn kafka_connection(&self, name: &str) -> Option<&KafkaConnectionConfig> {
        self.config.kafka.get(name)
    }

    pub(crate) fn lambda(&self) -> Option<(&aws_sdk_lambda::Client, &LambdaConfig)> {
        self.lambda.as_ref().map(|(client, config)| (client, config))
    }

    pub(crate) fn stop_sender(&self) -> mpsc::Sender<bool> {
        self.stop.clone()
    }

    /// Launch `worker * (1 + split)` worker tasks per configured service.
    pub async fn start(&mut self) -> Result<(), BridgeError> {
        let services: Vec<Arc<ServiceConfig>> = self
            .config
            .services
            .iter()
            .cloned()
            .map(Arc::new)
            .collect();

        for service in services {
            for instance in 0..service.worker {
                self.start_instance(service.clone(), instance).await?;
            }
        }

        Ok(())
    }

    async fn start_instance(
        &mut self,
        service: Arc<ServiceConfig>,
        instance: usize,
    ) -> Result<(), BridgeError> {
        let mut target = targets::new_target(self, &service)?;
        target.start().await.map_err(BridgeError::Target)?;
        let target: Arc<dyn Target> = Arc::from(target);

        let pipeline = match &service.pipeline {
            Some(config) => {
                let mut pipeline = Pipeline::new(config, self.stop.clone())?;
                pipeline.start().await.map_err(BridgeError::Target)?;
                Some(Arc::new(pipeline))
            }
            None => None,
        };

        let schedule = RetrySchedule::new(self.config.retry_intervals.clone());
        let terminate_capacity = service.split.max(0) as usize + 1;

        let connection = self
            .connections
            .get("default")
            .ok_or(BridgeError::NoBrokerConnection)?;

        let mut spawned = Vec::new();

        // The parent worker consumes the service queue on the topic exchange
        // and, for split services, owns the dispatch channel.
        let channel =
            broker::channel(connection, ExchangeKind::Topic, broker::EVENTS_EXCHANGE).await?;
        let consumer = broker::stream(
            &channel,
            broker::EVENTS_EXCHANGE,
            &service.queue,
            &service.routing_keys(),
        )
        .await?;
        let group_channel = if service.split > 0 {
            Some(broker::channel(connection, ExchangeKind::Direct, broker::GROUP_EXCHANGE).await?)
        } else {
            None
        };

        spawned.push(self.build_worker(
            &service,
            WorkerRole::Parent,
            channel,
            group_channel,
            consumer,
            target.clone(),
            pipeline.clone(),
            schedule.clone(),
            format!("{}-{}", service.queue, instance),
            terminate_capacity,
        ));

        // Shard sub-workers each own a queue on the direct exchange; equal
        // `id mod split` always lands on the same one.
        for shard in 0..service.split {
            let shard_queue = service.shard_queue(shard);
            let channel =
                broker::channel(connection, ExchangeKind::Direct, broker::GROUP_EXCHANGE).await?;
            let consumer = broker::stream(
                &channel,
                broker::GROUP_EXCHANGE,
                &shard_queue,
                std::slice::from_ref(&shard_queue),
            )
            .await?;

            spawned.push(self.build_worker(
                &service,
                WorkerRole::Shard(shard),
                channel,
                None,
                consumer,
                target.clone(),
                pipeline.clone(),
                schedule.clone(),
                format!("{}-{}", shard_queue, instance),
                terminate_capacity,
            ));
        }

        self.workers.extend(spawned);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn build_worker(
        &self,
        service: &Arc<ServiceConfig>,
        role: WorkerRole,
        channel: lapin::Channel,
        group_channel: Option<lapin::Channel>,
        consumer: Consumer,
        target: Arc<dyn Target>,
        pipeline: Option<Arc<Pipeline>>,
        schedule: RetrySchedule,
        component: String,
        terminate_capacity: usize,
    ) -> WorkerHandle {
        let worker = ServiceWorker {
            service: service.clone(),
            role,
            channel,
            group_channel,
            target,
            pipeline,
            schedule,
            retry: RetryState::default(),
            dead_letter: service
                .dead_letter
                .clone()
                .map(|config| DeadLetterHandler::new(config, self.http_client.clone())),
            stop: self.stop.clone(),
            liveness: self.health.register(component, time::Duration::seconds(60)),
        };

        let (terminate_tx, terminate_rx) = mpsc::channel(terminate_capacity);
        let handle = tokio::spawn(worker.run(consumer, terminate_rx));

        WorkerHandle {
            terminate: terminate_tx,
            handle,
        }
    }

    /// Send one sentinel to every worker task, then wait for all of them to
    /// finish their in-flight message and drain.
    pub async fn terminate(self) {
        for worker in &self.workers {
            _ = worker.terminate.send(()).await;
        }

        for worker in self.workers {
            let _unused = worker.handle.await;
        }
    }
}

fn build_http_client(config: &AppConfig) -> reqwest::Client {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );

    reqwest::Client::builder()
        .default_headers(headers)
        .user_agent(format!("rusty-bridge/{VERSION}"))
        .pool_max_idle_per_host(config.http_client.max_idle_connections_per_host)
        .pool_idle_timeout(config.http_client.idle_connection_timeout)
        .connect_timeout(config.http_client.timeout_connection)
        .timeout(config.http_client.timeout_request)
        .build()
        .expect("failed to construct reqwest client for the bridge")
}

fn build_lambda_client(config: &LambdaConfig) -> aws_sdk_lambda::Client {
    let credentials = aws_sdk_lambda::config::Credentials::new(
        config.auth_key.clone(),
        config.auth_secret.clone(),
        None,
        None,
        "consumer-config",
    );

    let sdk_config = aws_sdk_lambda::config::Builder::new()
        .behavior_version(aws_sdk_lambda::config::BehaviorVersion::latest())
        .region(aws_sdk_lambda::config::Region::new(config.region.clone()))
        .credentials_provider(credentials)
        .build();

    aws_sdk_lambda::Client::from_conf(sdk_config)
}

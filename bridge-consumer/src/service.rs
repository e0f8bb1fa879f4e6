//! The per-service worker: one queue binding, one message at a time, driving
//! the filter → dispatch/handle → retry → dead-letter → ack state machine.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bridge_common::config::{RouteConfig, ServiceConfig};
use bridge_common::delivery::Delivery;
use bridge_common::health::HealthHandle;
use bridge_common::metrics::{
    message_labels, CONSUME_DURATION, TOTAL_FAILURE, TOTAL_FILTERED, TOTAL_RETRY, TOTAL_SUCCESS,
};
use bridge_common::retry::{RetrySchedule, RetryState};
use futures::{FutureExt, StreamExt};
use lapin::{Channel, Consumer};
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::broker;
use crate::dead_letter::{DeadLetterHandler, DeadLetterOutcome};
use crate::error::{TargetError, WorkerError};
use crate::pipeline::Pipeline;
use crate::targets::Target;

/// Whether this worker consumes the parent queue or one shard queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    Parent,
    Shard(i64),
}

enum Flow {
    Continue,
    Stop,
}

/// How often an idle worker wakes up to refresh its liveness report.
const LIVENESS_HEARTBEAT: Duration = Duration::from_secs(30);

/// One worker task. Owns its broker channel and its retry and dead-letter
/// state; nothing here is shared with sibling workers.
pub struct ServiceWorker {
    pub(crate) service: Arc<ServiceConfig>,
    pub(crate) role: WorkerRole,
    pub(crate) channel: Channel,
    /// Publishing channel on the shard exchange; only the parent of a split
    /// service carries one.
    pub(crate) group_channel: Option<Channel>,
    pub(crate) target: Arc<dyn Target>,
    pub(crate) pipeline: Option<Arc<Pipeline>>,
    pub(crate) schedule: RetrySchedule,
    pub(crate) retry: RetryState,
    pub(crate) dead_letter: Option<DeadLetterHandler>,
    pub(crate) stop: mpsc::Sender<bool>,
    pub(crate) liveness: HealthHandle,
}

impl ServiceWorker {
    /// Drive the message loop until the termination channel fires or the
    /// consumer closes. Per-message errors never end the loop; broker and
    /// notification errors do, pushing a sentinel onto the application stop
    /// channel.
    pub async fn run(mut self, mut consumer: Consumer, mut terminate: mpsc::Receiver<()>) {
        loop {
            self.liveness.report_healthy();

            tokio::select! {
                _ = terminate.recv() => break,
                _ = tokio::time::sleep(LIVENESS_HEARTBEAT) => continue,
                next = consumer.next() => {
                    let Some(next) = next else { break };

                    let delivery = match next {
                        Ok(delivery) => delivery,
                        Err(err) => {
                            error!(
                                error = %err,
                                queue = %self.service.queue,
                                "failed receiving delivery"
                            );
                            continue;
                        }
                    };

                    let flow = self.process(delivery, &mut terminate).await;
                    match flow {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Stop) => break,
                        Err(err) => {
                            error!(
                                error = %err,
                                queue = %self.service.queue,
                                service = %self.service.name,
                                "worker failed, shutting down"
                            );
                            _ = self.stop.try_send(true);
                            break;
                        }
                    }
                }
            }
        }

        info!(
            queue = %self.service.queue,
            service = %self.service.name,
            "terminating"
        );

        if self.role == WorkerRole::Parent {
            if let Err(err) = self.target.terminate().await {
                error!(error = %err, service = %self.service.name, "failed terminating target");
            }

            if let Some(pipeline) = &self.pipeline {
                if let Err(err) = pipeline.terminate().await {
                    error!(error = %err, service = %self.service.name, "failed terminating pipeline");
                }
            }
        }

        let _unused = self.channel.close(200, "terminating").await;
    }

    async fn process(
        &mut self,
        delivery: lapin::message::Delivery,
        terminate: &mut mpsc::Receiver<()>,
    ) -> Result<Flow, WorkerError> {
        let mut delivery = broker::from_amqp(&delivery);

        // Routes were already applied on the parent before a shard delivery
        // was dispatched; shard workers skip the gate.
        if self.role == WorkerRole::Parent
            && !passes_route_conditions(&self.service.routes, &delivery)
        {
            broker::nack_drop(&self.channel, delivery.delivery_tag, true).await?;
            counter!(
                TOTAL_FILTERED,
                &message_labels(&self.service.queue, &self.service.name, &delivery.routing_key)
            )
            .increment(1);
            return Ok(Flow::Continue);
        }

        // A panicking handler leaves the delivery unacked; the broker will
        // redeliver it after the visibility timeout. Counters do not move.
        let handled = AssertUnwindSafe(self.handle(&mut delivery, terminate))
            .catch_unwind()
            .await;
        match handled {
            Ok(flow) => flow,
            Err(panic) => {
                error!(
                    panic = %panic_message(panic),
                    msg.routing_key = %delivery.routing_key,
                    queue = %self.service.queue,
                    "recovered from panic"
                );
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle(
        &mut self,
        delivery: &mut Delivery,
        terminate: &mut mpsc::Receiver<()>,
    ) -> Result<Flow, WorkerError> {
        normalize_headers(delivery, &self.service.queue);

        if !delivery.redelivered {
            if let Some(dead_letter) = &mut self.dead_letter {
                dead_letter.reset();
            }
        }

        if self.service.split > 0 && self.role == WorkerRole::Parent {
            return self.dispatch(delivery, terminate).await;
        }

        self.handle_direct(delivery, terminate).await
    }

    /// Repartition one delivery onto its shard queue. Equal `id mod split`
    /// always lands on the same sub-worker.
    async fn dispatch(
        &mut self,
        delivery: &mut Delivery,
        terminate: &mut mpsc::Receiver<()>,
    ) -> Result<Flow, WorkerError> {
        let shard_queue = self.service.shard_queue(shard_index(&delivery.body, self.service.split));

        delivery.remove_header("portal-name");
        delivery.remove_header("entity-type");
        delivery.set_header("X-SERVICE", self.service.name.clone());
        delivery.set_header("X-ROUTING-KEY", delivery.routing_key.clone());

        let Some(group_channel) = &self.group_channel else {
            return Err(WorkerError::Target(TargetError::Fatal(
                "split service without a shard channel".to_owned(),
            )));
        };

        let properties =
            broker::publish_properties(delivery.content_type.as_deref(), &delivery.headers);

        let published = broker::publish(
            group_channel,
            broker::GROUP_EXCHANGE,
            &shard_queue,
            &delivery.body,
            properties,
        )
        .await;

        match published {
            Ok(()) => {
                info!(routing_key = %shard_queue, "message dispatched to sub-consumer");
                broker::ack(&self.channel, delivery.delivery_tag).await?;
                Ok(Flow::Continue)
            }
            Err(err) => {
                error!(
                    error = %err,
                    routing_key = %shard_queue,
                    "failed dispatching message to sub-consumer"
                );
                self.fail(delivery, terminate).await
            }
        }
    }

    async fn handle_direct(
        &mut self,
        delivery: &mut Delivery,
        terminate: &mut mpsc::Receiver<()>,
    ) -> Result<Flow, WorkerError> {
        let started = Instant::now();

        let succeeded = match self.target.handle(delivery).await {
            Ok(Some(response)) => match &self.pipeline {
                Some(pipeline) => {
                    let ok = pipeline.invoke(&response).await;
                    if !ok {
                        error!(
                            msg.routing_key = %delivery.routing_key,
                            queue = %self.service.queue,
                            "failed execute the pipeline"
                        );
                    }
                    ok
                }
                None => true,
            },
            Ok(None) => true,
            Err(TargetError::Fatal(reason)) => {
                return Err(WorkerError::Target(TargetError::Fatal(reason)));
            }
            Err(TargetError::Transient(reason)) => {
                error!(
                    error = %reason,
                    msg.routing_key = %delivery.routing_key,
                    queue = %self.service.queue,
                    "failed execute the target"
                );
                false
            }
        };

        if !succeeded {
            return self.fail(delivery, terminate).await;
        }

        broker::ack(&self.channel, delivery.delivery_tag).await?;

        let labels = message_labels(&self.service.queue, &self.service.name, &delivery.routing_key);
        counter!(TOTAL_SUCCESS, &labels).increment(1);
        histogram!(CONSUME_DURATION, &labels).record(started.elapsed().as_secs_f64());

        Ok(Flow::Continue)
    }

    /// One failed attempt: consult the dead-letter handler, then requeue
    /// with backoff.
    async fn fail(
        &mut self,
        delivery: &Delivery,
        terminate: &mut mpsc::Receiver<()>,
    ) -> Result<Flow, WorkerError> {
        if let Some(dead_letter) = &mut self.dead_letter {
            let outcome = dead_letter.handle_failure(&self.service, delivery).await;
            match outcome {
                DeadLetterOutcome::Keep => {}
                DeadLetterOutcome::Promoted => {
                    broker::nack_drop(&self.channel, delivery.delivery_tag, false).await?;
                    return Ok(Flow::Continue);
                }
                DeadLetterOutcome::NotificationRejected(status) => {
                    // The message is dropped either way; the rejection is the
                    // worker's problem, not the message's.
                    broker::nack_drop(&self.channel, delivery.delivery_tag, false).await?;
                    return Err(WorkerError::DeadLetterNotification(status));
                }
            }
        }

        let interval = self.retry.next_interval(&self.schedule);

        let labels = message_labels(&self.service.queue, &self.service.name, &delivery.routing_key);
        counter!(TOTAL_FAILURE, &labels).increment(1);
        counter!(TOTAL_RETRY, &labels).increment(1);

        error!(
            msg.routing_key = %delivery.routing_key,
            queue = %self.service.queue,
            retry_in = ?interval,
            "failed handling message"
        );

        broker::nack_requeue(&self.channel, delivery.delivery_tag).await?;

        // The requeue already happened; the sleep only paces redelivery and
        // must not hold up shutdown.
        tokio::select! {
            _ = tokio::time::sleep(interval) => Ok(Flow::Continue),
            _ = terminate.recv() => Ok(Flow::Stop),
        }
    }
}

/// Every route whose key matches must pass its condition (routes without a
/// condition always pass).
fn passes_route_conditions(routes: &[RouteConfig], delivery: &Delivery) -> bool {
    for route in routes {
        if route.name != delivery.routing_key {
            continue;
        }

        if let Some(condition) = &route.condition {
            if !condition.evaluate(delivery) {
                return false;
            }
        }
    }

    true
}

/// Stamp the owning queue and restore the original routing key on shard
/// deliveries.
fn normalize_headers(delivery: &mut Delivery, queue: &str) {
    delivery.set_header("X-QUEUE", queue.to_owned());

    if let Some(routing_key) = delivery.text_header("X-ROUTING-KEY").map(str::to_owned) {
        delivery.remove_header("X-ROUTING-KEY");
        let original = std::mem::replace(&mut delivery.routing_key, routing_key);
        delivery.set_header("X-ORIGINAL-ROUTING-KEY", original);
    }
}

/// Shard for one body: the integer `id` field modulo the split. Absent or
/// non-numeric ids hash to 0 and concentrate on shard 0.
fn shard_index(body: &[u8], split: i64) -> i64 {
    let id = serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .as_ref()
        .and_then(|document| document.get("id"))
        .and_then(numeric)
        .unwrap_or(0);

    id % split
}

fn numeric(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use bridge_common::delivery::Headers;
    use bytes::Bytes;

    use super::*;

    fn delivery(routing_key: &str, body: &'static [u8]) -> Delivery {
        Delivery {
            routing_key: routing_key.to_owned(),
            body: Bytes::from_static(body),
            headers: Headers::new(),
            redelivered: false,
            delivery_tag: 1,
            content_type: None,
        }
    }

    #[test]
    fn shard_index_partitions_by_id() {
        assert_eq!(shard_index(br#"{"id":4}"#, 2), 0);
        assert_eq!(shard_index(br#"{"id":5}"#, 2), 1);
        assert_eq!(shard_index(br#"{"id":12}"#, 5), 2);
    }

    #[test]
    fn shard_index_is_stable_per_residue() {
        for id in 0..50i64 {
            let body = format!(r#"{{"id":{id}}}"#);
            assert_eq!(shard_index(body.as_bytes(), 4), id % 4);
        }
    }

    #[test]
    fn missing_or_non_numeric_ids_hash_to_zero() {
        assert_eq!(shard_index(br#"{"type":"event"}"#, 2), 0);
        assert_eq!(shard_index(br#"{"id":"abc"}"#, 2), 0);
        assert_eq!(shard_index(br#"not json"#, 2), 0);
        // Numeric strings still partition.
        assert_eq!(shard_index(br#"{"id":"7"}"#, 2), 1);
    }

    #[test]
    fn normalize_headers_stamps_the_queue() {
        let mut d = delivery("lo.update", br#"{}"#);
        normalize_headers(&mut d, "group:q");

        assert_eq!(d.text_header("X-QUEUE"), Some("group:q"));
        assert_eq!(d.routing_key, "lo.update");
        assert!(d.text_header("X-ORIGINAL-ROUTING-KEY").is_none());
    }

    #[test]
    fn normalize_headers_restores_the_dispatched_routing_key() {
        let mut d = delivery("group:q:1", br#"{}"#);
        d.set_header("X-ROUTING-KEY", "ro.delete");

        normalize_headers(&mut d, "group:q");

        assert_eq!(d.routing_key, "ro.delete");
        assert_eq!(d.text_header("X-ORIGINAL-ROUTING-KEY"), Some("group:q:1"));
        assert!(d.text_header("X-ROUTING-KEY").is_none());
    }

    #[test]
    fn route_conditions_gate_matching_routes_only() {
        let routes: Vec<RouteConfig> = serde_yaml::from_str(
            r#"
- name: "lo.update"
  condition:
    type: json
    json: { part: body, query: type, op: match, arg: event }
- name: "lo.delete"
"#,
        )
        .unwrap();

        // Matching route, condition true.
        assert!(passes_route_conditions(
            &routes,
            &delivery("lo.update", br#"{"type":"event","id":555}"#)
        ));

        // Matching route, condition false.
        assert!(!passes_route_conditions(
            &routes,
            &delivery("lo.update", br#"{"type":"course","id":666}"#)
        ));

        // Route without a condition always passes.
        assert!(passes_route_conditions(
            &routes,
            &delivery("lo.delete", br#"{"type":"course"}"#)
        ));

        // Routes for other keys are ignored.
        assert!(passes_route_conditions(
            &routes,
            &delivery("enrolment.create", br#"{"type":"course"}"#)
        ));
    }

    #[test]
    fn every_matching_route_must_pass() {
        let routes: Vec<RouteConfig> = serde_yaml::from_str(
            r#"
- name: "lo.update"
  condition:
    type: json
    json: { part: body, query: type, op: match, arg: event }
- name: "lo.update"
  condition:
    type: json
    json: { part: body, query: id, op: greaterThan, arg: "100" }
"#,
        )
        .unwrap();

        assert!(passes_route_conditions(
            &routes,
            &delivery("lo.update", br#"{"type":"event","id":555}"#)
        ));
        assert!(!passes_route_conditions(
            &routes,
            &delivery("lo.update", br#"{"type":"event","id":5}"#)
        ));
    }

    #[test]
    fn panic_messages_unwrap_common_payloads() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("boom".to_owned())), "boom");
        assert_eq!(panic_message(Box::new(42_u8)), "panic");
    }
}

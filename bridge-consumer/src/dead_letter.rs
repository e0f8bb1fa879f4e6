//! Dead-letter promotion: deciding when a repeating failure is terminal and
//! delivering the notification.

use std::time::Instant;

use bridge_common::config::{DeadLetterConfig, DeadLetterHttpConfig, ServiceConfig};
use bridge_common::delivery::Delivery;
use reqwest::header;
use tracing::{error, info};

/// What the worker should do with a delivery after counting its failure.
#[derive(Debug, PartialEq, Eq)]
pub enum DeadLetterOutcome {
    /// Not terminal yet: requeue and keep retrying.
    Keep,
    /// Promoted: the notification went out, drop the delivery.
    Promoted,
    /// Promoted, but the notification sink rejected it. The delivery is
    /// still dropped; the worker surfaces the status as a fatal error.
    NotificationRejected(u16),
}

/// Per-worker dead-letter state. Owned by exactly one worker; reset on the
/// first receipt of a fresh (non-redelivered) message.
pub struct DeadLetterHandler {
    config: DeadLetterConfig,
    client: reqwest::Client,
    started_at: Instant,
    attempts: u32,
}

impl DeadLetterHandler {
    pub fn new(config: DeadLetterConfig, client: reqwest::Client) -> Self {
        DeadLetterHandler {
            config,
            client,
            started_at: Instant::now(),
            attempts: 0,
        }
    }

    pub fn reset(&mut self) {
        self.started_at = Instant::now();
        self.attempts = 0;
    }

    /// Count one failure and decide the delivery's disposition, sending the
    /// notification when both configured bounds are met.
    pub async fn handle_failure(
        &mut self,
        service: &ServiceConfig,
        delivery: &Delivery,
    ) -> DeadLetterOutcome {
        self.attempts += 1;

        if !self.should_promote() {
            return DeadLetterOutcome::Keep;
        }

        self.deliver(service, delivery).await
    }

    fn should_promote(&self) -> bool {
        let attempts_bound = self.config.condition.attempts > 0;
        let timeout_bound = self.config.condition.timeout.is_some();

        // A handler with neither bound never promotes.
        if !attempts_bound && !timeout_bound {
            return false;
        }

        if attempts_bound && self.attempts < self.config.condition.attempts {
            return false;
        }

        if let Some(timeout) = self.config.condition.timeout {
            if self.started_at.elapsed() < timeout {
                return false;
            }
        }

        true
    }

    async fn deliver(&self, service: &ServiceConfig, delivery: &Delivery) -> DeadLetterOutcome {
        match (self.config.target.as_str(), &self.config.http) {
            ("http", Some(http)) => self.deliver_http(http, service, delivery).await,
            _ => DeadLetterOutcome::Keep,
        }
    }

    async fn deliver_http(
        &self,
        target: &DeadLetterHttpConfig,
        service: &ServiceConfig,
        delivery: &Delivery,
    ) -> DeadLetterOutcome {
        let body = notification_body(&target.body, service, delivery);

        info!(
            service = %service.name,
            queue = %service.queue,
            message.routing_key = %delivery.routing_key,
            request.method = %target.method,
            request.url = %target.url,
            "deliver dead-letter"
        );

        let method = match reqwest::Method::from_bytes(target.method.as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                error!(method = %target.method, "dead-letter target has a bad method");
                return DeadLetterOutcome::Keep;
            }
        };

        let response = self
            .client
            .request(method, &target.url)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body.clone())
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                error!(error = %err, request.url = %target.url, "dead-letter delivery failed");
                return DeadLetterOutcome::Keep;
            }
        };

        // Any 2xx counts as accepted. The notification sink historically
        // answered with a bare 200; 201/202/204 from a replacement sink must
        // not be mistaken for rejection.
        let status = response.status();
        if status.is_success() {
            info!(
                request.url = %target.url,
                request.body = %body,
                response.status = %status,
                "dead-letter delivered"
            );
            DeadLetterOutcome::Promoted
        } else {
            error!(
                request.url = %target.url,
                request.body = %body,
                response.status = %status,
                "dead-letter notification rejected"
            );
            DeadLetterOutcome::NotificationRejected(status.as_u16())
        }
    }
}

/// Substitute `%dead-letter%` in the configured template with a quoted
/// failure summary.
fn notification_body(template: &str, service: &ServiceConfig, delivery: &Delivery) -> String {
    let summary = format!(
        "service: {} queue: {} routingKey: {} body: {}",
        service.name,
        service.queue,
        delivery.routing_key,
        String::from_utf8_lossy(&delivery.body),
    );

    template.replace("%dead-letter%", &format!("{summary:?}"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bridge_common::config::{AppConfig, DeadLetterCondition};
    use bridge_common::delivery::Headers;
    use bytes::Bytes;

    use super::*;

    fn handler(attempts: u32, timeout: Option<Duration>) -> DeadLetterHandler {
        DeadLetterHandler::new(
            DeadLetterConfig {
                condition: DeadLetterCondition { attempts, timeout },
                target: String::new(),
                http: None,
            },
            reqwest::Client::new(),
        )
    }

    fn service() -> ServiceConfig {
        AppConfig::from_yaml(
            r#"
prefix: "group"
services:
- name: "q"
  routes: [{name: "ro.delete"}]
"#,
        )
        .unwrap()
        .services
        .remove(0)
    }

    fn delivery() -> Delivery {
        Delivery {
            routing_key: "ro.delete".to_owned(),
            body: Bytes::from_static(br#"{"id":4}"#),
            headers: Headers::new(),
            redelivered: true,
            delivery_tag: 7,
            content_type: None,
        }
    }

    #[tokio::test]
    async fn attempts_bound_gates_promotion() {
        let mut dl = handler(3, None);
        let service = service();
        let delivery = delivery();

        // The configured target is unknown, so promotion falls through to
        // Keep; should_promote is what flips.
        assert!(!dl.should_promote());
        assert_eq!(dl.handle_failure(&service, &delivery).await, DeadLetterOutcome::Keep);
        assert_eq!(dl.handle_failure(&service, &delivery).await, DeadLetterOutcome::Keep);
        dl.attempts += 1;
        assert!(dl.should_promote());
    }

    #[tokio::test]
    async fn timeout_bound_gates_promotion() {
        let mut dl = handler(1, Some(Duration::from_secs(3600)));

        assert_eq!(
            dl.handle_failure(&service(), &delivery()).await,
            DeadLetterOutcome::Keep
        );
        // Attempts are satisfied but the window has not elapsed.
        assert!(!dl.should_promote());
    }

    #[test]
    fn neither_bound_never_promotes() {
        let mut dl = handler(0, None);
        dl.attempts = 1_000;
        assert!(!dl.should_promote());
    }

    #[test]
    fn reset_clears_the_attempt_counter() {
        let mut dl = handler(2, None);
        dl.attempts = 5;
        assert!(dl.should_promote());

        dl.reset();
        assert!(!dl.should_promote());
        assert_eq!(dl.attempts, 0);
    }

    #[test]
    fn notification_body_substitutes_the_quoted_summary() {
        let body = notification_body(
            r#"payload={"text": %dead-letter%}"#,
            &service(),
            &delivery(),
        );

        assert_eq!(
            body,
            r#"payload={"text": "service: q queue: group:q routingKey: ro.delete body: {\"id\":4}"}"#
        );
    }
}

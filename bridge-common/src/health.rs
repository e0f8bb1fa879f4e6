use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tracing::warn;

/// Health reporting for the consumer's worker loops.
///
/// Every worker registers a component and must report healthy more often
/// than its deadline. The process is healthy only while all registered
/// components have a fresh report; a component that goes quiet for longer
/// than its deadline is considered stalled and fails the liveness probe.

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Automatically set when a component is newly registered.
    Starting,
    /// Recently reported healthy, will need to report again before the date.
    HealthyUntil(OffsetDateTime),
    /// Automatically set when the HealthyUntil deadline is reached.
    Stalled,
}

#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthHandle {
    /// Must be called more frequently than the configured deadline.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc().add(self.deadline),
        ));
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut components) => {
                _ = components.insert(self.component.clone(), status);
            }
            Err(_) => warn!("poisoned HealthRegistry lock"),
        }
    }
}

#[derive(Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        HealthRegistry::default()
    }

    /// Registers a new component. The returned handle should be passed to
    /// the component, to allow it to frequently report its health status.
    pub fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// The overall process status, computed from all registered components.
    /// Can be used as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = match self.components.read() {
            Ok(components) => components,
            Err(_) => return HealthStatus::default(),
        };

        let now = OffsetDateTime::now_utc();
        let mut status = HealthStatus {
            // Unhealthy until at least one component has registered.
            healthy: !components.is_empty(),
            components: HashMap::new(),
        };

        for (name, component) in components.iter() {
            match component {
                ComponentStatus::HealthyUntil(until) if until.gt(&now) => {
                    _ = status.components.insert(name.clone(), component.clone());
                }
                ComponentStatus::HealthyUntil(_) => {
                    status.healthy = false;
                    _ = status
                        .components
                        .insert(name.clone(), ComponentStatus::Stalled);
                }
                other => {
                    status.healthy = false;
                    _ = status.components.insert(name.clone(), other.clone());
                }
            }
        }

        status
    }
}

#[cfg(test)]
mod tests {
    use std::ops::Sub;

    use super::*;

    #[test]
    fn defaults_to_unhealthy() {
        let registry = HealthRegistry::new();
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn component_lifecycle() {
        let registry = HealthRegistry::new();
        let handle = registry.register("worker".to_owned(), Duration::seconds(30));

        // New components start out in Starting, which is not yet healthy.
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("worker"),
            Some(&ComponentStatus::Starting)
        );

        handle.report_healthy();
        assert!(registry.get_status().healthy);
    }

    #[test]
    fn stale_report_fails_the_check() {
        let registry = HealthRegistry::new();
        let handle = registry.register("worker".to_owned(), Duration::seconds(30));

        handle.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc().sub(Duration::seconds(1)),
        ));

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("worker"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[test]
    fn all_components_must_be_healthy() {
        let registry = HealthRegistry::new();
        let one = registry.register("one".to_owned(), Duration::seconds(30));
        let two = registry.register("two".to_owned(), Duration::seconds(30));

        one.report_healthy();
        assert!(!registry.get_status().healthy);

        two.report_healthy();
        assert!(registry.get_status().healthy);
    }

    #[test]
    fn into_response() {
        let nok = HealthStatus::default().into_response();
        assert_eq!(nok.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let ok = HealthStatus {
            healthy: true,
            components: HashMap::new(),
        }
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);
    }
}

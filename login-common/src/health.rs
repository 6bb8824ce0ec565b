//! Liveness of the drain loop.
//!
//! A component registers with a deadline and must call `report_healthy` before the deadline
//! passes. `HealthRegistry::get_status` fails while any component is still starting or has
//! stalled, and also while nothing has registered yet.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    /// Per component status, printed in the response body.
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let code = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (code, format!("{:?}", self)).into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, no report yet.
    Starting,
    /// Healthy until the given instant.
    HealthyUntil(OffsetDateTime),
    /// The `HealthyUntil` deadline passed without a new report.
    Stalled,
}

struct StatusUpdate {
    component: String,
    status: ComponentStatus,
}

/// Handed to a registered component to report on itself.
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    updates: mpsc::Sender<StatusUpdate>,
}

impl HealthHandle {
    /// Mark the component healthy for another `deadline`. Returns once the update is queued.
    pub async fn report_healthy(&self) {
        let until = OffsetDateTime::now_utc() + self.deadline;
        self.report_status(ComponentStatus::HealthyUntil(until)).await
    }

    async fn report_status(&self, status: ComponentStatus) {
        let update = StatusUpdate {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.updates.send(update).await {
            warn!("failed to report health status: {}", err)
        }
    }
}

/// Tracks the status of every registered component for one probe.
#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    updates: mpsc::Sender<StatusUpdate>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        let (updates, mut rx) = mpsc::channel::<StatusUpdate>(16);
        let components: Arc<RwLock<HashMap<String, ComponentStatus>>> = Default::default();

        let shared = components.clone();
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                match shared.write() {
                    Ok(mut map) => {
                        _ = map.insert(update.component, update.status);
                    }
                    Err(_) => warn!("poisoned HealthRegistry lock"),
                }
            }
        });

        Self {
            name: name.to_owned(),
            components,
            updates,
        }
    }

    /// Register `component`, which starts out as `Starting` until its first report.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            updates: self.updates.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// The probe result. Usable as an axum handler through `IntoResponse`.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("poisoned HealthRegistry lock");
            return HealthStatus::default();
        };

        let now = OffsetDateTime::now_utc();
        let components: HashMap<String, ComponentStatus> = components
            .iter()
            .map(|(name, status)| {
                let status = match status {
                    ComponentStatus::HealthyUntil(until) if *until <= now => {
                        ComponentStatus::Stalled
                    }
                    other => other.clone(),
                };
                (name.clone(), status)
            })
            .collect();

        let healthy = !components.is_empty()
            && components
                .values()
                .all(|status| matches!(status, ComponentStatus::HealthyUntil(_)));

        if healthy {
            info!("{} health check ok", self.name);
        } else {
            warn!("{} health check failed: {:?}", self.name, components);
        }

        HealthStatus {
            healthy,
            components,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn eventually<F>(check: F)
    where
        F: Fn() -> bool,
    {
        for _ in 0..50 {
            if check() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        assert!(check())
    }

    #[tokio::test]
    async fn test_empty_registry_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn test_drain_loop_reports_healthy() {
        let registry = HealthRegistry::new("liveness");

        let handle = registry
            .register("drain_loop".to_string(), Duration::seconds(30))
            .await;
        eventually(|| registry.get_status().components.len() == 1).await;
        assert_eq!(
            registry.get_status().components.get("drain_loop"),
            Some(&ComponentStatus::Starting)
        );
        assert!(!registry.get_status().healthy);

        handle.report_healthy().await;
        eventually(|| registry.get_status().healthy).await;
    }

    #[tokio::test]
    async fn test_missed_deadline_is_stalled() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("drain_loop".to_string(), Duration::seconds(30))
            .await;

        handle
            .report_status(ComponentStatus::HealthyUntil(
                OffsetDateTime::now_utc() - Duration::seconds(1),
            ))
            .await;
        eventually(|| {
            registry.get_status().components.get("drain_loop") == Some(&ComponentStatus::Stalled)
        })
        .await;
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn test_status_code() {
        let failing = HealthStatus::default().into_response();
        assert_eq!(failing.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let passing = HealthStatus {
            healthy: true,
            components: Default::default(),
        }
        .into_response();
        assert_eq!(passing.status(), StatusCode::OK);
    }
}

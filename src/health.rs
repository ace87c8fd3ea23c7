//! Health check module
//! Provides health status for the application and its dependencies

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error};

use crate::database::{get_pool_stats, health_check};

/// Health status response
#[derive(Debug, Serialize, Clone)]
pub struct HealthStatus {
    pub status: HealthState,
    pub checks: HashMap<String, ComponentHealth>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Overall health state
#[derive(Debug, Serialize, Clone)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Individual component health status
#[derive(Debug, Serialize, Clone)]
pub struct ComponentHealth {
    pub status: ComponentState,
    pub response_time_ms: Option<u128>,
    pub details: Option<String>,
}

/// Component state
#[derive(Debug, Serialize, Clone)]
pub enum ComponentState {
    Up,
    Down,
    Warning,
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            status: HealthState::Healthy,
            checks: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        !matches!(self.status, HealthState::Unhealthy)
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentHealth {
    pub fn up(response_time_ms: Option<u128>) -> Self {
        Self {
            status: ComponentState::Up,
            response_time_ms,
            details: None,
        }
    }

    pub fn down(details: Option<String>) -> Self {
        Self {
            status: ComponentState::Down,
            response_time_ms: None,
            details,
        }
    }

    pub fn warning(response_time_ms: Option<u128>, details: Option<String>) -> Self {
        Self {
            status: ComponentState::Warning,
            response_time_ms,
            details,
        }
    }
}

/// Health checker for the application
#[derive(Clone)]
pub struct HealthChecker {
    /// `None` when the ledger lives in memory
    db_pool: Option<sqlx::PgPool>,
}

impl HealthChecker {
    pub fn new(db_pool: Option<sqlx::PgPool>) -> Self {
        Self { db_pool }
    }

    /// Perform comprehensive health check
    pub async fn check_health(&self) -> HealthStatus {
        let mut health_status = HealthStatus::new();

        let Some(pool) = &self.db_pool else {
            health_status.checks.insert(
                "ledger".to_string(),
                ComponentHealth::warning(None, Some("in-memory ledger".to_string())),
            );
            health_status.status = HealthState::Degraded;
            return health_status;
        };

        let start = Instant::now();
        match timeout(Duration::from_secs(5), health_check(pool)).await {
            Ok(Ok(())) => {
                let stats = get_pool_stats(pool);
                let mut component = ComponentHealth::up(Some(start.elapsed().as_millis()));
                component.details = Some(format!("{} connections, {} idle", stats.size, stats.num_idle));
                health_status.checks.insert("database".to_string(), component);
            }
            Ok(Err(e)) => {
                error!("Database health check failed: {}", e);
                health_status.checks.insert(
                    "database".to_string(),
                    ComponentHealth::down(Some(e.to_string())),
                );
                health_status.status = HealthState::Unhealthy;
            }
            Err(_) => {
                error!("Database health check timed out");
                health_status.checks.insert(
                    "database".to_string(),
                    ComponentHealth::down(Some("Timeout".to_string())),
                );
                health_status.status = HealthState::Unhealthy;
            }
        }

        health_status
    }
}

pub fn routes(checker: HealthChecker) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(readiness))
        .route("/health/live", get(liveness))
        .with_state(Arc::new(checker))
}

async fn health(
    State(checker): State<Arc<HealthChecker>>,
) -> Result<Json<HealthStatus>, (StatusCode, Json<HealthStatus>)> {
    let health_status = checker.check_health().await;
    if health_status.is_healthy() {
        Ok(Json(health_status))
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(health_status)))
    }
}

/// Readiness probe - checks if the service is ready to accept traffic
async fn readiness(
    state: State<Arc<HealthChecker>>,
) -> Result<Json<HealthStatus>, (StatusCode, Json<HealthStatus>)> {
    let result = health(state).await;
    if result.is_err() {
        error!("Readiness check failed");
    }
    result
}

/// Liveness probe - checks if the service is alive (basic check)
async fn liveness() -> &'static str {
    debug!("Liveness probe requested");
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_status_creation() {
        let health_status = HealthStatus::new();
        assert!(matches!(health_status.status, HealthState::Healthy));
        assert!(health_status.checks.is_empty());
        assert!(health_status.timestamp <= chrono::Utc::now());
    }

    #[tokio::test]
    async fn in_memory_mode_reports_degraded_but_serving() {
        let status = HealthChecker::new(None).check_health().await;
        assert!(matches!(status.status, HealthState::Degraded));
        assert!(status.is_healthy());
        assert!(status.checks.contains_key("ledger"));
    }

    #[test]
    fn test_component_health_states() {
        let up_health = ComponentHealth::up(Some(100));
        assert!(matches!(up_health.status, ComponentState::Up));
        assert_eq!(up_health.response_time_ms, Some(100));

        let down_health = ComponentHealth::down(Some("Test error".to_string()));
        assert!(matches!(down_health.status, ComponentState::Down));
        assert_eq!(down_health.details, Some("Test error".to_string()));
    }
}

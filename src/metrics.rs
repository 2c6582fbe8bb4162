// Adapted from Istio Authors' agentgateway, licensed under the Apache
// License, Version 2.0.

//! Process metrics exposed on `/metrics` in Prometheus text format.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct AppLabel {
    pub app: String,
}

#[derive(Clone)]
pub struct Metrics {
    pub http_requests_total: Family<AppLabel, Counter>,
    pub http_in_flight: Gauge,
    pub ws_sessions_active: Gauge,
    pub node_evictions_total: Family<AppLabel, Counter>,
    pub call_retries_total: Family<AppLabel, Counter>,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let sub = registry.sub_registry_with_prefix("meshgate");
        let http_requests_total = Family::<AppLabel, Counter>::default();
        sub.register(
            "http_requests",
            "Total HTTP requests dispatched",
            http_requests_total.clone(),
        );
        let http_in_flight = Gauge::default();
        sub.register(
            "http_in_flight",
            "HTTP requests currently being handled",
            http_in_flight.clone(),
        );
        let ws_sessions_active = Gauge::default();
        sub.register(
            "ws_sessions_active",
            "Currently open websocket sessions",
            ws_sessions_active.clone(),
        );
        let node_evictions_total = Family::<AppLabel, Counter>::default();
        sub.register(
            "node_evictions",
            "Nodes evicted after consecutive failures",
            node_evictions_total.clone(),
        );
        let call_retries_total = Family::<AppLabel, Counter>::default();
        sub.register(
            "call_retries",
            "Calls retried against a different node",
            call_retries_total.clone(),
        );
        Self {
            http_requests_total,
            http_in_flight,
            ws_sessions_active,
            node_evictions_total,
            call_retries_total,
        }
    }
}

#[derive(Clone)]
pub struct App {
    registry: Arc<Registry>,
}

impl App {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(self.clone())
    }
}

async fn metrics_handler(State(app): State<App>) -> Result<String, StatusCode> {
    let mut buffer = String::new();
    encode(&mut buffer, &app.registry).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(buffer)
}

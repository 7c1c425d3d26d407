//! Webhook HTTP surface.
//!
//! Three routes: the TradingView signal webhook, a health probe and queue
//! statistics. The webhook route is rate limited per client IP before any
//! parsing happens.

use axum::Router;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::application::ingress::{SignalIngress, WebhookSignal};
use crate::domain::errors::IngressError;
use crate::domain::ports::SignalQueue;

#[derive(Clone)]
pub struct AppState {
    pub ingress: Arc<SignalIngress>,
    pub queue: Arc<dyn SignalQueue>,
    pub limiter: Arc<RateLimiter>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/webhooks/tradingview", post(receive_signal))
        .route("/webhooks/health", get(health))
        .route("/webhooks/queue/stats", get(queue_stats))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct SignalResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    signal_id: Option<String>,
    message: String,
    queued: bool,
}

impl SignalResponse {
    fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            signal_id: None,
            message: message.into(),
            queued: false,
        }
    }
}

async fn receive_signal(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let client_ip = addr.ip().to_string();

    if !state.limiter.try_acquire(&client_ip).await {
        warn!("Webhook rate limit exceeded for {}", client_ip);
        return (
            StatusCode::TOO_MANY_REQUESTS,
            axum::Json(SignalResponse::error("Rate limit exceeded")),
        )
            .into_response();
    }

    let payload: WebhookSignal = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                axum::Json(SignalResponse::error(format!("Invalid payload: {}", e))),
            )
                .into_response();
        }
    };

    let signature = headers
        .get("X-Signature")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    match state
        .ingress
        .ingest(payload, &body, signature.as_deref(), &client_ip)
        .await
    {
        Ok(outcome) => (
            StatusCode::OK,
            axum::Json(SignalResponse {
                success: true,
                signal_id: Some(outcome.request_id.clone()),
                message: outcome.message(),
                queued: outcome.queued_any(),
            }),
        )
            .into_response(),
        Err(e) => {
            let status = ingress_status(&e);
            if status == StatusCode::INTERNAL_SERVER_ERROR {
                error!("Webhook processing failed: {:#}", e);
            }
            (status, axum::Json(SignalResponse::error(e.to_string()))).into_response()
        }
    }
}

fn ingress_status(error: &IngressError) -> StatusCode {
    match error {
        IngressError::InvalidSecret => StatusCode::UNAUTHORIZED,
        IngressError::StrategyNotFound => StatusCode::NOT_FOUND,
        IngressError::StrategyInactive | IngressError::InvalidPrice(_) => StatusCode::BAD_REQUEST,
        IngressError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        IngressError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug, Serialize)]
struct WebhookHealth {
    status: &'static str,
    timestamp: String,
    version: &'static str,
}

async fn health() -> impl IntoResponse {
    axum::Json(WebhookHealth {
        status: "healthy",
        timestamp: Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn queue_stats(State(state): State<AppState>) -> Response {
    match state.queue.stats().await {
        Ok(stats) => axum::Json(stats).into_response(),
        Err(e) => {
            error!("Failed to read queue stats: {:#}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(SignalResponse::error("Queue unavailable")),
            )
                .into_response()
        }
    }
}

// =========================================================================
// Rate limiting
// =========================================================================

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket per client IP. The bucket holds a minute's worth of requests
/// and refills continuously.
pub struct RateLimiter {
    per_minute: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(per_minute: u32) -> Self {
        Self {
            per_minute: per_minute as f64,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub async fn try_acquire(&self, key: &str) -> bool {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.per_minute,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.per_minute / 60.0).min(self.per_minute);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limiter_exhausts_and_refills_per_key() {
        let limiter = RateLimiter::new(3);

        assert!(limiter.try_acquire("1.2.3.4").await);
        assert!(limiter.try_acquire("1.2.3.4").await);
        assert!(limiter.try_acquire("1.2.3.4").await);
        assert!(!limiter.try_acquire("1.2.3.4").await);

        // Other clients have their own bucket.
        assert!(limiter.try_acquire("5.6.7.8").await);
    }

    #[test]
    fn ingress_errors_map_to_expected_statuses() {
        assert_eq!(
            ingress_status(&IngressError::InvalidSecret),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ingress_status(&IngressError::StrategyNotFound),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ingress_status(&IngressError::StrategyInactive),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ingress_status(&IngressError::InvalidPrice("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ingress_status(&IngressError::Validation("x".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }
}

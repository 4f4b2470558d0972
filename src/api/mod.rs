//! HTTP surface: REST endpoints over the broker plus the push stream.

pub mod routes;

use std::sync::Arc;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error};

use crate::broker::DelegateBroker;
use crate::error::{BrokerError, DatabaseError, Error};
use crate::push::{PushHub, ws::stream_routes};
use crate::tasks::WaitRegistry;

pub use routes::{ProbeResult, TaskSubmission, api_routes, wait_routes};

/// Full application router: REST, async response long-poll, push stream,
/// permissive CORS.
pub fn router(broker: Arc<DelegateBroker>, hub: Arc<PushHub>, waiters: Arc<WaitRegistry>) -> Router {
    api_routes(broker)
        .merge(wait_routes(waiters))
        .merge(stream_routes(hub))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Broker error rendered as `{"error": ...}` with a matching status code.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() && status != StatusCode::GATEWAY_TIMEOUT {
            error!(error = %self.0, "Request failed");
        } else {
            debug!(status = %status, error = %self.0, "Request rejected");
        }
        (status, Json(serde_json::json!({"error": self.0.to_string()}))).into_response()
    }
}

pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Broker(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
        Error::Broker(BrokerError::TaskVanished { .. }) => StatusCode::GONE,
        Error::Broker(BrokerError::DelegateNotFound { .. }) => StatusCode::NOT_FOUND,
        Error::Broker(BrokerError::InvalidTask(_) | BrokerError::InvalidScope(_)) => {
            StatusCode::BAD_REQUEST
        }
        Error::Config(_) | Error::Database(_) | Error::Broker(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

pub(crate) fn not_found(message: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": message})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;

    #[test]
    fn error_status_mapping() {
        let task_id = Uuid::new_v4();
        let cases: Vec<(Error, StatusCode)> = vec![
            (
                BrokerError::ExecutionTimeout {
                    task_id,
                    timeout: Duration::from_millis(100),
                }
                .into(),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (BrokerError::NoResponse { task_id }.into(), StatusCode::GATEWAY_TIMEOUT),
            (BrokerError::TaskVanished { task_id }.into(), StatusCode::GONE),
            (
                BrokerError::DelegateNotFound {
                    account_id: "acct".into(),
                    delegate_id: "d1".into(),
                }
                .into(),
                StatusCode::NOT_FOUND,
            ),
            (BrokerError::InvalidTask("no type".into()).into(), StatusCode::BAD_REQUEST),
            (BrokerError::InvalidScope("empty".into()).into(), StatusCode::BAD_REQUEST),
            (
                DatabaseError::Query("disk full".into()).into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(status_for(&err), expected, "{err}");
        }
    }
}

// =============================================================================
// Client-facing API — REST surface and the tick WebSocket
// =============================================================================

pub mod auth;
pub mod rest;
pub mod ws;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::aggregator::AggregatorStats;
use crate::distributor::Distributor;
use crate::engine::EngineHandle;
use crate::errors::CoreError;
use crate::ohlc::OhlcAggregator;
use crate::router::Router as OrderRouter;
use crate::sessions::SessionManager;
use crate::supervisor::Supervisor;
use crate::symbols::SymbolRegistry;
use crate::tick_store::TickStore;

/// Everything the handlers need, shared via `State<Arc<AppCtx>>`.
pub struct AppCtx {
    pub registry: Arc<SymbolRegistry>,
    pub tick_store: Arc<TickStore>,
    pub ohlc: Arc<OhlcAggregator>,
    pub engine: EngineHandle,
    pub order_router: Arc<OrderRouter>,
    pub sessions: Arc<SessionManager>,
    pub distributor: Arc<Distributor>,
    pub supervisor: Arc<Supervisor>,
    pub aggregator_stats: Arc<AggregatorStats>,
}

/// REST error envelope: every domain error surfaces its stable kind plus an
/// HTTP status that matches its class.
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = match &err {
            CoreError::AuthRequired | CoreError::TokenExpired => StatusCode::UNAUTHORIZED,
            CoreError::Forbidden => StatusCode::FORBIDDEN,
            CoreError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            CoreError::ServerBusy => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::MalformedMessage(_) | CoreError::InvalidConfig(_) => {
                StatusCode::BAD_REQUEST
            }
            CoreError::UnknownSymbol(_)
            | CoreError::UnknownAccount(_)
            | CoreError::OrderNotFound(_)
            | CoreError::PositionNotFound(_) => StatusCode::NOT_FOUND,
            CoreError::NoLiquidity(_)
            | CoreError::StalePrice(_)
            | CoreError::SymbolSuspended(_)
            | CoreError::InsufficientMargin { .. }
            | CoreError::InvalidVolume { .. }
            | CoreError::AccountSuspended(_)
            | CoreError::MarginCall
            | CoreError::StopOut => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "error": err.to_string(),
            "kind": err.kind(),
        });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: CoreError) -> StatusCode {
        ApiError(err).into_response().status()
    }

    #[test]
    fn error_kinds_map_to_statuses() {
        assert_eq!(status_of(CoreError::AuthRequired), StatusCode::UNAUTHORIZED);
        assert_eq!(status_of(CoreError::TokenExpired), StatusCode::UNAUTHORIZED);
        assert_eq!(status_of(CoreError::Forbidden), StatusCode::FORBIDDEN);
        assert_eq!(
            status_of(CoreError::RateLimited),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_of(CoreError::ServerBusy),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(CoreError::NoLiquidity("EURUSD".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(CoreError::PositionNotFound("p".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(CoreError::MalformedMessage("x".into())),
            StatusCode::BAD_REQUEST
        );
    }
}

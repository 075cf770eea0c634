// HTTP API over the tip ledger

pub mod handlers;
pub mod types;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tracing::error;

use crate::custody::Custody;
use crate::error::{ErrorKind, LedgerError};
use crate::relay::RelayRejection;
use crate::service::TipService;
use crate::store::Store;

/// Header carrying the authenticated caller address
pub const CALLER_HEADER: &str = "x-caller-address";

/// Application state shared across handlers
pub struct AppState<S, K> {
    pub service: TipService<S, K>,
}

fn status_for(err: &LedgerError) -> StatusCode {
    match err.kind() {
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorKind::InsufficientFunds | ErrorKind::Unsupported => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Unavailable => match err {
            LedgerError::Storage(_) | LedgerError::Overflow => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::SERVICE_UNAVAILABLE,
        },
    }
}

impl IntoResponse for LedgerError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        let body = Json(json!({
            "error": self.to_string(),
            "kind": self.kind(),
        }));
        (status, body).into_response()
    }
}

impl IntoResponse for RelayRejection {
    fn into_response(self) -> Response {
        let status = status_for(&self.error);
        if status.is_server_error() {
            error!("Relay request failed: {}", self.error);
        }
        let body = Json(json!({
            "error": self.error.to_string(),
            "kind": self.error.kind(),
            "stage": self.stage,
        }));
        (status, body).into_response()
    }
}

pub fn router<S: Store, K: Custody>(service: TipService<S, K>) -> Router {
    let state = Arc::new(AppState { service });

    Router::new()
        .route("/health", get(handlers::health::<S, K>))
        // Accounts
        .route("/accounts/register", post(handlers::register::<S, K>))
        .route("/accounts/promote/creator", post(handlers::promote_creator::<S, K>))
        .route("/accounts/promote/tipper", post(handlers::promote_tipper::<S, K>))
        .route("/accounts/:owner", get(handlers::user_profile::<S, K>))
        .route("/accounts/:owner/tips", get(handlers::account_tips::<S, K>))
        .route("/creators/:handle", get(handlers::creator_by_handle::<S, K>))
        // Balances
        .route("/balances/deposit", post(handlers::deposit::<S, K>))
        .route("/balances/withdraw", post(handlers::withdraw::<S, K>))
        .route("/balances/:owner/:token", get(handlers::balance_of::<S, K>))
        // Operators
        .route("/operators/authorize", post(handlers::authorize_operator::<S, K>))
        .route("/operators/revoke", post(handlers::revoke_operator::<S, K>))
        .route("/operators/:owner/:operator", get(handlers::allowance::<S, K>))
        .route(
            "/operators/:owner/:operator/authorized",
            get(handlers::is_authorized::<S, K>),
        )
        // Tips
        .route("/tips", post(handlers::tip::<S, K>))
        .route("/tips/:id", get(handlers::tip_record::<S, K>))
        .route("/relay/tip", post(handlers::relay_tip::<S, K>))
        .route("/relay/mention", post(handlers::relay_mention::<S, K>))
        // Tokens
        .route("/tokens", get(handlers::supported_tokens::<S, K>))
        .route("/tokens/:token/supply", get(handlers::token_supply::<S, K>))
        .route("/admin/tokens", post(handlers::add_supported_token::<S, K>))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::command::CommandParser;
    use crate::custody::TrackingCustody;
    use crate::fees::FeeSchedule;
    use crate::models::Address;
    use crate::relay::RelayStage;
    use crate::service::ServiceSettings;
    use crate::store::MemoryStore;
    use axum::body::{to_bytes, Body};
    use axum::http::{HeaderMap, Request};
    use serde_json::Value;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let admin = Address::parse("admin").unwrap();
        let service = TipService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(TrackingCustody::new()),
            Arc::new(SystemClock),
            ServiceSettings {
                admin,
                fee_account: Address::parse("platform").unwrap(),
                fees: FeeSchedule::default(),
                dedup_retention: chrono::Duration::hours(24),
                parser: CommandParser::new(Vec::new(), None),
            },
        );
        router(service)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn register_request(caller: &str, handle: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/accounts/register")
            .header("content-type", "application/json")
            .header(CALLER_HEADER, caller)
            .body(Body::from(
                json!({ "handle": handle, "as_creator": true }).to_string(),
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_round_trip() {
        let app = test_router();

        let (status, body) = send(&app, register_request("0xABCDEF01", "Carol")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["owner"], "0xabcdef01");
        assert_eq!(body["handle"], "Carol");
        assert_eq!(body["is_creator"], true);

        let (status, body) = send(&app, register_request("0xabcdef02", "carol")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "conflict");

        let lookup = Request::builder()
            .uri("/creators/CAROL")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, lookup).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["owner"], "0xabcdef01");
    }

    #[tokio::test]
    async fn test_missing_caller_is_rejected() {
        let app = test_router();
        let request = Request::builder()
            .method("POST")
            .uri("/accounts/register")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"handle":"dave"}"#))
            .unwrap();

        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "invalid_input");
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(status_for(&LedgerError::InvalidAmount), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&LedgerError::RecipientNotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&LedgerError::HandleTaken), StatusCode::CONFLICT);
        assert_eq!(status_for(&LedgerError::NotAdmin), StatusCode::FORBIDDEN);
        assert_eq!(
            status_for(&LedgerError::DailyLimitExceeded),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&LedgerError::RequestInFlight),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&LedgerError::Storage("down".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_rejection_response_status() {
        let rejection = RelayRejection {
            stage: RelayStage::AfterReservation,
            error: LedgerError::InsufficientBalance,
        };
        assert_eq!(
            rejection.into_response().status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn test_caller_header() {
        let mut headers = HeaderMap::new();
        assert!(handlers::caller(&headers).is_err());

        headers.insert(CALLER_HEADER, "0xabcdef01".parse().unwrap());
        assert_eq!(handlers::caller(&headers).unwrap().as_str(), "0xabcdef01");

        headers.insert(CALLER_HEADER, "bad address".parse().unwrap());
        assert!(handlers::caller(&headers).is_err());
    }
}

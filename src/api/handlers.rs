// HTTP handlers: decode, call the service, encode

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::types::*;
use super::{AppState, CALLER_HEADER};
use crate::command::Mention;
use crate::custody::Custody;
use crate::error::{LedgerError, Result};
use crate::models::{
    Account, Address, AllowanceView, Authorization, Balance, CreatorView, TipRecord, TokenId,
    UserProfile,
};
use crate::relay::{RelayReceipt, RelayRejection, RelayRequest};
use crate::store::Store;

const DEFAULT_PAGE_SIZE: usize = 20;

/// Identity of the caller, set by the authenticating gateway in front of us
pub(crate) fn caller(headers: &HeaderMap) -> Result<Address> {
    let raw = headers
        .get(CALLER_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| LedgerError::InvalidAddress(format!("missing {} header", CALLER_HEADER)))?;
    Address::parse(raw)
}

type AppResult<T> = Result<Json<T>>;

pub async fn health<S: Store, K: Custody>(
    State(state): State<Arc<AppState<S, K>>>,
) -> AppResult<HealthResponse> {
    let tokens = state.service.supported_tokens().await?;
    Ok(Json(HealthResponse {
        status: "ok",
        supported_tokens: tokens.len(),
    }))
}

// ============================================================================
// ACCOUNTS
// ============================================================================

pub async fn register<S: Store, K: Custody>(
    State(state): State<Arc<AppState<S, K>>>,
    headers: HeaderMap,
    Json(req): Json<RegisterRequest>,
) -> AppResult<Account> {
    let caller = caller(&headers)?;
    let account = state
        .service
        .register(&caller, &req.handle, req.as_creator, req.as_tipper)
        .await?;
    Ok(Json(account))
}

pub async fn promote_creator<S: Store, K: Custody>(
    State(state): State<Arc<AppState<S, K>>>,
    headers: HeaderMap,
) -> AppResult<Account> {
    let caller = caller(&headers)?;
    Ok(Json(state.service.promote_to_creator(&caller).await?))
}

pub async fn promote_tipper<S: Store, K: Custody>(
    State(state): State<Arc<AppState<S, K>>>,
    headers: HeaderMap,
) -> AppResult<Account> {
    let caller = caller(&headers)?;
    Ok(Json(state.service.promote_to_tipper(&caller).await?))
}

pub async fn user_profile<S: Store, K: Custody>(
    State(state): State<Arc<AppState<S, K>>>,
    Path(owner): Path<String>,
) -> AppResult<UserProfile> {
    let owner = Address::parse(&owner)?;
    Ok(Json(state.service.get_user_profile(&owner).await?))
}

pub async fn creator_by_handle<S: Store, K: Custody>(
    State(state): State<Arc<AppState<S, K>>>,
    Path(handle): Path<String>,
) -> AppResult<CreatorView> {
    Ok(Json(state.service.get_creator_by_handle(&handle).await?))
}

pub async fn account_tips<S: Store, K: Custody>(
    State(state): State<Arc<AppState<S, K>>>,
    Path(owner): Path<String>,
    Query(page): Query<PageQuery>,
) -> AppResult<Vec<TipRecord>> {
    let owner = Address::parse(&owner)?;
    let tips = state
        .service
        .tips_for(
            &owner,
            page.limit.unwrap_or(DEFAULT_PAGE_SIZE),
            page.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(tips))
}

// ============================================================================
// BALANCES
// ============================================================================

pub async fn deposit<S: Store, K: Custody>(
    State(state): State<Arc<AppState<S, K>>>,
    headers: HeaderMap,
    Json(req): Json<TokenAmountRequest>,
) -> AppResult<Balance> {
    let caller = caller(&headers)?;
    Ok(Json(
        state.service.deposit(&caller, &req.token, req.amount).await?,
    ))
}

pub async fn withdraw<S: Store, K: Custody>(
    State(state): State<Arc<AppState<S, K>>>,
    headers: HeaderMap,
    Json(req): Json<TokenAmountRequest>,
) -> AppResult<Balance> {
    let caller = caller(&headers)?;
    Ok(Json(
        state.service.withdraw(&caller, &req.token, req.amount).await?,
    ))
}

pub async fn balance_of<S: Store, K: Custody>(
    State(state): State<Arc<AppState<S, K>>>,
    Path((owner, token)): Path<(String, String)>,
) -> AppResult<BalanceResponse> {
    let owner = Address::parse(&owner)?;
    let token = TokenId::parse(&token)?;
    let amount = state.service.balance_of(&owner, &token).await?;
    Ok(Json(BalanceResponse {
        owner,
        token,
        amount,
    }))
}

// ============================================================================
// OPERATORS
// ============================================================================

pub async fn authorize_operator<S: Store, K: Custody>(
    State(state): State<Arc<AppState<S, K>>>,
    headers: HeaderMap,
    Json(req): Json<AuthorizeRequest>,
) -> AppResult<Authorization> {
    let caller = caller(&headers)?;
    Ok(Json(
        state
            .service
            .authorize_operator(&caller, &req.operator, req.daily_limit)
            .await?,
    ))
}

pub async fn revoke_operator<S: Store, K: Custody>(
    State(state): State<Arc<AppState<S, K>>>,
    headers: HeaderMap,
    Json(req): Json<RevokeRequest>,
) -> AppResult<Authorization> {
    let caller = caller(&headers)?;
    Ok(Json(
        state.service.revoke_operator(&caller, &req.operator).await?,
    ))
}

pub async fn allowance<S: Store, K: Custody>(
    State(state): State<Arc<AppState<S, K>>>,
    Path((owner, operator)): Path<(String, String)>,
) -> AppResult<AllowanceView> {
    let owner = Address::parse(&owner)?;
    let operator = Address::parse(&operator)?;
    Ok(Json(state.service.allowance(&owner, &operator).await?))
}

pub async fn is_authorized<S: Store, K: Custody>(
    State(state): State<Arc<AppState<S, K>>>,
    Path((owner, operator)): Path<(String, String)>,
) -> AppResult<AuthorizedResponse> {
    let owner = Address::parse(&owner)?;
    let operator = Address::parse(&operator)?;
    let authorized = state.service.is_authorized(&owner, &operator).await?;
    Ok(Json(AuthorizedResponse {
        owner,
        operator,
        authorized,
    }))
}

// ============================================================================
// TIPS
// ============================================================================

pub async fn tip<S: Store, K: Custody>(
    State(state): State<Arc<AppState<S, K>>>,
    headers: HeaderMap,
    Json(req): Json<TipRequest>,
) -> AppResult<TipRecord> {
    let caller = caller(&headers)?;
    let record = state
        .service
        .tip(
            &caller,
            &req.recipient_handle,
            &req.token,
            req.amount,
            &req.message,
        )
        .await?;
    Ok(Json(record))
}

pub async fn tip_record<S: Store, K: Custody>(
    State(state): State<Arc<AppState<S, K>>>,
    Path(id): Path<Uuid>,
) -> AppResult<TipRecord> {
    Ok(Json(state.service.tip_record(&id).await?))
}

pub async fn relay_tip<S: Store, K: Custody>(
    State(state): State<Arc<AppState<S, K>>>,
    headers: HeaderMap,
    Json(req): Json<RelayTipRequest>,
) -> Result<Json<RelayReceipt>, RelayRejection> {
    let operator = caller(&headers).map_err(RelayRejection::before)?;
    debug!("Relay request {} from operator {}", req.request_id, operator);

    let receipt = state
        .service
        .tip_for(RelayRequest {
            operator,
            tipper: req.tipper,
            recipient_handle: req.recipient_handle,
            token: req.token,
            amount: req.amount,
            message: req.message,
            request_id: req.request_id,
        })
        .await?;
    Ok(Json(receipt))
}

pub async fn relay_mention<S: Store, K: Custody>(
    State(state): State<Arc<AppState<S, K>>>,
    headers: HeaderMap,
    Json(mention): Json<Mention>,
) -> Result<Json<RelayReceipt>, RelayRejection> {
    let operator = caller(&headers).map_err(RelayRejection::before)?;
    let receipt = state.service.relay_mention(&operator, &mention).await?;
    Ok(Json(receipt))
}

// ============================================================================
// TOKENS
// ============================================================================

pub async fn supported_tokens<S: Store, K: Custody>(
    State(state): State<Arc<AppState<S, K>>>,
) -> AppResult<Vec<TokenId>> {
    Ok(Json(state.service.supported_tokens().await?))
}

pub async fn add_supported_token<S: Store, K: Custody>(
    State(state): State<Arc<AppState<S, K>>>,
    headers: HeaderMap,
    Json(req): Json<AddTokenRequest>,
) -> AppResult<AddTokenResponse> {
    let caller = caller(&headers)?;
    let added = state
        .service
        .add_supported_token(&caller, &req.token)
        .await?;
    Ok(Json(AddTokenResponse {
        token: req.token,
        added,
    }))
}

pub async fn token_supply<S: Store, K: Custody>(
    State(state): State<Arc<AppState<S, K>>>,
    Path(token): Path<String>,
) -> AppResult<TokenSupplyResponse> {
    let token = TokenId::parse(&token)?;
    let supply = state.service.token_supply(&token).await?;
    Ok(Json(TokenSupplyResponse {
        token,
        supply: supply.to_string(),
    }))
}

// Request and response bodies for the HTTP API

use serde::{Deserialize, Serialize};

use crate::models::{Address, Amount, TokenId};

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub handle: String,
    #[serde(default)]
    pub as_creator: bool,
    #[serde(default)]
    pub as_tipper: bool,
}

/// Body of deposit and withdraw
#[derive(Debug, Deserialize)]
pub struct TokenAmountRequest {
    pub token: TokenId,
    pub amount: Amount,
}

#[derive(Debug, Deserialize)]
pub struct AuthorizeRequest {
    pub operator: Address,
    pub daily_limit: Amount,
}

#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    pub operator: Address,
}

#[derive(Debug, Deserialize)]
pub struct TipRequest {
    pub recipient_handle: String,
    pub token: TokenId,
    pub amount: Amount,
    #[serde(default)]
    pub message: String,
}

/// Relay body; the operator is the authenticated caller
#[derive(Debug, Deserialize)]
pub struct RelayTipRequest {
    pub tipper: Address,
    pub recipient_handle: String,
    pub token: TokenId,
    pub amount: Amount,
    #[serde(default)]
    pub message: String,
    pub request_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AddTokenRequest {
    pub token: TokenId,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub owner: Address,
    pub token: TokenId,
    pub amount: Amount,
}

#[derive(Debug, Serialize)]
pub struct AuthorizedResponse {
    pub owner: Address,
    pub operator: Address,
    pub authorized: bool,
}

#[derive(Debug, Serialize)]
pub struct AddTokenResponse {
    pub token: TokenId,
    pub added: bool,
}

#[derive(Debug, Serialize)]
pub struct TokenSupplyResponse {
    pub token: TokenId,
    /// Decimal string; the sum can exceed u64
    pub supply: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub supported_tokens: usize,
}

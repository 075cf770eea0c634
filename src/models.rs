// Domain records for the tip ledger

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::LedgerError;

/// Amount in a token's minor unit
pub type Amount = u64;

/// Days since the Unix epoch, UTC
pub type DayIndex = i64;

/// Longest handle accepted at registration
pub const MAX_HANDLE_LEN: usize = 15;

/// Longest tip message, in characters
pub const MAX_MESSAGE_LEN: usize = 280;

const MAX_ADDRESS_LEN: usize = 128;

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Owner identity of an account (wallet address or public key)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

/// Token contract address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TokenId(String);

fn validate_address(raw: &str) -> Result<String, LedgerError> {
    let value = raw.trim();
    if value.is_empty() || value.len() > MAX_ADDRESS_LEN {
        return Err(LedgerError::InvalidAddress(raw.to_string()));
    }

    match value.strip_prefix("0x") {
        // Hex is case-insensitive; base58 keys are not
        Some(hex_part) => {
            let bytes = hex::decode(hex_part)
                .map_err(|_| LedgerError::InvalidAddress(raw.to_string()))?;
            if bytes.is_empty() {
                return Err(LedgerError::InvalidAddress(raw.to_string()));
            }
            Ok(format!("0x{}", hex_part.to_ascii_lowercase()))
        }
        None => {
            if !value.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(LedgerError::InvalidAddress(raw.to_string()));
            }
            Ok(value.to_string())
        }
    }
}

impl Address {
    /// Accepts `0x`-prefixed hex or a plain alphanumeric key (base58 style)
    pub fn parse(raw: &str) -> Result<Self, LedgerError> {
        validate_address(raw).map(Address)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TokenId {
    pub fn parse(raw: &str) -> Result<Self, LedgerError> {
        validate_address(raw).map(TokenId)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Address {
    type Error = LedgerError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl TryFrom<String> for TokenId {
    type Error = LedgerError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl From<TokenId> for String {
    fn from(token: TokenId) -> Self {
        token.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// HANDLES
// ============================================================================

/// Validate a social handle and return it without a leading `@`.
///
/// Handles are 1-15 characters of `[A-Za-z0-9_]` and may not be all digits.
pub fn validate_handle(raw: &str) -> Result<String, LedgerError> {
    let handle = raw.strip_prefix('@').unwrap_or(raw);

    let well_formed = !handle.is_empty()
        && handle.len() <= MAX_HANDLE_LEN
        && handle.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !handle.chars().all(|c| c.is_ascii_digit());

    if well_formed {
        Ok(handle.to_string())
    } else {
        Err(LedgerError::InvalidHandle(raw.to_string()))
    }
}

/// Case-insensitive lookup key for a handle
pub fn handle_key(handle: &str) -> String {
    handle.strip_prefix('@').unwrap_or(handle).to_ascii_lowercase()
}

// ============================================================================
// STORED RECORDS
// ============================================================================

/// Registered identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub owner: Address,
    /// Display handle, casing as registered
    pub handle: String,
    pub is_creator: bool,
    pub is_tipper: bool,
    pub registered_at: DateTime<Utc>,
    pub active: bool,
    pub tips_sent: u64,
    pub tips_received: u64,
}

impl Account {
    pub fn new(
        owner: Address,
        handle: String,
        is_creator: bool,
        is_tipper: bool,
        registered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            owner,
            handle,
            is_creator,
            is_tipper,
            registered_at,
            active: true,
            tips_sent: 0,
            tips_received: 0,
        }
    }

    pub fn handle_key(&self) -> String {
        handle_key(&self.handle)
    }
}

/// Custodial balance for one (account, token) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub owner: Address,
    pub token: TokenId,
    pub amount: Amount,
    /// Gross amount tipped out of this balance
    pub total_sent: Amount,
    /// Net amount received as tips into this balance
    pub total_received: Amount,
}

impl Balance {
    pub fn zero(owner: Address, token: TokenId) -> Self {
        Self {
            owner,
            token,
            amount: 0,
            total_sent: 0,
            total_received: 0,
        }
    }
}

/// Operator authorization for one (account, operator) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    pub owner: Address,
    pub operator: Address,
    pub authorized: bool,
    pub daily_limit: Amount,
    pub daily_spent: Amount,
    pub spent_day: DayIndex,
}

impl Authorization {
    /// Spent amount as seen on `today`; a stale day counts as zero
    pub fn effective_spent(&self, today: DayIndex) -> Amount {
        if self.spent_day == today {
            self.daily_spent
        } else {
            0
        }
    }

    pub fn remaining(&self, today: DayIndex) -> Amount {
        self.daily_limit.saturating_sub(self.effective_spent(today))
    }
}

/// Immutable audit entry for one completed tip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipRecord {
    pub id: Uuid,
    pub sender: Address,
    pub sender_handle: String,
    pub recipient: Address,
    pub recipient_handle: String,
    pub token: TokenId,
    pub gross_amount: Amount,
    pub fee_amount: Amount,
    pub net_amount: Amount,
    pub message: String,
    pub operator: Option<Address>,
    pub request_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// STORE OPERATIONS
// ============================================================================

/// One leg of an atomic balance batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Movement {
    Credit {
        owner: Address,
        token: TokenId,
        amount: Amount,
    },
    Debit {
        owner: Address,
        token: TokenId,
        amount: Amount,
    },
}

impl Movement {
    pub fn owner(&self) -> &Address {
        match self {
            Movement::Credit { owner, .. } | Movement::Debit { owner, .. } => owner,
        }
    }

    pub fn token(&self) -> &TokenId {
        match self {
            Movement::Credit { token, .. } | Movement::Debit { token, .. } => token,
        }
    }
}

/// Relay deduplication key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub operator: Address,
    pub request_id: String,
}

/// Stored result of a relay request that reached the reservation step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum RelayOutcome {
    Completed(TipRecord),
    Failed(LedgerError),
}

/// Result of claiming a relay request identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestClaim {
    /// First delivery; the caller owns execution
    Fresh,
    /// Claimed by a delivery that has not finished yet
    Pending,
    /// A pending claim whose lease ran out; the caller now owns it, but the
    /// earlier delivery may have committed its tip
    Abandoned,
    /// Already executed; replay this outcome
    Done(RelayOutcome),
}

// ============================================================================
// READ VIEWS
// ============================================================================

/// Account plus all of its balances
#[derive(Debug, Clone, Serialize)]
pub struct UserProfile {
    pub account: Account,
    pub balances: Vec<Balance>,
}

/// Public creator card returned by handle lookup
#[derive(Debug, Clone, Serialize)]
pub struct CreatorView {
    pub owner: Address,
    pub handle: String,
    pub tips_received: u64,
    pub registered_at: DateTime<Utc>,
}

/// Operator quota as of today
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllowanceView {
    pub owner: Address,
    pub operator: Address,
    pub authorized: bool,
    pub daily_limit: Amount,
    pub daily_spent: Amount,
    pub remaining: Amount,
    pub day: DayIndex,
}

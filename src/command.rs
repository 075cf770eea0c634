//! Mention command parsing for the tip bot.
//!
//! Accepted form, anywhere in the mention text:
//!
//! ```text
//! [@bot] tip @handle <amount> <SYMBOL> [message...]
//! ```
//!
//! Amounts are decimal strings converted exactly into the token's minor unit
//! using the decimals configured for the symbol.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{LedgerError, Result};
use crate::models::{handle_key, Address, Amount, TokenId};
use crate::relay::RelayRequest;

/// Most decimals any supported token may use (10^19 overflows u64)
pub const MAX_DECIMALS: u8 = 18;

lazy_static! {
    static ref TIP_COMMAND: Regex = Regex::new(
        r"(?is)(?:^|\s)tip\s+@(?P<handle>[A-Za-z0-9_]{1,15})\b\s+\$?(?P<amount>\d+(?:\.\d+)?)\s*(?P<symbol>[A-Za-z][A-Za-z0-9]*)\b(?:\s+(?P<message>.*))?$"
    )
    .expect("tip command pattern compiles");
}

/// A token the bot knows by symbol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSpec {
    pub symbol: String,
    pub token: TokenId,
    pub decimals: u8,
}

/// A social post that mentioned the bot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mention {
    /// Platform id of the post; used as the relay request id
    pub id: String,
    pub author_handle: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TipCommand {
    pub recipient_handle: String,
    pub symbol: String,
    pub token: TokenId,
    pub amount: Amount,
    pub message: String,
}

impl TipCommand {
    pub fn into_relay_request(
        self,
        operator: Address,
        tipper: Address,
        request_id: String,
    ) -> RelayRequest {
        RelayRequest {
            operator,
            tipper,
            recipient_handle: self.recipient_handle,
            token: self.token,
            amount: self.amount,
            message: self.message,
            request_id,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandParser {
    tokens: HashMap<String, TokenSpec>,
    bot_handle: Option<String>,
}

impl CommandParser {
    pub fn new(tokens: Vec<TokenSpec>, bot_handle: Option<&str>) -> Self {
        Self {
            tokens: tokens
                .into_iter()
                .map(|spec| (spec.symbol.to_ascii_uppercase(), spec))
                .collect(),
            bot_handle: bot_handle.map(handle_key),
        }
    }

    pub fn tokens(&self) -> impl Iterator<Item = &TokenSpec> {
        self.tokens.values()
    }

    pub fn token_for_symbol(&self, symbol: &str) -> Option<&TokenSpec> {
        self.tokens.get(&symbol.to_ascii_uppercase())
    }

    fn mentions_bot(&self, text: &str) -> bool {
        let Some(bot) = &self.bot_handle else {
            return true;
        };
        text.split_whitespace()
            .filter_map(|word| word.strip_prefix('@'))
            .map(|word| word.trim_end_matches(|c: char| !(c.is_ascii_alphanumeric() || c == '_')))
            .any(|word| handle_key(word) == *bot)
    }

    pub fn parse(&self, text: &str) -> Result<TipCommand> {
        if !self.mentions_bot(text) {
            return Err(LedgerError::InvalidCommand("bot was not mentioned".into()));
        }

        let caps = TIP_COMMAND.captures(text).ok_or_else(|| {
            LedgerError::InvalidCommand("expected `tip @handle <amount> <symbol>`".into())
        })?;

        let symbol = &caps["symbol"];
        let spec = self
            .token_for_symbol(symbol)
            .ok_or_else(|| LedgerError::InvalidCommand(format!("unknown token {}", symbol)))?;
        let amount = parse_amount(&caps["amount"], spec.decimals)?;
        let message = caps
            .name("message")
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();

        Ok(TipCommand {
            recipient_handle: caps["handle"].to_string(),
            symbol: spec.symbol.clone(),
            token: spec.token.clone(),
            amount,
            message,
        })
    }
}

/// Convert a decimal string such as `"9.75"` into minor units.
///
/// More fractional digits than `decimals` is an error, never rounded.
pub fn parse_amount(raw: &str, decimals: u8) -> Result<Amount> {
    let invalid = |reason: &str| LedgerError::InvalidCommand(format!("amount {}: {}", raw, reason));

    if decimals > MAX_DECIMALS {
        return Err(invalid("token has too many decimals"));
    }
    let (whole, fraction) = raw.split_once('.').unwrap_or((raw, ""));
    if whole.is_empty() || !whole.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid("not a number"));
    }
    if !fraction.chars().all(|c| c.is_ascii_digit()) || raw.ends_with('.') {
        return Err(invalid("not a number"));
    }
    if fraction.len() > decimals as usize {
        return Err(invalid("too many decimal places"));
    }

    let scale = 10u64.pow(decimals as u32);
    let whole: u64 = whole.parse().map_err(|_| invalid("out of range"))?;
    let fraction: u64 = if fraction.is_empty() {
        0
    } else {
        let padded = format!("{:0<width$}", fraction, width = decimals as usize);
        padded.parse().map_err(|_| invalid("out of range"))?
    };

    whole
        .checked_mul(scale)
        .and_then(|minor| minor.checked_add(fraction))
        .ok_or_else(|| invalid("out of range"))
}

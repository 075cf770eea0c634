// Server configuration loaded from the environment (and `.env`)

use anyhow::{anyhow, bail, Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::command::{TokenSpec, MAX_DECIMALS};
use crate::fees::{FeeSchedule, VolumeDiscount, DEFAULT_FEE_BPS};
use crate::models::{Address, TokenId};
use crate::relay::{DEFAULT_DEDUP_RETENTION_HOURS, MAX_DEDUP_RETENTION_HOURS};

#[derive(Debug, Clone)]
pub struct Config {
    /// Unset runs on the in-memory store
    pub database_url: Option<String>,
    pub port: u16,
    pub admin: Address,
    pub fee_account: Address,
    pub fee_bps: u16,
    pub discount: Option<VolumeDiscount>,
    pub tokens: Vec<TokenSpec>,
    pub bot_handle: Option<String>,
    pub dedup_retention_hours: i64,
    /// Unset keeps custody in-process
    pub custody_url: Option<String>,
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(name: &str) -> Result<String> {
    optional(name).ok_or_else(|| anyhow!("{} must be set in environment", name))
}

fn parsed<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(name) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{} has an invalid value: {}", name, raw)),
        None => Ok(default),
    }
}

/// Parse `SYMBOL=token_address:decimals,...`
pub fn parse_token_list(raw: &str) -> Result<Vec<TokenSpec>> {
    let mut specs = Vec::new();

    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (symbol, rest) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("token entry '{}' is missing '='", entry))?;
        let (address, decimals) = rest
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("token entry '{}' is missing ':decimals'", entry))?;

        let symbol = symbol.trim().to_ascii_uppercase();
        if symbol.is_empty() || !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
            bail!("token entry '{}' has an invalid symbol", entry);
        }
        let token = TokenId::parse(address.trim())
            .map_err(|e| anyhow!("token entry '{}': {}", entry, e))?;
        let decimals: u8 = decimals
            .trim()
            .parse()
            .with_context(|| format!("token entry '{}' has invalid decimals", entry))?;
        if decimals > MAX_DECIMALS {
            bail!("token entry '{}' has more than {} decimals", entry, MAX_DECIMALS);
        }

        specs.push(TokenSpec {
            symbol,
            token,
            decimals,
        });
    }

    Ok(specs)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let admin = Address::parse(&required("ADMIN_ADDRESS")?)
            .map_err(|e| anyhow!("ADMIN_ADDRESS: {}", e))?;
        let fee_account = Address::parse(&required("FEE_ACCOUNT")?)
            .map_err(|e| anyhow!("FEE_ACCOUNT: {}", e))?;

        let discount = match (optional("DISCOUNT_MIN_TIPS"), optional("DISCOUNT_FEE_BPS")) {
            (Some(_), Some(_)) => Some(VolumeDiscount {
                min_tips_sent: parsed("DISCOUNT_MIN_TIPS", 0)?,
                discounted_bps: parsed("DISCOUNT_FEE_BPS", 0)?,
            }),
            (None, None) => None,
            _ => bail!("DISCOUNT_MIN_TIPS and DISCOUNT_FEE_BPS must be set together"),
        };

        let dedup_retention_hours = check_retention(parsed(
            "DEDUP_RETENTION_HOURS",
            DEFAULT_DEDUP_RETENTION_HOURS,
        )?)?;

        Ok(Self {
            database_url: optional("DATABASE_URL"),
            port: parsed("PORT", 4000)?,
            admin,
            fee_account,
            fee_bps: parsed("PLATFORM_FEE_BPS", DEFAULT_FEE_BPS)?,
            discount,
            tokens: parse_token_list(&optional("SUPPORTED_TOKENS").unwrap_or_default())?,
            bot_handle: optional("BOT_HANDLE"),
            dedup_retention_hours,
            custody_url: optional("CUSTODY_URL"),
        })
    }

    pub fn fee_schedule(&self) -> Result<FeeSchedule> {
        let schedule = match self.discount {
            Some(discount) => FeeSchedule::new(self.fee_bps, Arc::new(discount)),
            None => FeeSchedule::flat(self.fee_bps),
        };
        schedule.map_err(|e| anyhow!("PLATFORM_FEE_BPS: {}", e))
    }

    pub fn log_summary(&self) {
        info!("Configuration:");
        info!(
            "  Store: {}",
            if self.database_url.is_some() { "postgres" } else { "memory" }
        );
        info!(
            "  Custody: {}",
            self.custody_url.as_deref().unwrap_or("in-process tracking")
        );
        info!("  Admin: {}", self.admin);
        info!("  Fee account: {} ({} bps)", self.fee_account, self.fee_bps);
        if let Some(discount) = &self.discount {
            info!(
                "  Volume discount: {} bps after {} tips",
                discount.discounted_bps, discount.min_tips_sent
            );
        }
        for spec in &self.tokens {
            info!("  Token {}: {} ({} decimals)", spec.symbol, spec.token, spec.decimals);
        }
        info!("  Dedup retention: {}h", self.dedup_retention_hours);
        info!("  Server Port: {}", self.port);
    }
}

fn check_retention(hours: i64) -> Result<i64> {
    if !(1..=MAX_DEDUP_RETENTION_HOURS).contains(&hours) {
        bail!(
            "DEDUP_RETENTION_HOURS must be between 1 and {}, got {}",
            MAX_DEDUP_RETENTION_HOURS,
            hours
        );
    }
    Ok(hours)
}

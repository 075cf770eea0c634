//! Custodial tip ledger with delegated, rate-limited relay tipping.
//!
//! Registered accounts hold per-token balances, tip creators by social
//! handle, and may authorize an operator (a bot) to tip on their behalf up to
//! a daily limit. [`service::TipService`] is the entry point; [`api`] exposes
//! it over HTTP.

pub mod api;
pub mod authorization;
pub mod clock;
pub mod command;
pub mod config;
pub mod custody;
pub mod error;
pub mod fees;
pub mod ledger;
pub mod models;
pub mod registry;
pub mod relay;
pub mod service;
pub mod store;
pub mod tips;

pub use error::{ErrorKind, LedgerError, Result};
pub use relay::{RelayReceipt, RelayRejection, RelayRequest, RelayStage};
pub use service::{ServiceSettings, TipService};

// Postgres store: each trait call is one database transaction

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::info;
use uuid::Uuid;

use super::Store;
use crate::error::{LedgerError, Result};
use crate::models::{
    Account, Address, Amount, Authorization, Balance, Movement, RelayOutcome, RequestClaim,
    RequestKey, TipRecord, TokenId,
};

const ACCOUNT_COLUMNS: &str = "owner, handle, is_creator, is_tipper, registered_at, active, \
     tips_sent, tips_received";

const TIP_COLUMNS: &str = "id, sender, sender_handle, recipient, recipient_handle, token, \
     gross_amount, fee_amount, net_amount, message, operator, request_id, created_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and run migrations
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        info!("Connecting to database");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("Database initialized successfully");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// ROW CONVERSION
// ============================================================================

fn to_db(amount: Amount) -> Result<i64> {
    i64::try_from(amount).map_err(|_| LedgerError::Overflow)
}

fn from_db(value: i64) -> Result<Amount> {
    u64::try_from(value)
        .map_err(|_| LedgerError::Storage(format!("negative amount {} in storage", value)))
}

fn account_from_row(row: &PgRow) -> Result<Account> {
    Ok(Account {
        owner: Address::parse(row.try_get("owner")?)?,
        handle: row.try_get("handle")?,
        is_creator: row.try_get("is_creator")?,
        is_tipper: row.try_get("is_tipper")?,
        registered_at: row.try_get("registered_at")?,
        active: row.try_get("active")?,
        tips_sent: from_db(row.try_get("tips_sent")?)?,
        tips_received: from_db(row.try_get("tips_received")?)?,
    })
}

fn balance_from_row(row: &PgRow) -> Result<Balance> {
    Ok(Balance {
        owner: Address::parse(row.try_get("owner")?)?,
        token: TokenId::parse(row.try_get("token")?)?,
        amount: from_db(row.try_get("amount")?)?,
        total_sent: from_db(row.try_get("total_sent")?)?,
        total_received: from_db(row.try_get("total_received")?)?,
    })
}

fn authorization_from_row(row: &PgRow) -> Result<Authorization> {
    Ok(Authorization {
        owner: Address::parse(row.try_get("owner")?)?,
        operator: Address::parse(row.try_get("operator")?)?,
        authorized: row.try_get("authorized")?,
        daily_limit: from_db(row.try_get("daily_limit")?)?,
        daily_spent: from_db(row.try_get("daily_spent")?)?,
        spent_day: row.try_get("spent_day")?,
    })
}

fn tip_from_row(row: &PgRow) -> Result<TipRecord> {
    let id: String = row.try_get("id")?;
    let operator: Option<String> = row.try_get("operator")?;

    Ok(TipRecord {
        id: Uuid::parse_str(&id).map_err(|e| LedgerError::Storage(e.to_string()))?,
        sender: Address::parse(row.try_get("sender")?)?,
        sender_handle: row.try_get("sender_handle")?,
        recipient: Address::parse(row.try_get("recipient")?)?,
        recipient_handle: row.try_get("recipient_handle")?,
        token: TokenId::parse(row.try_get("token")?)?,
        gross_amount: from_db(row.try_get("gross_amount")?)?,
        fee_amount: from_db(row.try_get("fee_amount")?)?,
        net_amount: from_db(row.try_get("net_amount")?)?,
        message: row.try_get("message")?,
        operator: operator.as_deref().map(Address::parse).transpose()?,
        request_id: row.try_get("request_id")?,
        created_at: row.try_get("created_at")?,
    })
}

// ============================================================================
// TRANSACTION HELPERS
// ============================================================================

/// Lock every touched balance row in a fixed order, then apply the batch
async fn apply_in_tx(tx: &mut Transaction<'_, Postgres>, movements: &[Movement]) -> Result<()> {
    let mut keys: Vec<(&str, &str)> = movements
        .iter()
        .map(|m| (m.owner().as_str(), m.token().as_str()))
        .collect();
    keys.sort_unstable();
    keys.dedup();

    for (owner, token) in keys {
        sqlx::query("SELECT 1 FROM balances WHERE owner = $1 AND token = $2 FOR UPDATE")
            .bind(owner)
            .bind(token)
            .fetch_optional(&mut **tx)
            .await?;
    }

    for movement in movements {
        match movement {
            Movement::Credit {
                owner,
                token,
                amount,
            } => {
                sqlx::query(
                    "INSERT INTO balances (owner, token, amount) VALUES ($1, $2, $3)
                     ON CONFLICT (owner, token) DO UPDATE SET amount = balances.amount + EXCLUDED.amount",
                )
                .bind(owner.as_str())
                .bind(token.as_str())
                .bind(to_db(*amount)?)
                .execute(&mut **tx)
                .await?;
            }
            Movement::Debit {
                owner,
                token,
                amount,
            } => {
                let result = sqlx::query(
                    "UPDATE balances SET amount = amount - $3
                     WHERE owner = $1 AND token = $2 AND amount >= $3",
                )
                .bind(owner.as_str())
                .bind(token.as_str())
                .bind(to_db(*amount)?)
                .execute(&mut **tx)
                .await?;

                if result.rows_affected() == 0 {
                    return Err(LedgerError::InsufficientBalance);
                }
            }
        }
    }

    Ok(())
}

fn is_constraint(err: &sqlx::Error, name: &str) -> bool {
    match err {
        sqlx::Error::Database(db) => db.constraint() == Some(name),
        _ => false,
    }
}

impl Store for PgStore {
    async fn account(&self, owner: &Address) -> Result<Option<Account>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM accounts WHERE owner = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(owner.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn account_by_handle(&self, handle_key: &str) -> Result<Option<Account>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM accounts WHERE handle_key = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(handle_key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn insert_account(&self, account: &Account) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO accounts (owner, handle, handle_key, is_creator, is_tipper,
                                   registered_at, active, tips_sent, tips_received)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(account.owner.as_str())
        .bind(&account.handle)
        .bind(account.handle_key())
        .bind(account.is_creator)
        .bind(account.is_tipper)
        .bind(account.registered_at)
        .bind(account.active)
        .bind(to_db(account.tips_sent)?)
        .bind(to_db(account.tips_received)?)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint(&e, "accounts_pkey") => Err(LedgerError::AlreadyRegistered),
            Err(e) if is_constraint(&e, "accounts_handle_key_unique") => {
                Err(LedgerError::HandleTaken)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_account<F>(&self, owner: &Address, f: F) -> Result<Account>
    where
        F: FnOnce(&mut Account) -> Result<()> + Send,
    {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM accounts WHERE owner = $1 FOR UPDATE",
            ACCOUNT_COLUMNS
        ))
        .bind(owner.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(LedgerError::NotRegistered)?;

        let mut account = account_from_row(&row)?;
        f(&mut account)?;

        sqlx::query(
            "UPDATE accounts SET is_creator = $2, is_tipper = $3, active = $4,
                                 tips_sent = $5, tips_received = $6
             WHERE owner = $1",
        )
        .bind(owner.as_str())
        .bind(account.is_creator)
        .bind(account.is_tipper)
        .bind(account.active)
        .bind(to_db(account.tips_sent)?)
        .bind(to_db(account.tips_received)?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(account)
    }

    async fn is_supported_token(&self, token: &TokenId) -> Result<bool> {
        let found = sqlx::query("SELECT 1 FROM supported_tokens WHERE token = $1")
            .bind(token.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn add_supported_token(&self, token: &TokenId) -> Result<bool> {
        let result =
            sqlx::query("INSERT INTO supported_tokens (token) VALUES ($1) ON CONFLICT DO NOTHING")
                .bind(token.as_str())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn supported_tokens(&self) -> Result<Vec<TokenId>> {
        let rows = sqlx::query_scalar::<_, String>("SELECT token FROM supported_tokens ORDER BY token")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|t| TokenId::parse(t)).collect()
    }

    async fn balance(&self, owner: &Address, token: &TokenId) -> Result<Balance> {
        let row = sqlx::query(
            "SELECT owner, token, amount, total_sent, total_received
             FROM balances WHERE owner = $1 AND token = $2",
        )
        .bind(owner.as_str())
        .bind(token.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => balance_from_row(&row),
            None => Ok(Balance::zero(owner.clone(), token.clone())),
        }
    }

    async fn balances(&self, owner: &Address) -> Result<Vec<Balance>> {
        let rows = sqlx::query(
            "SELECT owner, token, amount, total_sent, total_received
             FROM balances WHERE owner = $1 ORDER BY token",
        )
        .bind(owner.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(balance_from_row).collect()
    }

    async fn token_supply(&self, token: &TokenId) -> Result<u128> {
        let total = sqlx::query_scalar::<_, String>(
            "SELECT COALESCE(SUM(amount), 0)::TEXT FROM balances WHERE token = $1",
        )
        .bind(token.as_str())
        .fetch_one(&self.pool)
        .await?;

        total
            .parse::<u128>()
            .map_err(|e| LedgerError::Storage(format!("token supply {}: {}", total, e)))
    }

    async fn apply_movements(&self, movements: &[Movement]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        apply_in_tx(&mut tx, movements).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn commit_tip(&self, movements: &[Movement], record: &TipRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        apply_in_tx(&mut tx, movements).await?;

        sqlx::query(
            "UPDATE balances SET total_sent = total_sent + $3 WHERE owner = $1 AND token = $2",
        )
        .bind(record.sender.as_str())
        .bind(record.token.as_str())
        .bind(to_db(record.gross_amount)?)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE balances SET total_received = total_received + $3
             WHERE owner = $1 AND token = $2",
        )
        .bind(record.recipient.as_str())
        .bind(record.token.as_str())
        .bind(to_db(record.net_amount)?)
        .execute(&mut *tx)
        .await?;

        // Account rows are locked in owner order, like balance rows
        let mut owners = [record.sender.as_str(), record.recipient.as_str()];
        owners.sort_unstable();
        for owner in owners {
            sqlx::query("SELECT 1 FROM accounts WHERE owner = $1 FOR UPDATE")
                .bind(owner)
                .fetch_optional(&mut *tx)
                .await?;
        }

        let sender = sqlx::query("UPDATE accounts SET tips_sent = tips_sent + 1 WHERE owner = $1")
            .bind(record.sender.as_str())
            .execute(&mut *tx)
            .await?;
        if sender.rows_affected() == 0 {
            return Err(LedgerError::NotRegistered);
        }

        let recipient =
            sqlx::query("UPDATE accounts SET tips_received = tips_received + 1 WHERE owner = $1")
                .bind(record.recipient.as_str())
                .execute(&mut *tx)
                .await?;
        if recipient.rows_affected() == 0 {
            return Err(LedgerError::RecipientNotFound);
        }

        sqlx::query(&format!(
            "INSERT INTO tip_records ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            TIP_COLUMNS
        ))
        .bind(record.id.to_string())
        .bind(record.sender.as_str())
        .bind(&record.sender_handle)
        .bind(record.recipient.as_str())
        .bind(&record.recipient_handle)
        .bind(record.token.as_str())
        .bind(to_db(record.gross_amount)?)
        .bind(to_db(record.fee_amount)?)
        .bind(to_db(record.net_amount)?)
        .bind(&record.message)
        .bind(record.operator.as_ref().map(|o| o.as_str()))
        .bind(record.request_id.as_deref())
        .bind(record.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn tip(&self, id: &Uuid) -> Result<Option<TipRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM tip_records WHERE id = $1", TIP_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(tip_from_row).transpose()
    }

    async fn tip_for_request(
        &self,
        key: &RequestKey,
        since: DateTime<Utc>,
    ) -> Result<Option<TipRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM tip_records
             WHERE operator = $1 AND request_id = $2 AND created_at >= $3
             ORDER BY seq DESC
             LIMIT 1",
            TIP_COLUMNS
        ))
        .bind(key.operator.as_str())
        .bind(&key.request_id)
        .bind(since)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(tip_from_row).transpose()
    }

    async fn tips_for(&self, owner: &Address, limit: usize, offset: usize) -> Result<Vec<TipRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tip_records
             WHERE sender = $1 OR recipient = $1
             ORDER BY seq DESC
             LIMIT $2 OFFSET $3",
            TIP_COLUMNS
        ))
        .bind(owner.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(tip_from_row).collect()
    }

    async fn authorization(
        &self,
        owner: &Address,
        operator: &Address,
    ) -> Result<Option<Authorization>> {
        let row = sqlx::query(
            "SELECT owner, operator, authorized, daily_limit, daily_spent, spent_day
             FROM authorizations WHERE owner = $1 AND operator = $2",
        )
        .bind(owner.as_str())
        .bind(operator.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(authorization_from_row).transpose()
    }

    async fn update_authorization<F, T>(
        &self,
        owner: &Address,
        operator: &Address,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(Option<Authorization>) -> Result<(Authorization, T)> + Send,
        T: Send,
    {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT owner, operator, authorized, daily_limit, daily_spent, spent_day
             FROM authorizations WHERE owner = $1 AND operator = $2 FOR UPDATE",
        )
        .bind(owner.as_str())
        .bind(operator.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let current = row.as_ref().map(authorization_from_row).transpose()?;
        let existed = current.is_some();
        let (updated, output) = f(current)?;

        if existed {
            sqlx::query(
                "UPDATE authorizations
                 SET authorized = $3, daily_limit = $4, daily_spent = $5, spent_day = $6
                 WHERE owner = $1 AND operator = $2",
            )
            .bind(owner.as_str())
            .bind(operator.as_str())
            .bind(updated.authorized)
            .bind(to_db(updated.daily_limit)?)
            .bind(to_db(updated.daily_spent)?)
            .bind(updated.spent_day)
            .execute(&mut *tx)
            .await?;
        } else {
            let inserted = sqlx::query(
                "INSERT INTO authorizations
                     (owner, operator, authorized, daily_limit, daily_spent, spent_day)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (owner, operator) DO NOTHING",
            )
            .bind(owner.as_str())
            .bind(operator.as_str())
            .bind(updated.authorized)
            .bind(to_db(updated.daily_limit)?)
            .bind(to_db(updated.daily_spent)?)
            .bind(updated.spent_day)
            .execute(&mut *tx)
            .await?;

            // A concurrent first write won the race; the caller retries
            if inserted.rows_affected() == 0 {
                return Err(LedgerError::Storage(
                    "concurrent authorization update".to_string(),
                ));
            }
        }

        tx.commit().await?;
        Ok(output)
    }

    async fn claim_request(
        &self,
        key: &RequestKey,
        now: DateTime<Utc>,
        expire_before: DateTime<Utc>,
        lease_before: DateTime<Utc>,
    ) -> Result<RequestClaim> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM relay_requests WHERE claimed_at < $1")
            .bind(expire_before)
            .execute(&mut *tx)
            .await?;

        let inserted = sqlx::query(
            "INSERT INTO relay_requests (operator, request_id, claimed_at) VALUES ($1, $2, $3)
             ON CONFLICT (operator, request_id) DO NOTHING",
        )
        .bind(key.operator.as_str())
        .bind(&key.request_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let claim = if inserted.rows_affected() == 1 {
            RequestClaim::Fresh
        } else {
            let row = sqlx::query(
                "SELECT claimed_at, outcome FROM relay_requests
                 WHERE operator = $1 AND request_id = $2 FOR UPDATE",
            )
            .bind(key.operator.as_str())
            .bind(&key.request_id)
            .fetch_one(&mut *tx)
            .await?;

            let claimed_at: DateTime<Utc> = row.try_get("claimed_at")?;
            let outcome: Option<String> = row.try_get("outcome")?;

            match outcome {
                Some(encoded) => RequestClaim::Done(serde_json::from_str(&encoded)?),
                None if claimed_at < lease_before => {
                    sqlx::query(
                        "UPDATE relay_requests SET claimed_at = $3
                         WHERE operator = $1 AND request_id = $2",
                    )
                    .bind(key.operator.as_str())
                    .bind(&key.request_id)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                    RequestClaim::Abandoned
                }
                None => RequestClaim::Pending,
            }
        };

        tx.commit().await?;
        Ok(claim)
    }

    async fn complete_request(&self, key: &RequestKey, outcome: &RelayOutcome) -> Result<()> {
        let encoded = serde_json::to_string(outcome)?;
        sqlx::query(
            "UPDATE relay_requests SET outcome = $3 WHERE operator = $1 AND request_id = $2",
        )
        .bind(key.operator.as_str())
        .bind(&key.request_id)
        .bind(encoded)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_request(&self, key: &RequestKey) -> Result<()> {
        sqlx::query("DELETE FROM relay_requests WHERE operator = $1 AND request_id = $2")
            .bind(key.operator.as_str())
            .bind(&key.request_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

//! PostgreSQL storage backend.
//!
//! Expects the tables in `sql/schema.sql` to exist. Every call is a single
//! statement on the shared pool, so each balance write and each status change
//! is individually atomic.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, instrument};

use tally_common::{
    AccountId, LedgerError, NewTransaction, Result, TransactionId, TransactionKind,
    TransactionRecord, TransactionStatus,
};

use crate::balance::{AccountBalance, BalanceStore};
use crate::journal::TransactionLog;

/// Reference DDL for the tables this backend uses.
pub const SCHEMA: &str = include_str!("../../sql/schema.sql");

const RECORD_COLUMNS: &str =
    "id, from_account, to_account, amount, kind, status, created_at, status_changed_at";

/// Open a connection pool.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(storage_error)
}

fn storage_error(err: sqlx::Error) -> LedgerError {
    LedgerError::StorageFailure(err.to_string())
}

/// Balance store backed by the `balances` table.
#[derive(Debug, Clone)]
pub struct PgBalanceStore {
    pool: Arc<PgPool>,
}

impl PgBalanceStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn balance_from_row(row: &PgRow) -> Result<AccountBalance> {
    let account: i64 = row.try_get("account_id").map_err(storage_error)?;
    let amount: Decimal = row.try_get("amount").map_err(storage_error)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(storage_error)?;
    Ok(AccountBalance::new(AccountId::new(account), amount, updated_at))
}

#[async_trait]
impl BalanceStore for PgBalanceStore {
    #[instrument(skip(self), fields(account = %account))]
    async fn read(&self, account: AccountId) -> Result<Option<AccountBalance>> {
        let row = sqlx::query(
            "SELECT account_id, amount, updated_at FROM balances WHERE account_id = $1",
        )
        .bind(account.value())
        .fetch_optional(&*self.pool)
        .await
        .map_err(storage_error)?;

        row.as_ref().map(balance_from_row).transpose()
    }

    #[instrument(skip(self), fields(account = %account))]
    async fn write(&self, account: AccountId, amount: Decimal) -> Result<AccountBalance> {
        let row = sqlx::query(
            r#"
            INSERT INTO balances (account_id, amount, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (account_id)
            DO UPDATE SET amount = EXCLUDED.amount, updated_at = EXCLUDED.updated_at
            RETURNING account_id, amount, updated_at
            "#,
        )
        .bind(account.value())
        .bind(amount)
        .fetch_one(&*self.pool)
        .await
        .map_err(storage_error)?;

        debug!(account = %account, amount = %amount, "Balance written");
        balance_from_row(&row)
    }
}

/// Transaction log backed by the `transactions` table.
#[derive(Debug, Clone)]
pub struct PgTransactionLog {
    pool: Arc<PgPool>,
}

impl PgTransactionLog {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn fetch(&self, id: TransactionId) -> Result<Option<TransactionRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transactions WHERE id = $1",
            RECORD_COLUMNS
        ))
        .bind(id.value())
        .fetch_optional(&*self.pool)
        .await
        .map_err(storage_error)?;

        row.as_ref().map(record_from_row).transpose()
    }
}

fn record_from_row(row: &PgRow) -> Result<TransactionRecord> {
    let decode = |e: String| LedgerError::StorageFailure(format!("malformed record: {}", e));

    let id: i64 = row.try_get("id").map_err(storage_error)?;
    let from_account: i64 = row.try_get("from_account").map_err(storage_error)?;
    let to_account: Option<i64> = row.try_get("to_account").map_err(storage_error)?;
    let kind: String = row.try_get("kind").map_err(storage_error)?;
    let status: String = row.try_get("status").map_err(storage_error)?;

    Ok(TransactionRecord {
        id: TransactionId::new(id),
        from_account: AccountId::new(from_account),
        to_account: to_account.map(AccountId::new),
        amount: row.try_get("amount").map_err(storage_error)?,
        kind: kind
            .parse::<TransactionKind>()
            .map_err(|e| decode(e.to_string()))?,
        status: status
            .parse::<TransactionStatus>()
            .map_err(|e| decode(e.to_string()))?,
        created_at: row.try_get("created_at").map_err(storage_error)?,
        status_changed_at: row.try_get("status_changed_at").map_err(storage_error)?,
    })
}

#[async_trait]
impl TransactionLog for PgTransactionLog {
    #[instrument(skip(self, intent), fields(kind = %intent.kind, from = %intent.from_account))]
    async fn append(&self, intent: NewTransaction) -> Result<TransactionRecord> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO transactions
                (from_account, to_account, amount, kind, status, created_at, status_changed_at)
            VALUES ($1, $2, $3, $4, 'pending', now(), now())
            RETURNING {}
            "#,
            RECORD_COLUMNS
        ))
        .bind(intent.from_account.value())
        .bind(intent.to_account.map(|a| a.value()))
        .bind(intent.amount)
        .bind(intent.kind.as_str())
        .fetch_one(&*self.pool)
        .await
        .map_err(storage_error)?;

        record_from_row(&row)
    }

    #[instrument(skip(self), fields(id = %id, status = %status))]
    async fn update_status(
        &self,
        id: TransactionId,
        status: TransactionStatus,
    ) -> Result<TransactionRecord> {
        // Only Pending rows move; terminal rows are left untouched.
        let row = sqlx::query(&format!(
            r#"
            UPDATE transactions
            SET status = $2, status_changed_at = now()
            WHERE id = $1 AND status = 'pending' AND $2 <> 'pending'
            RETURNING {}
            "#,
            RECORD_COLUMNS
        ))
        .bind(id.value())
        .bind(status.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(storage_error)?;

        match row {
            Some(row) => record_from_row(&row),
            None => match self.fetch(id).await? {
                Some(current) => Err(LedgerError::InvalidTransition {
                    from: current.status,
                    to: status,
                }),
                None => Err(LedgerError::TransactionNotFound(id)),
            },
        }
    }

    async fn get(&self, id: TransactionId) -> Result<Option<TransactionRecord>> {
        self.fetch(id).await
    }

    #[instrument(skip(self), fields(account = %account))]
    async fn query_by_account(&self, account: AccountId) -> Result<Vec<TransactionRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM transactions
            WHERE from_account = $1 OR to_account = $1
            ORDER BY id ASC
            "#,
            RECORD_COLUMNS
        ))
        .bind(account.value())
        .fetch_all(&*self.pool)
        .await
        .map_err(storage_error)?;

        rows.iter().map(record_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These need a database with sql/schema.sql applied:
    //   DATABASE_URL=postgres://... cargo test -- --ignored

    async fn pool() -> PgPool {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        connect(&url, 4).await.expect("database reachable")
    }

    #[test]
    fn test_schema_declares_tables() {
        assert!(SCHEMA.contains("CREATE TABLE IF NOT EXISTS balances"));
        assert!(SCHEMA.contains("CREATE TABLE IF NOT EXISTS transactions"));
    }

    #[tokio::test]
    #[ignore]
    async fn test_pg_balance_upsert() {
        let store = PgBalanceStore::new(pool().await);
        let account = AccountId::new(9_000_001);

        store.write(account, Decimal::from(100)).await.unwrap();
        let written = store.write(account, Decimal::new(4250, 2)).await.unwrap();
        assert_eq!(written.amount, Decimal::new(4250, 2));

        let read = store.read(account).await.unwrap().unwrap();
        assert_eq!(read.amount, Decimal::new(4250, 2));
    }

    #[tokio::test]
    #[ignore]
    async fn test_pg_log_lifecycle() {
        let log = PgTransactionLog::new(pool().await);
        let from = AccountId::new(9_000_002);
        let to = AccountId::new(9_000_003);

        let record = log
            .append(NewTransaction::transfer(from, to, Decimal::from(5)).unwrap())
            .await
            .unwrap();
        assert_eq!(record.status, TransactionStatus::Pending);
        assert_eq!(record.to_account, Some(to));

        let done = log
            .update_status(record.id, TransactionStatus::Completed)
            .await
            .unwrap();
        assert_eq!(done.status, TransactionStatus::Completed);

        let again = log.update_status(record.id, TransactionStatus::Failed).await;
        assert_eq!(
            again,
            Err(LedgerError::InvalidTransition {
                from: TransactionStatus::Completed,
                to: TransactionStatus::Failed,
            })
        );

        let history = log.query_by_account(to).await.unwrap();
        assert!(history.iter().any(|r| r.id == record.id));
        assert!(history.windows(2).all(|w| w[0].id < w[1].id));
    }
}

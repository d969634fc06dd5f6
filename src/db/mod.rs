use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::prelude::FromRow;
use sqlx::{PgPool, Postgres};

use crate::config::DBConfig;
use crate::currency::Currency;
use crate::errors::{CustodyError, Result};
use crate::tx::selector::SelectionResult;

mod memory;
mod models;

pub use memory::MemoryStore;
pub use models::*;

static MIGRATOR: Migrator = sqlx::migrate!("src/db/migrations");

pub async fn open_postgres_db(config: &DBConfig) -> Result<Repo> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.dsn)
        .await?;
    let repo = Repo { pool };
    if config.automigrate {
        repo.migrate().await?;
    }
    Ok(repo)
}

pub async fn open_store(config: &DBConfig) -> Result<UtxoStore> {
    match config.mode.as_str() {
        "memory" => {
            warn!("using in-memory utxo store, state is lost on exit");
            Ok(UtxoStore::Memory(MemoryStore::default()))
        }
        _ => Ok(UtxoStore::Postgres(open_postgres_db(config).await?)),
    }
}

fn dedup_ids(ids: &[i64]) -> Vec<i64> {
    let mut ids = ids.to_vec();
    ids.sort_unstable();
    ids.dedup();
    ids
}

#[derive(FromRow)]
struct Total {
    total: i64,
}

#[derive(FromRow)]
struct Id {
    id: i64,
}

/// The ledger of tracked outputs. Every state transition is a single
/// conditional update over an id set: it applies to all ids or to none.
#[derive(Clone)]
pub enum UtxoStore {
    Postgres(Repo),
    Memory(MemoryStore),
}

impl UtxoStore {
    pub async fn upsert_utxo(&self, utxo: &NewUtxo, now: i64) -> Result<Utxo> {
        match self {
            Self::Postgres(repo) => repo.upsert_utxo(utxo, now).await,
            Self::Memory(mem) => Ok(mem.upsert_utxo(utxo, now)),
        }
    }

    pub async fn find_utxo(&self, key: &UtxoKey) -> Result<Option<Utxo>> {
        match self {
            Self::Postgres(repo) => repo.find_utxo(key).await,
            Self::Memory(mem) => Ok(mem.find_utxo(key)),
        }
    }

    pub async fn refresh_confirmations(
        &self,
        key: &UtxoKey,
        currency: Currency,
        confirmations: i64,
        block_height: Option<i64>,
        now: i64,
    ) -> Result<bool> {
        match self {
            Self::Postgres(repo) => {
                repo.refresh_confirmations(key, currency, confirmations, block_height, now)
                    .await
            }
            Self::Memory(mem) => {
                Ok(mem.refresh_confirmations(key, currency, confirmations, block_height, now))
            }
        }
    }

    pub async fn available_utxos(&self, owner: &str, currency: Currency) -> Result<Vec<Utxo>> {
        match self {
            Self::Postgres(repo) => repo.available_utxos(owner, currency).await,
            Self::Memory(mem) => Ok(mem.available_utxos(owner, currency)),
        }
    }

    pub async fn available_balance(&self, owner: &str, currency: Currency) -> Result<u64> {
        match self {
            Self::Postgres(repo) => repo.available_balance(owner, currency).await,
            Self::Memory(mem) => Ok(mem.available_balance(owner, currency)),
        }
    }

    pub async fn lock_utxos(
        &self,
        ids: &[i64],
        holder: &str,
        expires_at: i64,
        now: i64,
    ) -> Result<()> {
        match self {
            Self::Postgres(repo) => repo.lock_utxos(ids, holder, expires_at, now).await,
            Self::Memory(mem) => mem.lock_utxos(ids, holder, expires_at, now),
        }
    }

    pub async fn unlock_utxos(&self, ids: &[i64], now: i64) -> Result<()> {
        match self {
            Self::Postgres(repo) => repo.unlock_utxos(ids, now).await,
            Self::Memory(mem) => mem.unlock_utxos(ids, now),
        }
    }

    pub async fn mark_spent(&self, ids: &[i64], spent_in_tx_hash: &str, now: i64) -> Result<()> {
        match self {
            Self::Postgres(repo) => repo.mark_spent(ids, spent_in_tx_hash, now).await,
            Self::Memory(mem) => mem.mark_spent(ids, spent_in_tx_hash, now),
        }
    }

    pub async fn locked_by(&self, holder: &str) -> Result<Vec<i64>> {
        match self {
            Self::Postgres(repo) => repo.locked_by(holder).await,
            Self::Memory(mem) => Ok(mem.locked_by(holder)),
        }
    }

    pub async fn reap_expired_locks(&self, now: i64) -> Result<u64> {
        match self {
            Self::Postgres(repo) => repo.reap_expired_locks(now).await,
            Self::Memory(mem) => Ok(mem.reap_expired_locks(now)),
        }
    }

    /// Reads the available outputs, runs `select` over them and locks the
    /// chosen ones as one unit. Nothing is locked if `select` fails.
    pub async fn select_and_lock<F>(
        &self,
        owner: &str,
        currency: Currency,
        holder: &str,
        expires_at: i64,
        now: i64,
        select: F,
    ) -> Result<SelectionResult>
    where
        F: FnOnce(&[Utxo]) -> Result<SelectionResult>,
    {
        match self {
            Self::Postgres(repo) => {
                repo.select_and_lock(owner, currency, holder, expires_at, now, select)
                    .await
            }
            Self::Memory(mem) => mem.select_and_lock(owner, currency, holder, expires_at, now, select),
        }
    }

    pub async fn upsert_deposit_address(
        &self,
        owner: &str,
        currency: Currency,
        address: &str,
        derivation_path: &str,
        now: i64,
    ) -> Result<DepositAddress> {
        match self {
            Self::Postgres(repo) => {
                repo.upsert_deposit_address(owner, currency, address, derivation_path, now)
                    .await
            }
            Self::Memory(mem) => {
                Ok(mem.upsert_deposit_address(owner, currency, address, derivation_path, now))
            }
        }
    }

    pub async fn deposit_addresses(&self, currency: Currency) -> Result<Vec<DepositAddress>> {
        match self {
            Self::Postgres(repo) => repo.deposit_addresses(currency).await,
            Self::Memory(mem) => Ok(mem.deposit_addresses(currency)),
        }
    }

    pub async fn update_deposit_balance(
        &self,
        owner: &str,
        currency: Currency,
        balance: i64,
        now: i64,
    ) -> Result<()> {
        match self {
            Self::Postgres(repo) => {
                repo.update_deposit_balance(owner, currency, balance, now)
                    .await
            }
            Self::Memory(mem) => {
                mem.update_deposit_balance(owner, currency, balance, now);
                Ok(())
            }
        }
    }
}

#[derive(Clone)]
pub struct Repo {
    pub pool: PgPool,
}

impl Repo {
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(sqlx::Error::from)?;
        Ok(())
    }

    pub async fn reset_schema(&self) -> Result<()> {
        let _ = sqlx::query("DROP SCHEMA public CASCADE")
            .execute(&self.pool)
            .await?;

        let _ = sqlx::query("CREATE SCHEMA public")
            .execute(&self.pool)
            .await?;
        self.migrate().await?;
        Ok(())
    }

    pub async fn upsert_utxo(&self, utxo: &NewUtxo, now: i64) -> Result<Utxo> {
        // On conflict only chain-derived fields move; owner, address and
        // lock/spend state are left as they are.
        let result = sqlx::query_as::<_, Utxo>(
            "INSERT INTO utxos (
                    tx_hash,
                    vout,
                    currency,
                    owner_id,
                    address,
                    derivation_path,
                    amount,
                    status,
                    block_height,
                    confirmations,
                    script_pub_key,
                    created_at,
                    updated_at)
                  VALUES($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)
             ON CONFLICT (tx_hash, vout, currency) DO UPDATE SET
                    confirmations = EXCLUDED.confirmations,
                    block_height = EXCLUDED.block_height,
                    status = CASE
                        WHEN utxos.status IN ('unconfirmed', 'confirmed') THEN EXCLUDED.status
                        ELSE utxos.status
                    END,
                    updated_at = EXCLUDED.updated_at
             RETURNING *",
        )
        .bind(&utxo.tx_hash)
        .bind(utxo.vout)
        .bind(utxo.currency.as_str())
        .bind(&utxo.owner_id)
        .bind(&utxo.address)
        .bind(&utxo.derivation_path)
        .bind(utxo.amount)
        .bind(utxo.status())
        .bind(utxo.block_height)
        .bind(utxo.confirmations)
        .bind(&utxo.script_pub_key)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(result)
    }

    pub async fn find_utxo(&self, key: &UtxoKey) -> Result<Option<Utxo>> {
        let result = sqlx::query_as::<_, Utxo>(
            "SELECT * FROM utxos WHERE tx_hash = $1 AND vout = $2 AND currency = $3",
        )
        .bind(&key.tx_hash)
        .bind(key.vout)
        .bind(&key.currency)
        .fetch_optional(&self.pool)
        .await?;

        Ok(result)
    }

    pub async fn refresh_confirmations(
        &self,
        key: &UtxoKey,
        currency: Currency,
        confirmations: i64,
        block_height: Option<i64>,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE utxos SET
                confirmations = $1,
                block_height = COALESCE($2, block_height),
                status = CASE
                    WHEN status IN ('unconfirmed', 'confirmed') THEN $3
                    ELSE status
                END,
                updated_at = $4
             WHERE tx_hash = $5 AND vout = $6 AND currency = $7",
        )
        .bind(confirmations)
        .bind(block_height)
        .bind(currency.status_for(confirmations))
        .bind(now)
        .bind(&key.tx_hash)
        .bind(key.vout)
        .bind(&key.currency)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn available_utxos(&self, owner: &str, currency: Currency) -> Result<Vec<Utxo>> {
        let result = sqlx::query_as::<_, Utxo>(
            "SELECT * FROM utxos
             WHERE owner_id = $1 AND currency = $2 AND status = 'confirmed'
             ORDER BY amount DESC, created_at ASC, id ASC",
        )
        .bind(owner)
        .bind(currency.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(result)
    }

    pub async fn available_balance(&self, owner: &str, currency: Currency) -> Result<u64> {
        let result = sqlx::query_as::<_, Total>(
            "SELECT COALESCE(SUM(amount), 0)::BIGINT AS total FROM utxos
             WHERE owner_id = $1 AND currency = $2 AND status = 'confirmed'",
        )
        .bind(owner)
        .bind(currency.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(result.total.max(0) as u64)
    }

    async fn lock_rows(
        dbtx: &mut sqlx::Transaction<'_, Postgres>,
        ids: &[i64],
        holder: &str,
        expires_at: i64,
        now: i64,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE utxos SET status = 'locked', locked_until = $1, locked_by = $2, updated_at = $3
             WHERE id = ANY($4) AND status = 'confirmed'",
        )
        .bind(expires_at)
        .bind(holder)
        .bind(now)
        .bind(ids)
        .execute(&mut **dbtx)
        .await?;

        Ok(result.rows_affected())
    }

    /// Commits `dbtx` only when the update touched every id.
    async fn finish_all_or_nothing(
        dbtx: sqlx::Transaction<'_, Postgres>,
        expected: usize,
        affected: u64,
    ) -> Result<()> {
        if affected as usize != expected {
            dbtx.rollback().await?;
            return Err(CustodyError::LockConflict {
                expected,
                affected: affected as usize,
            });
        }
        dbtx.commit().await?;
        Ok(())
    }

    pub async fn lock_utxos(
        &self,
        ids: &[i64],
        holder: &str,
        expires_at: i64,
        now: i64,
    ) -> Result<()> {
        let ids = dedup_ids(ids);
        let mut dbtx = self.pool.begin().await?;
        let affected = Self::lock_rows(&mut dbtx, &ids, holder, expires_at, now).await?;
        Self::finish_all_or_nothing(dbtx, ids.len(), affected).await
    }

    pub async fn unlock_utxos(&self, ids: &[i64], now: i64) -> Result<()> {
        let ids = dedup_ids(ids);
        let mut dbtx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE utxos SET status = 'confirmed', locked_until = NULL, locked_by = NULL, updated_at = $1
             WHERE id = ANY($2) AND status = 'locked'",
        )
        .bind(now)
        .bind(&ids)
        .execute(&mut *dbtx)
        .await?;

        Self::finish_all_or_nothing(dbtx, ids.len(), result.rows_affected()).await
    }

    pub async fn mark_spent(&self, ids: &[i64], spent_in_tx_hash: &str, now: i64) -> Result<()> {
        let ids = dedup_ids(ids);
        let mut dbtx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE utxos SET status = 'spent', spent_in_tx_hash = $1, spent_at = $2,
                locked_until = NULL, updated_at = $2
             WHERE id = ANY($3) AND status = 'locked'",
        )
        .bind(spent_in_tx_hash)
        .bind(now)
        .bind(&ids)
        .execute(&mut *dbtx)
        .await?;

        Self::finish_all_or_nothing(dbtx, ids.len(), result.rows_affected()).await
    }

    pub async fn locked_by(&self, holder: &str) -> Result<Vec<i64>> {
        let result = sqlx::query_as::<_, Id>(
            "SELECT id FROM utxos WHERE locked_by = $1 AND status = 'locked' ORDER BY id ASC",
        )
        .bind(holder)
        .fetch_all(&self.pool)
        .await?;

        Ok(result.into_iter().map(|r| r.id).collect())
    }

    pub async fn reap_expired_locks(&self, now: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE utxos SET status = 'confirmed', locked_until = NULL, locked_by = NULL, updated_at = $1
             WHERE status = 'locked' AND locked_until < $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn select_and_lock<F>(
        &self,
        owner: &str,
        currency: Currency,
        holder: &str,
        expires_at: i64,
        now: i64,
        select: F,
    ) -> Result<SelectionResult>
    where
        F: FnOnce(&[Utxo]) -> Result<SelectionResult>,
    {
        let mut dbtx = self.pool.begin().await?;

        // Row locks are held until commit, a concurrent selection for the
        // same owner waits here and then sees the rows as 'locked'.
        let candidates = sqlx::query_as::<_, Utxo>(
            "SELECT * FROM utxos
             WHERE owner_id = $1 AND currency = $2 AND status = 'confirmed'
             ORDER BY amount DESC, created_at ASC, id ASC
             FOR UPDATE",
        )
        .bind(owner)
        .bind(currency.as_str())
        .fetch_all(&mut *dbtx)
        .await?;

        let selection = match select(&candidates) {
            Ok(selection) => selection,
            Err(err) => {
                dbtx.rollback().await?;
                return Err(err);
            }
        };

        let ids = selection.ids();
        let affected = Self::lock_rows(&mut dbtx, &ids, holder, expires_at, now).await?;
        Self::finish_all_or_nothing(dbtx, ids.len(), affected).await?;

        Ok(selection)
    }

    pub async fn upsert_deposit_address(
        &self,
        owner: &str,
        currency: Currency,
        address: &str,
        derivation_path: &str,
        now: i64,
    ) -> Result<DepositAddress> {
        let result = sqlx::query_as::<_, DepositAddress>(
            "INSERT INTO deposit_addresses
                (owner_id, currency, address, derivation_path, last_checked_balance, created_at, updated_at)
             VALUES ($1, $2, $3, $4, 0, $5, $5)
             ON CONFLICT (owner_id, currency) DO UPDATE SET
                address = EXCLUDED.address,
                derivation_path = EXCLUDED.derivation_path,
                updated_at = EXCLUDED.updated_at
             RETURNING *",
        )
        .bind(owner)
        .bind(currency.as_str())
        .bind(address)
        .bind(derivation_path)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(result)
    }

    pub async fn deposit_addresses(&self, currency: Currency) -> Result<Vec<DepositAddress>> {
        let result = sqlx::query_as::<_, DepositAddress>(
            "SELECT * FROM deposit_addresses WHERE currency = $1 ORDER BY owner_id ASC",
        )
        .bind(currency.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(result)
    }

    pub async fn update_deposit_balance(
        &self,
        owner: &str,
        currency: Currency,
        balance: i64,
        now: i64,
    ) -> Result<()> {
        let _ = sqlx::query(
            "UPDATE deposit_addresses SET last_checked_balance = $1, updated_at = $2
             WHERE owner_id = $3 AND currency = $4",
        )
        .bind(balance)
        .bind(now)
        .bind(owner)
        .bind(currency.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

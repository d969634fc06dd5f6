use chrono::{TimeDelta, Utc};
use serde::Serialize;
use ulid::Ulid;

use crate::{
    currency::Currency,
    db::UtxoStore,
    errors::Result,
    tx::selector::{select_inputs, SelectionResult},
};

pub const DEFAULT_LOCK_MINUTES: i64 = 30;

/// A selection that is locked under `holder` until `expires_at`.
#[derive(Debug, Clone, Serialize)]
pub struct Reservation {
    pub holder: String,
    pub expires_at: i64,
    pub selection: SelectionResult,
}

#[derive(Clone)]
pub struct LockManager {
    store: UtxoStore,
    lock_window: TimeDelta,
}

impl LockManager {
    pub fn new(store: UtxoStore, lock_minutes: i64) -> Self {
        let minutes = if lock_minutes > 0 {
            lock_minutes
        } else {
            DEFAULT_LOCK_MINUTES
        };
        Self {
            store,
            lock_window: TimeDelta::minutes(minutes),
        }
    }

    pub fn store(&self) -> &UtxoStore {
        &self.store
    }

    fn expiry(&self, now: i64) -> i64 {
        now + self.lock_window.num_seconds()
    }

    /// Selects inputs for `target` and locks them in one store operation,
    /// so two concurrent calls never receive the same output.
    pub async fn select_and_lock(
        &self,
        owner: &str,
        currency: Currency,
        target: u64,
        fee_rate: f64,
    ) -> Result<Reservation> {
        let holder = Ulid::new().to_string();
        let now = Utc::now().timestamp();
        let expires_at = self.expiry(now);

        let selection = self
            .store
            .select_and_lock(owner, currency, &holder, expires_at, now, |available| {
                select_inputs(available, target, fee_rate)
            })
            .await?;

        info!(
            "utxos locked: owner={} currency={} holder={} ids={:?} total_input={} fee={} change={}",
            owner,
            currency,
            holder,
            selection.ids(),
            selection.total_input,
            selection.fee,
            selection.change_amount
        );

        Ok(Reservation {
            holder,
            expires_at,
            selection,
        })
    }

    /// Locks an explicit id set; all ids must currently be available.
    pub async fn lock(&self, ids: &[i64], holder: &str) -> Result<i64> {
        let now = Utc::now().timestamp();
        let expires_at = self.expiry(now);
        self.store.lock_utxos(ids, holder, expires_at, now).await?;
        info!("utxos locked: holder={} ids={:?}", holder, ids);
        Ok(expires_at)
    }

    pub async fn release(&self, ids: &[i64]) -> Result<()> {
        self.store
            .unlock_utxos(ids, Utc::now().timestamp())
            .await?;
        info!("utxos unlocked: ids={:?}", ids);
        Ok(())
    }

    pub async fn release_holder(&self, holder: &str) -> Result<Vec<i64>> {
        let ids = self.store.locked_by(holder).await?;
        if !ids.is_empty() {
            self.release(&ids).await?;
        }
        Ok(ids)
    }

    pub async fn commit_spent(&self, ids: &[i64], spent_in_tx_hash: &str) -> Result<()> {
        self.store
            .mark_spent(ids, spent_in_tx_hash, Utc::now().timestamp())
            .await?;
        info!(
            "utxos marked as spent: ids={:?} tx_hash={}",
            ids, spent_in_tx_hash
        );
        Ok(())
    }

    pub async fn reap(&self) -> Result<u64> {
        self.reap_at(Utc::now().timestamp()).await
    }

    pub async fn reap_at(&self, now: i64) -> Result<u64> {
        let count = self.store.reap_expired_locks(now).await?;
        if count > 0 {
            info!("expired utxo locks released: count={}", count);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, NewUtxo, Utxo};
    use crate::errors::CustodyError;

    async fn seed(store: &UtxoStore, owner: &str, currency: Currency, amounts: &[i64]) {
        for (i, amount) in amounts.iter().enumerate() {
            let utxo = NewUtxo {
                tx_hash: format!("{:064x}", i + 1),
                vout: 0,
                currency,
                owner_id: owner.to_owned(),
                address: "addr".to_owned(),
                derivation_path: format!("m/0/{}", i),
                amount: *amount,
                block_height: Some(800_000),
                confirmations: 10,
                script_pub_key: String::new(),
            };
            store.upsert_utxo(&utxo, i as i64).await.unwrap();
        }
    }

    fn manager() -> LockManager {
        LockManager::new(UtxoStore::Memory(MemoryStore::default()), 30)
    }

    #[tokio::test]
    async fn consecutive_selections_do_not_overlap() {
        let locks = manager();
        seed(locks.store(), "u1", Currency::Btc, &[50_000, 30_000, 20_000, 10_000]).await;

        let first = locks.select_and_lock("u1", Currency::Btc, 40_000, 5.0).await.unwrap();
        let second = locks.select_and_lock("u1", Currency::Btc, 15_000, 5.0).await.unwrap();

        let a = first.selection.ids();
        let b = second.selection.ids();
        assert!(a.iter().all(|id| !b.contains(id)));
        assert_ne!(first.holder, second.holder);
        assert_eq!(locks.store().locked_by(&first.holder).await.unwrap(), a);
    }

    #[tokio::test]
    async fn failed_selection_locks_nothing() {
        let locks = manager();
        seed(locks.store(), "u1", Currency::Btc, &[5_000, 4_000]).await;

        let err = locks
            .select_and_lock("u1", Currency::Btc, 100_000, 5.0)
            .await
            .unwrap_err();
        assert!(matches!(err, CustodyError::InsufficientFunds { .. }));
        assert_eq!(
            locks.store().available_balance("u1", Currency::Btc).await.unwrap(),
            9_000
        );

        let err = locks
            .select_and_lock("u2", Currency::Btc, 1_000, 5.0)
            .await
            .unwrap_err();
        assert!(matches!(err, CustodyError::NoUtxosAvailable));
    }

    #[tokio::test]
    async fn currency_isolation() {
        let locks = manager();
        seed(locks.store(), "u1", Currency::Ltc, &[900_000]).await;
        let store = locks.store().clone();
        let btc = NewUtxo {
            tx_hash: format!("{:064x}", 99),
            vout: 1,
            currency: Currency::Btc,
            owner_id: "u1".to_owned(),
            address: "addr".to_owned(),
            derivation_path: "m/0/99".to_owned(),
            amount: 20_000,
            block_height: Some(800_000),
            confirmations: 10,
            script_pub_key: String::new(),
        };
        store.upsert_utxo(&btc, 100).await.unwrap();

        let r = locks.select_and_lock("u1", Currency::Btc, 10_000, 1.0).await.unwrap();
        assert!(r.selection.selected.iter().all(|u| u.currency == "BTC"));

        let err = locks
            .select_and_lock("u1", Currency::Btc, 10_000, 1.0)
            .await
            .unwrap_err();
        assert!(matches!(err, CustodyError::NoUtxosAvailable));
    }

    #[tokio::test]
    async fn release_and_spend() {
        let locks = manager();
        seed(locks.store(), "u1", Currency::Btc, &[50_000, 30_000]).await;

        let r = locks.select_and_lock("u1", Currency::Btc, 10_000, 1.0).await.unwrap();
        assert_eq!(locks.release_holder(&r.holder).await.unwrap(), r.selection.ids());
        assert_eq!(
            locks.store().available_balance("u1", Currency::Btc).await.unwrap(),
            80_000
        );

        let r = locks.select_and_lock("u1", Currency::Btc, 10_000, 1.0).await.unwrap();
        locks.commit_spent(&r.selection.ids(), "ab".repeat(32).as_str()).await.unwrap();
        assert!(locks.release(&r.selection.ids()).await.is_err());

        let available = locks.store().available_utxos("u1", Currency::Btc).await.unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].amount, 30_000);
    }

    #[tokio::test]
    async fn reaper_is_idempotent() {
        let locks = manager();
        seed(locks.store(), "u1", Currency::Btc, &[50_000]).await;

        let r = locks.select_and_lock("u1", Currency::Btc, 10_000, 1.0).await.unwrap();
        assert_eq!(locks.reap_at(r.expires_at).await.unwrap(), 0);

        let later = r.expires_at + 1;
        assert_eq!(locks.reap_at(later).await.unwrap(), 1);
        assert_eq!(locks.reap_at(later).await.unwrap(), 0);

        let rows = locks.store().available_utxos("u1", Currency::Btc).await.unwrap();
        assert_eq!(rows[0].status, Utxo::STATUS_CONFIRMED);
        assert!(locks.store().locked_by(&r.holder).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn explicit_lock_window() {
        let locks = LockManager::new(UtxoStore::Memory(MemoryStore::default()), 0);
        seed(locks.store(), "u1", Currency::Btc, &[50_000]).await;

        let ids: Vec<i64> = locks
            .store()
            .available_utxos("u1", Currency::Btc)
            .await
            .unwrap()
            .iter()
            .map(|u| u.id)
            .collect();
        let before = Utc::now().timestamp();
        let expires_at = locks.lock(&ids, "manual").await.unwrap();
        assert!(expires_at >= before + DEFAULT_LOCK_MINUTES * 60);
        assert!(matches!(
            locks.lock(&ids, "other").await,
            Err(CustodyError::LockConflict { .. })
        ));
    }
}

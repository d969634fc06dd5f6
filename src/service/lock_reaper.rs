use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::lock_manager::LockManager;

pub struct LockReaper {
    locks: LockManager,
    interval: Duration,
}

impl LockReaper {
    pub fn new(locks: LockManager, interval_secs: u64) -> Self {
        Self {
            locks,
            interval: Duration::from_secs(interval_secs.max(1)),
        }
    }

    pub fn start(self, cancel: CancellationToken) -> actix_rt::task::JoinHandle<()> {
        actix_rt::spawn(self.run(cancel))
    }

    async fn run(self, stop_signal: CancellationToken) {
        loop {
            if let Err(err) = self.locks.reap().await {
                error!("failed to release expired locks: error={}", err);
            }

            tokio::select! {
                _ = sleep(self.interval) => {
                    continue;
                }

                _ = stop_signal.cancelled() => {
                    info!("gracefully shutting down lock reaper");
                    break;
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::Currency;
    use crate::db::{MemoryStore, NewUtxo, UtxoStore};

    #[actix_rt::test]
    async fn first_pass_releases_expired() {
        let store = UtxoStore::Memory(MemoryStore::default());
        let utxo = NewUtxo {
            tx_hash: format!("{:064x}", 7),
            vout: 0,
            currency: Currency::Ltc,
            owner_id: "u1".to_owned(),
            address: "addr".to_owned(),
            derivation_path: "m/0/7".to_owned(),
            amount: 70_000,
            block_height: Some(2_500_000),
            confirmations: 12,
            script_pub_key: String::new(),
        };
        let row = store.upsert_utxo(&utxo, 1).await.unwrap();
        // expired long ago
        store.lock_utxos(&[row.id], "stale", 10, 2).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = LockReaper::new(LockManager::new(store.clone(), 30), 3600).start(cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(
            store.available_balance("u1", Currency::Ltc).await.unwrap(),
            70_000
        );
    }
}

use chrono::Utc;
use futures::{stream, StreamExt};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::monitor::AddressMonitor;
use crate::{
    config::MonitorConfig,
    currency::Currency,
    db::{DepositAddress, UtxoStore},
};

/// Periodically polls every registered deposit address.
pub struct DepositWatchdog {
    store: UtxoStore,
    monitor: AddressMonitor,
    cfg: MonitorConfig,
}

impl DepositWatchdog {
    pub fn new(store: UtxoStore, monitor: AddressMonitor, cfg: MonitorConfig) -> Self {
        Self {
            store,
            monitor,
            cfg,
        }
    }

    pub fn start(self, cancel: CancellationToken) -> actix_rt::task::JoinHandle<()> {
        actix_rt::spawn(self.run(cancel))
    }

    async fn run(self, stop_signal: CancellationToken) {
        let interval = Duration::from_secs(self.cfg.interval_secs.max(1));
        loop {
            for currency in self.cfg.currencies.iter() {
                self.sweep(*currency).await;
            }

            tokio::select! {
                _ = sleep(interval) => {
                    continue;
                }

                _ = stop_signal.cancelled() => {
                    info!("gracefully shutting down deposit watchdog");
                    break;
                }
            };
        }
    }

    /// One pass over the registry of `currency`. Returns how many addresses
    /// were polled successfully.
    pub async fn sweep(&self, currency: Currency) -> usize {
        let addresses = match self.store.deposit_addresses(currency).await {
            Ok(list) => list,
            Err(err) => {
                error!(
                    "failed to load deposit addresses: currency={} error={}",
                    currency, err
                );
                return 0;
            }
        };

        let total = addresses.len();
        let ok = stream::iter(addresses.iter())
            .map(|deposit| self.check(currency, deposit))
            .buffer_unordered(self.cfg.concurrency.max(1))
            .filter(|polled| futures::future::ready(*polled))
            .count()
            .await;

        if total > 0 {
            debug!(
                "deposit sweep done: currency={} addresses={} polled={}",
                currency, total, ok
            );
        }
        ok
    }

    async fn check(&self, currency: Currency, deposit: &DepositAddress) -> bool {
        let report = match self
            .monitor
            .poll(
                &deposit.address,
                currency,
                &deposit.owner_id,
                &deposit.derivation_path,
            )
            .await
        {
            Ok(report) => report,
            Err(err) => {
                warn!(
                    "deposit poll failed: owner={} currency={} address={} error={}",
                    deposit.owner_id, currency, deposit.address, err
                );
                return false;
            }
        };

        if let Err(err) = self
            .store
            .update_deposit_balance(
                &deposit.owner_id,
                currency,
                report.balance,
                Utc::now().timestamp(),
            )
            .await
        {
            error!(
                "failed to store deposit balance: owner={} currency={} error={}",
                deposit.owner_id, currency, err
            );
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainClient;
    use crate::db::MemoryStore;

    #[actix_rt::test]
    async fn sweep_covers_registry() {
        let store = UtxoStore::Memory(MemoryStore::default());
        store
            .upsert_deposit_address("u1", Currency::Btc, "a1", "m/0/1", 1)
            .await
            .unwrap();
        store
            .upsert_deposit_address("u2", Currency::Btc, "a2", "m/0/2", 1)
            .await
            .unwrap();
        store
            .upsert_deposit_address("u3", Currency::Ltc, "l3", "m/0/3", 1)
            .await
            .unwrap();

        let monitor = AddressMonitor::new(store.clone(), ChainClient::Offline);
        let watchdog = DepositWatchdog::new(
            store.clone(),
            monitor,
            MonitorConfig {
                interval_secs: 1,
                concurrency: 2,
                currencies: Currency::ALL.to_vec(),
            },
        );

        assert_eq!(watchdog.sweep(Currency::Btc).await, 2);
        assert_eq!(watchdog.sweep(Currency::Ltc).await, 1);

        let rows = store.deposit_addresses(Currency::Btc).await.unwrap();
        assert!(rows.iter().all(|r| r.last_checked_balance == 0 && r.updated_at > 1));
    }

    #[actix_rt::test]
    async fn stops_on_cancel() {
        let store = UtxoStore::Memory(MemoryStore::default());
        let monitor = AddressMonitor::new(store.clone(), ChainClient::Offline);
        let watchdog = DepositWatchdog::new(store, monitor, MonitorConfig::default());

        let cancel = CancellationToken::new();
        let handle = watchdog.start(cancel.clone());
        cancel.cancel();
        handle.await.unwrap();
    }
}

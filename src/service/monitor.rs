use chrono::Utc;
use serde::Serialize;

use crate::{
    chain::{ChainClient, ChainOutput},
    currency::Currency,
    db::{NewUtxo, UtxoKey, UtxoStore},
    errors::{CustodyError, Result},
};

#[derive(Debug, Clone, Default, Serialize)]
pub struct PollReport {
    pub address: String,
    pub balance: i64,
    pub unconfirmed_balance: i64,
    pub seen: usize,
    pub inserted: usize,
}

/// Pulls unspent outputs for deposit addresses and folds them into the store.
#[derive(Clone)]
pub struct AddressMonitor {
    store: UtxoStore,
    chain: ChainClient,
}

impl AddressMonitor {
    pub fn new(store: UtxoStore, chain: ChainClient) -> Self {
        Self { store, chain }
    }

    pub async fn poll(
        &self,
        address: &str,
        currency: Currency,
        owner: &str,
        derivation_path: &str,
    ) -> Result<PollReport> {
        let snapshot = self.chain.unspent_outputs(address, currency).await?;
        let (seen, inserted) = self
            .reconcile(address, currency, owner, derivation_path, &snapshot.outputs)
            .await?;

        debug!(
            "address polled: currency={} address={} seen={} inserted={} balance={}",
            currency, address, seen, inserted, snapshot.balance
        );

        Ok(PollReport {
            address: address.to_owned(),
            balance: snapshot.balance,
            unconfirmed_balance: snapshot.unconfirmed_balance,
            seen,
            inserted,
        })
    }

    /// Returns (outputs seen, outputs newly tracked). Already tracked outputs
    /// only get their confirmation count and derived status refreshed.
    pub async fn reconcile(
        &self,
        address: &str,
        currency: Currency,
        owner: &str,
        derivation_path: &str,
        outputs: &[ChainOutput],
    ) -> Result<(usize, usize)> {
        let mut inserted = 0;
        for out in outputs {
            let now = Utc::now().timestamp();
            let key = UtxoKey {
                tx_hash: out.tx_hash.clone(),
                vout: out.vout,
                currency: currency.as_str().to_owned(),
            };

            match self.store.find_utxo(&key).await? {
                Some(existing) => {
                    if existing.owner_id != owner || existing.address != address {
                        warn!(
                            "tracked utxo reported for another owner, keeping stored one: tx_hash={} vout={} stored_owner={} owner={}",
                            out.tx_hash, out.vout, existing.owner_id, owner
                        );
                    }
                    self.store
                        .refresh_confirmations(&key, currency, out.confirmations, out.block_height, now)
                        .await?;
                }
                None => {
                    let amount = i64::try_from(out.value).map_err(|_| {
                        CustodyError::Malformed(format!(
                            "output value out of range: tx_hash={} vout={} value={}",
                            out.tx_hash, out.vout, out.value
                        ))
                    })?;
                    let utxo = NewUtxo {
                        tx_hash: out.tx_hash.clone(),
                        vout: out.vout,
                        currency,
                        owner_id: owner.to_owned(),
                        address: address.to_owned(),
                        derivation_path: derivation_path.to_owned(),
                        amount,
                        block_height: out.block_height,
                        confirmations: out.confirmations,
                        script_pub_key: out.script.clone(),
                    };
                    let row = self.store.upsert_utxo(&utxo, now).await?;
                    inserted += 1;

                    info!(
                        "utxo added: id={} tx_hash={} vout={} owner={} currency={} amount={} confirmations={} status={}",
                        row.id, row.tx_hash, row.vout, row.owner_id, currency, row.amount, row.confirmations, row.status
                    );
                }
            }
        }

        Ok((outputs.len(), inserted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, Utxo};

    fn output(tx: u64, vout: i32, value: u64, confirmations: i64) -> ChainOutput {
        ChainOutput {
            tx_hash: format!("{:064x}", tx),
            vout,
            value,
            block_height: (confirmations > 0).then_some(800_000),
            confirmations,
            script: String::new(),
        }
    }

    fn monitor() -> AddressMonitor {
        AddressMonitor::new(
            UtxoStore::Memory(MemoryStore::default()),
            ChainClient::Offline,
        )
    }

    #[tokio::test]
    async fn new_outputs_are_tracked_once() {
        let m = monitor();
        let outputs = vec![output(1, 0, 10_000, 1), output(2, 1, 20_000, 7)];

        let (seen, inserted) = m
            .reconcile("addr", Currency::Ltc, "u1", "m/0/1", &outputs)
            .await
            .unwrap();
        assert_eq!((seen, inserted), (2, 2));

        // identical upstream data
        let (seen, inserted) = m
            .reconcile("addr", Currency::Ltc, "u1", "m/0/1", &outputs)
            .await
            .unwrap();
        assert_eq!((seen, inserted), (2, 0));

        let available = m.store.available_utxos("u1", Currency::Ltc).await.unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].amount, 20_000);
        assert_eq!(available[0].derivation_path, "m/0/1");
    }

    #[tokio::test]
    async fn confirmations_are_refreshed() {
        let m = monitor();
        m.reconcile("addr", Currency::Btc, "u1", "m/0/1", &[output(1, 0, 10_000, 1)])
            .await
            .unwrap();
        assert_eq!(
            m.store.available_balance("u1", Currency::Btc).await.unwrap(),
            0
        );

        m.reconcile("addr", Currency::Btc, "u1", "m/0/1", &[output(1, 0, 10_000, 3)])
            .await
            .unwrap();
        assert_eq!(
            m.store.available_balance("u1", Currency::Btc).await.unwrap(),
            10_000
        );
    }

    #[tokio::test]
    async fn ownership_is_immutable() {
        let m = monitor();
        m.reconcile("addr", Currency::Btc, "u1", "m/0/1", &[output(1, 0, 10_000, 5)])
            .await
            .unwrap();
        let (_, inserted) = m
            .reconcile("other", Currency::Btc, "u2", "m/0/2", &[output(1, 0, 10_000, 6)])
            .await
            .unwrap();
        assert_eq!(inserted, 0);

        let key = UtxoKey {
            tx_hash: format!("{:064x}", 1),
            vout: 0,
            currency: "BTC".to_owned(),
        };
        let row = m.store.find_utxo(&key).await.unwrap().unwrap();
        assert_eq!(row.owner_id, "u1");
        assert_eq!(row.address, "addr");
        assert_eq!(row.confirmations, 6);
        assert_eq!(row.status, Utxo::STATUS_CONFIRMED);
    }

    #[tokio::test]
    async fn locked_outputs_stay_locked_on_refresh() {
        let m = monitor();
        m.reconcile("addr", Currency::Btc, "u1", "m/0/1", &[output(1, 0, 10_000, 5)])
            .await
            .unwrap();
        let ids: Vec<i64> = m
            .store
            .available_utxos("u1", Currency::Btc)
            .await
            .unwrap()
            .iter()
            .map(|u| u.id)
            .collect();
        m.store.lock_utxos(&ids, "h", i64::MAX, 0).await.unwrap();

        m.reconcile("addr", Currency::Btc, "u1", "m/0/1", &[output(1, 0, 10_000, 9)])
            .await
            .unwrap();
        assert_eq!(m.store.locked_by("h").await.unwrap(), ids);
    }

    #[tokio::test]
    async fn offline_poll_is_empty() {
        let m = monitor();
        let report = m.poll("addr", Currency::Btc, "u1", "m/0/1").await.unwrap();
        assert_eq!(report.seen, 0);
        assert_eq!(report.inserted, 0);
    }

    #[tokio::test]
    async fn oversized_values_are_rejected() {
        let m = monitor();
        let err = m
            .reconcile("addr", Currency::Btc, "u1", "m/0/1", &[output(1, 0, u64::MAX, 5)])
            .await
            .unwrap_err();
        assert!(matches!(err, CustodyError::Malformed(_)));

        let key = UtxoKey {
            tx_hash: format!("{:064x}", 1),
            vout: 0,
            currency: "BTC".to_owned(),
        };
        assert!(m.store.find_utxo(&key).await.unwrap().is_none());
        assert_eq!(m.store.available_balance("u1", Currency::Btc).await.unwrap(), 0);
    }
}

use serde::Serialize;

use super::{broadcaster::Broadcaster, lock_manager::LockManager};
use crate::{
    chain::{ChainClient, FeeTier},
    currency::{ChainParams, Currency, Network},
    db::Utxo,
    errors::{CustodyError, Result},
    tx::{builder::TxBuilder, signer::KeyService},
};

#[derive(Debug, Clone, Copy)]
pub enum FeeChoice {
    Tier(FeeTier),
    Rate(f64),
}

#[derive(Debug, Clone)]
pub struct WithdrawalRequest {
    pub owner: String,
    pub currency: Currency,
    pub destination: String,
    pub amount: u64,
    pub fee: FeeChoice,
    pub change_derivation_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WithdrawalReceipt {
    pub holder: String,
    pub tx_hash: String,
    pub inputs: Vec<i64>,
    pub total_input: u64,
    pub fee: u64,
    pub change_amount: u64,
    pub outputs: usize,
    pub fee_rate: f64,
}

/// Drives one withdrawal: reserve inputs, verify key derivation, build,
/// sign, broadcast, mark spent.
pub struct WithdrawalService {
    locks: LockManager,
    chain: ChainClient,
    broadcaster: Broadcaster,
    keys: KeyService,
    net: Network,
}

impl WithdrawalService {
    pub fn new(locks: LockManager, chain: ChainClient, keys: KeyService, net: Network) -> Self {
        Self {
            locks,
            broadcaster: Broadcaster::new(chain.clone()),
            chain,
            keys,
            net,
        }
    }

    pub async fn resolve_fee_rate(&self, currency: Currency, fee: FeeChoice) -> Result<f64> {
        let rate = match fee {
            FeeChoice::Rate(rate) => rate,
            FeeChoice::Tier(tier) => self.chain.fee_tiers(currency).await.rate(tier),
        };
        if !rate.is_finite() || rate < 0.0 {
            return Err(CustodyError::InvalidFeeRate(rate));
        }
        Ok(rate)
    }

    pub async fn withdraw(&self, req: &WithdrawalRequest) -> Result<WithdrawalReceipt> {
        let params = ChainParams::lookup(req.currency, self.net);
        if req.amount == 0 {
            return Err(CustodyError::InvalidAmount(req.amount));
        }
        // reject before anything gets locked
        params.script_for_address(&req.destination)?;

        let fee_rate = self.resolve_fee_rate(req.currency, req.fee).await?;
        let reservation = self
            .locks
            .select_and_lock(&req.owner, req.currency, req.amount, fee_rate)
            .await?;
        let ids = reservation.selection.ids();

        let needs_change = reservation.selection.change_amount > 0;
        let change_address = match self
            .prepare_keys(req, &reservation.selection.selected, needs_change)
            .await
        {
            Ok(addr) => addr,
            Err(err @ CustodyError::AddressMismatch { .. }) => {
                error!(
                    "withdrawal halted, inputs stay locked: holder={} owner={} currency={} error={}",
                    reservation.holder, req.owner, req.currency, err
                );
                return Err(err);
            }
            Err(err) => {
                self.abandon(&reservation.holder, &ids, &err).await;
                return Err(err);
            }
        };

        let built = TxBuilder::new(params).build_transaction(
            &reservation.selection.selected,
            &req.destination,
            req.amount,
            reservation.selection.change_amount,
            &change_address,
        );
        let unsigned = match built {
            Ok(tx) => tx,
            Err(err) => {
                self.abandon(&reservation.holder, &ids, &err).await;
                return Err(err);
            }
        };

        let signed = match self.keys.sign(req.currency, &unsigned).await {
            Ok(signed) => signed,
            Err(err) => {
                self.abandon(&reservation.holder, &ids, &err).await;
                return Err(err);
            }
        };

        let tx_hash = match self.broadcaster.broadcast(&signed).await {
            Ok(hash) => hash,
            Err(err) => {
                warn!(
                    "broadcast rejected, inputs stay locked until unlock or expiry: holder={} expires_at={} ids={:?}",
                    reservation.holder, reservation.expires_at, ids
                );
                return Err(err);
            }
        };

        if let Err(err) = self.locks.commit_spent(&ids, &tx_hash).await {
            error!(
                "broadcasted inputs not marked as spent, mark them by hand: holder={} ids={:?} tx_hash={} error={}",
                reservation.holder, ids, tx_hash, err
            );
            return Err(CustodyError::SpentNotRecorded {
                tx_hash,
                reason: err.to_string(),
            });
        }

        Ok(WithdrawalReceipt {
            holder: reservation.holder,
            tx_hash,
            inputs: ids,
            total_input: reservation.selection.total_input,
            fee: reservation.selection.fee,
            change_amount: reservation.selection.change_amount,
            outputs: reservation.selection.output_count(),
            fee_rate,
        })
    }

    /// Verifies input addresses and derives the change address when needed.
    async fn prepare_keys(
        &self,
        req: &WithdrawalRequest,
        selected: &[Utxo],
        needs_change: bool,
    ) -> Result<String> {
        self.keys.verify_addresses(req.currency, selected).await?;
        if !needs_change {
            return Ok(String::new());
        }

        let change = self
            .keys
            .derive_address(req.currency, &req.change_derivation_path)
            .await?;
        Ok(change.address)
    }

    async fn abandon(&self, holder: &str, ids: &[i64], cause: &CustodyError) {
        match self.locks.release(ids).await {
            Ok(_) => warn!(
                "withdrawal abandoned, inputs released: holder={} error={}",
                holder, cause
            ),
            Err(err) => error!(
                "failed to release inputs, left for the reaper: holder={} ids={:?} error={}",
                holder, ids, err
            ),
        }
    }
}

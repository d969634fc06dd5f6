use std::str::FromStr;

use bitcoin::{OutPoint, Txid};
use serde::Serialize;
use sqlx::prelude::FromRow;

use crate::currency::Currency;
use crate::errors::{CustodyError, Result};

#[derive(Default, Clone, Debug, PartialEq, FromRow, Serialize)]
pub struct Utxo {
    pub id: i64,
    pub tx_hash: String,
    pub vout: i32,
    pub currency: String,
    pub owner_id: String,
    pub address: String,
    pub derivation_path: String,
    pub amount: i64,
    pub status: String, // unconfirmed, confirmed, locked, spent
    pub block_height: Option<i64>,
    pub confirmations: i64,
    pub locked_until: Option<i64>,
    pub locked_by: Option<String>,
    pub spent_in_tx_hash: Option<String>,
    pub spent_at: Option<i64>,
    pub script_pub_key: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Utxo {
    pub const STATUS_UNCONFIRMED: &'static str = "unconfirmed";
    pub const STATUS_CONFIRMED: &'static str = "confirmed";
    pub const STATUS_LOCKED: &'static str = "locked";
    pub const STATUS_SPENT: &'static str = "spent";

    pub fn out_point(&self) -> Result<OutPoint> {
        let txid = Txid::from_str(&self.tx_hash)
            .map_err(|e| CustodyError::Malformed(format!("tx_hash={} {}", self.tx_hash, e)))?;
        Ok(OutPoint {
            txid,
            vout: self.vout as u32,
        })
    }

    pub fn amount_sat(&self) -> u64 {
        self.amount.max(0) as u64
    }

    pub fn key(&self) -> UtxoKey {
        UtxoKey {
            tx_hash: self.tx_hash.clone(),
            vout: self.vout,
            currency: self.currency.clone(),
        }
    }

    pub fn is_selectable(&self) -> bool {
        self.status == Self::STATUS_CONFIRMED
    }
}

/// The external identity of an output: (tx hash, output index, currency).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UtxoKey {
    pub tx_hash: String,
    pub vout: i32,
    pub currency: String,
}

/// A freshly observed output as reported by the chain source.
#[derive(Clone, Debug)]
pub struct NewUtxo {
    pub tx_hash: String,
    pub vout: i32,
    pub currency: Currency,
    pub owner_id: String,
    pub address: String,
    pub derivation_path: String,
    pub amount: i64,
    pub block_height: Option<i64>,
    pub confirmations: i64,
    pub script_pub_key: String,
}

impl NewUtxo {
    pub fn key(&self) -> UtxoKey {
        UtxoKey {
            tx_hash: self.tx_hash.clone(),
            vout: self.vout,
            currency: self.currency.as_str().to_owned(),
        }
    }

    pub fn status(&self) -> &'static str {
        self.currency.status_for(self.confirmations)
    }
}

#[derive(Default, Clone, Debug, PartialEq, FromRow, Serialize)]
pub struct DepositAddress {
    pub id: i64,
    pub owner_id: String,
    pub currency: String,
    pub address: String,
    pub derivation_path: String,
    pub last_checked_balance: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

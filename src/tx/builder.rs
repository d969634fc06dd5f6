use bitcoin::{
    absolute::LockTime, consensus, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
    Witness,
};
use serde::Serialize;

use crate::currency::ChainParams;
use crate::db::Utxo;
use crate::errors::{CustodyError, Result};

/// What the signer needs to know about each input. No key material.
#[derive(Clone, Debug, Serialize)]
pub struct SigningInput {
    pub outpoint: String,
    pub derivation_path: String,
    pub value: u64,
    pub script_pubkey: String,
}

#[derive(Clone, Debug)]
pub struct UnsignedTransaction {
    pub tx: Transaction,
    pub inputs: Vec<SigningInput>,
}

impl UnsignedTransaction {
    pub fn to_hex(&self) -> String {
        hex::encode(consensus::serialize(&self.tx))
    }
}

pub struct TxBuilder {
    params: &'static ChainParams,
}

impl TxBuilder {
    pub fn new(params: &'static ChainParams) -> Self {
        Self { params }
    }

    pub fn build_transaction(
        &self,
        selected: &[Utxo],
        destination: &str,
        amount: u64,
        change_amount: u64,
        change_address: &str,
    ) -> Result<UnsignedTransaction> {
        if amount == 0 {
            return Err(CustodyError::InvalidAmount(amount));
        }
        if selected.is_empty() {
            return Err(CustodyError::NoUtxosAvailable);
        }

        let mut tx = Transaction {
            version: 2,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![],
        };
        let mut inputs = Vec::with_capacity(selected.len());

        for u in selected {
            if u.currency != self.params.currency.as_str() {
                return Err(CustodyError::CurrencyMismatch {
                    expected: self.params.currency,
                    found: u.currency.clone(),
                });
            }

            let previous_output: OutPoint = u.out_point()?;
            let script_pubkey = if u.script_pub_key.is_empty() {
                self.params.script_for_address(&u.address)?
            } else {
                ScriptBuf::from_hex(&u.script_pub_key).map_err(|e| {
                    CustodyError::Malformed(format!("script of {}: {}", previous_output, e))
                })?
            };

            tx.input.push(TxIn {
                previous_output,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            });
            inputs.push(SigningInput {
                outpoint: previous_output.to_string(),
                derivation_path: u.derivation_path.clone(),
                value: u.amount_sat(),
                script_pubkey: script_pubkey.to_hex_string(),
            });
        }

        tx.output.push(TxOut {
            value: amount,
            script_pubkey: self.params.script_for_address(destination)?,
        });

        if change_amount > 0 {
            tx.output.push(TxOut {
                value: change_amount,
                script_pubkey: self.params.script_for_address(change_address)?,
            });
        }

        info!(
            "transaction built (unsigned): currency={} inputs={} outputs={} amount={} change={}",
            self.params.currency,
            tx.input.len(),
            tx.output.len(),
            amount,
            change_amount
        );

        Ok(UnsignedTransaction { tx, inputs })
    }
}

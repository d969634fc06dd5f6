use serde::Serialize;

use crate::currency::DUST_THRESHOLD;
use crate::db::Utxo;
use crate::errors::{CustodyError, Result};

// P2WPKH sizing in virtual bytes.
pub const INPUT_VBYTES: f64 = 68.0;
pub const OUTPUT_VBYTES: f64 = 31.0;
pub const OVERHEAD_VBYTES: f64 = 10.5;

/// Selection always budgets for recipient + change.
const ASSUMED_OUTPUTS: usize = 2;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SelectionResult {
    pub selected: Vec<Utxo>,
    pub total_input: u64,
    pub target: u64,
    pub fee: u64,
    /// Zero when the leftover was dust and went to the fee.
    pub change_amount: u64,
}

impl SelectionResult {
    pub fn ids(&self) -> Vec<i64> {
        self.selected.iter().map(|u| u.id).collect()
    }

    pub fn output_count(&self) -> usize {
        if self.change_amount > 0 {
            2
        } else {
            1
        }
    }
}

pub fn estimate_vsize(inputs: usize, outputs: usize) -> f64 {
    inputs as f64 * INPUT_VBYTES + outputs as f64 * OUTPUT_VBYTES + OVERHEAD_VBYTES
}

pub fn estimate_fee(inputs: usize, outputs: usize, fee_rate: f64) -> u64 {
    (estimate_vsize(inputs, outputs) * fee_rate).ceil() as u64
}

/// Largest-first coin selection over a snapshot of available outputs.
pub fn select_inputs(available: &[Utxo], target: u64, fee_rate: f64) -> Result<SelectionResult> {
    if !fee_rate.is_finite() || fee_rate < 0.0 {
        return Err(CustodyError::InvalidFeeRate(fee_rate));
    }
    if target == 0 {
        return Err(CustodyError::InvalidAmount(target));
    }
    if available.is_empty() {
        return Err(CustodyError::NoUtxosAvailable);
    }

    let mut candidates: Vec<&Utxo> = available.iter().collect();
    candidates.sort_by(|a, b| {
        b.amount
            .cmp(&a.amount)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });

    let mut selected = Vec::new();
    let mut total_input: u64 = 0;
    let mut fee: u64 = 0;

    for utxo in candidates {
        selected.push(utxo.clone());
        total_input += utxo.amount_sat();
        fee = estimate_fee(selected.len(), ASSUMED_OUTPUTS, fee_rate);

        if total_input >= target.saturating_add(fee) {
            break;
        }
    }

    let needed = target.saturating_add(fee);
    if total_input < needed {
        return Err(CustodyError::InsufficientFunds {
            needed,
            available: total_input,
        });
    }

    let mut change_amount = total_input - needed;
    if change_amount > 0 && change_amount < DUST_THRESHOLD {
        fee += change_amount;
        change_amount = 0;
    }

    Ok(SelectionResult {
        selected,
        total_input,
        target,
        fee,
        change_amount,
    })
}

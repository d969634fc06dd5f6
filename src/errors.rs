use thiserror::Error;

use crate::currency::Currency;

#[derive(Error, Debug)]
pub enum CustodyError {
    #[error("no utxos available")]
    NoUtxosAvailable,

    #[error("insufficient funds: needed={needed} available={available}")]
    InsufficientFunds { needed: u64, available: u64 },

    /// A key-service address disagrees with the stored one for the same
    /// derivation path. Callers must stop the flow that observed it.
    #[error("address mismatch: path={path} stored={stored} derived={derived}")]
    AddressMismatch {
        path: String,
        stored: String,
        derived: String,
    },

    #[error("broadcast rejected: {0}")]
    Broadcast(String),

    /// The network took the transaction but its inputs are not marked spent.
    #[error("transaction {tx_hash} accepted, inputs not marked spent: {reason}")]
    SpentNotRecorded { tx_hash: String, reason: String },

    #[error("lock conflict: expected={expected} affected={affected}")]
    LockConflict { expected: usize, affected: usize },

    #[error("invalid {currency} address: {address}")]
    InvalidAddress { currency: Currency, address: String },

    #[error("currency mismatch: expected={expected} found={found}")]
    CurrencyMismatch { expected: Currency, found: String },

    #[error("invalid fee rate: {0}")]
    InvalidFeeRate(f64),

    #[error("invalid amount: {0}")]
    InvalidAmount(u64),

    #[error("unknown currency: {0}")]
    UnknownCurrency(String),

    #[error("malformed data: {0}")]
    Malformed(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, CustodyError>;

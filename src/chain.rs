use serde::{Deserialize, Serialize};

use crate::{
    config::ExplorerConfig,
    currency::{ChainParams, Currency, Network},
    errors::{CustodyError, Result},
};

/// Fee estimates in smallest units per virtual byte.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FeeTiers {
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl Default for FeeTiers {
    fn default() -> Self {
        Self {
            high: 50.0,
            medium: 30.0,
            low: 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum FeeTier {
    High,
    Medium,
    Low,
}

impl FeeTiers {
    pub fn from_per_kb(high: f64, medium: f64, low: f64) -> Self {
        Self {
            high: high / 1024.0,
            medium: medium / 1024.0,
            low: low / 1024.0,
        }
    }

    pub fn rate(&self, tier: FeeTier) -> f64 {
        match tier {
            FeeTier::High => self.high,
            FeeTier::Medium => self.medium,
            FeeTier::Low => self.low,
        }
    }
}

/// An unspent output as reported by the explorer.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainOutput {
    pub tx_hash: String,
    pub vout: i32,
    pub value: u64,
    pub block_height: Option<i64>,
    pub confirmations: i64,
    pub script: String,
}

#[derive(Debug, Clone, Default)]
pub struct AddressSnapshot {
    pub balance: i64,
    pub unconfirmed_balance: i64,
    pub outputs: Vec<ChainOutput>,
}

#[derive(Clone)]
pub enum ChainClient {
    BlockCypher(BlockCypherClient),
    Offline,
}

impl ChainClient {
    pub fn new(cfg: &ExplorerConfig, net: Network) -> Self {
        match cfg.mode.as_str() {
            "offline" => Self::Offline,
            _ => Self::BlockCypher(BlockCypherClient::new(cfg, net)),
        }
    }

    pub async fn unspent_outputs(&self, address: &str, currency: Currency) -> Result<AddressSnapshot> {
        match self {
            Self::BlockCypher(client) => client.unspent_outputs(address, currency).await,
            Self::Offline => Ok(AddressSnapshot::default()),
        }
    }

    pub async fn push_tx(&self, raw_hex: &str, currency: Currency) -> Result<String> {
        match self {
            Self::BlockCypher(client) => client.push_tx(raw_hex, currency).await,
            Self::Offline => Err(CustodyError::Broadcast(
                "explorer is offline, nothing was submitted".to_owned(),
            )),
        }
    }

    /// Never fails: explorer trouble degrades to the default tiers.
    pub async fn fee_tiers(&self, currency: Currency) -> FeeTiers {
        let result = match self {
            Self::BlockCypher(client) => client.fee_tiers(currency).await,
            Self::Offline => return FeeTiers::default(),
        };

        match result {
            Ok(tiers) => tiers,
            Err(err) => {
                warn!(
                    "fee tiers unavailable, using defaults: currency={} error={}",
                    currency, err
                );
                FeeTiers::default()
            }
        }
    }
}

#[derive(Clone)]
pub struct BlockCypherClient {
    base_url: String,
    token: Option<String>,
    net: Network,
}

impl BlockCypherClient {
    pub fn new(cfg: &ExplorerConfig, net: Network) -> Self {
        Self {
            base_url: cfg.base_url.trim_end_matches('/').to_owned(),
            token: cfg.token.clone(),
            net,
        }
    }

    fn url(&self, currency: Currency, path: &str, query: &[(&str, &str)]) -> String {
        let params = ChainParams::lookup(currency, self.net);
        let mut url = format!("{}/{}{}", self.base_url, params.explorer_path, path);

        let mut pairs: Vec<String> = query.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        if let Some(token) = &self.token {
            pairs.push(format!("token={}", token));
        }
        if !pairs.is_empty() {
            url.push('?');
            url.push_str(&pairs.join("&"));
        }
        url
    }

    pub async fn unspent_outputs(&self, address: &str, currency: Currency) -> Result<AddressSnapshot> {
        let client = awc::Client::default();
        let url = self.url(
            currency,
            &format!("/addrs/{}", address),
            &[("unspentOnly", "true"), ("includeScript", "true")],
        );
        let mut resp = client
            .get(&url)
            .send()
            .await
            .map_err(|e| CustodyError::Upstream(format!("explorer address {}: {}", address, e)))?;

        if !resp.status().is_success() {
            return Err(CustodyError::Upstream(format!(
                "explorer address {}: status={}",
                address,
                resp.status()
            )));
        }

        let val = resp
            .json::<AddressResponse>()
            .limit(8 * 1024 * 1024)
            .await
            .map_err(|e| CustodyError::Upstream(format!("explorer address {}: {}", address, e)))?;

        Ok(val.into())
    }

    pub async fn push_tx(&self, raw_hex: &str, currency: Currency) -> Result<String> {
        let client = awc::Client::default();
        let url = self.url(currency, "/txs/push", &[]);
        let mut resp = client
            .post(&url)
            .send_json(&PushRequest { tx: raw_hex })
            .await
            .map_err(|e| CustodyError::Broadcast(e.to_string()))?;

        let status = resp.status();
        let val = resp
            .json::<PushResponse>()
            .await
            .map_err(|e| CustodyError::Broadcast(format!("status={} {}", status, e)))?;

        match (val.tx, val.error) {
            (Some(tx), None) if status.is_success() => Ok(tx.hash),
            (_, Some(reason)) => Err(CustodyError::Broadcast(reason)),
            _ => Err(CustodyError::Broadcast(format!("status={}", status))),
        }
    }

    pub async fn fee_tiers(&self, currency: Currency) -> Result<FeeTiers> {
        let client = awc::Client::default();
        let url = self.url(currency, "", &[]);
        let mut resp = client
            .get(&url)
            .send()
            .await
            .map_err(|e| CustodyError::Upstream(format!("explorer chain info: {}", e)))?;

        let val = resp
            .json::<ChainInfoResponse>()
            .await
            .map_err(|e| CustodyError::Upstream(format!("explorer chain info: {}", e)))?;

        Ok(FeeTiers::from_per_kb(
            val.high_fee_per_kb,
            val.medium_fee_per_kb,
            val.low_fee_per_kb,
        ))
    }
}

#[derive(Debug, Clone, Serialize)]
struct PushRequest<'a> {
    tx: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushResponse {
    pub tx: Option<PushedTx>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushedTx {
    pub hash: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainInfoResponse {
    pub high_fee_per_kb: f64,
    pub medium_fee_per_kb: f64,
    pub low_fee_per_kb: f64,
}

#[derive(Default, Debug, Clone, Deserialize)]
pub struct AddressResponse {
    pub address: String,
    #[serde(default)]
    pub balance: i64,
    #[serde(default)]
    pub unconfirmed_balance: i64,
    #[serde(default)]
    pub txrefs: Vec<TxRef>,
    #[serde(default)]
    pub unconfirmed_txrefs: Vec<TxRef>,
}

#[derive(Default, Debug, Clone, Deserialize)]
pub struct TxRef {
    pub tx_hash: String,
    pub tx_output_n: i32,
    pub value: u64,
    #[serde(default)]
    pub block_height: i64,
    #[serde(default)]
    pub confirmations: i64,
    #[serde(default)]
    pub script: Option<String>,
}

impl From<TxRef> for ChainOutput {
    fn from(r: TxRef) -> Self {
        Self {
            tx_hash: r.tx_hash,
            vout: r.tx_output_n,
            value: r.value,
            // unconfirmed refs carry block_height = -1
            block_height: (r.block_height > 0).then_some(r.block_height),
            confirmations: r.confirmations.max(0),
            script: r.script.unwrap_or_default(),
        }
    }
}

impl From<AddressResponse> for AddressSnapshot {
    fn from(val: AddressResponse) -> Self {
        let outputs = val
            .txrefs
            .into_iter()
            .chain(val.unconfirmed_txrefs)
            .filter(|r| r.tx_output_n >= 0)
            .map(ChainOutput::from)
            .collect();

        Self {
            balance: val.balance,
            unconfirmed_balance: val.unconfirmed_balance,
            outputs,
        }
    }
}

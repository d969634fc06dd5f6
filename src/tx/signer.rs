use serde::{Deserialize, Serialize};

use super::builder::{SigningInput, UnsignedTransaction};
use crate::config::KeyServiceConfig;
use crate::currency::Currency;
use crate::db::Utxo;
use crate::errors::{CustodyError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct DerivedKey {
    pub address: String,
    pub public_key: String,
}

#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub currency: Currency,
    pub raw_hex: String,
}

#[derive(Serialize)]
struct AddressRequest<'a> {
    currency: Currency,
    derivation_path: &'a str,
}

#[derive(Serialize)]
struct SignRequest<'a> {
    currency: Currency,
    unsigned_tx: String,
    inputs: &'a [SigningInput],
}

#[derive(Deserialize)]
struct SignResponse {
    raw_tx: String,
}

/// Client of the key-holding service. Private keys stay on the other side;
/// this core only sends derivation paths and unsigned transactions.
#[derive(Clone)]
pub struct KeyService {
    url: String,
    api_key: Option<String>,
}

impl KeyService {
    pub fn new(cfg: &KeyServiceConfig) -> Self {
        Self {
            url: cfg.url.trim_end_matches('/').to_owned(),
            api_key: cfg.api_key.clone(),
        }
    }

    async fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R> {
        let client = awc::Client::default();
        let mut req = client.post(format!("{}/{}", self.url, path));
        if let Some(key) = &self.api_key {
            req = req.insert_header(("X-Api-Key", key.clone()));
        }

        let mut resp = req
            .send_json(body)
            .await
            .map_err(|e| CustodyError::Upstream(format!("key service {}: {}", path, e)))?;

        if !resp.status().is_success() {
            let body = resp.body().await.unwrap_or_default();
            return Err(CustodyError::Upstream(format!(
                "key service {}: status={} body={}",
                path,
                resp.status(),
                String::from_utf8_lossy(&body)
            )));
        }

        resp.json::<R>()
            .limit(4 * 1024 * 1024)
            .await
            .map_err(|e| CustodyError::Upstream(format!("key service {}: {}", path, e)))
    }

    pub async fn derive_address(&self, currency: Currency, derivation_path: &str) -> Result<DerivedKey> {
        self.post(
            "address",
            &AddressRequest {
                currency,
                derivation_path,
            },
        )
        .await
    }

    /// Checks every distinct derivation path of `selected` against the key
    /// service. A disagreement means key derivation drifted.
    pub async fn verify_addresses(&self, currency: Currency, selected: &[Utxo]) -> Result<()> {
        let mut checked: Vec<(&str, &str)> = Vec::new();
        for u in selected {
            if checked.contains(&(u.derivation_path.as_str(), u.address.as_str())) {
                continue;
            }

            let derived = self.derive_address(currency, &u.derivation_path).await?;
            if derived.address != u.address {
                error!(
                    "derived address mismatch: utxo_id={} path={} stored={} derived={}",
                    u.id, u.derivation_path, u.address, derived.address
                );
                return Err(CustodyError::AddressMismatch {
                    path: u.derivation_path.clone(),
                    stored: u.address.clone(),
                    derived: derived.address,
                });
            }
            checked.push((u.derivation_path.as_str(), u.address.as_str()));
        }
        Ok(())
    }

    pub async fn sign(
        &self,
        currency: Currency,
        unsigned: &UnsignedTransaction,
    ) -> Result<SignedTransaction> {
        let resp: SignResponse = self
            .post(
                "sign",
                &SignRequest {
                    currency,
                    unsigned_tx: unsigned.to_hex(),
                    inputs: &unsigned.inputs,
                },
            )
            .await?;

        debug!(
            "transaction signed: currency={} inputs={} size={}",
            currency,
            unsigned.inputs.len(),
            resp.raw_tx.len() / 2
        );

        Ok(SignedTransaction {
            currency,
            raw_hex: resp.raw_tx,
        })
    }
}

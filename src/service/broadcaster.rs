use crate::{chain::ChainClient, errors::Result, tx::signer::SignedTransaction};

#[derive(Clone)]
pub struct Broadcaster {
    chain: ChainClient,
}

impl Broadcaster {
    pub fn new(chain: ChainClient) -> Self {
        Self { chain }
    }

    /// Submits once. On rejection the caller decides between retrying and
    /// releasing the reserved outputs.
    pub async fn broadcast(&self, signed: &SignedTransaction) -> Result<String> {
        match self.chain.push_tx(&signed.raw_hex, signed.currency).await {
            Ok(tx_hash) => {
                info!(
                    "transaction broadcasted: currency={} tx_hash={}",
                    signed.currency, tx_hash
                );
                Ok(tx_hash)
            }
            Err(err) => {
                error!(
                    "transaction broadcast failed: currency={} error={}",
                    signed.currency, err
                );
                Err(err)
            }
        }
    }
}

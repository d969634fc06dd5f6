use chrono::Utc;
use ulid::Ulid;

use crate::{
    chain::{ChainClient, FeeTier},
    config,
    currency::{ChainParams, Currency},
    db,
    service::{
        withdrawal::{FeeChoice, WithdrawalRequest},
        AddressMonitor, LockManager, WithdrawalService,
    },
    tx::signer::KeyService,
};

#[derive(Debug, clap::Parser)]
pub struct PollCmd {
    #[arg(long)]
    address: String,

    #[arg(long)]
    currency: Currency,

    #[arg(long)]
    owner: String,

    #[arg(long)]
    derivation_path: String,
}

impl PollCmd {
    pub async fn run(&self, cfg_path: &str) -> anyhow::Result<()> {
        let cfg = config::read_config(cfg_path)?;
        let store = db::open_store(&cfg.db).await?;
        let chain = ChainClient::new(&cfg.explorer, cfg.get_network());
        let monitor = AddressMonitor::new(store, chain);

        let report = monitor
            .poll(&self.address, self.currency, &self.owner, &self.derivation_path)
            .await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    }
}

#[derive(Debug, clap::Parser)]
pub struct BalanceCmd {
    #[arg(long)]
    owner: String,

    #[arg(long)]
    currency: Currency,

    /// also list the spendable outputs
    #[arg(long, default_value_t = false)]
    verbose: bool,
}

impl BalanceCmd {
    pub async fn run(&self, cfg_path: &str) -> anyhow::Result<()> {
        let cfg = config::read_config(cfg_path)?;
        let store = db::open_store(&cfg.db).await?;

        let balance = store.available_balance(&self.owner, self.currency).await?;
        println!("{} {} available: {}", self.owner, self.currency, balance);

        if self.verbose {
            for u in store.available_utxos(&self.owner, self.currency).await? {
                println!(
                    "  id={} {}:{} amount={} confirmations={}",
                    u.id, u.tx_hash, u.vout, u.amount, u.confirmations
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, clap::Parser)]
pub struct RegisterAddressCmd {
    #[arg(long)]
    owner: String,

    #[arg(long)]
    currency: Currency,

    #[arg(long)]
    derivation_path: String,

    /// derived through the key service when omitted
    #[arg(long)]
    address: Option<String>,
}

impl RegisterAddressCmd {
    pub async fn run(&self, cfg_path: &str) -> anyhow::Result<()> {
        let cfg = config::read_config(cfg_path)?;
        let store = db::open_store(&cfg.db).await?;
        let params = ChainParams::lookup(self.currency, cfg.get_network());

        let address = match &self.address {
            Some(addr) => addr.clone(),
            None => {
                let keys = KeyService::new(&cfg.key_service);
                let derived = keys
                    .derive_address(self.currency, &self.derivation_path)
                    .await?;
                debug!(
                    "deposit address derived: path={} address={} public_key={}",
                    self.derivation_path, derived.address, derived.public_key
                );
                derived.address
            }
        };
        params.script_for_address(&address)?;

        let row = store
            .upsert_deposit_address(
                &self.owner,
                self.currency,
                &address,
                &self.derivation_path,
                Utc::now().timestamp(),
            )
            .await?;
        info!(
            "deposit address registered: owner={} currency={} address={} path={}",
            row.owner_id, row.currency, row.address, row.derivation_path
        );
        println!("{}", row.address);
        Ok(())
    }
}

#[derive(Debug, clap::Parser)]
pub struct WithdrawCmd {
    #[arg(long)]
    owner: String,

    #[arg(long)]
    currency: Currency,

    #[arg(long)]
    destination: String,

    /// amount in the smallest unit of the currency
    #[arg(long)]
    amount: u64,

    /// explicit fee rate per vbyte, overrides --tier
    #[arg(long)]
    fee_rate: Option<f64>,

    #[arg(long, value_enum, default_value_t = FeeTier::Medium)]
    tier: FeeTier,

    #[arg(long)]
    change_path: String,
}

impl WithdrawCmd {
    pub async fn run(&self, cfg_path: &str) -> anyhow::Result<()> {
        let cfg = config::read_config(cfg_path)?;
        let net = cfg.get_network();
        let store = db::open_store(&cfg.db).await?;
        let chain = ChainClient::new(&cfg.explorer, net);
        let service = WithdrawalService::new(
            LockManager::new(store, cfg.locks.lock_minutes),
            chain,
            KeyService::new(&cfg.key_service),
            net,
        );

        let fee = match self.fee_rate {
            Some(rate) => FeeChoice::Rate(rate),
            None => FeeChoice::Tier(self.tier),
        };
        let receipt = service
            .withdraw(&WithdrawalRequest {
                owner: self.owner.clone(),
                currency: self.currency,
                destination: self.destination.clone(),
                amount: self.amount,
                fee,
                change_derivation_path: self.change_path.clone(),
            })
            .await?;

        println!("{}", serde_json::to_string_pretty(&receipt)?);
        Ok(())
    }
}

#[derive(Debug, clap::Parser)]
pub struct LockCmd {
    #[arg(long, value_delimiter = ',', required = true)]
    ids: Vec<i64>,

    /// a fresh ULID when omitted
    #[arg(long)]
    holder: Option<String>,
}

impl LockCmd {
    pub async fn run(&self, cfg_path: &str) -> anyhow::Result<()> {
        let cfg = config::read_config(cfg_path)?;
        let store = db::open_store(&cfg.db).await?;
        let locks = LockManager::new(store, cfg.locks.lock_minutes);

        let holder = self
            .holder
            .clone()
            .unwrap_or_else(|| Ulid::new().to_string());
        let expires_at = locks.lock(&self.ids, &holder).await?;
        println!("holder={} expires_at={}", holder, expires_at);
        Ok(())
    }
}

#[derive(Debug, clap::Parser)]
pub struct UnlockCmd {
    /// release everything locked under this holder
    #[arg(long, conflicts_with = "ids")]
    holder: Option<String>,

    #[arg(long, value_delimiter = ',')]
    ids: Vec<i64>,
}

impl UnlockCmd {
    pub async fn run(&self, cfg_path: &str) -> anyhow::Result<()> {
        let cfg = config::read_config(cfg_path)?;
        let store = db::open_store(&cfg.db).await?;
        let locks = LockManager::new(store, cfg.locks.lock_minutes);

        let released = match &self.holder {
            Some(holder) => locks.release_holder(holder).await?,
            None if self.ids.is_empty() => anyhow::bail!("either --holder or --ids is required"),
            None => {
                locks.release(&self.ids).await?;
                self.ids.clone()
            }
        };
        println!("released: {:?}", released);
        Ok(())
    }
}

#[derive(Debug, clap::Parser)]
pub struct FeesCmd {
    #[arg(long)]
    currency: Currency,
}

impl FeesCmd {
    pub async fn run(&self, cfg_path: &str) -> anyhow::Result<()> {
        let cfg = config::read_config(cfg_path)?;
        let chain = ChainClient::new(&cfg.explorer, cfg.get_network());

        let tiers = chain.fee_tiers(self.currency).await;
        println!("{}", serde_json::to_string_pretty(&tiers)?);
        Ok(())
    }
}

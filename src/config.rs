use serde::Deserialize;
use std::fs;

use crate::currency::{Currency, Network};

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub network: Option<String>,
    pub db: DBConfig,
    pub explorer: ExplorerConfig,
    pub key_service: KeyServiceConfig,
    #[serde(default)]
    pub locks: LocksConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl Config {
    pub fn get_network(&self) -> Network {
        let Some(net) = self.network.clone() else {
            return Network::Mainnet;
        };
        Network::new_from_str(&net)
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct DBConfig {
    /// "postgres" or "memory"
    #[serde(default = "default_db_mode")]
    pub mode: String,
    #[serde(default)]
    pub dsn: String,
    #[serde(default)]
    pub automigrate: bool,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ExplorerConfig {
    /// "blockcypher" or "offline"
    #[serde(default = "default_explorer_mode")]
    pub mode: String,
    #[serde(default = "default_explorer_url")]
    pub base_url: String,
    pub token: Option<String>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct KeyServiceConfig {
    pub url: String,
    pub api_key: Option<String>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct LocksConfig {
    pub lock_minutes: i64,
    pub reap_interval_secs: u64,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            lock_minutes: 30,
            reap_interval_secs: 60,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    pub concurrency: usize,
    pub currencies: Vec<Currency>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 120,
            concurrency: 4,
            currencies: Currency::ALL.to_vec(),
        }
    }
}

fn default_db_mode() -> String {
    "postgres".to_owned()
}

fn default_max_connections() -> u32 {
    20
}

fn default_explorer_mode() -> String {
    "blockcypher".to_owned()
}

fn default_explorer_url() -> String {
    "https://api.blockcypher.com/v1".to_owned()
}

pub fn read_config(path: &str) -> anyhow::Result<Config> {
    let contents = fs::read_to_string(path)?;

    let config: Config = toml::from_str(&contents)?;
    Ok(config)
}

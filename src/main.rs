#[macro_use]
extern crate log;

use clap::Parser;
use tokio_util::sync::CancellationToken;

mod chain;
mod cmd;
mod config;
mod currency;
mod db;
mod errors;
mod service;
#[cfg(test)]
mod test_http;
mod tx;

/// Custody core for BTC and LTC outputs
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// path to config file
    #[arg(short, long, default_value_t = String::from("config.toml"))]
    config: String,

    #[command(subcommand)]
    subcommand: Option<Subcommand>,
}

#[actix_rt::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();

    match args.subcommand {
        None | Some(Subcommand::Serve) => run_app(&args.config).await,
        Some(subcmd) => subcmd.run(&args.config).await,
    }
}

#[derive(Debug, Parser)]
enum Subcommand {
    #[command(about = "Run the deposit watchdog and the lock reaper (default)")]
    Serve,

    #[command(about = "Poll one address and record its outputs")]
    Poll(cmd::PollCmd),

    #[command(about = "Show the spendable balance of an owner")]
    Balance(cmd::BalanceCmd),

    #[command(about = "Register a deposit address for the watchdog")]
    RegisterAddress(cmd::RegisterAddressCmd),

    #[command(about = "Select, sign and broadcast a withdrawal")]
    Withdraw(cmd::WithdrawCmd),

    #[command(about = "Hold confirmed outputs out of selection")]
    Lock(cmd::LockCmd),

    #[command(about = "Release locked outputs by holder or ids")]
    Unlock(cmd::UnlockCmd),

    #[command(about = "Release expired locks once")]
    Reap,

    #[command(about = "Show current fee tiers")]
    Fees(cmd::FeesCmd),

    #[command(about = "Cleans all data from the custody db")]
    ResetDB,
}

impl Subcommand {
    async fn run(&self, cfg_path: &str) -> anyhow::Result<()> {
        match self {
            Subcommand::Serve => run_app(cfg_path).await,
            Subcommand::Poll(cmd) => cmd.run(cfg_path).await,
            Subcommand::Balance(cmd) => cmd.run(cfg_path).await,
            Subcommand::RegisterAddress(cmd) => cmd.run(cfg_path).await,
            Subcommand::Withdraw(cmd) => cmd.run(cfg_path).await,
            Subcommand::Lock(cmd) => cmd.run(cfg_path).await,
            Subcommand::Unlock(cmd) => cmd.run(cfg_path).await,
            Subcommand::Reap => reap(cfg_path).await,
            Subcommand::Fees(cmd) => cmd.run(cfg_path).await,
            Subcommand::ResetDB => reset_db(cfg_path).await,
        }
    }
}

async fn run_app(cfg_path: &str) -> anyhow::Result<()> {
    let cfg = config::read_config(cfg_path)?;
    let store = db::open_store(&cfg.db).await?;
    let chain = chain::ChainClient::new(&cfg.explorer, cfg.get_network());

    let monitor = service::AddressMonitor::new(store.clone(), chain);
    let watchdog =
        service::deposit_watchdog::DepositWatchdog::new(store.clone(), monitor, cfg.monitor.clone());
    let reaper = service::lock_reaper::LockReaper::new(
        service::LockManager::new(store, cfg.locks.lock_minutes),
        cfg.locks.reap_interval_secs,
    );

    let cancel = CancellationToken::new();

    let watchdog_handle = watchdog.start(cancel.clone());
    let reaper_handle = reaper.start(cancel.clone());

    info!(
        "custody jobs started: network={:?} currencies={:?}",
        cfg.get_network(),
        cfg.monitor.currencies
    );

    tokio::signal::ctrl_c().await?;
    // signal background jobs to stop running
    cancel.cancel();

    watchdog_handle.await?;
    reaper_handle.await?;

    info!("Application successfully shut down");

    Ok(())
}

async fn reap(cfg_path: &str) -> anyhow::Result<()> {
    let cfg = config::read_config(cfg_path)?;
    let store = db::open_store(&cfg.db).await?;
    let locks = service::LockManager::new(store, cfg.locks.lock_minutes);

    let count = locks.reap().await?;
    println!("released: {}", count);
    Ok(())
}

async fn reset_db(cfg_path: &str) -> anyhow::Result<()> {
    let mut cfg = config::read_config(cfg_path)?;
    cfg.db.automigrate = false;

    let repo: db::Repo = db::open_postgres_db(&cfg.db).await?;
    repo.reset_schema().await?;

    info!("custody schema recreated");
    Ok(())
}

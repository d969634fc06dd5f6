pub mod broadcaster;
pub mod deposit_watchdog;
pub mod lock_manager;
pub mod lock_reaper;
pub mod monitor;
pub mod withdrawal;

pub use lock_manager::LockManager;
pub use monitor::AddressMonitor;
pub use withdrawal::WithdrawalService;

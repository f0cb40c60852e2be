pub mod action;
pub mod config;
pub mod display;
pub mod error;
pub mod fs;
pub mod ledger;
pub mod logging;
pub mod reconciler;
pub mod stats;
pub mod token;
pub mod types;
pub mod watch;

#[cfg(test)]
mod test_guards;

pub use action::{ActionRegistry, ActionRunner};
pub use config::{Config, RunConfig};
pub use error::{ImageLockError, Result};
pub use ledger::Ledger;
pub use reconciler::Reconciler;
pub use stats::RunStats;
pub use types::{FileKey, FreshnessToken};
pub use watch::{WatchCoordinator, WatchEvent};

//! Worker configuration.

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::api::OrderFilling;

/// Tunables for order placement and the poll loops.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between poll iterations
    pub poll_interval: Duration,

    /// Maximum price deviation in points accepted by the terminal
    pub deviation: u32,

    /// Smallest lot size submitted; smaller quantities are raised to it
    pub min_volume: Decimal,

    /// Decimal places lot sizes are rounded to
    pub volume_decimals: u32,

    /// Filling policy for queued opening orders
    pub open_filling: OrderFilling,

    /// Filling policy for closes and copied orders
    pub copy_filling: OrderFilling,

    /// Re-read the accounts file on every queue iteration
    pub reload_accounts: bool,

    /// Replicate leader closes onto followers
    pub replicate_closes: bool,

    /// Record the first leader snapshot without replicating it
    pub seed_on_start: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            deviation: 10,
            min_volume: dec!(0.01),
            volume_decimals: 2,
            open_filling: OrderFilling::Fok,
            copy_filling: OrderFilling::Ioc,
            reload_accounts: false,
            replicate_closes: true,
            seed_on_start: false,
        }
    }
}

impl WorkerConfig {
    /// Defaults for the leader/follower mirror loop.
    pub fn mirror() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            ..Default::default()
        }
    }
}

use std::net::{IpAddr, Ipv4Addr};

use clap::Parser;
use minepool_common::config::VERSION;

use crate::core::error::PoolError;

// bind addresses
pub const DEFAULT_STRATUM_BIND_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_STRATUM_PORT: u16 = 3333;

// Starting difficulty handed to every new session on a port that has no
// explicit override
pub const DEFAULT_DIFFICULTY: f64 = 32.0;

// Connection admission
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
// A session with no traffic for this long is closed by the watchdog
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 600;
// The idle watchdog polls on a fixed cadence instead of arming one timer
// per session, which bounds timer overhead at thousands of connections
pub const IDLE_SWEEP_INTERVAL_SECS: u64 = 30;

// Banning defaults, matching the ratio-after-sample rule:
// a session is only evaluated once it has submitted check_threshold shares
pub const DEFAULT_BAN_TIME_SECS: u64 = 600;
pub const DEFAULT_BAN_INVALID_PERCENT: f64 = 50.0;
pub const DEFAULT_BAN_CHECK_THRESHOLD: u64 = 500;
pub const DEFAULT_BAN_PURGE_INTERVAL_SECS: u64 = 300;

// VarDiff defaults: aim for one share every target_time seconds, never
// retargeting more often than retarget_time
pub const DEFAULT_VARDIFF_MIN: f64 = 8.0;
pub const DEFAULT_VARDIFF_MAX: f64 = 512.0;
pub const DEFAULT_VARDIFF_TARGET_TIME_SECS: u64 = 15;
pub const DEFAULT_VARDIFF_RETARGET_TIME_SECS: u64 = 90;
// Difficulty is only re-announced when the candidate moves more than this
// fraction away from the current value
pub const VARDIFF_HYSTERESIS: f64 = 0.10;

// Payment processing
pub const DEFAULT_PAYMENT_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_MINIMUM_PAYMENT: f64 = 0.01;
pub const DEFAULT_REQUIRED_CONFIRMATIONS: u32 = 100;

// Hashrate accounting: every valid share is appended to a per-worker
// time-series used for windowed hashrate estimates
pub const DEFAULT_HASHRATE_WINDOW_SECS: u64 = 300;
pub const HASHRATE_SERIES_TTL_SECS: u64 = 3600;
pub const HASHRATE_RETENTION_SECS: u64 = 86_400;
pub const HASHRATE_CLEANUP_INTERVAL_SECS: u64 = 3600;

/// Per-port listener settings
#[derive(Debug, Clone)]
pub struct PortConfig {
    pub port: u16,
    pub difficulty: f64,
    pub vardiff: Option<VarDiffConfig>,
}

/// Variable-difficulty retargeting policy for one port
#[derive(Debug, Clone)]
pub struct VarDiffConfig {
    pub min: f64,
    pub max: f64,
    pub target_time_secs: u64,
    pub retarget_time_secs: u64,
}

impl Default for VarDiffConfig {
    fn default() -> Self {
        Self {
            min: DEFAULT_VARDIFF_MIN,
            max: DEFAULT_VARDIFF_MAX,
            target_time_secs: DEFAULT_VARDIFF_TARGET_TIME_SECS,
            retarget_time_secs: DEFAULT_VARDIFF_RETARGET_TIME_SECS,
        }
    }
}

/// Invalid-share banning policy
#[derive(Debug, Clone)]
pub struct BanConfig {
    pub enabled: bool,
    /// Ban duration in seconds
    pub time_secs: u64,
    /// Ban when the invalid percentage exceeds this value
    pub invalid_percent: f64,
    /// Minimum processed shares before the ratio is evaluated
    pub check_threshold: u64,
    /// Sweep cadence for expired entries
    pub purge_interval_secs: u64,
}

impl Default for BanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            time_secs: DEFAULT_BAN_TIME_SECS,
            invalid_percent: DEFAULT_BAN_INVALID_PERCENT,
            check_threshold: DEFAULT_BAN_CHECK_THRESHOLD,
            purge_interval_secs: DEFAULT_BAN_PURGE_INTERVAL_SECS,
        }
    }
}

/// Payment cycle settings
#[derive(Debug, Clone)]
pub struct PaymentConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Rewards below this amount are carried over instead of paid
    pub minimum_payment: f64,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: DEFAULT_PAYMENT_INTERVAL_SECS,
            minimum_payment: DEFAULT_MINIMUM_PAYMENT,
        }
    }
}

/// A fee recipient takes a percentage of every block reward off the top
#[derive(Debug, Clone)]
pub struct FeeRecipient {
    pub address: String,
    pub percent: f64,
}

/// Full configuration for one pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub name: String,
    pub bind_address: IpAddr,
    pub ports: Vec<PortConfig>,
    pub max_connections: usize,
    pub connection_timeout_secs: u64,
    pub required_confirmations: u32,
    pub banning: BanConfig,
    pub payments: PaymentConfig,
    pub fee_recipients: Vec<FeeRecipient>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "pool".to_owned(),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ports: vec![PortConfig {
                port: DEFAULT_STRATUM_PORT,
                difficulty: DEFAULT_DIFFICULTY,
                vardiff: None,
            }],
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connection_timeout_secs: DEFAULT_CONNECTION_TIMEOUT_SECS,
            required_confirmations: DEFAULT_REQUIRED_CONFIRMATIONS,
            banning: BanConfig::default(),
            payments: PaymentConfig::default(),
            fee_recipients: Vec::new(),
        }
    }
}

/// Command-line configuration for the daemon binary
#[derive(Debug, Parser)]
#[command(name = "minepool_daemon", version = VERSION, about = "Mining pool backend daemon")]
pub struct CliConfig {
    /// Pool name, used as the key prefix in the shared store
    #[arg(long, default_value = "pool")]
    pub pool_name: String,

    /// Address the stratum listeners bind to
    #[arg(long, default_value = DEFAULT_STRATUM_BIND_ADDRESS)]
    pub bind_address: IpAddr,

    /// Stratum port
    #[arg(long, default_value_t = DEFAULT_STRATUM_PORT)]
    pub stratum_port: u16,

    /// Starting session difficulty
    #[arg(long, default_value_t = DEFAULT_DIFFICULTY)]
    pub difficulty: f64,

    /// Enable variable-difficulty retargeting
    #[arg(long)]
    pub vardiff: bool,

    #[arg(long, default_value_t = DEFAULT_VARDIFF_MIN)]
    pub vardiff_min: f64,

    #[arg(long, default_value_t = DEFAULT_VARDIFF_MAX)]
    pub vardiff_max: f64,

    /// Target seconds between shares per session
    #[arg(long, default_value_t = DEFAULT_VARDIFF_TARGET_TIME_SECS)]
    pub vardiff_target_time: u64,

    /// Minimum seconds between retargets per session
    #[arg(long, default_value_t = DEFAULT_VARDIFF_RETARGET_TIME_SECS)]
    pub vardiff_retarget_time: u64,

    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    /// Seconds of inactivity before a session is closed
    #[arg(long, default_value_t = DEFAULT_CONNECTION_TIMEOUT_SECS)]
    pub connection_timeout: u64,

    /// Disable invalid-share banning
    #[arg(long)]
    pub disable_banning: bool,

    #[arg(long, default_value_t = DEFAULT_BAN_TIME_SECS)]
    pub ban_time: u64,

    #[arg(long, default_value_t = DEFAULT_BAN_INVALID_PERCENT)]
    pub ban_invalid_percent: f64,

    #[arg(long, default_value_t = DEFAULT_BAN_CHECK_THRESHOLD)]
    pub ban_check_threshold: u64,

    #[arg(long, default_value_t = DEFAULT_BAN_PURGE_INTERVAL_SECS)]
    pub ban_purge_interval: u64,

    /// Enable the payment cycle (requires a disbursement sender)
    #[arg(long)]
    pub enable_payments: bool,

    #[arg(long, default_value_t = DEFAULT_PAYMENT_INTERVAL_SECS)]
    pub payment_interval: u64,

    #[arg(long, default_value_t = DEFAULT_MINIMUM_PAYMENT)]
    pub minimum_payment: f64,

    /// Confirmations before a discovered block becomes payable
    #[arg(long, default_value_t = DEFAULT_REQUIRED_CONFIRMATIONS)]
    pub required_confirmations: u32,

    /// Fee recipient as "address:percent"; may be repeated
    #[arg(long = "fee-recipient")]
    pub fee_recipients: Vec<String>,
}

impl CliConfig {
    /// Build the structured pool configuration from the flat CLI flags
    pub fn into_pool_config(self) -> Result<PoolConfig, PoolError> {
        let mut fee_recipients = Vec::with_capacity(self.fee_recipients.len());
        for raw in &self.fee_recipients {
            let (address, percent) = raw.rsplit_once(':').ok_or_else(|| {
                PoolError::Config(format!("invalid fee recipient '{}', expected address:percent", raw))
            })?;
            let percent: f64 = percent.parse().map_err(|_| {
                PoolError::Config(format!("invalid fee percent in '{}'", raw))
            })?;
            if !(0.0..=100.0).contains(&percent) {
                return Err(PoolError::Config(format!(
                    "fee percent out of range in '{}'",
                    raw
                )));
            }
            fee_recipients.push(FeeRecipient {
                address: address.to_owned(),
                percent,
            });
        }

        let total_fee: f64 = fee_recipients.iter().map(|r| r.percent).sum();
        if total_fee >= 100.0 {
            return Err(PoolError::Config(format!(
                "fee recipients claim {}% of every reward",
                total_fee
            )));
        }

        let vardiff = self.vardiff.then(|| VarDiffConfig {
            min: self.vardiff_min,
            max: self.vardiff_max,
            target_time_secs: self.vardiff_target_time,
            retarget_time_secs: self.vardiff_retarget_time,
        });

        Ok(PoolConfig {
            name: self.pool_name,
            bind_address: self.bind_address,
            ports: vec![PortConfig {
                port: self.stratum_port,
                difficulty: self.difficulty,
                vardiff,
            }],
            max_connections: self.max_connections,
            connection_timeout_secs: self.connection_timeout,
            required_confirmations: self.required_confirmations,
            banning: BanConfig {
                enabled: !self.disable_banning,
                time_secs: self.ban_time,
                invalid_percent: self.ban_invalid_percent,
                check_threshold: self.ban_check_threshold,
                purge_interval_secs: self.ban_purge_interval,
            },
            payments: PaymentConfig {
                enabled: self.enable_payments,
                interval_secs: self.payment_interval,
                minimum_payment: self.minimum_payment,
            },
            fee_recipients,
        })
    }
}

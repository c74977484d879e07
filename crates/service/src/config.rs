use std::net::SocketAddr;
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use chrono::Duration as ChronoDuration;
use clap::Parser;
use gantry_bundler::{ProposerConfig, RelayerConfig};
use gantry_pool::PoolConfig;
use gantry_sim::ValidatorConfig;
use tracing::Level;
use url::Url;

use crate::service::BundlingMode;

/// CLI entry point for the bundler service.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "An ERC-4337 user-operation bundler")]
pub struct Args {
    #[arg(long, env, required = true, help = "HTTP JSON-RPC endpoint of the ledger node")]
    pub rpc_url: Url,

    #[arg(long, env, required = true)]
    pub chain_id: u64,

    #[arg(
        long,
        env,
        default_value = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789",
        help = "Entry-point contract address"
    )]
    pub entry_point: Address,

    /// Private keys funding bundle submissions, one transaction in flight
    /// per key. Format: 0x-prefixed 32-byte hex, comma separated.
    #[arg(long, env, value_delimiter = ',', required = true)]
    pub submission_keys: Vec<B256>,

    #[arg(long, env, default_value = "auto", help = "Bundling mode, auto or manual")]
    pub bundle_mode: BundlingMode,

    #[arg(
        long,
        env,
        default_value = "1000",
        help = "Interval in milliseconds between automatic bundling attempts"
    )]
    pub bundle_interval_ms: u64,

    #[arg(
        long,
        env,
        default_value = "5",
        help = "Submission attempts before an entry is cancelled"
    )]
    pub max_submit_attempts: u32,

    #[arg(
        long,
        env,
        default_value = "900",
        help = "Age in seconds past which a pool entry may be replaced without a fee bump"
    )]
    pub entry_ttl_secs: u64,

    #[arg(
        long,
        env,
        default_value = "3600",
        help = "How long finished entries stay queryable before purge, in seconds"
    )]
    pub archive_ttl_secs: u64,

    #[arg(
        long,
        env,
        default_value = "10",
        help = "Fee increase in percent required to replace a live entry in place"
    )]
    pub replacement_fee_bump_percent: u64,

    #[arg(
        long,
        env,
        default_value = "false",
        help = "Skip trace-based validation; only safe against trusted submitters"
    )]
    pub unsafe_validation: bool,

    #[arg(
        long,
        env,
        default_value = "bundlerCollectorTracer",
        help = "Tracer passed to debug_traceCall for validation replay"
    )]
    pub tracer: String,

    #[arg(
        long,
        env,
        default_value = "false",
        help = "Submit through eth_sendRawTransactionConditional"
    )]
    pub conditional: bool,

    #[arg(
        long,
        env,
        default_value = "false",
        help = "Re-offer bundles to a private relay on every new head instead of public broadcast"
    )]
    pub private_relay: bool,

    #[arg(
        long,
        env,
        default_value = "false",
        help = "Price bundles at the oracle estimate instead of the members' fees"
    )]
    pub oracle_fee_direct: bool,

    #[arg(long, env, default_value = "10000000", help = "Gas ceiling for one bundle")]
    pub max_bundle_gas: u64,

    /// Fee recipient for bundle transactions. Defaults to the submitting
    /// identity when unset or when its balance runs low.
    #[arg(long, env)]
    pub beneficiary: Option<Address>,

    #[arg(
        long,
        env,
        value_delimiter = ',',
        help = "Entities exempt from reputation rules"
    )]
    pub whitelist: Vec<Address>,

    #[arg(
        long,
        env,
        value_delimiter = ',',
        help = "Entities rejected unconditionally"
    )]
    pub blacklist: Vec<Address>,

    #[arg(
        long,
        env,
        default_value = "1000",
        help = "Interval in milliseconds between new-head polls"
    )]
    pub block_poll_interval_ms: u64,

    /// Enable the Prometheus metrics endpoint
    #[arg(long, env, default_value = "true")]
    pub metrics: bool,

    /// Address to serve Prometheus metrics on
    #[arg(long, env, default_value = "0.0.0.0:9000")]
    pub metrics_addr: SocketAddr,

    #[arg(long, env, default_value = "info")]
    pub log_level: Level,

    /// Format for logs, can be json or text
    #[arg(long, env, default_value = "text")]
    pub log_format: String,
}

impl Args {
    pub fn pool_config(&self) -> PoolConfig {
        let mut config = PoolConfig::new(self.chain_id, self.entry_point);
        config.entry_ttl = ChronoDuration::seconds(self.entry_ttl_secs as i64);
        config.archive_ttl = ChronoDuration::seconds(self.archive_ttl_secs as i64);
        config.replacement_fee_bump_percent = self.replacement_fee_bump_percent;
        config
    }

    pub fn validator_config(&self) -> ValidatorConfig {
        ValidatorConfig::new(self.entry_point)
    }

    pub fn proposer_config(&self) -> ProposerConfig {
        ProposerConfig {
            max_bundle_gas: U256::from(self.max_bundle_gas),
            oracle_fee_direct: self.oracle_fee_direct,
            ..ProposerConfig::default()
        }
    }

    pub fn relayer_config(&self) -> RelayerConfig {
        let mut config = RelayerConfig::new(self.chain_id, self.entry_point);
        config.beneficiary = self.beneficiary;
        config.conditional = self.conditional;
        config
    }

    pub fn bundle_interval(&self) -> Duration {
        Duration::from_millis(self.bundle_interval_ms)
    }

    pub fn block_poll_interval(&self) -> Duration {
        Duration::from_millis(self.block_poll_interval_ms)
    }
}

//! Bundler binary entry point.

use std::sync::Arc;

use alloy_provider::RootProvider;
use clap::Parser;
use dotenvy::dotenv;
use gantry_bundler::{
    BundleProposer, ClassicRelayer, IdentityPool, PrivateRelayer, Relayer,
};
use gantry_pool::{InMemoryStore, UoPool};
use gantry_provider::AbiEntryPointCodec;
use gantry_provider::alloy::{AlloyEthRpc, NodeFeeOracle};
use gantry_reputation::{ReputationParams, ReputationTracker, StakeRequirements};
use gantry_service::{Args, BundlerService};
use gantry_sim::{SafeValidator, UnsafeValidator, Validator};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args = Args::parse();

    let log_format = args.log_format.to_lowercase();
    let log_level = args.log_level.to_string();

    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::new(log_level))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(log_level))
            .with_ansi(false)
            .init();
    }

    if args.metrics {
        PrometheusBuilder::new()
            .with_http_listener(args.metrics_addr)
            .install()
            .expect("failed to setup Prometheus endpoint");
        info!(addr = %args.metrics_addr, "metrics endpoint listening");
    }

    let provider = RootProvider::new_http(args.rpc_url.clone());
    let rpc = Arc::new(AlloyEthRpc::new(
        provider.clone(),
        args.tracer.clone(),
        args.block_poll_interval(),
    ));
    let codec = Arc::new(AbiEntryPointCodec);
    let fee_oracle = Arc::new(NodeFeeOracle::new(provider));

    let reputation = Arc::new(ReputationTracker::new(
        ReputationParams::default(),
        StakeRequirements::default(),
        args.whitelist.iter().copied().collect(),
        args.blacklist.iter().copied().collect(),
    ));

    let pool = Arc::new(UoPool::new(
        args.pool_config(),
        reputation.clone(),
        Arc::new(InMemoryStore::new()),
    ));
    let recovered = pool.recover().await?;
    if recovered > 0 {
        info!(recovered, "recovered pool entries from the store");
    }

    let validator: Arc<dyn Validator> = if args.unsafe_validation {
        warn!("trace-based validation disabled; do not expose to untrusted submitters");
        Arc::new(UnsafeValidator::new(
            rpc.clone(),
            codec.clone(),
            args.validator_config(),
        ))
    } else {
        Arc::new(SafeValidator::new(
            rpc.clone(),
            codec.clone(),
            reputation.clone(),
            args.validator_config(),
        ))
    };

    let identities = IdentityPool::from_keys(&args.submission_keys)?;
    info!(
        identities = identities.len(),
        addresses = ?identities.addresses(),
        "submission identities loaded"
    );

    let relayer: Arc<dyn Relayer> = if args.private_relay {
        Arc::new(PrivateRelayer::new(
            rpc.clone(),
            codec.clone(),
            identities,
            args.relayer_config(),
        ))
    } else {
        Arc::new(ClassicRelayer::new(
            rpc.clone(),
            codec.clone(),
            identities,
            args.relayer_config(),
        ))
    };

    let proposer = BundleProposer::new(
        pool.clone(),
        validator.clone(),
        rpc,
        fee_oracle,
        reputation.clone(),
        args.proposer_config(),
    );

    let service = BundlerService::new(
        pool,
        validator,
        proposer,
        relayer,
        reputation,
        args.bundle_mode,
        args.bundle_interval(),
        args.max_submit_attempts,
    );

    info!(
        chain_id = args.chain_id,
        entry_point = %args.entry_point,
        mode = %args.bundle_mode,
        "bundler starting"
    );
    service.run().await;
    Ok(())
}

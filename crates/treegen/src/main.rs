// Copyright 2025 RISC Zero, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{path::PathBuf, sync::Arc, time::Duration};

use alloy::{
    primitives::Address,
    providers::{Provider, ProviderBuilder},
    rpc::client::RpcClient,
    transports::layers::RetryBackoffLayer,
};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rpl_rewards::{
    fetch_rewards_event, merkle, reconcile, resolve_interval, DutyOverrides, EngineConfig,
    HttpBeaconClient, HttpGatewayStore, Reconciled, RewardLeaf, RewardsEvent, RewardsFile,
    SnapshotFile, TreeGenerator,
};
use serde::Serialize;
use url::Url;

/// Generate, verify and query rewards interval trees.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Command,

    /// Whether to log in JSON format.
    #[clap(long, env, default_value_t = false, global = true)]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute the rewards tree of the interval closed by a network state snapshot.
    Generate(GenerateArgs),
    /// Check a local rewards file against the on-chain root, downloading the canonical file
    /// if needed.
    Verify(VerifyArgs),
    /// Print the amounts and Merkle proof of a node.
    Proof(ProofArgs),
}

#[derive(clap::Args, Debug)]
struct GenerateArgs {
    /// URL of the beacon node REST API.
    #[clap(long, env)]
    beacon_url: Url,

    /// Network state snapshot (JSON) taken at the end of the interval.
    #[clap(long)]
    snapshot: PathBuf,

    /// URL of the Ethereum RPC endpoint, used to look up the previous interval's event.
    #[clap(long, env, requires = "rewards_pool", conflicts_with = "previous_event")]
    rpc_url: Option<Url>,

    /// Address of the rewards pool contract.
    #[clap(long, env)]
    rewards_pool: Option<Address>,

    /// First block to search for the previous interval's event.
    #[clap(long, default_value = "0")]
    from_block: u64,

    /// The previous interval's event (JSON), instead of querying the chain.
    #[clap(long)]
    previous_event: Option<PathBuf>,

    /// Engine configuration file (TOML).
    #[clap(long)]
    config: Option<PathBuf>,

    /// Directory to write the rewards and performance files to.
    #[clap(long, default_value = ".")]
    out_dir: PathBuf,

    /// Compress the output files with gzip.
    #[clap(long, default_value_t = false)]
    gzip: bool,

    /// Known missed duties (JSON map of validator index to epochs).
    #[clap(long)]
    overrides: Option<PathBuf>,

    /// Number of epochs to fetch concurrently.
    #[clap(long)]
    workers: Option<usize>,

    /// Abort generation after this many seconds.
    #[clap(long)]
    timeout: Option<u64>,

    /// Number of attempts at the whole run before quitting on a transient error.
    #[clap(long, default_value = "3")]
    retries: u32,

    /// Directory for replay checkpoints, so an interrupted run resumes where it stopped.
    #[clap(long, env)]
    checkpoint_dir: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct VerifyArgs {
    /// URL of the Ethereum RPC endpoint.
    #[clap(long, env)]
    rpc_url: Url,

    /// Address of the rewards pool contract.
    #[clap(long, env)]
    rewards_pool: Address,

    /// Interval index.
    #[clap(long)]
    index: u64,

    /// First block to search for the interval's event.
    #[clap(long, default_value = "0")]
    from_block: u64,

    /// Local rewards file, if any.
    #[clap(long)]
    file: Option<PathBuf>,

    /// Network name used in file names.
    #[clap(long, default_value = "mainnet")]
    network: String,

    /// Content gateway URL templates with `{cid}` and `{file}` placeholders, tried in order.
    #[clap(long = "gateway")]
    gateways: Vec<String>,

    /// Directory to store a downloaded canonical file in.
    #[clap(long, default_value = ".")]
    out_dir: PathBuf,
}

#[derive(clap::Args, Debug)]
struct ProofArgs {
    /// Rewards file, plain or gzip compressed.
    #[clap(long)]
    file: PathBuf,

    /// Node address.
    #[clap(long)]
    node: Address,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProofOutput {
    index: u64,
    node: Address,
    collateral_rpl: String,
    oracle_dao_rpl: String,
    smoothing_pool_eth: String,
    merkle_root: alloy::primitives::B256,
    merkle_proof: Vec<alloy::primitives::B256>,
    verified: bool,
}

fn connect(rpc_url: Url) -> impl Provider {
    ProviderBuilder::new()
        .connect_client(
            RpcClient::builder().layer(RetryBackoffLayer::new(3, 1000, 200)).http(rpc_url),
        )
}

fn read_json<T: serde::de::DeserializeOwned>(path: &PathBuf, what: &str) -> Result<T> {
    let content = std::fs::read(path)
        .with_context(|| format!("Failed to read {what} from {}", path.display()))?;
    serde_json::from_slice(&content)
        .with_context(|| format!("Failed to parse {what} from {}", path.display()))
}

async fn generate(args: &GenerateArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    config.compress |= args.gzip;
    if let Some(workers) = args.workers {
        config.worker_count = workers;
    }
    if args.timeout.is_some() {
        config.timeout_secs = args.timeout;
    }
    if args.checkpoint_dir.is_some() {
        config.checkpoint_dir = args.checkpoint_dir.clone();
    }
    config.validate()?;

    let SnapshotFile { end, state } = read_json(&args.snapshot, "snapshot")?;
    let overrides: DutyOverrides = match &args.overrides {
        Some(path) => read_json(path, "duty overrides")?,
        None => DutyOverrides::new(),
    };

    let previous: Option<RewardsEvent> = match (&args.previous_event, &args.rpc_url) {
        _ if end.index == 0 => None,
        (Some(path), _) => Some(read_json(path, "previous event")?),
        (None, Some(rpc_url)) => {
            let pool = args.rewards_pool.context("--rewards-pool is required with --rpc-url")?;
            let provider = connect(rpc_url.clone());
            let event = fetch_rewards_event(
                &provider,
                pool,
                end.index - 1,
                args.from_block,
                end.execution_block,
            )
            .await?;
            Some(event)
        }
        (None, None) => {
            bail!("interval {} needs --previous-event or --rpc-url", end.index)
        }
    };

    let client = HttpBeaconClient::new(args.beacon_url.clone(), state.beacon().slots_per_epoch)?;
    let compress = config.compress;
    let generator = TreeGenerator::new(client, config);
    let state = Arc::new(state);

    let mut failures = 0u32;
    let generated = loop {
        let attempt = async {
            let interval =
                resolve_interval(generator.replayer(), state.beacon(), previous.as_ref(), &end)
                    .await?;
            generator.generate(&interval, state.clone(), overrides.clone()).await
        };
        match attempt.await {
            Ok(generated) => break generated,
            Err(e) if e.is_transient() && failures + 1 < args.retries => {
                failures += 1;
                tracing::error!("Error generating interval {}: {e:?}", end.index);
                tracing::info!("Retrying ({failures}/{})", args.retries);
                tokio::time::sleep(Duration::from_secs(failures as u64 * 10)).await;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to generate interval {}", end.index))
            }
        }
    };

    std::fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("Failed to create {}", args.out_dir.display()))?;
    let (rewards_path, performance_path) = generated.write(&args.out_dir, compress)?;
    tracing::info!("Wrote {} and {}", rewards_path.display(), performance_path.display());
    println!("{}", generated.root);
    Ok(())
}

async fn verify(args: &VerifyArgs) -> Result<()> {
    let provider = connect(args.rpc_url.clone());
    let latest = provider.get_block_number().await.context("Failed to get latest block")?;
    let event =
        fetch_rewards_event(&provider, args.rewards_pool, args.index, args.from_block, latest)
            .await?;

    let local = match &args.file {
        Some(path) if path.exists() => match RewardsFile::load(path) {
            Ok(file) => Some(file),
            Err(e) => {
                tracing::warn!("Ignoring unreadable rewards file {}: {e}", path.display());
                None
            }
        },
        _ => None,
    };

    let store = if args.gateways.is_empty() {
        HttpGatewayStore::default()
    } else {
        HttpGatewayStore::new(args.gateways.clone())
    };
    match reconcile(local, &event, &args.network, &store).await? {
        Reconciled::Local(file) => {
            println!("Interval {}: local file matches root {}", file.index, file.merkle_root);
        }
        Reconciled::Downloaded(file) => {
            std::fs::create_dir_all(&args.out_dir)
                .with_context(|| format!("Failed to create {}", args.out_dir.display()))?;
            let path = file.write(&args.out_dir, false)?;
            println!(
                "Interval {}: downloaded canonical file with root {} to {}",
                file.index,
                file.merkle_root,
                path.display()
            );
        }
    }
    Ok(())
}

fn proof(args: &ProofArgs) -> Result<ProofOutput> {
    let file = RewardsFile::load(&args.file)
        .with_context(|| format!("Failed to load rewards file {}", args.file.display()))?;
    let Some(entry) = file.node_rewards.get(&args.node) else {
        bail!("node {} has no rewards in interval {}", args.node, file.index);
    };
    let leaf = RewardLeaf::new(args.node, file.index, &entry.rewards()).hash(file.leaf_encoding);
    Ok(ProofOutput {
        index: file.index,
        node: args.node,
        collateral_rpl: entry.collateral_rpl.to_string(),
        oracle_dao_rpl: entry.oracle_dao_rpl.to_string(),
        smoothing_pool_eth: entry.smoothing_pool_eth.to_string(),
        merkle_root: file.merkle_root,
        merkle_proof: entry.merkle_proof.clone(),
        verified: merkle::verify(&entry.merkle_proof, &file.merkle_root, &leaf),
    })
}

async fn run(args: &Args) -> Result<()> {
    match &args.command {
        Command::Generate(args) => generate(args).await,
        Command::Verify(args) => verify(args).await,
        Command::Proof(args) => {
            let output = proof(args)?;
            println!("{}", serde_json::to_string_pretty(&output)?);
            if !output.verified {
                bail!("proof for {} does not verify against {}", output.node, output.merkle_root);
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .from_env_lossy();

    if args.log_json {
        tracing_subscriber::fmt().with_ansi(false).json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_ansi(false).with_env_filter(filter).init();
    }

    run(&args).await
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use alloy::primitives::U256;
    use clap::CommandFactory;
    use rpl_rewards::{
        aggregate::RplTotals,
        files::{performance_file_name, rewards_file_name},
        Interval, LeafEncoding, MerkleTree, MinipoolPerformanceFile, NodeRewards, RewardLedger,
    };
    use rpl_test_utils::{
        class, serve_beacon, write_previous_event, write_snapshot, MockBeacon, MockHistory,
        NodeParams,
    };

    use super::*;

    fn write_rewards_file(dir: &std::path::Path) -> PathBuf {
        let nodes: BTreeMap<Address, NodeRewards> = (1..=3u8)
            .map(|i| {
                (
                    Address::with_last_byte(i),
                    NodeRewards {
                        collateral_rpl: U256::from(i as u64 * 10),
                        oracle_dao_rpl: U256::ZERO,
                        smoothing_pool_eth: U256::from(i as u64),
                    },
                )
            })
            .collect();
        let ledger = RewardLedger {
            nodes,
            rpl: RplTotals {
                total: U256::from(100u64),
                collateral_rpl: U256::from(60u64),
                oracle_dao_rpl: U256::ZERO,
                treasury_rpl: U256::from(40u64),
            },
            smoothing_pool_balance: U256::from(6u64),
            node_eth: U256::from(6u64),
            user_eth: U256::ZERO,
            carried_over_eth: U256::ZERO,
        };
        let interval = Interval {
            index: 5,
            start_epoch: 100,
            end_epoch: 199,
            consensus_start_block: 3200,
            consensus_end_block: 6399,
            execution_start_block: 103_200,
            execution_end_block: 106_399,
            start_time: 1_577_875_200,
            end_time: 1_577_913_588,
            intervals_passed: 1,
        };
        let tree = MerkleTree::build(5, &ledger.nodes, LeafEncoding::V1);
        let file = RewardsFile::new("mainnet", &interval, &ledger, &tree).unwrap();
        file.write(dir, true).unwrap()
    }

    #[test]
    fn cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn generate_requires_pool_with_rpc() {
        let parsed = Args::try_parse_from([
            "rpl-treegen",
            "generate",
            "--beacon-url",
            "http://localhost:5052",
            "--snapshot",
            "snapshot.json",
            "--rpc-url",
            "http://localhost:8545",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn proof_verifies_for_listed_node() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_rewards_file(dir.path());
        let output =
            proof(&ProofArgs { file: path, node: Address::with_last_byte(2) }).unwrap();
        assert!(output.verified);
        assert_eq!(output.collateral_rpl, "20");
        assert_eq!(output.smoothing_pool_eth, "2");
    }

    #[tokio::test]
    async fn proof_for_unknown_node_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_rewards_file(dir.path());
        let args = Args {
            command: Command::Proof(ProofArgs { file: path, node: Address::with_last_byte(9) }),
            log_json: false,
        };
        let err = run(&args).await.unwrap_err();
        assert!(err.to_string().contains("has no rewards"));
    }

    fn generate_args(beacon_url: Url, dir: &std::path::Path) -> GenerateArgs {
        GenerateArgs {
            beacon_url,
            snapshot: dir.join("snapshot.json"),
            rpc_url: None,
            rewards_pool: None,
            from_block: 0,
            previous_event: Some(dir.join("previous.json")),
            config: None,
            out_dir: dir.join("out"),
            gzip: true,
            overrides: None,
            workers: Some(4),
            timeout: None,
            retries: 1,
            checkpoint_dir: Some(dir.join("checkpoints")),
        }
    }

    #[tokio::test]
    async fn generate_writes_files_matching_the_engine() {
        let mut history = MockHistory::new();
        history.end_epoch = history.start_epoch + 9;
        let sp = NodeParams {
            eight_eth_minipools: 1,
            collateral_rpl: 10,
            smoothing_pool: true,
            ..Default::default()
        };
        for _ in 0..3 {
            let node = history.new_node(class::SINGLE_EIGHT_ETH_SP, sp);
            history.nodes.push(node);
        }
        let plain = NodeParams { smoothing_pool: false, ..sp };
        let node = history.new_node(class::SINGLE_EIGHT_ETH, plain);
        history.nodes.push(node);

        let dir = tempfile::tempdir().unwrap();
        write_snapshot(&history, dir.path().join("snapshot.json")).unwrap();
        write_previous_event(&history, dir.path().join("previous.json")).unwrap();
        let missed = history.nodes[0].minipools[0].validator_index;
        let chain = || MockBeacon::for_history(&history).with_missed_attestation(missed, 103);
        let server = serve_beacon(chain()).await;
        let beacon_url = Url::parse(&format!("{}/", server.uri())).unwrap();

        let args = Args {
            command: Command::Generate(generate_args(beacon_url, dir.path())),
            log_json: false,
        };
        run(&args).await.unwrap();

        let expected = TreeGenerator::new(Arc::new(chain()), EngineConfig::default())
            .generate(
                &history.interval().unwrap(),
                Arc::new(history.network_state().unwrap()),
                DutyOverrides::new(),
            )
            .await
            .unwrap();

        let out_dir = dir.path().join("out");
        let rewards_path = out_dir.join(rewards_file_name("mainnet", history.index, true));
        let written = RewardsFile::load(&rewards_path).unwrap();
        assert_eq!(written, expected.rewards_file);
        let performance = MinipoolPerformanceFile::load(
            out_dir.join(performance_file_name("mainnet", history.index, true)),
        )
        .unwrap();
        assert_eq!(performance, expected.performance_file);
        let missed_minipool = history.nodes[0].minipools[0].address;
        assert_eq!(performance.minipool_performance[&missed_minipool].missed_attestations, 1);

        // The finished run leaves no checkpoints behind.
        let leftover = std::fs::read_dir(dir.path().join("checkpoints")).unwrap().count();
        assert_eq!(leftover, 0);

        for node in &history.nodes {
            let args = ProofArgs { file: rewards_path.clone(), node: node.address };
            let output = proof(&args).unwrap();
            assert!(output.verified, "proof for {}", node.address);
        }
    }
}

#![warn(clippy::all, clippy::pedantic, clippy::cargo, clippy::nursery)]

use std::{fs, path::PathBuf, process::ExitCode};

use anyhow::{Context as _, Result as AnyResult};
use dotenv::dotenv;
use lib::{
    allocator::{self, Allocator},
    chain_watcher,
    logging::LogOptions,
    metrics, registry, run, run_multi, shutdown,
};
use serde::Deserialize;
use structopt::StructOpt;
use tokio::{runtime, spawn, sync::oneshot};
use tracing::{error, info};
use types::ChainId;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\n",
    env!("CARGO_PKG_AUTHORS"),
    "\n",
    env!("CARGO_PKG_HOMEPAGE"),
    "\n",
    env!("CARGO_PKG_DESCRIPTION"),
);

#[cfg(not(feature = "mimalloc"))]
#[global_allocator]
pub static ALLOCATOR: Allocator<allocator::StdAlloc> = allocator::new_std();

#[cfg(feature = "mimalloc")]
#[global_allocator]
pub static ALLOCATOR: Allocator<allocator::MiMalloc> = allocator::new_mimalloc();

#[derive(StructOpt)]
#[structopt(about = "Watch-tower for conditional orders")]
struct Options {
    #[structopt(flatten)]
    log: LogOptions,

    #[structopt(flatten)]
    metrics: metrics::Options,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt)]
enum Command {
    /// Watch a single chain until `SIGINT`/`SIGTERM`.
    Run(chain_watcher::Options),

    /// Watch every chain described in a JSON config file, one task per
    /// chain.
    RunMulti {
        /// Path to a JSON file containing an array of chain configs (see
        /// `ChainConfig` for the shape).
        #[structopt(long, env = "CONFIG")]
        config: PathBuf,
    },

    /// Stream the persisted registry for one chain as JSON.
    DumpDb {
        #[structopt(flatten)]
        registry: registry::Options,

        #[structopt(long, env = "CHAIN_ID")]
        chain_id: u64,
    },
}

/// A single chain's worth of [`chain_watcher::Options`], as read from a
/// `run-multi` config file. `structopt` has no way to repeat a flattened
/// option group within one process invocation, so `run-multi` is configured
/// out of band instead.
#[derive(Deserialize)]
struct ChainConfig {
    ethereum: String,
    ethereum_ws: Option<String>,
    composable_cow: Vec<String>,
    #[serde(default = "default_max_reorg")]
    max_reorg: usize,
    #[serde(default = "default_block_timeout_secs")]
    block_timeout_secs: u64,
    registry_path: PathBuf,
    orders_api: String,
    #[serde(default)]
    deployment_block: u64,
    #[serde(default = "default_page_size")]
    page_size: u64,
    #[serde(default = "default_chunk_size")]
    chunk_size: usize,
    #[serde(default = "default_watchdog_timeout_secs")]
    watchdog_timeout_secs: u64,
    #[serde(default = "default_process_every_num_blocks")]
    process_every_num_blocks: u64,
    #[serde(default = "default_replay_against_head")]
    replay_against_head: bool,
}

const fn default_max_reorg() -> usize {
    10
}

const fn default_block_timeout_secs() -> u64 {
    300
}

const fn default_page_size() -> u64 {
    5000
}

const fn default_chunk_size() -> usize {
    50
}

const fn default_watchdog_timeout_secs() -> u64 {
    30
}

const fn default_process_every_num_blocks() -> u64 {
    1
}

const fn default_replay_against_head() -> bool {
    true
}

impl ChainConfig {
    fn into_options(self) -> AnyResult<chain_watcher::Options> {
        Ok(chain_watcher::Options {
            ethereum: lib::ethereum::Options {
                ethereum: self.ethereum.parse().context("invalid `ethereum` URL")?,
                ethereum_ws: self
                    .ethereum_ws
                    .map(|url| url.parse())
                    .transpose()
                    .context("invalid `ethereum_ws` URL")?,
                composable_cow: self
                    .composable_cow
                    .iter()
                    .map(|address| address.parse())
                    .collect::<Result<_, _>>()
                    .context("invalid `composable_cow` address")?,
                max_reorg: self.max_reorg,
                block_timeout_secs: self.block_timeout_secs,
            },
            registry: registry::Options {
                registry_path: self.registry_path,
            },
            submission: lib::submission::Options {
                orders_api: self.orders_api.parse().context("invalid `orders_api` URL")?,
            },
            deployment_block: self.deployment_block,
            page_size: self.page_size,
            chunk_size: self.chunk_size,
            watchdog_timeout_secs: self.watchdog_timeout_secs,
            process_every_num_blocks: self.process_every_num_blocks,
            replay_against_head: self.replay_against_head,
        })
    }
}

fn load_chain_configs(path: &PathBuf) -> AnyResult<Vec<chain_watcher::Options>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("error reading config file {}", path.display()))?;
    let configs: Vec<ChainConfig> =
        serde_json::from_str(&raw).context("error parsing config file as a JSON array")?;
    configs.into_iter().map(ChainConfig::into_options).collect()
}

fn main() -> AnyResult<ExitCode> {
    dotenv().ok();
    let matches = Options::clap().long_version(VERSION).get_matches();
    let options = Options::from_clap(&matches);

    ALLOCATOR.start_metering();
    options.log.init()?;

    let result = runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("error creating Tokio runtime")?
        .block_on(run_command(options));

    match result {
        Ok(()) => {
            info!("program terminating normally");
            Ok(ExitCode::SUCCESS)
        }
        Err(error) => {
            error!(%error, "fatal startup error");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run_command(options: Options) -> AnyResult<()> {
    let metrics = options.metrics.clone();
    spawn(metrics::main(metrics));

    match options.command {
        Command::Run(chain_options) => {
            let (send, shutdown) = oneshot::channel();
            spawn(async move {
                if shutdown::signal_shutdown().await.is_ok() {
                    let _ = send.send(());
                }
            });
            run(chain_options, shutdown).await
        }
        Command::RunMulti { config } => {
            let configs = load_chain_configs(&config)?;
            let (send, shutdown) = oneshot::channel();
            spawn(async move {
                if shutdown::signal_shutdown().await.is_ok() {
                    let _ = send.send(());
                }
            });
            run_multi(configs, shutdown).await
        }
        Command::DumpDb { registry: registry_options, chain_id } => {
            let store = registry::SledStore::open(&registry_options)?;
            let dump = store.dump(ChainId::new(chain_id)).await?;
            println!("{dump}");
            Ok(())
        }
    }
}

//! Watch-tower for conditional orders: indexes `ConditionalOrderCreated`/
//! `MerkleRootSet` events per chain, polls each live order every block, and
//! submits the resulting discrete orders to the off-chain orders API
//! exactly once.
#![warn(clippy::all, clippy::pedantic, clippy::cargo, clippy::nursery)]

pub mod allocator;
pub mod chain_watcher;
pub mod ethereum;
pub mod factory;
pub mod indexer;
pub mod logging;
pub mod metrics;
pub mod notify;
pub mod orders;
pub mod poll;
pub mod registry;
pub mod revert;
pub mod shutdown;
pub mod submission;
mod utils;

use anyhow::Result as AnyResult;
use futures::future::try_join_all;
use tokio::sync::oneshot;
use tracing::info;

use crate::{chain_watcher::ChainWatcher, utils::spawn_or_abort};

/// Watch a single chain until it exits (fatally) or `shutdown` fires.
///
/// `shutdown` firing does not currently interrupt an in-flight chain
/// watcher task; it only stops waiting for one that runs forever, matching
/// the teacher's own `main`'s `// TODO: Graceful shutdown`.
#[allow(clippy::missing_errors_doc)]
pub async fn run(options: chain_watcher::Options, shutdown: oneshot::Receiver<()>) -> AnyResult<()> {
    let watcher = ChainWatcher::connect(options).await?;
    let chain = watcher_handle(watcher);

    info!("watch-tower started, waiting for shutdown signal");
    tokio::select! {
        result = chain => result?,
        _ = shutdown => {}
    }
    Ok(())
}

/// Watch every chain in `configs` concurrently, one task per chain, the
/// same way the teacher's `App::connect` concurrently connects independent
/// external resources before `main` spawns its green threads.
#[allow(clippy::missing_errors_doc)]
pub async fn run_multi(
    configs: Vec<chain_watcher::Options>,
    shutdown: oneshot::Receiver<()>,
) -> AnyResult<()> {
    let watchers = try_join_all(configs.into_iter().map(ChainWatcher::connect)).await?;
    let chains = watchers.len();
    for watcher in watchers {
        spawn_or_abort(watcher_handle(watcher));
    }

    info!(chains, "watch-tower started, waiting for shutdown signal");
    shutdown.await?;
    // TODO: Graceful shutdown
    Ok(())
}

async fn watcher_handle(watcher: ChainWatcher) -> AnyResult<()> {
    watcher.run().await
}

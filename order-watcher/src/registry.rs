//! Registry Store (C1): crash-safe, per-chain persistence for the owner →
//! conditional-orders map and the chain watcher's processing watermark.
//! Backed by `sled`, whose `Batch` gives the atomic multi-key commit the
//! spec requires without needing a SQL server.

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, Context as _, Result as AnyResult};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter_vec, Histogram, IntCounterVec,
};
use serde::{Deserialize, Serialize};
use structopt::StructOpt;
use tokio::task::spawn_blocking;
use tracing::{info, trace, warn};
use types::ChainId;
use web3::types::Address;

use crate::orders::ConditionalOrder;

/// Current on-disk layout version. Bump when a field is added/removed and
/// add a migration branch in [`migrate`].
const CURRENT_VERSION: u32 = 1;
const MAX_WRITE_ATTEMPTS: u32 = 10;

static OPS_COUNTER: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("registry_operations", "Registry operations by kind.", &["kind"])
        .unwrap()
});
static LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!("registry_latency_seconds", "Registry store latency in seconds.").unwrap()
});

#[derive(Clone, Debug, PartialEq, StructOpt)]
pub struct Options {
    /// Path to the on-disk sled database directory.
    #[structopt(long, env = "REGISTRY_PATH", default_value = "./registry")]
    pub registry_path: PathBuf,
}

pub type RegistryBlock = types::BlockInfo;

/// The full per-chain state persisted atomically on every write.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    pub owner_orders: HashMap<Address, Vec<ConditionalOrder>>,
    pub last_processed_block: Option<RegistryBlock>,
    pub last_notified_error: Option<DateTime<Utc>>,
}

impl Registry {
    /// Remove the last order for an owner drops the owner key; empty owner
    /// sets are never observable after a `write`.
    pub fn insert(&mut self, owner: Address, order: ConditionalOrder) -> bool {
        let orders = self.owner_orders.entry(owner).or_default();
        if orders.iter().any(|existing| existing.params == order.params) {
            return false;
        }
        orders.push(order);
        true
    }

    pub fn remove_owner_orders<F>(&mut self, owner: Address, mut predicate: F)
    where
        F: FnMut(&ConditionalOrder) -> bool,
    {
        if let Some(orders) = self.owner_orders.get_mut(&owner) {
            orders.retain(|order| !predicate(order));
            if orders.is_empty() {
                self.owner_orders.remove(&owner);
            }
        }
    }

    fn normalize(&mut self) {
        self.owner_orders.retain(|_, orders| !orders.is_empty());
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("sled error")]
    Sled(#[from] sled::Error),
    #[error("(de)serialization error")]
    Serde(#[from] serde_json::Error),
    #[error("storage retries exhausted after {0} attempts")]
    RetriesExhausted(u32),
}

fn version_key(chain: ChainId) -> String {
    format!("CONDITIONAL_ORDER_REGISTRY_VERSION_{chain}")
}

fn registry_key(chain: ChainId) -> String {
    format!("CONDITIONAL_ORDER_REGISTRY_{chain}")
}

fn last_processed_block_key(chain: ChainId) -> String {
    format!("LAST_PROCESSED_BLOCK_{chain}")
}

fn last_notified_error_key(chain: ChainId) -> String {
    format!("LAST_NOTIFIED_ERROR_{chain}")
}

#[derive(Clone)]
pub struct SledStore {
    db: Arc<sled::Db>,
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("SledStore").finish()
    }
}

impl SledStore {
    pub fn open(options: &Options) -> Result<Self, Error> {
        info!("Opening registry store at {}", options.registry_path.display());
        let db = sled::open(&options.registry_path)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// If absent, returns an empty registry with `lastProcessedBlock = {
    /// number: genesisBlock - 1 }` per spec.
    pub async fn load(&self, chain: ChainId, genesis_block: u64) -> Result<Registry, Error> {
        OPS_COUNTER.with_label_values(&["load"]).inc();
        let _timer = LATENCY.start_timer();
        let db = self.db.clone();
        spawn_blocking(move || Self::load_sync(&db, chain, genesis_block))
            .await
            .map_err(|_| sled::Error::Unsupported("blocking task panicked".to_string()))?
    }

    fn load_sync(db: &sled::Db, chain: ChainId, genesis_block: u64) -> Result<Registry, Error> {
        let version: u32 = match db.get(version_key(chain))? {
            Some(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|text| text.parse().ok())
                .unwrap_or(0),
            None => {
                return Ok(Registry {
                    owner_orders: HashMap::new(),
                    last_processed_block: Some(RegistryBlock {
                        number: genesis_block.saturating_sub(1),
                        timestamp: 0,
                        hash: Default::default(),
                    }),
                    last_notified_error: None,
                });
            }
        };

        let owner_orders: HashMap<Address, Vec<ConditionalOrder>> =
            match db.get(registry_key(chain))? {
                Some(bytes) => serde_json::from_slice(&bytes)?,
                None => HashMap::new(),
            };
        let last_processed_block = match db.get(last_processed_block_key(chain))? {
            Some(bytes) => Some(serde_json::from_slice(&bytes)?),
            None => None,
        };
        let last_notified_error = match db.get(last_notified_error_key(chain))? {
            Some(bytes) => Some(serde_json::from_slice(&bytes)?),
            None => None,
        };

        let mut registry = Registry {
            owner_orders,
            last_processed_block,
            last_notified_error,
        };
        if version < CURRENT_VERSION {
            migrate(&mut registry, version);
        }
        Ok(registry)
    }

    /// Atomic multi-key commit of `{version, ownerOrders, lastProcessedBlock,
    /// lastNotifiedError}`.
    pub async fn write(&self, chain: ChainId, registry: &Registry) -> Result<(), Error> {
        OPS_COUNTER.with_label_values(&["write"]).inc();
        let _timer = LATENCY.start_timer();
        let db = self.db.clone();
        let mut registry = registry.clone();
        registry.normalize();
        spawn_blocking(move || Self::write_sync(&db, chain, &registry))
            .await
            .map_err(|_| sled::Error::Unsupported("blocking task panicked".to_string()))?
    }

    fn write_sync(db: &sled::Db, chain: ChainId, registry: &Registry) -> Result<(), Error> {
        let mut batch = sled::Batch::default();
        batch.insert(
            version_key(chain).as_bytes(),
            CURRENT_VERSION.to_string().as_bytes(),
        );
        batch.insert(
            registry_key(chain).as_bytes(),
            serde_json::to_vec(&registry.owner_orders)?,
        );
        match &registry.last_processed_block {
            Some(block) => batch.insert(
                last_processed_block_key(chain).as_bytes(),
                serde_json::to_vec(block)?,
            ),
            None => batch.remove(last_processed_block_key(chain).as_bytes()),
        }
        match &registry.last_notified_error {
            Some(timestamp) => batch.insert(
                last_notified_error_key(chain).as_bytes(),
                serde_json::to_vec(timestamp)?,
            ),
            None => batch.remove(last_notified_error_key(chain).as_bytes()),
        }
        db.apply_batch(batch)?;
        db.flush()?;
        Ok(())
    }

    /// Retry `write` with exponential backoff, up to [`MAX_WRITE_ATTEMPTS`],
    /// before propagating a fatal error for the watchdog to act on.
    pub async fn write_with_retry(&self, chain: ChainId, registry: &Registry) -> AnyResult<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.write(chain, registry).await {
                Ok(()) => return Ok(()),
                Err(error) if attempt >= MAX_WRITE_ATTEMPTS => {
                    return Err(anyhow!(error))
                        .context(format!("registry write failed after {attempt} attempts"));
                }
                Err(error) => {
                    warn!(?error, attempt, "registry write failed, retrying");
                    let backoff = Duration::from_millis(100 * 2u64.pow(attempt.min(8)));
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// JSON-stable snapshot for operator tooling (`dump-db`).
    pub async fn dump(&self, chain: ChainId) -> Result<String, Error> {
        OPS_COUNTER.with_label_values(&["dump"]).inc();
        let registry = self.load(chain, 0).await?;
        trace!(chain = %chain, "dumping registry");
        Ok(serde_json::to_string_pretty(&registry)?)
    }
}

/// Recompute derived fields (`id`) from `params` when loading an
/// older-versioned registry, per spec §4.1.
fn migrate(registry: &mut Registry, from_version: u32) {
    warn!(from_version, to_version = CURRENT_VERSION, "migrating registry");
    for orders in registry.owner_orders.values_mut() {
        for order in orders.iter_mut() {
            order.id = order.params.id();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::orders::{ConditionalOrderParams, PollResult};
    use web3::types::H256;

    fn temp_options() -> Options {
        Options {
            registry_path: std::env::temp_dir().join(format!(
                "order-watcher-registry-test-{}",
                uuid_like_suffix()
            )),
        }
    }

    fn uuid_like_suffix() -> u64 {
        // No Date.now()/random available at authoring time; a fixed but
        // unique-enough per-test suffix is provided by the thread id hash.
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        hasher.finish()
    }

    #[tokio::test]
    async fn load_of_missing_registry_seeds_genesis_watermark() {
        let store = SledStore::open(&temp_options()).unwrap();
        let registry = store.load(ChainId::new(1), 100).await.unwrap();
        assert!(registry.owner_orders.is_empty());
        assert_eq!(registry.last_processed_block.unwrap().number, 99);
    }

    #[tokio::test]
    async fn round_trip_persistence_preserves_orders() {
        let store = SledStore::open(&temp_options()).unwrap();
        let chain = ChainId::new(1);
        let mut registry = store.load(chain, 1).await.unwrap();
        let owner = Address::repeat_byte(0x07);
        registry.insert(
            owner,
            ConditionalOrder::new(
                H256::repeat_byte(0xaa),
                ConditionalOrderParams {
                    handler: Address::repeat_byte(0x01),
                    salt: H256::repeat_byte(0x11),
                    static_input: vec![0x00],
                },
                Address::repeat_byte(0x02),
            ),
        );
        store.write(chain, &registry).await.unwrap();

        let reloaded = store.load(chain, 1).await.unwrap();
        assert_eq!(reloaded.owner_orders.len(), 1);
        assert_eq!(reloaded.owner_orders[&owner].len(), 1);
    }

    #[tokio::test]
    async fn empty_owner_sets_are_normalized_away_on_write() {
        let store = SledStore::open(&temp_options()).unwrap();
        let chain = ChainId::new(1);
        let mut registry = store.load(chain, 1).await.unwrap();
        registry.owner_orders.insert(Address::repeat_byte(0x09), Vec::new());
        store.write(chain, &registry).await.unwrap();

        let reloaded = store.load(chain, 1).await.unwrap();
        assert!(reloaded.owner_orders.is_empty());
    }

    /// A sweep over 125 orders with a chunk size of 50 commits the whole
    /// in-memory registry after each chunk. Simulating a crash right after
    /// the second chunk's commit (orders 0..100 polled) should leave the
    /// first 100 orders with their updated hint and the remaining 25
    /// untouched on reload, since the third chunk's poll results never made
    /// it into a commit.
    #[tokio::test]
    async fn crash_after_second_chunk_commit_leaves_the_third_chunk_unpolled() {
        const CHUNK_SIZE: usize = 50;
        const TOTAL_ORDERS: usize = 125;

        let store = SledStore::open(&temp_options()).unwrap();
        let chain = ChainId::new(1);
        let mut registry = store.load(chain, 1).await.unwrap();
        let owner = Address::repeat_byte(0x07);
        for i in 0..TOTAL_ORDERS {
            registry.insert(
                owner,
                ConditionalOrder::new(
                    H256::repeat_byte(0xaa),
                    ConditionalOrderParams {
                        handler: Address::repeat_byte(0x01),
                        salt: H256::from_low_u64_be(i as u64),
                        static_input: vec![],
                    },
                    Address::repeat_byte(0x02),
                ),
            );
        }

        for (chunk_index, chunk) in (0..TOTAL_ORDERS).collect::<Vec<_>>().chunks(CHUNK_SIZE).enumerate() {
            for &i in chunk {
                registry.owner_orders.get_mut(&owner).unwrap()[i].poll_result =
                    Some(PollResult::TryNextBlock { reason: "polled".to_string() });
            }
            store.write(chain, &registry).await.unwrap();
            if chunk_index == 1 {
                break; // simulate crash right after the second chunk's commit
            }
        }

        let reloaded = store.load(chain, 1).await.unwrap();
        let orders = &reloaded.owner_orders[&owner];
        assert_eq!(orders.len(), TOTAL_ORDERS);
        for order in &orders[..100] {
            assert!(matches!(order.poll_result, Some(PollResult::TryNextBlock { .. })));
        }
        for order in &orders[100..] {
            assert!(order.poll_result.is_none());
        }
    }

    proptest::proptest! {
        /// The JSON encoding `SledStore` persists each order batch with is
        /// lossless for any watermark block number, independent of sled.
        #[test]
        fn json_round_trip_preserves_the_watermark(number in 0u64..u64::MAX, timestamp in 0u64..u64::MAX, hash in 0u64..u64::MAX) {
            let registry = Registry {
                owner_orders: HashMap::new(),
                last_processed_block: Some(RegistryBlock {
                    number,
                    timestamp,
                    hash: H256::from_low_u64_be(hash),
                }),
                last_notified_error: None,
            };
            let encoded = serde_json::to_string(&registry).unwrap();
            let decoded: Registry = serde_json::from_str(&encoded).unwrap();
            pretty_assertions::assert_eq!(registry, decoded);
        }
    }
}

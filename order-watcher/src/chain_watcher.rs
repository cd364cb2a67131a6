//! Chain Watcher (C7): the per-chain driver. Warms up via paged
//! `eth_getLogs` backfill, then subscribes to live blocks, threading the
//! registry through the indexer and poll engine with a watchdog guarding
//! liveness.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, Result as AnyResult};
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};
use structopt::StructOpt;
use tokio::sync::{broadcast::error::RecvError, Mutex};
use tracing::{debug, error, info, warn};
use types::{BlockInfo as ChainBlockInfo, ChainId};
use web3::types::{Address, BlockHeader, BlockId, BlockNumber, FilterBuilder, Log};

use block_watcher::{Event as BlockEvent, Reorgable};

use crate::{
    ethereum::{self, Ethereum},
    factory::{BlockInfo as FactoryBlockInfo, LegacyOnlyFactory, OrderFactory},
    indexer::{self, FilterAction, FilterPolicy, OwnerAllowList},
    notify::{self, ErrorNotifier, LoggingNotifier},
    orders::{ConditionalOrder, OrderStatus, PollResult},
    poll,
    registry::{self, Registry, SledStore},
    submission::{self, SubmissionGate, SubmissionOutcome},
};

static BLOCK_HEIGHT: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("chain_watcher_block_height", "Last block height observed.").unwrap()
});
static BLOCK_PRODUCING_RATE: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "chain_watcher_block_producing_rate_seconds",
        "Seconds between consecutive block timestamps."
    )
    .unwrap()
});
static REORGS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("chain_watcher_reorgs", "Count of detected reorgs.").unwrap()
});
static REORG_DEPTH: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!("chain_watcher_reorg_depth", "Depth of detected reorgs.").unwrap()
});

#[derive(Clone, Debug, PartialEq, StructOpt)]
pub struct Options {
    #[structopt(flatten)]
    pub ethereum: ethereum::Options,

    #[structopt(flatten)]
    pub registry: registry::Options,

    #[structopt(flatten)]
    pub submission: submission::Options,

    /// First block to index from when no prior watermark exists.
    #[structopt(long, env = "DEPLOYMENT_BLOCK", default_value = "0")]
    pub deployment_block: u64,

    /// `eth_getLogs` page size during backfill. 0 means "up to the head in
    /// one page".
    #[structopt(long, env = "PAGE_SIZE", default_value = "5000")]
    pub page_size: u64,

    /// Conditional orders polled per registry commit during a C4 sweep.
    #[structopt(long, env = "CHUNK_SIZE", default_value = "50")]
    pub chunk_size: usize,

    /// Seconds without a new block before the watchdog considers the chain
    /// stuck.
    #[structopt(long, env = "WATCHDOG_TIMEOUT_SECS", default_value = "30")]
    pub watchdog_timeout_secs: u64,

    /// Only run the Poll Engine every Nth block (the Event Indexer still
    /// runs on every block).
    #[structopt(long, env = "PROCESS_EVERY_NUM_BLOCKS", default_value = "1")]
    pub process_every_num_blocks: u64,

    /// Use the current head block's number/timestamp (rather than the
    /// historical block being replayed) as the scheduling hint during
    /// backfill.
    #[structopt(long, env = "REPLAY_AGAINST_HEAD", default_value = "true")]
    pub replay_against_head: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Syncing,
    InSync,
    Unknown,
}

pub struct ChainWatcher {
    ethereum: Ethereum,
    ethereum_options: ethereum::Options,
    store: SledStore,
    submission: SubmissionGate,
    factory: Arc<dyn OrderFactory>,
    allow_list: OwnerAllowList,
    filter: FilterPolicy,
    notifier: Arc<dyn ErrorNotifier>,
    options: Options,
    state: Arc<Mutex<State>>,
    last_block_timestamp: Arc<AtomicU64>,
}

impl ChainWatcher {
    pub async fn connect(options: Options) -> AnyResult<Self> {
        let ethereum_options = options.ethereum.clone();
        let ethereum = Ethereum::connect(options.ethereum.clone()).await?;
        let store = SledStore::open(&options.registry)?;
        let submission = SubmissionGate::new(options.submission.clone());
        Ok(Self {
            ethereum,
            ethereum_options,
            store,
            submission,
            factory: Arc::new(LegacyOnlyFactory),
            allow_list: OwnerAllowList::default(),
            filter: FilterPolicy::default(),
            notifier: Arc::new(LoggingNotifier),
            options,
            state: Arc::new(Mutex::new(State::Syncing)),
            last_block_timestamp: Arc::new(AtomicU64::new(0)),
        })
    }

    #[must_use]
    pub fn with_factory(mut self, factory: Arc<dyn OrderFactory>) -> Self {
        self.factory = factory;
        self
    }

    #[must_use]
    pub fn with_allow_list(mut self, allow_list: OwnerAllowList) -> Self {
        self.allow_list = allow_list;
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: FilterPolicy) -> Self {
        self.filter = filter;
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn ErrorNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub async fn state(&self) -> State {
        *self.state.lock().await
    }

    /// Drive this chain forever: backfill, then live subscription, with a
    /// watchdog task running alongside.
    pub async fn run(self) -> AnyResult<()> {
        let chain = self.ethereum.chain.chain_id;
        let mut registry = self
            .store
            .load(chain, self.options.deployment_block)
            .await?;

        info!(%chain, "starting backfill");
        self.backfill(&mut registry).await?;
        *self.state.lock().await = State::InSync;
        info!(%chain, "backfill complete, switching to live mode");

        let watchdog = self.spawn_watchdog();
        let result = self.live(&mut registry).await;
        watchdog.abort();
        result
    }

    async fn backfill(&self, registry: &mut Registry) -> AnyResult<()> {
        let mut from_block = registry
            .last_processed_block
            .map_or(self.options.deployment_block, |block| block.number + 1);

        loop {
            let head_number = self.ethereum.web3.eth().block_number().await?.as_u64();
            if from_block > head_number {
                break;
            }
            let to_block = if self.options.page_size == 0 {
                head_number
            } else {
                (from_block + self.options.page_size - 1).min(head_number)
            };

            let logs = self.fetch_logs(from_block, to_block).await?;
            let by_block = group_logs_by_block(logs);

            if !by_block.is_empty() {
                let head_block = self.block_info(head_number).await?;
                for (number, block_logs) in by_block {
                    for log in &block_logs {
                        indexer::apply_log(registry, log, &self.allow_list, &self.filter)?;
                    }
                    let replay_block = if self.options.replay_against_head {
                        head_block
                    } else {
                        self.block_info(number).await?
                    };
                    self.sweep(registry, replay_block).await?;
                }
            }

            let watermark = self.block_info(to_block).await?;
            registry.last_processed_block = Some(watermark);
            self.commit(registry).await?;

            debug!(from_block, to_block, head_number, "backfill page committed");
            if to_block >= head_number {
                break;
            }
            from_block = to_block + 1;
        }
        Ok(())
    }

    async fn live(&self, registry: &mut Registry) -> AnyResult<()> {
        let ws_url = Ethereum::websocket_url(&self.ethereum_options);
        let mut receiver = block_watcher::start(ws_url, self.ethereum.chain.max_reorg)?;
        let mut last_number: Option<u64> = registry.last_processed_block.map(|block| block.number);
        let mut last_timestamp: Option<u64> = None;

        loop {
            let event: BlockEvent = match receiver.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "live block stream lagged, continuing");
                    continue;
                }
                Err(RecvError::Closed) => return Err(anyhow!("live block stream closed")),
            };

            match event {
                Reorgable::Reorg { block_height } => {
                    let depth = last_number.map_or(1, |last| last.saturating_sub(block_height) + 1);
                    REORGS.inc();
                    #[allow(clippy::cast_precision_loss)]
                    REORG_DEPTH.observe(depth as f64);
                    warn!(block_height, depth, "chain reorg detected");
                }
                Reorgable::Event(header) => {
                    let block = header_to_block_info(&header)?;
                    self.last_block_timestamp
                        .store(block.timestamp, Ordering::Relaxed);
                    if let Some(previous) = last_timestamp {
                        #[allow(clippy::cast_precision_loss)]
                        BLOCK_PRODUCING_RATE.observe(block.timestamp.saturating_sub(previous) as f64);
                    }
                    self.process_live_block(registry, block).await?;
                    last_number = Some(block.number);
                    last_timestamp = Some(block.timestamp);
                    #[allow(clippy::cast_possible_wrap)]
                    BLOCK_HEIGHT.set(block.number as i64);
                }
            }
        }
    }

    async fn process_live_block(&self, registry: &mut Registry, block: ChainBlockInfo) -> AnyResult<()> {
        let logs = self.fetch_logs(block.number, block.number).await?;
        for log in &logs {
            indexer::apply_log(registry, log, &self.allow_list, &self.filter)?;
        }
        if block.number % self.options.process_every_num_blocks == 0 {
            self.sweep(registry, block).await?;
        }
        registry.last_processed_block = Some(block);
        self.commit(registry).await?;
        Ok(())
    }

    /// Commit the registry, notifying the operator (throttled) if storage
    /// retries are exhausted before propagating the fatal error.
    async fn commit(&self, registry: &mut Registry) -> AnyResult<()> {
        let chain = self.ethereum.chain.chain_id;
        match self.store.write_with_retry(chain, registry).await {
            Ok(()) => Ok(()),
            Err(error) => {
                notify::notify_throttled(
                    self.notifier.as_ref(),
                    registry,
                    chain,
                    &format!("registry storage retries exhausted: {error}"),
                );
                Err(error)
            }
        }
    }

    async fn fetch_logs(&self, from: u64, to: u64) -> AnyResult<Vec<Log>> {
        let filter = FilterBuilder::default()
            .address(self.ethereum.chain.composable_cow.clone())
            .from_block(BlockNumber::Number(from.into()))
            .to_block(BlockNumber::Number(to.into()))
            .build();
        Ok(self.ethereum.web3.eth().logs(filter).await?)
    }

    async fn block_info(&self, number: u64) -> AnyResult<ChainBlockInfo> {
        let block = self
            .ethereum
            .web3
            .eth()
            .block(BlockId::Number(BlockNumber::Number(number.into())))
            .await?
            .ok_or_else(|| anyhow!("block {number} not found"))?;
        Ok(ChainBlockInfo {
            number: block.number.ok_or_else(|| anyhow!("block missing number"))?.as_u64(),
            timestamp: block.timestamp.as_u64(),
            hash: block.hash.ok_or_else(|| anyhow!("block missing hash"))?,
        })
    }

    /// Chunked C4 sweep over every conditional order in the registry,
    /// committing the registry at chunk boundaries.
    async fn sweep(&self, registry: &mut Registry, block: ChainBlockInfo) -> AnyResult<()> {
        let flat = collect_order_refs(registry);
        if flat.is_empty() {
            return Ok(());
        }
        let factory_block = FactoryBlockInfo {
            number: block.number,
            timestamp: block.timestamp,
        };

        for chunk in flat.chunks(self.options.chunk_size.max(1)) {
            let mut owners = Vec::with_capacity(chunk.len());
            let mut indices = Vec::with_capacity(chunk.len());
            let mut drops = Vec::new();

            for (owner, idx) in chunk {
                let Some(order) = registry.owner_orders.get(owner).and_then(|o| o.get(*idx)) else {
                    continue;
                };
                match self.filter.resolve(order.id, order.tx, *owner, order.params.handler) {
                    FilterAction::Drop => drops.push((*owner, order.id)),
                    FilterAction::Skip => {}
                    FilterAction::Accept => {
                        owners.push(*owner);
                        indices.push(*idx);
                    }
                }
            }

            if !owners.is_empty() {
                let orders: Vec<&ConditionalOrder> = owners
                    .iter()
                    .zip(&indices)
                    .map(|(owner, idx)| &registry.owner_orders[owner][*idx])
                    .collect();
                let results = poll::poll_batch(&self.ethereum, self.factory.as_ref(), &owners, &orders, factory_block)
                    .await;

                for ((owner, idx), result) in owners.into_iter().zip(indices).zip(results) {
                    if let Some(result) = result {
                        if let Some(terminal) = self.apply_poll_result(registry, owner, idx, result).await {
                            drops.push(terminal);
                        }
                    }
                }
            }

            // Removals happen only here, after every order in the chunk has
            // been processed against its original index: removing mid-chunk
            // would shift the `Vec` of any other order still queued for the
            // same owner in this chunk out from under its stale `idx`.
            for (owner, id) in drops {
                registry.remove_owner_orders(owner, |order| order.id == id);
            }

            self.commit(registry).await?;
        }
        Ok(())
    }

    /// Apply one order's poll decision: dedup + submit on `Success`,
    /// otherwise record the hint. Returns the order's `(owner, id)` if the
    /// resulting hint is terminal; the caller defers the actual removal
    /// until the whole chunk has been processed, so indices stay stable
    /// across same-owner orders within one chunk.
    async fn apply_poll_result(
        &self,
        registry: &mut Registry,
        owner: Address,
        idx: usize,
        result: PollResult,
    ) -> Option<(Address, crate::orders::OrderId)> {
        let Some(composable_cow) = registry
            .owner_orders
            .get(&owner)
            .and_then(|orders| orders.get(idx))
            .map(|order| order.composable_cow)
        else {
            return None;
        };

        if let PollResult::Success { order: discrete, signature } = result {
            let chain_id = self.ethereum.chain.chain_id.as_u256();
            let uid = discrete.uid(owner, chain_id, composable_cow);

            if is_already_submitted(registry, owner, idx, uid) {
                debug!(%uid, "order already submitted, skipping resubmission");
                return None;
            }

            let outcome = self.submission.submit(owner, uid, &discrete, &signature).await;
            let hint = match outcome {
                SubmissionOutcome::Success => PollResult::Success {
                    order: discrete,
                    signature,
                },
                SubmissionOutcome::TryNextBlock { reason } => PollResult::TryNextBlock { reason },
                SubmissionOutcome::TryAtEpoch { epoch, reason } => PollResult::TryAtEpoch { epoch, reason },
                SubmissionOutcome::DontTryAgain { reason } => PollResult::DontTryAgain { reason },
                SubmissionOutcome::UnexpectedError { reason, cause } => {
                    PollResult::UnexpectedError { reason, cause }
                }
            };
            let submitted_uid = matches!(hint, PollResult::Success { .. }).then_some(uid);
            return record_poll_result(registry, owner, idx, hint, submitted_uid);
        }

        record_poll_result(registry, owner, idx, result, None)
    }

    fn spawn_watchdog(&self) -> tokio::task::JoinHandle<()> {
        let state = self.state.clone();
        let last_timestamp = self.last_block_timestamp.clone();
        let timeout = self.options.watchdog_timeout_secs;
        let chain = self.ethereum.chain.chain_id;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(core::time::Duration::from_secs(5)).await;
                let last = last_timestamp.load(Ordering::Relaxed);
                if last == 0 {
                    continue;
                }
                #[allow(clippy::cast_sign_loss)]
                let now = chrono::Utc::now().timestamp() as u64;
                if !is_stale(now, last, timeout) {
                    continue;
                }
                error!(%chain, "watchdog timeout: no new block received");
                if is_orchestrated(
                    std::env::var("KUBERNETES_SERVICE_HOST").ok().as_deref(),
                    std::env::var("KUBERNETES_SERVICE_PORT").ok().as_deref(),
                ) {
                    *state.lock().await = State::Unknown;
                } else {
                    error!(%chain, "not running in an orchestrated container, exiting");
                    std::process::exit(1);
                }
            }
        })
    }
}

fn is_stale(now: u64, last: u64, timeout_secs: u64) -> bool {
    now.saturating_sub(last) >= timeout_secs
}

fn is_orchestrated(service_host: Option<&str>, service_port: Option<&str>) -> bool {
    service_host.is_some() && service_port.is_some()
}

fn header_to_block_info(header: &BlockHeader) -> AnyResult<ChainBlockInfo> {
    Ok(ChainBlockInfo {
        number: header
            .number
            .ok_or_else(|| anyhow!("block header missing number"))?
            .as_u64(),
        timestamp: header.timestamp.as_u64(),
        hash: header.hash.ok_or_else(|| anyhow!("block header missing hash"))?,
    })
}

fn group_logs_by_block(logs: Vec<Log>) -> BTreeMap<u64, Vec<Log>> {
    let mut by_block: BTreeMap<u64, Vec<Log>> = BTreeMap::new();
    for log in logs {
        let number = log.block_number.unwrap_or_default().as_u64();
        by_block.entry(number).or_default().push(log);
    }
    by_block
}

/// Whether `uid` was already recorded against the order at `(owner, idx)`,
/// i.e. a prior sweep already had it submitted. Once true, a poll engine
/// `Success` for the same `uid` is never resubmitted.
fn is_already_submitted(registry: &Registry, owner: Address, idx: usize, uid: crate::orders::OrderUid) -> bool {
    registry
        .owner_orders
        .get(&owner)
        .and_then(|orders| orders.get(idx))
        .is_some_and(|order| order.orders.contains_key(&uid))
}

/// Record one order's poll decision: mark `submitted_uid` (if any) as
/// `Submitted` and store `result` as the new hint. Returns the order's
/// `(owner, id)` if `result` is terminal, but does not remove it — removal
/// is the caller's job, deferred until every order in the current chunk has
/// been recorded against its original index.
fn record_poll_result(
    registry: &mut Registry,
    owner: Address,
    idx: usize,
    result: PollResult,
    submitted_uid: Option<crate::orders::OrderUid>,
) -> Option<(Address, crate::orders::OrderId)> {
    let terminal = result.is_terminal();
    let mut terminal_id = None;
    if let Some(order) = registry.owner_orders.get_mut(&owner).and_then(|orders| orders.get_mut(idx)) {
        if let Some(uid) = submitted_uid {
            order.orders.insert(uid, OrderStatus::Submitted);
        }
        if terminal {
            terminal_id = Some(order.id);
        }
        order.poll_result = Some(result);
    }
    terminal_id.map(|id| (owner, id))
}

/// A deterministic, flattened `(owner, order index)` worklist for a sweep:
/// owners sorted ascending (stand-in for the `HashMap`'s unspecified
/// iteration order; `Address` is `Ord` via its big-endian bytes) with each
/// owner's orders visited in their stored (insertion) order.
fn collect_order_refs(registry: &Registry) -> Vec<(Address, usize)> {
    let mut owners: Vec<Address> = registry.owner_orders.keys().copied().collect();
    owners.sort();
    let mut flat = Vec::new();
    for owner in owners {
        let len = registry.owner_orders[&owner].len();
        for idx in 0..len {
            flat.push((owner, idx));
        }
    }
    flat
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::orders::ConditionalOrderParams;
    use web3::types::H256;

    #[test]
    fn watchdog_is_stale_past_timeout() {
        assert!(!is_stale(100, 80, 30));
        assert!(is_stale(100, 70, 30));
    }

    #[test]
    fn orchestrated_requires_both_env_vars() {
        assert!(!is_orchestrated(None, None));
        assert!(!is_orchestrated(Some("10.0.0.1"), None));
        assert!(is_orchestrated(Some("10.0.0.1"), Some("443")));
    }

    #[test]
    fn collect_order_refs_is_sorted_by_owner() {
        let mut registry = Registry::default();
        let low = Address::repeat_byte(0x01);
        let high = Address::repeat_byte(0xff);
        registry.insert(
            high,
            ConditionalOrder::new(
                H256::repeat_byte(1),
                ConditionalOrderParams {
                    handler: Address::zero(),
                    salt: H256::zero(),
                    static_input: vec![],
                },
                Address::zero(),
            ),
        );
        registry.insert(
            low,
            ConditionalOrder::new(
                H256::repeat_byte(2),
                ConditionalOrderParams {
                    handler: Address::zero(),
                    salt: H256::repeat_byte(1),
                    static_input: vec![],
                },
                Address::zero(),
            ),
        );
        let flat = collect_order_refs(&registry);
        assert_eq!(flat, vec![(low, 0), (high, 0)]);
    }

    fn log_at_block(number: u64) -> Log {
        Log {
            address: Address::zero(),
            topics: vec![],
            data: web3::types::Bytes(vec![]),
            block_hash: None,
            block_number: Some(number.into()),
            transaction_hash: None,
            transaction_index: None,
            log_index: None,
            transaction_log_index: None,
            log_type: None,
            removed: None,
        }
    }

    #[test]
    fn group_logs_by_block_orders_ascending() {
        let grouped = group_logs_by_block(vec![log_at_block(20), log_at_block(10)]);
        assert_eq!(grouped.keys().copied().collect::<Vec<_>>(), vec![10, 20]);
    }

    fn example_order(owner: Address) -> (Registry, crate::orders::OrderUid) {
        let mut registry = Registry::default();
        registry.insert(
            owner,
            ConditionalOrder::new(
                H256::repeat_byte(1),
                ConditionalOrderParams {
                    handler: Address::repeat_byte(0xab),
                    salt: H256::zero(),
                    static_input: vec![],
                },
                Address::repeat_byte(0xcc),
            ),
        );
        let uid = crate::orders::OrderUid([0x42; 56]);
        (registry, uid)
    }

    /// A duplicate-order API response marks the `uid` `Submitted` and never
    /// resubmits it: the second `Success` hint for the same `uid` is
    /// recognized by `is_already_submitted` before any network call is made.
    #[test]
    fn success_hint_is_not_resubmitted_once_recorded_submitted() {
        let (mut registry, uid) = example_order(Address::repeat_byte(0x07));
        let owner = Address::repeat_byte(0x07);
        assert!(!is_already_submitted(&registry, owner, 0, uid));

        record_poll_result(&mut registry, owner, 0, PollResult::TryNextBlock { reason: "ok".into() }, Some(uid));

        assert_eq!(registry.owner_orders[&owner][0].orders[&uid], OrderStatus::Submitted);
        assert!(is_already_submitted(&registry, owner, 0, uid));
    }

    /// `record_poll_result` with a terminal hint reports the order for
    /// removal but does not remove it itself; the order is still present
    /// (with its updated hint) until the caller actually removes it.
    #[test]
    fn record_poll_result_reports_terminal_hint_without_removing() {
        let (mut registry, uid) = example_order(Address::repeat_byte(0x07));
        let owner = Address::repeat_byte(0x07);
        let order_id = registry.owner_orders[&owner][0].id;
        record_poll_result(&mut registry, owner, 0, PollResult::TryNextBlock { reason: "ok".into() }, Some(uid));
        assert_eq!(registry.owner_orders[&owner].len(), 1);

        let dropped =
            record_poll_result(&mut registry, owner, 0, PollResult::DontTryAgain { reason: "not authed".into() }, None);

        assert_eq!(dropped, Some((owner, order_id)));
        assert_eq!(registry.owner_orders[&owner].len(), 1);
        assert!(matches!(
            registry.owner_orders[&owner][0].poll_result,
            Some(PollResult::DontTryAgain { .. })
        ));
    }

    /// Two same-owner orders in one chunk, one terminal and one about to
    /// succeed: recording both against their original indices before either
    /// is removed must not let the first removal shift the second's index
    /// out from under it (the original bug resolved the second order's
    /// `idx` against an already-shrunk `Vec`, either silently dropping it or
    /// misattributing its result to whatever order slid into that slot).
    #[test]
    fn terminal_order_does_not_shift_other_same_owner_indices_mid_chunk() {
        let owner = Address::repeat_byte(0x07);
        let mut registry = Registry::default();
        registry.insert(
            owner,
            ConditionalOrder::new(
                H256::repeat_byte(1),
                ConditionalOrderParams {
                    handler: Address::repeat_byte(0x01),
                    salt: H256::zero(),
                    static_input: vec![],
                },
                Address::repeat_byte(0xcc),
            ),
        );
        registry.insert(
            owner,
            ConditionalOrder::new(
                H256::repeat_byte(2),
                ConditionalOrderParams {
                    handler: Address::repeat_byte(0x02),
                    salt: H256::repeat_byte(1),
                    static_input: vec![],
                },
                Address::repeat_byte(0xcc),
            ),
        );
        let order_b_id = registry.owner_orders[&owner][1].id;
        let uid = crate::orders::OrderUid([0x99; 56]);

        // Simulate one chunk's worth of `apply_poll_result` calls: order A
        // (idx 0) terminal, order B (idx 1) a fresh submission, both
        // resolved against the pre-chunk snapshot of indices.
        let mut drops = Vec::new();
        if let Some(dropped) =
            record_poll_result(&mut registry, owner, 0, PollResult::DontTryAgain { reason: "not authed".into() }, None)
        {
            drops.push(dropped);
        }
        if let Some(dropped) = record_poll_result(
            &mut registry,
            owner,
            1,
            PollResult::Success {
                order: crate::orders::DiscreteOrder {
                    sell_token: Address::zero(),
                    buy_token: Address::zero(),
                    receiver: Address::zero(),
                    sell_amount: web3::types::U256::zero(),
                    buy_amount: web3::types::U256::zero(),
                    valid_to: 0,
                    app_data: H256::zero(),
                    fee_amount: web3::types::U256::zero(),
                    kind: crate::orders::OrderKind::Sell,
                    partially_fillable: false,
                    sell_token_balance: crate::orders::TokenBalance::Erc20,
                    buy_token_balance: crate::orders::TokenBalance::Erc20,
                },
                signature: vec![],
            },
            Some(uid),
        ) {
            drops.push(dropped);
        }

        for (owner, id) in drops {
            registry.remove_owner_orders(owner, |order| order.id == id);
        }

        assert_eq!(registry.owner_orders[&owner].len(), 1);
        let remaining = &registry.owner_orders[&owner][0];
        assert_eq!(remaining.id, order_b_id);
        assert_eq!(remaining.orders[&uid], OrderStatus::Submitted);
    }
}

//! Event Indexer (C6): scans `ConditionalOrderCreated` / `MerkleRootSet`
//! logs for a block range, mutating the registry in place.

use ethabi::{Contract as AbiContract, ParamType, Token};
use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, IntCounterVec};
use tracing::{debug, trace};
use web3::types::{Address, Log, H256};

use crate::{
    ethereum::COMPOSABLE_COW_ABI,
    orders::{ConditionalOrder, ConditionalOrderParams, Proof},
    registry::Registry,
};

static EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "indexer_events",
        "Events processed by the indexer by kind.",
        &["kind"]
    )
    .unwrap()
});

static COMPOSABLE_COW: Lazy<AbiContract> =
    Lazy::new(|| AbiContract::load(COMPOSABLE_COW_ABI).expect("valid composable_cow ABI"));

/// Filter policy actions, checked at both ingest time (here) and poll time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Accept,
    Skip,
    Drop,
}

/// A decision table with overrides keyed by id/tx/owner/handler; precedence
/// `id > tx > owner > handler > default`.
#[derive(Debug, Clone, Default)]
pub struct FilterPolicy {
    pub by_id: std::collections::HashMap<H256, FilterAction>,
    pub by_tx: std::collections::HashMap<H256, FilterAction>,
    pub by_owner: std::collections::HashMap<Address, FilterAction>,
    pub by_handler: std::collections::HashMap<Address, FilterAction>,
    pub default: FilterAction,
}

impl FilterPolicy {
    #[must_use]
    pub fn resolve(&self, id: H256, tx: H256, owner: Address, handler: Address) -> FilterAction {
        self.by_id
            .get(&id)
            .or_else(|| self.by_tx.get(&tx))
            .or_else(|| self.by_owner.get(&owner))
            .or_else(|| self.by_handler.get(&handler))
            .copied()
            .unwrap_or(self.default)
    }
}

impl Default for FilterAction {
    fn default() -> Self {
        Self::Accept
    }
}

/// Optional owner allow-list: when set, events for owners outside it are
/// silently skipped before they ever reach the registry.
#[derive(Debug, Clone, Default)]
pub struct OwnerAllowList(pub Option<std::collections::HashSet<Address>>);

impl OwnerAllowList {
    #[must_use]
    pub fn allows(&self, owner: Address) -> bool {
        self.0.as_ref().is_none_or(|set| set.contains(&owner))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("log is missing the owner topic")]
    MissingOwnerTopic,
    #[error("ABI decode error")]
    Abi(#[from] ethabi::Error),
}

/// Apply one `ConditionalOrderCreated` or `MerkleRootSet` log to `registry`,
/// honoring the owner allow-list and filter policy.
pub fn apply_log(
    registry: &mut Registry,
    log: &Log,
    allow_list: &OwnerAllowList,
    filter: &FilterPolicy,
) -> Result<(), Error> {
    let created_signature = COMPOSABLE_COW
        .event("ConditionalOrderCreated")
        .expect("event in ABI")
        .signature();
    let merkle_signature = COMPOSABLE_COW
        .event("MerkleRootSet")
        .expect("event in ABI")
        .signature();

    let topic0 = *log.topics.first().ok_or(Error::MissingOwnerTopic)?;
    if topic0 == created_signature {
        apply_conditional_order_created(registry, log, allow_list, filter)
    } else if topic0 == merkle_signature {
        apply_merkle_root_set(registry, log, allow_list, filter)
    } else {
        Ok(())
    }
}

fn owner_from_topics(log: &Log) -> Result<Address, Error> {
    let topic = log.topics.get(1).ok_or(Error::MissingOwnerTopic)?;
    Ok(Address::from_slice(&topic.as_bytes()[12..]))
}

fn apply_conditional_order_created(
    registry: &mut Registry,
    log: &Log,
    allow_list: &OwnerAllowList,
    filter: &FilterPolicy,
) -> Result<(), Error> {
    let owner = owner_from_topics(log)?;
    if !allow_list.allows(owner) {
        trace!(?owner, "owner not in allow-list, skipping event");
        return Ok(());
    }
    EVENTS.with_label_values(&["conditional_order_created"]).inc();

    let event = COMPOSABLE_COW.event("ConditionalOrderCreated").expect("event in ABI");
    let decoded = event.parse_log(ethabi::RawLog {
        topics: log.topics.clone(),
        data: log.data.0.clone(),
    })?;
    let params_token = decoded
        .params
        .into_iter()
        .find(|param| param.name == "params")
        .ok_or(Error::MissingOwnerTopic)?
        .value;
    let params = decode_params(&params_token)?;

    let tx = log.transaction_hash.unwrap_or_default();
    let id = params.id();
    let action = filter.resolve(id, tx, owner, params.handler);
    if action == FilterAction::Drop {
        return Ok(());
    }

    let order = ConditionalOrder::new(tx, params, log.address);
    registry.insert(owner, order);
    Ok(())
}

fn apply_merkle_root_set(
    registry: &mut Registry,
    log: &Log,
    allow_list: &OwnerAllowList,
    filter: &FilterPolicy,
) -> Result<(), Error> {
    let owner = owner_from_topics(log)?;
    if !allow_list.allows(owner) {
        trace!(?owner, "owner not in allow-list, skipping event");
        return Ok(());
    }
    EVENTS.with_label_values(&["merkle_root_set"]).inc();

    let event = COMPOSABLE_COW.event("MerkleRootSet").expect("event in ABI");
    let decoded = event.parse_log(ethabi::RawLog {
        topics: log.topics.clone(),
        data: log.data.0.clone(),
    })?;
    let mut root = H256::zero();
    let mut location = ethabi::ethereum_types::U256::zero();
    let mut proof_data = Vec::new();
    for param in decoded.params {
        match param.name.as_str() {
            "root" => {
                if let Token::FixedBytes(bytes) = param.value {
                    root = H256::from_slice(&bytes);
                }
            }
            "proof" => {
                if let Token::Tuple(fields) = param.value {
                    if let [Token::Uint(loc), Token::Bytes(data)] = fields.as_slice() {
                        location = *loc;
                        proof_data = data.clone();
                    }
                }
            }
            _ => {}
        }
    }

    // Flush: remove every existing order under `owner` whose proof's root
    // differs from the new root.
    registry.remove_owner_orders(owner, |order| match &order.proof {
        Some(proof) => proof.merkle_root != root,
        None => false,
    });

    let tx = log.transaction_hash.unwrap_or_default();

    if location == ethabi::ethereum_types::U256::one() {
        // Inline payload: sequence of (bytes32[] path, (address,bytes32,bytes) params).
        let entries = ethabi::decode(
            &[ParamType::Array(Box::new(ParamType::Tuple(vec![
                ParamType::Array(Box::new(ParamType::FixedBytes(32))),
                ParamType::Tuple(vec![
                    ParamType::Address,
                    ParamType::FixedBytes(32),
                    ParamType::Bytes,
                ]),
            ])))],
            &proof_data,
        )?;
        if let Some(Token::Array(items)) = entries.into_iter().next() {
            for item in items {
                if let Token::Tuple(fields) = item {
                    if let [Token::Array(path_tokens), params_token] = fields.as_slice() {
                        let path = path_tokens
                            .iter()
                            .filter_map(|token| match token {
                                Token::FixedBytes(bytes) => Some(H256::from_slice(bytes)),
                                _ => None,
                            })
                            .collect();
                        let params = decode_params(params_token)?;
                        let id = params.id();
                        let action = filter.resolve(id, tx, owner, params.handler);
                        if action == FilterAction::Drop {
                            continue;
                        }
                        let mut order = ConditionalOrder::new(tx, params, log.address);
                        order.proof = Some(Proof {
                            merkle_root: root,
                            path,
                        });
                        registry.insert(owner, order);
                    }
                }
            }
        }
        debug!(?owner, "applied inline merkle proof payload");
    }

    Ok(())
}

fn decode_params(token: &Token) -> Result<ConditionalOrderParams, Error> {
    if let Token::Tuple(fields) = token {
        if let [Token::Address(handler), Token::FixedBytes(salt), Token::Bytes(static_input)] =
            fields.as_slice()
        {
            return Ok(ConditionalOrderParams {
                handler: *handler,
                salt: H256::from_slice(salt),
                static_input: static_input.clone(),
            });
        }
    }
    Err(Error::MissingOwnerTopic)
}

#[cfg(test)]
mod test {
    use ethabi::Token;

    use super::*;

    fn conditional_order_created_log(owner: Address, handler: Address, salt: H256, tx: H256) -> Log {
        let event = COMPOSABLE_COW.event("ConditionalOrderCreated").unwrap();
        let mut owner_topic = [0u8; 32];
        owner_topic[12..].copy_from_slice(owner.as_bytes());
        let data = ethabi::encode(&[Token::Tuple(vec![
            Token::Address(handler),
            Token::FixedBytes(salt.as_bytes().to_vec()),
            Token::Bytes(vec![0x00]),
        ])]);
        Log {
            address: Address::repeat_byte(0xcc),
            topics: vec![event.signature(), H256::from(owner_topic)],
            data: web3::types::Bytes(data),
            block_hash: None,
            block_number: None,
            transaction_hash: Some(tx),
            transaction_index: None,
            log_index: None,
            transaction_log_index: None,
            log_type: None,
            removed: None,
        }
    }

    fn merkle_root_set_log(owner: Address, root: H256, entries: Vec<(H256, Address, H256)>, tx: H256) -> Log {
        let event = COMPOSABLE_COW.event("MerkleRootSet").unwrap();
        let mut owner_topic = [0u8; 32];
        owner_topic[12..].copy_from_slice(owner.as_bytes());

        let proof_data = ethabi::encode(&[Token::Array(
            entries
                .into_iter()
                .map(|(_path_entry, handler, salt)| {
                    Token::Tuple(vec![
                        Token::Array(vec![]),
                        Token::Tuple(vec![
                            Token::Address(handler),
                            Token::FixedBytes(salt.as_bytes().to_vec()),
                            Token::Bytes(vec![0x00]),
                        ]),
                    ])
                })
                .collect(),
        )]);
        let data = ethabi::encode(&[
            Token::FixedBytes(root.as_bytes().to_vec()),
            Token::Tuple(vec![Token::Uint(1.into()), Token::Bytes(proof_data)]),
        ]);

        Log {
            address: Address::repeat_byte(0xcc),
            topics: vec![event.signature(), H256::from(owner_topic)],
            data: web3::types::Bytes(data),
            block_hash: None,
            block_number: None,
            transaction_hash: Some(tx),
            transaction_index: None,
            log_index: None,
            transaction_log_index: None,
            log_type: None,
            removed: None,
        }
    }

    /// A `by_tx` filter override keyed on the `MerkleRootSet` event's real
    /// transaction hash must apply to orders decoded from that event's
    /// inline payload, the same as it would for a `ConditionalOrderCreated`
    /// log from the same transaction.
    #[test]
    fn merkle_root_set_inline_payload_resolves_filter_against_the_real_tx_hash() {
        let mut registry = Registry::default();
        let owner = Address::repeat_byte(0x07);
        let handler = Address::repeat_byte(0x01);
        let salt = H256::repeat_byte(0x11);
        let tx = H256::repeat_byte(0xbb);
        let log = merkle_root_set_log(owner, H256::repeat_byte(0xee), vec![(H256::zero(), handler, salt)], tx);

        let mut filter = FilterPolicy::default();
        filter.by_tx.insert(tx, FilterAction::Drop);

        apply_log(&mut registry, &log, &OwnerAllowList::default(), &filter).unwrap();

        assert!(registry.owner_orders.get(&owner).is_none_or(Vec::is_empty));
    }

    #[test]
    fn conditional_order_created_dedups_on_identical_params() {
        let mut registry = Registry::default();
        let owner = Address::repeat_byte(0x07);
        let handler = Address::repeat_byte(0x01);
        let salt = H256::repeat_byte(0x11);
        let log = conditional_order_created_log(owner, handler, salt, H256::repeat_byte(0xaa));

        apply_log(&mut registry, &log, &OwnerAllowList::default(), &FilterPolicy::default()).unwrap();
        apply_log(&mut registry, &log, &OwnerAllowList::default(), &FilterPolicy::default()).unwrap();

        assert_eq!(registry.owner_orders[&owner].len(), 1);
    }

    /// Reorg re-processing re-runs the indexer on the new canonical block's
    /// logs; since `apply_log` only dedups on identical params (never on
    /// block hash), orders added under an earlier, now-orphaned block hash
    /// are not retroactively removed.
    #[test]
    fn reorg_replay_does_not_purge_orders_from_the_earlier_block_hash() {
        let mut registry = Registry::default();
        let owner = Address::repeat_byte(0x07);
        let allow_list = OwnerAllowList::default();
        let filter = FilterPolicy::default();

        // Block {number: 100, hash: 0xA}: two ConditionalOrderCreated events.
        let log_a1 = conditional_order_created_log(
            owner,
            Address::repeat_byte(0x01),
            H256::repeat_byte(0x11),
            H256::repeat_byte(0xa1),
        );
        let log_a2 = conditional_order_created_log(
            owner,
            Address::repeat_byte(0x02),
            H256::repeat_byte(0x12),
            H256::repeat_byte(0xa2),
        );
        apply_log(&mut registry, &log_a1, &allow_list, &filter).unwrap();
        apply_log(&mut registry, &log_a2, &allow_list, &filter).unwrap();
        assert_eq!(registry.owner_orders[&owner].len(), 2);

        // Reorg: block {number: 100, hash: 0xB} observed instead, with one
        // (different) event.
        let log_b1 = conditional_order_created_log(
            owner,
            Address::repeat_byte(0x03),
            H256::repeat_byte(0x13),
            H256::repeat_byte(0xb1),
        );
        apply_log(&mut registry, &log_b1, &allow_list, &filter).unwrap();

        assert_eq!(registry.owner_orders[&owner].len(), 3);
    }

    #[test]
    fn filter_policy_precedence_prefers_id_over_default() {
        let id = H256::repeat_byte(1);
        let mut policy = FilterPolicy::default();
        policy.by_id.insert(id, FilterAction::Drop);
        assert_eq!(
            policy.resolve(id, H256::zero(), Address::zero(), Address::zero()),
            FilterAction::Drop
        );
    }

    #[test]
    fn owner_allow_list_defaults_to_allow_all() {
        let allow_list = OwnerAllowList::default();
        assert!(allow_list.allows(Address::repeat_byte(1)));
    }

    #[test]
    fn owner_allow_list_rejects_unlisted_owners() {
        let mut set = std::collections::HashSet::new();
        set.insert(Address::repeat_byte(1));
        let allow_list = OwnerAllowList(Some(set));
        assert!(allow_list.allows(Address::repeat_byte(1)));
        assert!(!allow_list.allows(Address::repeat_byte(2)));
    }
}

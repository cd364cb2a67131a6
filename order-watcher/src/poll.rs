//! Poll Engine (C4): for a batch of conditional orders at a given block,
//! decides per order whether to skip, retry later, drop, or emit a discrete
//! order — via the factory path first, falling back to an on-chain
//! `getTradeableOrderWithSignature` multicall.

use ethabi::{Contract as AbiContract, Token};
use once_cell::sync::Lazy;
use prometheus::{register_histogram, register_int_counter, Histogram, IntCounter};
use web3::types::{Address, H256};

use crate::{
    ethereum::{Ethereum, COMPOSABLE_COW_ABI},
    factory::{BlockInfo, FactoryOutcome, OrderFactory},
    orders::{ConditionalOrder, DiscreteOrder, PollResult},
    revert::{self, RevertReason},
};

static LEGACY_CALLS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "poll_legacy_calls",
        "Count of orders that fell through to the on-chain multicall path."
    )
    .unwrap()
});
static BATCH_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "poll_batch_latency_seconds",
        "Time spent in a single aggregate3Value multicall round trip."
    )
    .unwrap()
});

static COMPOSABLE_COW: Lazy<AbiContract> =
    Lazy::new(|| AbiContract::load(COMPOSABLE_COW_ABI).expect("valid composable_cow ABI"));

/// One conditional order in need of a poll decision.
pub struct PollRequest<'a> {
    pub owner: Address,
    pub order: &'a ConditionalOrder,
}

/// Returns `None` when the caller should leave the prior hint untouched
/// (the early-skip case), `Some(result)` otherwise.
fn early_skip(order: &ConditionalOrder, block: BlockInfo) -> Option<PollResult> {
    match &order.poll_result {
        Some(PollResult::TryAtEpoch { epoch, .. }) if block.timestamp < *epoch => {
            order.poll_result.clone()
        }
        Some(PollResult::TryOnBlock { block_number, .. }) if block.number < *block_number => {
            order.poll_result.clone()
        }
        _ => None,
    }
}

fn proof_path(order: &ConditionalOrder) -> Vec<H256> {
    order
        .proof
        .as_ref()
        .map(|proof| proof.path.clone())
        .unwrap_or_default()
}

fn encode_legacy_call(order: &ConditionalOrder, owner: Address) -> Result<Vec<u8>, ethabi::Error> {
    let function = COMPOSABLE_COW.function("getTradeableOrderWithSignature")?;
    let params = Token::Tuple(vec![
        Token::Address(order.params.handler),
        Token::FixedBytes(order.params.salt.as_bytes().to_vec()),
        Token::Bytes(order.params.static_input.clone()),
    ]);
    let proof = Token::Array(
        proof_path(order)
            .into_iter()
            .map(|hash| Token::FixedBytes(hash.as_bytes().to_vec()))
            .collect(),
    );
    function.encode_input(&[
        Token::Address(owner),
        params,
        Token::Bytes(Vec::new()),
        proof,
    ])
}

fn decode_legacy_output(data: &[u8]) -> Result<(DiscreteOrder, Vec<u8>), ()> {
    let function = COMPOSABLE_COW
        .function("getTradeableOrderWithSignature")
        .map_err(|_| ())?;
    let tokens = function.decode_output(data).map_err(|_| ())?;
    let (order_tuple, signature) = match tokens.as_slice() {
        [Token::Tuple(fields), Token::Bytes(signature)] => (fields.clone(), signature.clone()),
        _ => return Err(()),
    };
    let [sell_token, buy_token, receiver, sell_amount, buy_amount, valid_to, app_data, fee_amount, kind, partially_fillable, sell_token_balance, buy_token_balance] =
        <[Token; 12]>::try_from(order_tuple).map_err(|_| ())?;
    let order = DiscreteOrder::from_tuple_hashes(
        sell_token.into_address().ok_or(())?,
        buy_token.into_address().ok_or(())?,
        receiver.into_address().ok_or(())?,
        sell_amount.into_uint().ok_or(())?,
        buy_amount.into_uint().ok_or(())?,
        valid_to.into_uint().ok_or(())?.as_u32(),
        H256::from_slice(&bytes32_token(&app_data)?),
        fee_amount.into_uint().ok_or(())?,
        H256::from_slice(&bytes32_token(&kind)?),
        partially_fillable.into_bool().ok_or(())?,
        H256::from_slice(&bytes32_token(&sell_token_balance)?),
        H256::from_slice(&bytes32_token(&buy_token_balance)?),
    )
    .map_err(|_| ())?;
    Ok((order, signature))
}

/// Pull the 32 bytes out of a `Token::FixedBytes(bytes32)`.
fn bytes32_token(token: &Token) -> Result<[u8; 32], ()> {
    token
        .clone()
        .into_fixed_bytes()
        .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
        .ok_or(())
}

fn revert_to_poll_result(reason: RevertReason) -> PollResult {
    match reason {
        RevertReason::SingleOrderNotAuthed
        | RevertReason::ProofNotAuthed
        | RevertReason::InterfaceNotSupported
        | RevertReason::InvalidFallbackHandler
        | RevertReason::InvalidHandler
        | RevertReason::SwapGuardRestricted => PollResult::DontTryAgain {
            reason: "order not authed".to_string(),
        },
        RevertReason::OrderNotValid(message) => PollResult::DontTryAgain { reason: message },
        RevertReason::PollTryNextBlock(reason) => PollResult::TryNextBlock { reason },
        RevertReason::PollTryAtBlock(block_number, reason) => PollResult::TryOnBlock {
            block_number: u64::from(block_number),
            reason,
        },
        RevertReason::PollTryAtEpoch(epoch, reason) => PollResult::TryAtEpoch {
            epoch: u64::from(epoch),
            reason,
        },
        RevertReason::PollNever(reason) => PollResult::DontTryAgain { reason },
        RevertReason::NonCompliant => PollResult::DontTryAgain {
            reason: "non-compliant revert hint".to_string(),
        },
    }
}

/// Poll a single conditional order, trying the factory first and falling
/// back to a one-call legacy multicall. Prefer [`poll_batch`] when polling
/// many orders at once.
pub async fn poll(
    ethereum: &Ethereum,
    factory: &dyn OrderFactory,
    request: &PollRequest<'_>,
    block: BlockInfo,
) -> Option<PollResult> {
    poll_batch(ethereum, factory, &[request.owner], &[request.order], block)
        .await
        .into_iter()
        .next()
        .flatten()
}

/// Poll many conditional orders in a single `aggregate3Value` round trip for
/// whichever orders the factory doesn't resolve. Returns one `Option<PollResult>`
/// per input, in the same order, `None` meaning "leave the prior hint as-is".
pub async fn poll_batch(
    ethereum: &Ethereum,
    factory: &dyn OrderFactory,
    owners: &[Address],
    orders: &[&ConditionalOrder],
    block: BlockInfo,
) -> Vec<Option<PollResult>> {
    assert_eq!(owners.len(), orders.len());
    let mut results: Vec<Option<PollResult>> = Vec::with_capacity(orders.len());
    let mut legacy_indices = Vec::new();
    let mut legacy_calls = Vec::new();

    for (index, (owner, order)) in owners.iter().zip(orders.iter()).enumerate() {
        if let Some(skip) = early_skip(order, block) {
            results.push(Some(skip));
            continue;
        }
        let outcome = factory
            .poll(*owner, &order.params, block, &proof_path(order))
            .await;
        match outcome {
            FactoryOutcome::Resolved(result) => results.push(Some(validate(result))),
            FactoryOutcome::Unknown => {
                results.push(None); // placeholder, filled in below
                match encode_legacy_call(order, *owner) {
                    Ok(call_data) => {
                        legacy_indices.push(index);
                        legacy_calls.push((order.composable_cow, call_data));
                    }
                    Err(error) => {
                        results[index] = Some(PollResult::UnexpectedError {
                            reason: "could not encode legacy call".to_string(),
                            cause: error.to_string(),
                        });
                    }
                }
            }
        }
    }

    if legacy_calls.is_empty() {
        return results;
    }

    LEGACY_CALLS.inc_by(legacy_calls.len() as u64);
    let _timer = BATCH_LATENCY.start_timer();
    match ethereum.aggregate3(legacy_calls).await {
        Ok(call_results) => {
            for (index, (success, return_data)) in legacy_indices.into_iter().zip(call_results) {
                results[index] = Some(if success {
                    match decode_legacy_output(&return_data) {
                        Ok((order, signature)) => validate(PollResult::Success { order, signature }),
                        Err(()) => PollResult::DontTryAgain {
                            reason: "decode failure".to_string(),
                        },
                    }
                } else {
                    match revert::decode(&return_data) {
                        Ok(reason) => revert_to_poll_result(reason),
                        Err(_) => PollResult::DontTryAgain {
                            reason: "non-compliant revert hint".to_string(),
                        },
                    }
                });
            }
        }
        Err(error) => {
            for index in legacy_indices {
                results[index] = Some(PollResult::TryNextBlock {
                    reason: format!("multicall failed: {error}"),
                });
            }
        }
    }

    results
}

/// §4.3 step 4: reject nonsensical orders before they ever reach the
/// Submission Gate.
fn validate(result: PollResult) -> PollResult {
    match result {
        PollResult::Success { order, .. } if !order.is_sane() => PollResult::DontTryAgain {
            reason: "order failed sanity validation".to_string(),
        },
        other => other,
    }
}

//! Submission Gate (C5): posts a discrete order exactly once per `OrderUid`
//! and classifies the orders API's response into a scheduling outcome.

use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, IntCounterVec};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use structopt::StructOpt;
use tracing::{info, warn};
use url::Url;
use web3::types::Address;

use crate::orders::{DiscreteOrder, OrderUid};

/// The Submission Gate's verdict. Distinct from [`crate::orders::PollResult`]
/// because a submission can only ever confirm or override the hint that was
/// already decided by the Poll Engine — it never itself produces a fresh
/// discrete order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Success,
    TryNextBlock { reason: String },
    TryAtEpoch { epoch: u64, reason: String },
    DontTryAgain { reason: String },
    UnexpectedError { reason: String, cause: String },
}

static SUBMISSIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "submission_gate_outcomes",
        "Submission Gate outcomes by classification.",
        &["outcome"]
    )
    .unwrap()
});

#[derive(Clone, Debug, PartialEq, StructOpt)]
pub struct Options {
    /// Base URL of the orders API, e.g. `https://api.cow.fi/mainnet`.
    #[structopt(long, env = "ORDERS_API")]
    pub orders_api: Url,
}

#[derive(Clone, Debug)]
pub struct SubmissionGate {
    client: Client,
    base_url: Url,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderPayload {
    sell_token: Address,
    buy_token: Address,
    receiver: Address,
    #[serde(with = "types::serde_dec::u256_dec")]
    sell_amount: web3::types::U256,
    #[serde(with = "types::serde_dec::u256_dec")]
    buy_amount: web3::types::U256,
    valid_to: u32,
    app_data: web3::types::H256,
    #[serde(with = "types::serde_dec::u256_dec")]
    fee_amount: web3::types::U256,
    kind: &'static str,
    partially_fillable: bool,
    sell_token_balance: &'static str,
    buy_token_balance: &'static str,
    signing_scheme: &'static str,
    signature: String,
    from: Address,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(rename = "errorType")]
    error_type: Option<String>,
}

impl SubmissionGate {
    #[must_use]
    pub fn new(options: Options) -> Self {
        Self {
            client: Client::new(),
            base_url: options.orders_api,
        }
    }

    /// POST the order once. The caller dedupes against
    /// `conditionalOrder.orders` before calling this and, on
    /// [`SubmissionOutcome::Success`], records `orders[uid] = Submitted`.
    pub async fn submit(
        &self,
        owner: Address,
        uid: OrderUid,
        order: &DiscreteOrder,
        signature: &[u8],
    ) -> SubmissionOutcome {
        let payload = OrderPayload {
            sell_token: order.sell_token,
            buy_token: order.buy_token,
            receiver: order.receiver,
            sell_amount: order.sell_amount,
            buy_amount: order.buy_amount,
            valid_to: order.valid_to,
            app_data: order.app_data,
            fee_amount: order.fee_amount,
            kind: match order.kind {
                crate::orders::OrderKind::Sell => "sell",
                crate::orders::OrderKind::Buy => "buy",
            },
            partially_fillable: order.partially_fillable,
            sell_token_balance: balance_str(order.sell_token_balance),
            buy_token_balance: balance_str(order.buy_token_balance),
            signing_scheme: "eip1271",
            signature: format!("0x{}", hex::encode(signature)),
            from: owner,
        };

        let url = match self.base_url.join("api/v1/orders") {
            Ok(url) => url,
            Err(error) => {
                return unexpected(format!("invalid orders API base url: {error}"));
            }
        };

        let response = match self.client.post(url).json(&payload).send().await {
            Ok(response) => response,
            Err(error) => {
                warn!(?error, ?uid, "transport error submitting order");
                SUBMISSIONS.with_label_values(&["transport_error"]).inc();
                return unexpected(format!("transport error: {error}"));
            }
        };

        classify(response.status(), response.json::<ApiErrorBody>().await.ok())
    }
}

fn balance_str(balance: crate::orders::TokenBalance) -> &'static str {
    match balance {
        crate::orders::TokenBalance::Erc20 => "erc20",
        crate::orders::TokenBalance::Internal => "internal",
        crate::orders::TokenBalance::External => "external",
    }
}

fn unexpected(reason: String) -> SubmissionOutcome {
    SubmissionOutcome::UnexpectedError {
        reason: "submission failed".to_string(),
        cause: reason,
    }
}

fn try_at_epoch(offset_secs: i64, reason: &str) -> SubmissionOutcome {
    let epoch = (chrono::Utc::now().timestamp() + offset_secs).max(0) as u64;
    SubmissionOutcome::TryAtEpoch {
        epoch,
        reason: reason.to_string(),
    }
}

/// Classify an orders API HTTP response into a scheduling outcome per the
/// status/`errorType` table.
fn classify(status: StatusCode, body: Option<ApiErrorBody>) -> SubmissionOutcome {
    let error_type = body.and_then(|body| body.error_type);
    let outcome = match (status.as_u16(), error_type.as_deref()) {
        (200..=299, _) => SubmissionOutcome::Success,
        (400, Some("DuplicatedOrder" | "DUPLICATED_ORDER")) => SubmissionOutcome::Success,
        (400, Some("InsufficientAllowance" | "INSUFFICIENT_ALLOWANCE"))
        | (400, Some("InsufficientBalance" | "INSUFFICIENT_BALANCE")) => {
            try_at_epoch(600, "insufficient allowance or balance")
        }
        (400, Some("TooManyLimitOrders" | "TOO_MANY_LIMIT_ORDERS")) => {
            try_at_epoch(3600, "too many limit orders")
        }
        (400, Some("InvalidAppData" | "INVALID_APP_DATA")) => {
            try_at_epoch(60, "invalid app data")
        }
        (
            400,
            Some(
                "QuoteNotFound" | "QUOTE_NOT_FOUND" | "InvalidQuote" | "INVALID_QUOTE"
                | "InsufficientValidTo" | "INSUFFICIENT_VALID_TO" | "InvalidEip1271Signature"
                | "INVALID_EIP1271SIGNATURE",
            ),
        ) => SubmissionOutcome::TryNextBlock {
            reason: "quote or signature not yet valid".to_string(),
        },
        (400, Some(_)) => SubmissionOutcome::DontTryAgain {
            reason: "order rejected by orders API".to_string(),
        },
        (403, _) => SubmissionOutcome::DontTryAgain {
            reason: "owner is deny-listed".to_string(),
        },
        (404, _) => try_at_epoch(600, "no liquidity"),
        (429, _) => try_at_epoch(600, "rate limited"),
        _ => unexpected(format!("unclassified status {status}")),
    };
    SUBMISSIONS
        .with_label_values(&[outcome_label(&outcome)])
        .inc();
    outcome
}

const fn outcome_label(result: &SubmissionOutcome) -> &'static str {
    match result {
        SubmissionOutcome::Success => "success",
        SubmissionOutcome::TryNextBlock { .. } => "try_next_block",
        SubmissionOutcome::TryAtEpoch { .. } => "try_at_epoch",
        SubmissionOutcome::DontTryAgain { .. } => "dont_try_again",
        SubmissionOutcome::UnexpectedError { .. } => "unexpected_error",
    }
}

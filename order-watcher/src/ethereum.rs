//! Connection to an EVM chain: the `web3` client, chain identity, and the
//! fixed Multicall3 contract used to batch `eth_call`s without risking a
//! top-level revert.

use core::time::Duration;

use ethabi::Token;
use structopt::StructOpt;
use thiserror::Error;
use tracing::info;
use types::ChainId;
use url::Url;
use web3::{
    contract::{Contract, Options as Web3Options},
    transports::Http,
    types::{Address, BlockId, BlockNumber},
    Web3,
};

const MULTICALL3_ABI: &[u8] = include_bytes!("../abis/multicall3.json");
pub const COMPOSABLE_COW_ABI: &[u8] = include_bytes!("../abis/composable_cow.json");

/// Fixed Multicall3 deployment address, identical across every EVM chain it
/// has been deployed to.
#[must_use]
pub fn multicall3_address() -> Address {
    "0xcA11bde05977b3631167028862bE2a173976CA11"
        .parse()
        .expect("valid checksummed address")
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("web3 initialization error")]
    Web3(#[from] web3::Error),
    #[error("contract query error")]
    Contract(#[from] web3::contract::Error),
    #[error("ABI encoding error")]
    Abi(#[from] ethabi::Error),
}

#[derive(Clone, Debug, PartialEq, StructOpt)]
pub struct Options {
    /// Ethereum JSON-RPC HTTP endpoint, used for calls and log queries.
    #[structopt(short, long, env = "ETHEREUM")]
    pub ethereum: Url,

    /// Ethereum JSON-RPC WebSocket endpoint, used for the live block
    /// subscription. Defaults to the HTTP endpoint with its scheme swapped.
    #[structopt(long, env = "ETHEREUM_WS")]
    pub ethereum_ws: Option<Url>,

    /// Addresses of the `ComposableCoW`-like contracts to index events from.
    #[structopt(long, env = "COMPOSABLE_COW", use_delimiter = true)]
    pub composable_cow: Vec<Address>,

    /// Maximum chain reorg depth that will be handled.
    #[structopt(long, env = "MAX_REORG", default_value = "10")]
    pub max_reorg: usize,

    /// Maximum time to wait for the next block before it is considered a
    /// failure.
    #[structopt(long, env = "BLOCK_TIMEOUT_SECS", default_value = "300")]
    pub block_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ChainInfo {
    pub chain_id: ChainId,
    pub composable_cow: Vec<Address>,
    pub block_timeout: Duration,
    pub max_reorg: usize,
}

#[derive(Clone, Debug)]
pub struct Ethereum {
    pub chain: ChainInfo,
    pub web3: Web3<Http>,
    pub multicall: Contract<Http>,
}

impl Ethereum {
    pub async fn connect(options: Options) -> Result<Self, Error> {
        info!("Connecting to Ethereum at {}", options.ethereum);
        let transport = Http::new(options.ethereum.as_str())?;
        let web3 = Web3::new(transport);

        let chain_id = web3.eth().chain_id().await?;
        let chain = ChainInfo {
            chain_id: chain_id.into(),
            composable_cow: options.composable_cow.clone(),
            block_timeout: Duration::from_secs(options.block_timeout_secs),
            max_reorg: options.max_reorg,
        };
        info!("Connected to Ethereum with chain id {}", chain.chain_id);

        let multicall = Contract::from_json(web3.eth(), multicall3_address(), MULTICALL3_ABI)?;

        Ok(Self {
            chain,
            web3,
            multicall,
        })
    }

    /// Look up the websocket endpoint for the live block subscription,
    /// defaulting to swapping `http(s)` for `ws(s)` on the call endpoint.
    #[must_use]
    pub fn websocket_url(options: &Options) -> Url {
        if let Some(ws) = &options.ethereum_ws {
            return ws.clone();
        }
        let mut url = options.ethereum.clone();
        let scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        let _ = url.set_scheme(scheme);
        url
    }

    /// Execute a batch of `eth_call`s via `Multicall3.aggregate3Value`, with
    /// `allowFailure = true` so an individual order's revert never fails the
    /// whole batch.
    pub async fn aggregate3(
        &self,
        calls: Vec<(Address, Vec<u8>)>,
    ) -> Result<Vec<(bool, Vec<u8>)>, Error> {
        let tokens: Vec<Token> = calls
            .into_iter()
            .map(|(target, call_data)| {
                Token::Tuple(vec![
                    Token::Address(target),
                    Token::Bool(true),
                    Token::Uint(0.into()),
                    Token::Bytes(call_data),
                ])
            })
            .collect();
        let input = Aggregate3Input(tokens);
        let block_id = BlockId::from(BlockNumber::Latest);
        let options = Web3Options::default();
        let output: Aggregate3Output = self
            .multicall
            .query("aggregate3Value", input, None, options, block_id)
            .await?;
        Ok(output.0)
    }
}

struct Aggregate3Input(Vec<Token>);

impl web3::contract::tokens::Tokenize for Aggregate3Input {
    fn into_tokens(self) -> Vec<Token> {
        vec![Token::Array(self.0)]
    }
}

struct Aggregate3Output(Vec<(bool, Vec<u8>)>);

impl web3::contract::tokens::Detokenize for Aggregate3Output {
    fn from_tokens(tokens: Vec<Token>) -> Result<Self, web3::contract::Error> {
        let array = match tokens.as_slice() {
            [Token::Array(results)] => results.clone(),
            _ => {
                return Err(web3::contract::Error::InvalidOutputType(
                    "expected a single array of results".into(),
                ))
            }
        };
        let mut out = Vec::with_capacity(array.len());
        for result in array {
            match result {
                Token::Tuple(fields) => match fields.as_slice() {
                    [Token::Bool(success), Token::Bytes(return_data)] => {
                        out.push((*success, return_data.clone()));
                    }
                    _ => {
                        return Err(web3::contract::Error::InvalidOutputType(
                            "malformed Multicall3.Result tuple".into(),
                        ))
                    }
                },
                _ => {
                    return Err(web3::contract::Error::InvalidOutputType(
                        "expected a tuple".into(),
                    ))
                }
            }
        }
        Ok(Self(out))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn multicall3_address_is_the_canonical_deployment() {
        assert_eq!(
            format!("{:?}", multicall3_address()),
            "0xca11bde05977b3631167028862be2a173976ca11"
        );
    }
}

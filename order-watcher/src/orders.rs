//! The conditional/discrete order data model: `ConditionalOrderParams`,
//! `ConditionalOrder`, `PollResult`, and the domain-separated `OrderUid`
//! hashing of a `GPv2Order`-shaped discrete order.

use hex_literal::hex;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::collections::HashMap;
use types::keccak256;
use web3::types::{Address, H256, U256};

// EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)
const DOMAIN_TYPE_HASH: [u8; 32] =
    hex!("8b73c3c69bb8fe3d512ecc4cf759cc79239f7b179b0ffacaa9a75d522b39400f");
// keccak256("Gnosis Protocol")
const NAME_HASH: [u8; 32] =
    hex!("6c85c0337eba1661327f94f3bf46c8a7f9311a563f4d5c948362567f5d8ed60c");
// keccak256("v2")
const VERSION_HASH: [u8; 32] =
    hex!("f9446b8e937d86f0bc87cac73923491692b123ca5f8761908494703758206adf");
// Order(address sellToken,address buyToken,address receiver,uint256 sellAmount,
//       uint256 buyAmount,uint32 validTo,bytes32 appData,uint256 feeAmount,
//       string kind,bool partiallyFillable,string sellTokenBalance,string buyTokenBalance)
const ORDER_TYPE_HASH: [u8; 32] =
    hex!("d5a25ba2e97094ad7d83dc28a6572da797d6b3e7fc6663bd93efb789fc17e489");

const KIND_SELL: [u8; 32] =
    hex!("f3b277728b3fee749481eb3e0b3b48980dbbab78658fc419025cb16eee346775");
const KIND_BUY: [u8; 32] =
    hex!("6ed88e868af0a1983e3886d5f3e95a2fafbd6c3450bc229e27342283dc429ccc");
const BALANCE_ERC20: [u8; 32] =
    hex!("5a28e9363bb942b639270062aa6bb295f434bcdfc42c97267bf003f272060dc9");
const BALANCE_INTERNAL: [u8; 32] =
    hex!("4ac99ace14ee0a5ef932dc609df0943ab7ac16b7583634612f8dc35a4289a6ce");
const BALANCE_EXTERNAL: [u8; 32] =
    hex!("abee3b73373acd583a130924aad6dc38cfdc44ba0555ba94ce2ff63980ea0632");

struct BigEndian([u8; 32]);

impl AsRef<[u8]> for BigEndian {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<&U256> for BigEndian {
    fn from(value: &U256) -> Self {
        let mut result = [0; 32];
        value.to_big_endian(&mut result);
        Self(result)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown order kind")]
    UnknownKind,
    #[error("unknown token balance location")]
    UnknownBalance,
}

/// The three fields a `ConditionalOrderCreated` event carries for a single
/// conditional order. Two params are equal iff all three fields match
/// case-insensitively as hex, which for `Address`/`H256`/`Vec<u8>` is just
/// structural equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConditionalOrderParams {
    pub handler: Address,
    pub salt: H256,
    pub static_input: Vec<u8>,
}

/// `keccak256` of the canonical serialization of a `ConditionalOrderParams`,
/// stable across restarts and used as a `ConditionalOrder`'s primary key.
pub type OrderId = H256;

impl ConditionalOrderParams {
    #[must_use]
    pub fn id(&self) -> OrderId {
        let mut buffer = Vec::with_capacity(20 + 32 + self.static_input.len());
        buffer.extend_from_slice(self.handler.as_bytes());
        buffer.extend_from_slice(self.salt.as_bytes());
        buffer.extend_from_slice(&self.static_input);
        H256::from(keccak256(&buffer))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub merkle_root: H256,
    pub path: Vec<H256>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Submitted,
    Filled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalOrder {
    pub id: OrderId,
    pub tx: H256,
    pub params: ConditionalOrderParams,
    pub proof: Option<Proof>,
    pub composable_cow: Address,
    pub orders: HashMap<OrderUid, OrderStatus>,
    pub poll_result: Option<PollResult>,
}

impl ConditionalOrder {
    #[must_use]
    pub fn new(tx: H256, params: ConditionalOrderParams, composable_cow: Address) -> Self {
        Self {
            id: params.id(),
            tx,
            params,
            proof: None,
            composable_cow,
            orders: HashMap::new(),
            poll_result: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Sell,
    Buy,
}

impl OrderKind {
    fn from_hash(hash: H256) -> Result<Self, Error> {
        match hash.0 {
            KIND_SELL => Ok(Self::Sell),
            KIND_BUY => Ok(Self::Buy),
            _ => Err(Error::UnknownKind),
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Sell => "sell",
            Self::Buy => "buy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenBalance {
    Erc20,
    Internal,
    External,
}

impl TokenBalance {
    fn from_hash(hash: H256) -> Result<Self, Error> {
        match hash.0 {
            BALANCE_ERC20 => Ok(Self::Erc20),
            BALANCE_INTERNAL => Ok(Self::Internal),
            BALANCE_EXTERNAL => Ok(Self::External),
            _ => Err(Error::UnknownBalance),
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Erc20 => "erc20",
            Self::Internal => "internal",
            Self::External => "external",
        }
    }
}

/// A concrete discrete order as returned by `getTradeableOrderWithSignature`,
/// prior to domain-separated hashing into an `OrderUid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscreteOrder {
    pub sell_token: Address,
    pub buy_token: Address,
    pub receiver: Address,
    #[serde(with = "types::serde_dec::u256_dec")]
    pub sell_amount: U256,
    #[serde(with = "types::serde_dec::u256_dec")]
    pub buy_amount: U256,
    pub valid_to: u32,
    pub app_data: H256,
    #[serde(with = "types::serde_dec::u256_dec")]
    pub fee_amount: U256,
    pub kind: OrderKind,
    pub partially_fillable: bool,
    pub sell_token_balance: TokenBalance,
    pub buy_token_balance: TokenBalance,
}

impl DiscreteOrder {
    /// Build a `DiscreteOrder` from the raw `(order, signature)` ABI tuple
    /// returned by `getTradeableOrderWithSignature`, resolving the `kind` and
    /// balance-location hash constants to their enum values.
    pub fn from_tuple_hashes(
        sell_token: Address,
        buy_token: Address,
        receiver: Address,
        sell_amount: U256,
        buy_amount: U256,
        valid_to: u32,
        app_data: H256,
        fee_amount: U256,
        kind_hash: H256,
        partially_fillable: bool,
        sell_token_balance_hash: H256,
        buy_token_balance_hash: H256,
    ) -> Result<Self, Error> {
        Ok(Self {
            sell_token,
            buy_token,
            receiver,
            sell_amount,
            buy_amount,
            valid_to,
            app_data,
            fee_amount,
            kind: OrderKind::from_hash(kind_hash)?,
            partially_fillable,
            sell_token_balance: TokenBalance::from_hash(sell_token_balance_hash)?,
            buy_token_balance: TokenBalance::from_hash(buy_token_balance_hash)?,
        })
    }

    /// An empty/zero receiver means "use the sender"; it must be treated as
    /// absent when computing the struct hash.
    fn receiver_for_hashing(&self) -> Address {
        if self.receiver.is_zero() {
            Address::zero()
        } else {
            self.receiver
        }
    }

    fn struct_hash(&self) -> [u8; 32] {
        let mut hasher = Keccak256::new();
        hasher.update(ORDER_TYPE_HASH);
        hasher.update(H256::from(self.sell_token));
        hasher.update(H256::from(self.buy_token));
        hasher.update(H256::from(self.receiver_for_hashing()));
        hasher.update(BigEndian::from(&self.sell_amount));
        hasher.update(BigEndian::from(&self.buy_amount));
        hasher.update(BigEndian::from(&U256::from(self.valid_to)));
        hasher.update(self.app_data);
        hasher.update(BigEndian::from(&self.fee_amount));
        hasher.update(Keccak256::digest(self.kind.as_str().as_bytes()));
        hasher.update(H256::from_low_u64_be(u64::from(self.partially_fillable)));
        hasher.update(Keccak256::digest(self.sell_token_balance.as_str().as_bytes()));
        hasher.update(Keccak256::digest(self.buy_token_balance.as_str().as_bytes()));
        <[u8; 32]>::from(hasher.finalize())
    }

    fn domain_hash(chain_id: U256, verifying_contract: Address) -> [u8; 32] {
        let mut hasher = Keccak256::new();
        hasher.update(DOMAIN_TYPE_HASH);
        hasher.update(NAME_HASH);
        hasher.update(VERSION_HASH);
        hasher.update(BigEndian::from(&chain_id));
        hasher.update(H256::from(verifying_contract));
        <[u8; 32]>::from(hasher.finalize())
    }

    /// Domain-separated EIP-712 hash of the order, independent of owner.
    #[must_use]
    pub fn digest(&self, chain_id: U256, verifying_contract: Address) -> H256 {
        let mut hasher = Keccak256::new();
        hasher.update(hex!("1901"));
        hasher.update(Self::domain_hash(chain_id, verifying_contract));
        hasher.update(self.struct_hash());
        H256::from(<[u8; 32]>::from(hasher.finalize()))
    }

    /// `OrderUid = digest(32) ++ owner(20) ++ validTo(4, big-endian)`.
    #[must_use]
    pub fn uid(&self, owner: Address, chain_id: U256, verifying_contract: Address) -> OrderUid {
        let digest = self.digest(chain_id, verifying_contract);
        let mut uid = [0u8; 56];
        uid[0..32].copy_from_slice(digest.as_bytes());
        uid[32..52].copy_from_slice(owner.as_bytes());
        uid[52..56].copy_from_slice(&self.valid_to.to_be_bytes());
        OrderUid(uid)
    }

    /// §4.3 sanity check: reject nonsensical orders before emission.
    #[must_use]
    pub fn is_sane(&self) -> bool {
        !self.sell_amount.is_zero()
            && !self.buy_amount.is_zero()
            && !self.sell_token.is_zero()
            && !self.buy_token.is_zero()
            && self.sell_token != self.buy_token
    }
}

/// The domain-separated discrete-order identifier used as the dedup key for
/// submission; 32-byte order digest ++ 20-byte owner ++ 4-byte `validTo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderUid(#[serde(with = "uid_hex")] pub [u8; 56]);

impl std::fmt::Display for OrderUid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

mod uid_hex {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8; 56], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(value)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 56], D::Error> {
        let text = String::deserialize(deserializer)?;
        let trimmed = text.trim_start_matches("0x");
        let bytes = hex::decode(trimmed).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| D::Error::custom("OrderUid must be 56 bytes"))
    }
}

/// Per-order scheduling decision produced by the Poll Engine and/or Order
/// Factory. See the closed set of variants: exactly one path through the
/// engine yields `Success`, the rest defer or drop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PollResult {
    Success {
        order: DiscreteOrder,
        signature: Vec<u8>,
    },
    TryNextBlock {
        reason: String,
    },
    TryOnBlock {
        block_number: u64,
        reason: String,
    },
    TryAtEpoch {
        epoch: u64,
        reason: String,
    },
    DontTryAgain {
        reason: String,
    },
    UnexpectedError {
        reason: String,
        cause: String,
    },
}

impl PollResult {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::DontTryAgain { .. })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn hash(bytes: &[u8]) -> [u8; 32] {
        <[u8; 32]>::from(Keccak256::digest(bytes))
    }

    #[test]
    fn domain_type_hash_matches_preimage() {
        assert_eq!(
            DOMAIN_TYPE_HASH,
            hash(b"EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)")
        );
    }

    #[test]
    fn order_type_hash_matches_preimage() {
        assert_eq!(
            ORDER_TYPE_HASH,
            hash(
                b"Order(address sellToken,address buyToken,address receiver,uint256 sellAmount,\
uint256 buyAmount,uint32 validTo,bytes32 appData,uint256 feeAmount,string kind,bool \
partiallyFillable,string sellTokenBalance,string buyTokenBalance)"
            )
        );
    }

    #[test]
    fn name_and_version_hashes_match_preimage() {
        assert_eq!(NAME_HASH, hash(b"Gnosis Protocol"));
        assert_eq!(VERSION_HASH, hash(b"v2"));
    }

    #[test]
    fn order_id_is_stable_across_equal_params() {
        let params = ConditionalOrderParams {
            handler: Address::repeat_byte(0xaa),
            salt: H256::repeat_byte(0x11),
            static_input: vec![0x00],
        };
        assert_eq!(params.id(), params.clone().id());
    }

    #[test]
    fn order_uid_round_trips_through_json() {
        let order = DiscreteOrder {
            sell_token: Address::repeat_byte(1),
            buy_token: Address::repeat_byte(2),
            receiver: Address::zero(),
            sell_amount: 1_000.into(),
            buy_amount: 2_000.into(),
            valid_to: 1_700_000_000,
            app_data: H256::zero(),
            fee_amount: 0.into(),
            kind: OrderKind::Sell,
            partially_fillable: false,
            sell_token_balance: TokenBalance::Erc20,
            buy_token_balance: TokenBalance::Erc20,
        };
        let uid = order.uid(Address::repeat_byte(3), U256::from(1), Address::repeat_byte(4));
        let json = serde_json::to_string(&uid).unwrap();
        let round_tripped: OrderUid = serde_json::from_str(&json).unwrap();
        assert_eq!(uid, round_tripped);
    }

    #[test]
    fn sanity_check_rejects_same_sell_and_buy_token() {
        let mut order = DiscreteOrder {
            sell_token: Address::repeat_byte(1),
            buy_token: Address::repeat_byte(1),
            receiver: Address::zero(),
            sell_amount: 1.into(),
            buy_amount: 1.into(),
            valid_to: 0,
            app_data: H256::zero(),
            fee_amount: 0.into(),
            kind: OrderKind::Sell,
            partially_fillable: false,
            sell_token_balance: TokenBalance::Erc20,
            buy_token_balance: TokenBalance::Erc20,
        };
        assert!(!order.is_sane());
        order.buy_token = Address::repeat_byte(2);
        assert!(order.is_sane());
    }
}

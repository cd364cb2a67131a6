use core::fmt;

use serde::{Deserialize, Serialize};
use web3::types::{H256, U256};

/// Stable positive chain identifier, e.g. `1` for Ethereum mainnet.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl ChainId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn as_u256(self) -> U256 {
        U256::from(self.0)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<U256> for ChainId {
    fn from(value: U256) -> Self {
        Self(value.as_u64())
    }
}

/// Minimal identity of a processed block: its height, wall-clock time, and
/// hash. Keeping `hash` is load-bearing for reorg detection (see
/// [`crate::BlockInfo::number`]).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct BlockInfo {
    pub number: u64,
    pub timestamp: u64,
    pub hash: H256,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn chain_id_displays_as_decimal() {
        assert_eq!(ChainId::new(137).to_string(), "137");
    }

    #[test]
    fn block_info_round_trips_through_json() {
        let block = BlockInfo {
            number: 100,
            timestamp: 1_694_340_000,
            hash: H256::zero(),
        };
        let json = serde_json::to_string(&block).unwrap();
        let back: BlockInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(block, back);
    }
}

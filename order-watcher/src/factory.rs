//! Order Factory: an external collaborator that may know how to resolve a
//! conditional order's handler without an on-chain call. Kept behind a
//! trait so the legacy Multicall3 fallback path (C4) and a factory-backed
//! path share the same call shape in tests.

use async_trait::async_trait;
use web3::types::{Address, H256};

use crate::orders::{ConditionalOrderParams, PollResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub number: u64,
    pub timestamp: u64,
}

/// What a factory had to say about a conditional order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FactoryOutcome {
    /// The factory recognizes the handler and has an opinion.
    Resolved(PollResult),
    /// The handler is not one this factory understands; fall back to the
    /// legacy on-chain path.
    Unknown,
}

#[async_trait]
pub trait OrderFactory: Send + Sync {
    async fn poll(
        &self,
        owner: Address,
        params: &ConditionalOrderParams,
        block: BlockInfo,
        proof_path: &[H256],
    ) -> FactoryOutcome;
}

/// The default factory: every handler is unknown, so every order falls
/// through to the legacy `getTradeableOrderWithSignature` multicall path.
#[derive(Debug, Default, Clone, Copy)]
pub struct LegacyOnlyFactory;

#[async_trait]
impl OrderFactory for LegacyOnlyFactory {
    async fn poll(
        &self,
        _owner: Address,
        _params: &ConditionalOrderParams,
        _block: BlockInfo,
        _proof_path: &[H256],
    ) -> FactoryOutcome {
        FactoryOutcome::Unknown
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn legacy_only_factory_always_defers() {
        let factory = LegacyOnlyFactory;
        let params = ConditionalOrderParams {
            handler: Address::zero(),
            salt: H256::zero(),
            static_input: Vec::new(),
        };
        let outcome = factory
            .poll(
                Address::zero(),
                &params,
                BlockInfo {
                    number: 1,
                    timestamp: 1,
                },
                &[],
            )
            .await;
        assert_eq!(outcome, FactoryOutcome::Unknown);
    }
}

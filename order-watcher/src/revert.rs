//! Decodes raw EVM revert payloads from `ComposableCoW`-family contracts into
//! a closed set of typed hint variants. The contract uses custom-error
//! reverts as a structured signaling channel; this module is the single
//! source of truth mapping 4-byte selectors to decoded shapes.

use ethabi::{ParamType, Token};
use thiserror::Error;
use web3::types::U256;

// Selector table: keccak256 of each error signature, truncated to 4 bytes.
// Verified against the signatures in the tests below.
const PROOF_NOT_AUTHED: [u8; 4] = hex_literal::hex!("4a821464");
const SINGLE_ORDER_NOT_AUTHED: [u8; 4] = hex_literal::hex!("7a933234");
const SWAP_GUARD_RESTRICTED: [u8; 4] = hex_literal::hex!("03fc2a7e");
const INVALID_HANDLER: [u8; 4] = hex_literal::hex!("d8f59fa5");
const INVALID_FALLBACK_HANDLER: [u8; 4] = hex_literal::hex!("79ac63cd");
const INTERFACE_NOT_SUPPORTED: [u8; 4] = hex_literal::hex!("2c7ca6d7");
const ORDER_NOT_VALID: [u8; 4] = hex_literal::hex!("c8fc2725");
const POLL_TRY_NEXT_BLOCK: [u8; 4] = hex_literal::hex!("d05f3065");
const POLL_NEVER: [u8; 4] = hex_literal::hex!("981b64cd");
const POLL_TRY_AT_BLOCK: [u8; 4] = hex_literal::hex!("1fe8506e");
const POLL_TRY_AT_EPOCH: [u8; 4] = hex_literal::hex!("7e334637");

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("revert payload numeric parameter exceeds u32::MAX")]
    OutOfBounds,
    #[error("revert payload selector matched but body could not be ABI-decoded")]
    Malformed,
}

/// A decoded revert hint. `NonCompliant` covers both payloads shorter than 4
/// bytes and payloads with an unrecognized selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevertReason {
    ProofNotAuthed,
    SingleOrderNotAuthed,
    SwapGuardRestricted,
    InvalidHandler,
    InvalidFallbackHandler,
    InterfaceNotSupported,
    OrderNotValid(String),
    PollTryNextBlock(String),
    PollNever(String),
    PollTryAtBlock(u32, String),
    PollTryAtEpoch(u32, String),
    NonCompliant,
}

/// Decode a raw revert payload (as returned in `Multicall3.Result.returnData`
/// for a failed call) into a typed [`RevertReason`].
pub fn decode(data: &[u8]) -> Result<RevertReason, Error> {
    if data.len() < 4 {
        return Ok(RevertReason::NonCompliant);
    }
    let (selector, body) = data.split_at(4);
    match selector {
        s if s == PROOF_NOT_AUTHED => Ok(RevertReason::ProofNotAuthed),
        s if s == SINGLE_ORDER_NOT_AUTHED => Ok(RevertReason::SingleOrderNotAuthed),
        s if s == SWAP_GUARD_RESTRICTED => Ok(RevertReason::SwapGuardRestricted),
        s if s == INVALID_HANDLER => Ok(RevertReason::InvalidHandler),
        s if s == INVALID_FALLBACK_HANDLER => Ok(RevertReason::InvalidFallbackHandler),
        s if s == INTERFACE_NOT_SUPPORTED => Ok(RevertReason::InterfaceNotSupported),
        s if s == ORDER_NOT_VALID => decode_message(body).map(RevertReason::OrderNotValid),
        s if s == POLL_TRY_NEXT_BLOCK => decode_message(body).map(RevertReason::PollTryNextBlock),
        s if s == POLL_NEVER => decode_message(body).map(RevertReason::PollNever),
        s if s == POLL_TRY_AT_BLOCK => {
            let (number, message) = decode_number_and_message(body)?;
            Ok(RevertReason::PollTryAtBlock(number, message))
        }
        s if s == POLL_TRY_AT_EPOCH => {
            let (epoch, message) = decode_number_and_message(body)?;
            Ok(RevertReason::PollTryAtEpoch(epoch, message))
        }
        _ => Ok(RevertReason::NonCompliant),
    }
}

fn decode_message(body: &[u8]) -> Result<String, Error> {
    let tokens = ethabi::decode(&[ParamType::String], body).map_err(|_| Error::Malformed)?;
    match tokens.into_iter().next() {
        Some(Token::String(message)) => Ok(message),
        _ => Err(Error::Malformed),
    }
}

fn decode_number_and_message(body: &[u8]) -> Result<(u32, String), Error> {
    let tokens = ethabi::decode(&[ParamType::Uint(256), ParamType::String], body)
        .map_err(|_| Error::Malformed)?;
    let mut iter = tokens.into_iter();
    let number = match iter.next() {
        Some(Token::Uint(value)) => value,
        _ => return Err(Error::Malformed),
    };
    let message = match iter.next() {
        Some(Token::String(message)) => message,
        _ => return Err(Error::Malformed),
    };
    if number > U256::from(u32::MAX) {
        return Err(Error::OutOfBounds);
    }
    Ok((number.as_u32(), message))
}

#[cfg(test)]
mod test {
    use super::*;
    use ethabi::encode;
    use types::keccak256;

    fn selector(signature: &str) -> [u8; 4] {
        let hash = keccak256(signature.as_bytes());
        [hash[0], hash[1], hash[2], hash[3]]
    }

    #[test]
    fn selectors_match_their_signatures() {
        assert_eq!(PROOF_NOT_AUTHED, selector("ProofNotAuthed()"));
        assert_eq!(SINGLE_ORDER_NOT_AUTHED, selector("SingleOrderNotAuthed()"));
        assert_eq!(SWAP_GUARD_RESTRICTED, selector("SwapGuardRestricted()"));
        assert_eq!(INVALID_HANDLER, selector("InvalidHandler()"));
        assert_eq!(
            INVALID_FALLBACK_HANDLER,
            selector("InvalidFallbackHandler()")
        );
        assert_eq!(INTERFACE_NOT_SUPPORTED, selector("InterfaceNotSupported()"));
        assert_eq!(ORDER_NOT_VALID, selector("OrderNotValid(string)"));
        assert_eq!(POLL_TRY_NEXT_BLOCK, selector("PollTryNextBlock(string)"));
        assert_eq!(POLL_NEVER, selector("PollNever(string)"));
        assert_eq!(
            POLL_TRY_AT_BLOCK,
            selector("PollTryAtBlock(uint256,string)")
        );
        assert_eq!(
            POLL_TRY_AT_EPOCH,
            selector("PollTryAtEpoch(uint256,string)")
        );
    }

    #[test]
    fn decodes_single_order_not_authed() {
        let data = hex_literal::hex!("7a933234");
        assert_eq!(decode(&data).unwrap(), RevertReason::SingleOrderNotAuthed);
    }

    #[test]
    fn decodes_poll_try_at_epoch_with_message() {
        let mut data = POLL_TRY_AT_EPOCH.to_vec();
        data.extend(encode(&[
            Token::Uint(1_694_340_000.into()),
            Token::String("here's looking at you".to_string()),
        ]));
        match decode(&data).unwrap() {
            RevertReason::PollTryAtEpoch(epoch, message) => {
                assert_eq!(epoch, 1_694_340_000);
                assert_eq!(message, "here's looking at you");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn payload_shorter_than_four_bytes_is_non_compliant() {
        assert_eq!(decode(&[0xde, 0xad]).unwrap(), RevertReason::NonCompliant);
    }

    #[test]
    fn unknown_selector_is_non_compliant() {
        assert_eq!(
            decode(&hex_literal::hex!("deadbeef")).unwrap(),
            RevertReason::NonCompliant
        );
    }

    #[test]
    fn out_of_bounds_number_is_rejected() {
        let mut data = POLL_TRY_AT_BLOCK.to_vec();
        data.extend(encode(&[
            Token::Uint(U256::from(u32::MAX) + 1),
            Token::String(String::new()),
        ]));
        assert_eq!(decode(&data), Err(Error::OutOfBounds));
    }

    #[test]
    fn malformed_body_with_known_selector_is_rejected() {
        let mut data = ORDER_NOT_VALID.to_vec();
        data.extend_from_slice(&[0x01, 0x02]);
        assert_eq!(decode(&data), Err(Error::Malformed));
    }
}

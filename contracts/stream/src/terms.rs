//! Canonical byte encoding of proposed stream terms.
//!
//! Off-chain signers and the contract must agree on this layout bit for bit.
//! All integers are big-endian and fixed width:
//!
//! | offset | size | field               |
//! |--------|------|---------------------|
//! | 0      | 1    | encoding version    |
//! | 1      | 8    | `stream_id` (u64)   |
//! | 9      | 16   | `payment_per_block` (i128) |
//! | 25     | 4    | `start_block` (u32) |
//! | 29     | 4    | `stop_block` (u32)  |
//! | 33     | ..   | contract address, XDR `ScVal` |

use soroban_sdk::{xdr::ToXdr, Address, Bytes, Env};

use crate::Timeframe;

/// Bump when the layout changes so old signatures stop matching.
pub const TERMS_ENCODING_VERSION: u8 = 2;

/// Length of the fixed-width prefix before the contract address.
pub const TERMS_PREFIX_LEN: u32 = 33;

pub fn encode_terms(
    env: &Env,
    contract: &Address,
    stream_id: u64,
    payment_per_block: i128,
    timeframe: &Timeframe,
) -> Bytes {
    let mut payload = Bytes::new(env);
    payload.push_back(TERMS_ENCODING_VERSION);
    payload.extend_from_array(&stream_id.to_be_bytes());
    payload.extend_from_array(&payment_per_block.to_be_bytes());
    payload.extend_from_array(&timeframe.start_block.to_be_bytes());
    payload.extend_from_array(&timeframe.stop_block.to_be_bytes());
    debug_assert_eq!(payload.len(), TERMS_PREFIX_LEN);
    payload.append(&contract.clone().to_xdr(env));
    payload
}

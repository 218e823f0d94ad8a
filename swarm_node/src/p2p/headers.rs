// Settlement headers carried on pushsync and retrieval streams
//
// The initiator announces its exchange rate and deduction, and the responder
// answers with its own values through the stream headler.

use crate::error::{NodeError, Result};
use crate::p2p::{Headers, HeadlerFn};
use crate::types::Address;

use bytes::Bytes;
use std::sync::Arc;

/// Header carrying the exchange rate
pub const EXCHANGE_HEADER: &str = "exchange";

/// Header carrying the deduction
pub const DEDUCTION_HEADER: &str = "deduction";

/// Exchange rate and deduction announced by a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SettlementTerms {
    /// Exchange rate of accounting units
    pub exchange_rate: u64,
    /// One-time deduction applied to the first payment
    pub deduction: u64,
}

/// Encode a u64 header value
pub fn encode_u64(value: u64) -> Bytes {
    Bytes::copy_from_slice(&value.to_be_bytes())
}

/// Decode a u64 header value, `None` if missing
pub fn decode_u64(headers: &Headers, key: &str) -> Result<Option<u64>> {
    match headers.get(key) {
        None => Ok(None),
        Some(raw) => {
            let bytes: [u8; 8] = raw.as_ref().try_into().map_err(|_| {
                NodeError::Protocol(format!("header {} has {} bytes", key, raw.len()))
            })?;
            Ok(Some(u64::from_be_bytes(bytes)))
        }
    }
}

/// Build the settlement headers for a stream
pub fn make_settlement_headers(terms: SettlementTerms) -> Headers {
    let mut headers = Headers::new();
    headers.insert(EXCHANGE_HEADER.to_string(), encode_u64(terms.exchange_rate));
    headers.insert(DEDUCTION_HEADER.to_string(), encode_u64(terms.deduction));
    headers
}

/// Parse settlement headers; both values must be present
pub fn parse_settlement_headers(headers: &Headers) -> Result<SettlementTerms> {
    let exchange_rate = decode_u64(headers, EXCHANGE_HEADER)?
        .ok_or_else(|| NodeError::Protocol("missing exchange header".into()))?;
    let deduction = decode_u64(headers, DEDUCTION_HEADER)?
        .ok_or_else(|| NodeError::Protocol("missing deduction header".into()))?;
    Ok(SettlementTerms {
        exchange_rate,
        deduction,
    })
}

/// Headler answering any request with our own settlement terms
pub fn settlement_headler(terms: SettlementTerms) -> HeadlerFn {
    Arc::new(move |_request: &Headers, _peer: &Address| make_settlement_headers(terms))
}

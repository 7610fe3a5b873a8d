// SPDX-License-Identifier: MIT OR Apache-2.0
//! asap-protocol
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Wire format and server-side validation for ASAP envelopes:
//! JSON-RPC 2.0 framing ([`jsonrpc`]), the timestamp / nonce / sender
//! validation pipeline ([`validate`]), and body compression ([`compress`]).

pub mod compress;
pub mod jsonrpc;
pub mod validate;

pub use compress::{
    COMPRESSION_THRESHOLD, CompressError, CompressionAlgorithm, accept_encoding_header,
    compress_payload, decompress, encode,
};
pub use jsonrpc::{
    ASAP_ACK_METHOD, ASAP_METHOD, JSONRPC_VERSION, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
    ResponseDecodeError, decode_response_envelope, error_codes,
};
pub use validate::{
    MAX_ENVELOPE_AGE_SECONDS, MAX_FUTURE_TOLERANCE_SECONDS, NonceStore, ValidationConfig,
    ValidationError, global_nonce_store, validate_envelope,
};

//! Module: continuation
//! Responsibility: encode pipeline snapshots into opaque tokens and decode
//! them back, bound to the plan shape that produced them.
//! Does not own: rebuilding stages from a decoded snapshot (see `pipeline`).

mod hex;


use crate::{
    error::InternalError,
    pipeline::PipelineState,
    plan::{PlanKind, PlanSignature},
    serialize::{deserialize_bounded, serialize},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error as ThisError;

// re-exports
pub use hex::{HexDecodeError, decode_hex, encode_hex};

const MAX_TOKEN_BYTES: usize = hex::MAX_TOKEN_HEX_LEN / 2;

///
/// ContinuationToken
///
/// Opaque, printable resume point handed to callers between pages.
///

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContinuationToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

///
/// ContinuationError
///

#[derive(Clone, Debug, Eq, PartialEq, ThisError)]
pub enum ContinuationError {
    #[error(transparent)]
    Hex(#[from] HexDecodeError),

    #[error("continuation token envelope is unreadable: {0}")]
    Envelope(String),

    #[error("unsupported continuation token version: {version}")]
    UnsupportedVersion { version: u8 },

    #[error("continuation token was issued for plan {actual}, not {expected}")]
    ShapeMismatch {
        expected: PlanSignature,
        actual: PlanSignature,
    },

    #[error("continuation token payload is corrupt: {0}")]
    Payload(InternalError),

    #[error("continuation token holds a {found} stage where the plan has {expected}")]
    Structure { expected: PlanKind, found: PlanKind },

    #[error("failed to encode continuation token: {0}")]
    Encode(InternalError),
}

///
/// TokenVersion
///
/// Wire-level token version; parsing stays in one place.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TokenVersion {
    V1,
}

impl TokenVersion {
    const V1_TAG: u8 = 1;

    const fn decode(raw: u8) -> Result<Self, ContinuationError> {
        match raw {
            Self::V1_TAG => Ok(Self::V1),
            version => Err(ContinuationError::UnsupportedVersion { version }),
        }
    }

    const fn encode(self) -> u8 {
        match self {
            Self::V1 => Self::V1_TAG,
        }
    }
}

///
/// TokenEnvelope
///

#[derive(Deserialize, Serialize)]
struct TokenEnvelope {
    version: u8,
    signature: [u8; 32],
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

/// Encode `state` for the plan fingerprinted by `signature`. Deterministic:
/// an unchanged state always yields the same token.
pub fn encode(
    state: &PipelineState,
    signature: PlanSignature,
) -> Result<ContinuationToken, ContinuationError> {
    encode_with_version(state, signature, TokenVersion::V1.encode())
}

fn encode_with_version(
    state: &PipelineState,
    signature: PlanSignature,
    version: u8,
) -> Result<ContinuationToken, ContinuationError> {
    let payload =
        serialize(state).map_err(|err| ContinuationError::Encode(InternalError::from(err)))?;
    let envelope = TokenEnvelope {
        version,
        signature: signature.into_bytes(),
        payload,
    };
    let bytes =
        serialize(&envelope).map_err(|err| ContinuationError::Encode(InternalError::from(err)))?;

    Ok(ContinuationToken(encode_hex(&bytes)))
}

/// Decode `token`, accepting it only for the plan fingerprinted by `expected`.
pub fn decode(token: &str, expected: PlanSignature) -> Result<PipelineState, ContinuationError> {
    let bytes = decode_hex(token)?;
    let envelope: TokenEnvelope = deserialize_bounded(&bytes, MAX_TOKEN_BYTES)
        .map_err(|err| ContinuationError::Envelope(err.to_string()))?;

    // Version first so compatibility handling stays centralized.
    let TokenVersion::V1 = TokenVersion::decode(envelope.version)?;

    let actual = PlanSignature::from_bytes(envelope.signature);
    if actual != expected {
        return Err(ContinuationError::ShapeMismatch { expected, actual });
    }

    deserialize_bounded(&envelope.payload, MAX_TOKEN_BYTES).map_err(|err| {
        ContinuationError::Payload(InternalError::continuation_corruption(err.to_string()))
    })
}

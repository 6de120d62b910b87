// Identifier encoding shared between the store, the object store key layout,
// and the ANS-104 bundle container format.
//
// Both `data_item_id` and `bundle_id` (a transaction id) are 43-char
// URL-safe, unpadded base64 strings: the textual form of a 32-byte digest.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use sha2::{Digest, Sha256};

pub const ID_BYTE_LEN: usize = 32;
pub const ID_STR_LEN: usize = 43;

#[derive(Debug, thiserror::Error)]
pub enum IdError {
    #[error("expected {ID_STR_LEN}-char base64url id, got {0} chars")]
    WrongLength(usize),
    #[error("invalid base64url id: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("decoded id is {0} bytes, expected {ID_BYTE_LEN}")]
    WrongByteLength(usize),
}

/// Base64url-encode a 32-byte digest into the canonical id form.
pub fn encode_id(bytes: &[u8; ID_BYTE_LEN]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Parse and validate a canonical id string back into its 32 raw bytes.
pub fn decode_id(id: &str) -> Result<[u8; ID_BYTE_LEN], IdError> {
    if id.len() != ID_STR_LEN {
        return Err(IdError::WrongLength(id.len()));
    }
    let bytes = URL_SAFE_NO_PAD.decode(id)?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| IdError::WrongByteLength(v.len()))
}

/// A `data_item_id` is the base64url-encoded SHA-256 hash of the item's
/// signature (spec external format, §6).
pub fn data_item_id_from_signature(signature: &[u8]) -> String {
    let digest: [u8; ID_BYTE_LEN] = Sha256::digest(signature).into();
    encode_id(&digest)
}

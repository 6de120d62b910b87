// Binary layouts fixed by the external format (spec §6): the single data
// item envelope produced by ingest, and the ANS-104-compatible bundle
// container the prepare worker assembles from many items.
//
// Both layouts are external contracts this crate does not own, so changing
// them is not this crate's call to make — this module only encodes/decodes
// what spec §6 specifies.

use thiserror::Error;

pub const ID_LEN: usize = 32;
/// Size of one bundle-container header entry: `size[32] | id[32]`.
pub const BUNDLE_ENTRY_LEN: usize = 64;
/// Size of the bundle-container item count field.
pub const BUNDLE_COUNT_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("buffer too short: need at least {need} bytes, got {got}")]
    TooShort { need: usize, got: usize },
    #[error("unknown signature type: {0}")]
    UnknownSignatureType(u16),
    #[error("item count {0} does not fit in a usize")]
    CountOverflow(u128),
}

/// Lengths of the signature and owner (public key) fields, keyed by the
/// item's `signature_type`. A small, explicit table rather than a formula:
/// new signature types are rare and each has its own fixed key geometry.
pub fn sig_len(signature_type: u16) -> Result<usize, FormatError> {
    match signature_type {
        1 => Ok(512), // RSA-PSS 4096
        2 => Ok(64),  // Ed25519
        3 => Ok(65),  // secp256k1 (Ethereum-style recoverable ECDSA)
        4 => Ok(64),  // Ed25519 (Solana)
        _ => Err(FormatError::UnknownSignatureType(signature_type)),
    }
}

pub fn owner_len(signature_type: u16) -> Result<usize, FormatError> {
    match signature_type {
        1 => Ok(512),
        2 => Ok(32),
        3 => Ok(65),
        4 => Ok(32),
        _ => Err(FormatError::UnknownSignatureType(signature_type)),
    }
}

/// The decoded envelope of one raw data item, as found at
/// `raw-data-item/{id}` in the object store.
#[derive(Debug, Clone)]
pub struct DataItemHeader {
    pub signature_type: u16,
    pub signature: Vec<u8>,
    pub owner: Vec<u8>,
    pub target: Option<[u8; ID_LEN]>,
    pub anchor: Option<[u8; ID_LEN]>,
    pub tag_count: u64,
    pub tags: Vec<u8>,
    /// Offset from the start of the raw blob where `payload` begins.
    pub payload_data_start: u64,
}

/// Parse the fixed-layout envelope at the front of a raw data item blob.
/// Does not copy the payload; callers stream that separately via the object
/// store's byte-range read starting at `payload_data_start`.
pub fn parse_data_item_header(bytes: &[u8]) -> Result<DataItemHeader, FormatError> {
    let mut cursor = 0usize;
    let signature_type = read_u16_le(bytes, cursor)?;
    cursor += 2;

    let sig_len = sig_len(signature_type)?;
    let owner_len = owner_len(signature_type)?;

    let signature = read_bytes(bytes, cursor, sig_len)?.to_vec();
    cursor += sig_len;
    let owner = read_bytes(bytes, cursor, owner_len)?.to_vec();
    cursor += owner_len;

    let target_present = read_bytes(bytes, cursor, 1)?[0];
    cursor += 1;
    let target = if target_present != 0 {
        let t = read_bytes(bytes, cursor, ID_LEN)?;
        cursor += ID_LEN;
        Some(t.try_into().expect("exactly ID_LEN bytes"))
    } else {
        None
    };

    let anchor_present = read_bytes(bytes, cursor, 1)?[0];
    cursor += 1;
    let anchor = if anchor_present != 0 {
        let a = read_bytes(bytes, cursor, ID_LEN)?;
        cursor += ID_LEN;
        Some(a.try_into().expect("exactly ID_LEN bytes"))
    } else {
        None
    };

    let tag_count = read_u64_le(bytes, cursor)?;
    cursor += 8;
    let tags_byte_count = read_u64_le(bytes, cursor)? as usize;
    cursor += 8;
    let tags = read_bytes(bytes, cursor, tags_byte_count)?.to_vec();
    cursor += tags_byte_count;

    Ok(DataItemHeader {
        signature_type,
        signature,
        owner,
        target,
        anchor,
        tag_count,
        tags,
        payload_data_start: cursor as u64,
    })
}

/// One entry in a bundle container's header section.
#[derive(Debug, Clone, Copy)]
pub struct BundleItemEntry {
    pub byte_count: u64,
    pub id: [u8; ID_LEN],
}

/// Total size of a bundle container's header section (count field plus one
/// entry per item), per spec §6.
pub fn bundle_header_byte_count(item_count: usize) -> u64 {
    (BUNDLE_COUNT_LEN + item_count * BUNDLE_ENTRY_LEN) as u64
}

/// Encode the header section of an ANS-104-compatible bundle container:
/// big-endian item count followed by one `(size, id)` pair per item, each
/// field padded to its fixed 32-byte width.
pub fn encode_bundle_header(entries: &[BundleItemEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bundle_header_byte_count(entries.len()) as usize);
    out.extend_from_slice(&u256_be(entries.len() as u128));
    for entry in entries {
        out.extend_from_slice(&u256_be(entry.byte_count as u128));
        out.extend_from_slice(&entry.id);
    }
    out
}

/// Decode a bundle container's header section back into its entries.
pub fn decode_bundle_header(bytes: &[u8]) -> Result<Vec<BundleItemEntry>, FormatError> {
    let count_bytes = read_bytes(bytes, 0, BUNDLE_COUNT_LEN)?;
    let count = be_to_u128(count_bytes);
    let count: usize = count
        .try_into()
        .map_err(|_| FormatError::CountOverflow(count))?;

    let mut entries = Vec::with_capacity(count);
    let mut cursor = BUNDLE_COUNT_LEN;
    for _ in 0..count {
        let size_bytes = read_bytes(bytes, cursor, BUNDLE_COUNT_LEN)?;
        let byte_count = be_to_u128(size_bytes) as u64;
        cursor += BUNDLE_COUNT_LEN;
        let id_bytes = read_bytes(bytes, cursor, ID_LEN)?;
        cursor += ID_LEN;
        entries.push(BundleItemEntry {
            byte_count,
            id: id_bytes.try_into().expect("exactly ID_LEN bytes"),
        });
    }
    Ok(entries)
}

fn u256_be(value: u128) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[16..].copy_from_slice(&value.to_be_bytes());
    out
}

fn be_to_u128(bytes: &[u8]) -> u128 {
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&bytes[bytes.len() - 16..]);
    u128::from_be_bytes(buf)
}

fn read_bytes(bytes: &[u8], start: usize, len: usize) -> Result<&[u8], FormatError> {
    bytes
        .get(start..start + len)
        .ok_or(FormatError::TooShort {
            need: start + len,
            got: bytes.len(),
        })
}

fn read_u16_le(bytes: &[u8], start: usize) -> Result<u16, FormatError> {
    let slice = read_bytes(bytes, start, 2)?;
    Ok(u16::from_le_bytes(slice.try_into().unwrap()))
}

fn read_u64_le(bytes: &[u8], start: usize) -> Result<u64, FormatError> {
    let slice = read_bytes(bytes, start, 8)?;
    Ok(u64::from_le_bytes(slice.try_into().unwrap()))
}

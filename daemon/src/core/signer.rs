// Bundle transaction signing: the wallet that owns this bundler service
// signs the outgoing tx header built by the prepare worker (spec §4.6 step
// 5). This is distinct from, and out of scope relative to, per-item
// signature verification and receipt signing (spec §1) — those belong to
// ingest and the optical bridge, not this crate.
//
// Ed25519 only, matching signature_type 2/4 in `core::bundle_format`'s
// key-geometry table. Key material is zeroized on drop, following the
// teacher's `Ed25519SecretKey` convention (`common::crypto::ed25519`).

use ed25519_dalek::{Signer as DalekSigner, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::core::error::{BundlerError, BundlerResult};
use crate::core::gateway::TxHeader;

/// Deep-hash-free deterministic signing input: the sha256 of the header's
/// fields in a fixed order. A real Arweave-format deep hash is out of this
/// crate's scope (spec §1: the wire format is an external contract); this
/// crate only needs a stable, collision-resistant preimage to sign.
fn signing_preimage(header: &TxHeader) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(header.owner.as_slice());
    hasher.update(header.target.as_deref().unwrap_or("").as_bytes());
    hasher.update(header.quantity.to_string().as_bytes());
    hasher.update(header.reward.to_string().as_bytes());
    hasher.update(header.last_tx.as_bytes());
    hasher.update(header.data_size.to_le_bytes());
    hasher.update(header.data_root.as_bytes());
    for (name, value) in &header.tags {
        hasher.update(name.as_bytes());
        hasher.update(value.as_bytes());
    }
    hasher.finalize().to_vec()
}

/// The bundler's own signing identity. Holds the Ed25519 signing key in
/// memory only; zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Ed25519TxSigner {
    #[zeroize(skip)]
    verifying_key: VerifyingKey,
    signing_key: SigningKey,
}

impl Ed25519TxSigner {
    pub fn from_bytes(secret: &[u8; 32]) -> BundlerResult<Self> {
        let signing_key = SigningKey::from_bytes(secret);
        let verifying_key = signing_key.verifying_key();
        Ok(Self {
            verifying_key,
            signing_key,
        })
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// The wallet's address: the same sha256-then-base64url convention used
    /// for `owner_address` on every data item (spec §3). Used by the post
    /// worker to check this wallet's on-chain balance before posting.
    pub fn wallet_address(&self) -> String {
        let digest: [u8; 32] = Sha256::digest(self.public_key()).into();
        bundler_common::ids::encode_id(&digest)
    }

    /// Sign `header` in place, filling `owner`, `id`, and `signature`. `id`
    /// is the base64url content-hash of the signature, matching the
    /// data-item id convention in `bundler_common::ids`.
    pub fn sign(&self, header: &mut TxHeader) -> BundlerResult<()> {
        header.owner = self.public_key().to_vec();
        let preimage = signing_preimage(header);
        let signature = self.signing_key.sign(&preimage);
        header.signature = signature.to_bytes().to_vec();
        header.id = bundler_common::ids::data_item_id_from_signature(&header.signature);
        Ok(())
    }
}

/// Load the signer from a 32-byte hex-encoded secret key (the format the
/// daemon's configuration carries it in; never logged).
pub fn signer_from_hex(hex_secret: &str) -> BundlerResult<Ed25519TxSigner> {
    let mut bytes = hex::decode(hex_secret)
        .map_err(|e| BundlerError::BadInput(format!("invalid wallet key hex: {e}")))?;
    if bytes.len() != 32 {
        return Err(BundlerError::BadInput(format!(
            "wallet key must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    bytes.zeroize();
    Ed25519TxSigner::from_bytes(&key)
}

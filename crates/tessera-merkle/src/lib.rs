// Ordered Merkle commitment over a batch of message payloads (SHA-256).

use sha2::{Digest as _, Sha256};
use thiserror::Error;

/// Size of a leaf digest and of the root, in bytes.
pub const DIGEST_LEN: usize = 32;

/// A 32-byte SHA-256 digest.
pub type Digest = [u8; DIGEST_LEN];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MerkleError {
    #[error("cannot build a merkle root over an empty batch")]
    Empty,
}

/// Hash a single byte string. The empty byte string is a valid input and
/// hashes to the well-known SHA-256 of zero bytes.
pub fn digest(bytes: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Hash the 64-byte concatenation of two digests.
fn digest_pair(left: &Digest, right: &Digest) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Reduce an ordered sequence of byte strings to a single 32-byte root.
///
/// The leaf layer hashes every payload; each reduction step pairs nodes
/// left-to-right and hashes the concatenation. An unpaired trailing node is
/// promoted unchanged to the next layer (not duplicated), so for a single
/// leaf the root equals `digest(leaf)`.
///
/// The root is order-sensitive: swapping two distinct leaves produces a
/// different root.
pub fn merkle_root<I, B>(leaves: I) -> Result<Digest, MerkleError>
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut layer: Vec<Digest> = leaves.into_iter().map(|m| digest(m.as_ref())).collect();
    if layer.is_empty() {
        return Err(MerkleError::Empty);
    }

    while layer.len() > 1 {
        let mut next = Vec::with_capacity(layer.len() / 2 + 1);
        let mut pairs = layer.chunks_exact(2);
        for pair in &mut pairs {
            next.push(digest_pair(&pair[0], &pair[1]));
        }
        if let [odd] = pairs.remainder() {
            next.push(*odd);
        }
        layer = next;
    }

    Ok(layer[0])
}

/// Lowercase hex rendering of a digest, for logs and API responses.
pub fn encode_hex(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

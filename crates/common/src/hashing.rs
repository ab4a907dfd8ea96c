//! SHA-256 helpers used by the log's hash chain, the Merkle-diff sync, and
//! discovery topic fingerprints.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 over the concatenation of `parts`.
pub fn sha256_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

/// Raw SHA-256 digest bytes over the concatenation of `parts`.
pub fn sha256_bytes(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Classic pairwise SHA-256 fold over a sequence of hex-encoded leaf
/// hashes, duplicating the last hash at odd levels (spec §4.2). Returns
/// the empty-string root for an empty sequence.
pub fn merkle_root(leaves: &[String]) -> String {
    if leaves.is_empty() {
        return String::new();
    }
    let mut level: Vec<[u8; 32]> = leaves
        .iter()
        .map(|h| {
            let mut out = [0u8; 32];
            let decoded = hex::decode(h).unwrap_or_default();
            let len = decoded.len().min(32);
            out[..len].copy_from_slice(&decoded[..len]);
            out
        })
        .collect();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            let last = *level.last().unwrap();
            level.push(last);
        }
        let mut next = Vec::with_capacity(level.len() / 2);
        for pair in level.chunks(2) {
            next.push(sha256_bytes(&[&pair[0], &pair[1]]));
        }
        level = next;
    }
    hex::encode(level[0])
}

use sha1::{Digest, Sha1};

/// Lowercase hex SHA-1 of `data`. Names every content-addressed artifact:
/// proofs of concept, `.max` and generation files.
pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

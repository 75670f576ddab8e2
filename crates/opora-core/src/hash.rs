use sha2::{Digest, Sha256};

/// Length of the hex prefix kept from the full SHA-256 digest. Short enough
/// to keep buffer lines readable, long enough that collisions within a group
/// are not a practical concern.
const SENDER_HASH_LEN: usize = 12;

/// Hash a transport sender id into the stable pseudonymous form stored with
/// every message. Raw sender identifiers never reach the store or the LLM.
pub fn sender_hash(sender: &str) -> String {
    let digest = Sha256::digest(sender.as_bytes());
    let mut out = hex::encode(digest);
    out.truncate(SENDER_HASH_LEN);
    out
}

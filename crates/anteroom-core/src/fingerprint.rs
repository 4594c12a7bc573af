use sha2::{Digest, Sha256};

/// Salted hashing of client-observable attributes.
///
/// The fingerprint deduplicates enqueues and optionally binds credentials to
/// their original presenter. The salt keeps raw client attributes out of the
/// store and off the event bus.
#[derive(Clone)]
pub struct Fingerprinter {
    salt: String,
}

impl Fingerprinter {
    pub fn new(salt: impl Into<String>) -> Self {
        Self { salt: salt.into() }
    }

    /// Hash the given attribute parts under the configured salt.
    /// Parts are length-delimited before hashing so ("ab", "c") and
    /// ("a", "bc") cannot collide.
    pub fn fingerprint(&self, parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        for part in parts {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Unsalted hash of a user-agent string. Stored alongside the position for
/// observability only; never used for binding decisions.
pub fn hash_agent(user_agent: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_agent.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

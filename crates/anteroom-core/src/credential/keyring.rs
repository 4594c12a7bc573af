//! RSA signing key material and rotation.

use std::collections::HashMap;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use rand::RngCore;
use rsa::pkcs1::{EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::RsaPrivateKey;

use crate::error::CredentialError;

/// One signing keypair, addressed by key id.
pub struct SigningKey {
    pub kid: String,
    pub algorithm: Algorithm,
    pub encoding: EncodingKey,
    pub decoding: DecodingKey,
}

/// Key id -> keypair map with a designated active key.
///
/// Issues always sign with the active key; validation looks keys up by the
/// envelope's key id, so credentials signed before a rotation stay valid
/// until their natural expiry.
pub struct KeyRing {
    active: String,
    keys: HashMap<String, SigningKey>,
}

impl KeyRing {
    /// Generate a fresh 2048-bit keypair and make it the sole, active key.
    pub fn generate() -> Result<Self, CredentialError> {
        let key = generate_key()?;
        let active = key.kid.clone();
        Ok(Self {
            active: active.clone(),
            keys: HashMap::from([(active, key)]),
        })
    }

    /// Generate and activate a new key, keeping old ones for validation.
    /// Returns the new key id.
    pub fn rotate(&mut self) -> Result<String, CredentialError> {
        let key = generate_key()?;
        let kid = key.kid.clone();
        self.keys.insert(kid.clone(), key);
        self.active = kid.clone();
        Ok(kid)
    }

    pub fn active(&self) -> &SigningKey {
        // The constructor guarantees the active id is present.
        &self.keys[&self.active]
    }

    pub fn find(&self, kid: &str) -> Option<&SigningKey> {
        self.keys.get(kid)
    }

    pub fn active_kid(&self) -> &str {
        &self.active
    }
}

fn generate_key() -> Result<SigningKey, CredentialError> {
    let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048)
        .map_err(|e| CredentialError::Signing(e.to_string()))?;
    let public_key = private_key.to_public_key();
    let private_pem = private_key
        .to_pkcs1_pem(Default::default())
        .map_err(|e| CredentialError::Signing(e.to_string()))?;
    let public_pem = public_key
        .to_pkcs1_pem(Default::default())
        .map_err(|e| CredentialError::Signing(e.to_string()))?;

    let mut kid_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut kid_bytes);

    Ok(SigningKey {
        kid: hex::encode(kid_bytes),
        algorithm: Algorithm::RS256,
        encoding: EncodingKey::from_rsa_pem(private_pem.as_bytes())
            .map_err(|e| CredentialError::Signing(e.to_string()))?,
        decoding: DecodingKey::from_rsa_pem(public_pem.as_bytes())
            .map_err(|e| CredentialError::Signing(e.to_string()))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_keeps_previous_keys_resolvable() {
        let mut ring = KeyRing::generate().unwrap();
        let first = ring.active_kid().to_string();

        let second = ring.rotate().unwrap();
        assert_ne!(first, second);
        assert_eq!(ring.active_kid(), second);
        assert!(ring.find(&first).is_some(), "old key must stay resolvable");
        assert!(ring.find(&second).is_some());
        assert!(ring.find("nonexistent").is_none());
    }
}

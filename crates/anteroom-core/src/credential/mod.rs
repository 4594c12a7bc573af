//! Signed, stateless bearer credentials.
//!
//! The two kinds (waiting and admitted) share one claim shape and one
//! signing path. The wire format is three base64url segments (envelope, claim set,
//! signature). The envelope carries the algorithm and key id; the kind
//! discriminator rides in the claim set. Validation is strict about
//! algorithm and key id before any signature work: algorithm agility,
//! never algorithm downgrade.

mod keyring;

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use jsonwebtoken::{Algorithm, Header, Validation};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::clock;
use crate::error::CredentialError;
use crate::position::Priority;
use crate::store::{keys, Store};

pub use keyring::{KeyRing, SigningKey};

/// Clock skew tolerance applied to `exp` and `nbf`, seconds.
pub const LEEWAY_S: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    Waiting,
    Admitted,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialKind::Waiting => f.write_str("waiting"),
            CredentialKind::Admitted => f.write_str("admitted"),
        }
    }
}

/// Claim set. `jti` equals the position id (waiting) or session id
/// (admitted); `sub` is the queue; `fph` binds the credential to the
/// fingerprint observed at issue time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub jti: String,
    pub sub: String,
    pub kind: CredentialKind,
    pub iat: i64,
    pub exp: i64,
    pub nbf: i64,
    pub fph: String,
    /// Waiting credentials only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pri: Option<u8>,
    /// Admitted credentials only: the originating position.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pos: Option<String>,
}

impl Claims {
    pub fn remaining_s(&self, now_s: u64) -> u64 {
        (self.exp - now_s as i64).max(0) as u64
    }
}

/// An encoded credential together with its claim set.
#[derive(Debug, Clone)]
pub struct IssuedCredential {
    pub token: String,
    pub claims: Claims,
}

/// Issues and validates credentials; owns the keyring and consults the
/// revocation index on every validation.
pub struct CredentialService {
    keyring: RwLock<KeyRing>,
    store: Arc<dyn Store>,
    waiting_ttl: Duration,
}

impl CredentialService {
    pub fn new(
        keyring: KeyRing,
        store: Arc<dyn Store>,
        waiting_ttl: Duration,
    ) -> Self {
        Self {
            keyring: RwLock::new(keyring),
            store,
            waiting_ttl,
        }
    }

    pub fn issue_waiting(
        &self,
        position_id: &str,
        queue_id: &str,
        priority: Priority,
        fingerprint: &str,
    ) -> Result<IssuedCredential, CredentialError> {
        let now = clock::epoch_s() as i64;
        self.issue(Claims {
            jti: position_id.to_string(),
            sub: queue_id.to_string(),
            kind: CredentialKind::Waiting,
            iat: now,
            exp: now + self.waiting_ttl.as_secs() as i64,
            nbf: now,
            fph: fingerprint.to_string(),
            pri: Some(priority.as_u8()),
            pos: None,
        })
    }

    pub fn issue_admitted(
        &self,
        session_id: &str,
        queue_id: &str,
        position_id: &str,
        fingerprint: &str,
        ttl: Duration,
    ) -> Result<IssuedCredential, CredentialError> {
        let now = clock::epoch_s() as i64;
        self.issue(Claims {
            jti: session_id.to_string(),
            sub: queue_id.to_string(),
            kind: CredentialKind::Admitted,
            iat: now,
            exp: now + ttl.as_secs() as i64,
            nbf: now,
            fph: fingerprint.to_string(),
            pri: None,
            pos: Some(position_id.to_string()),
        })
    }

    fn issue(&self, claims: Claims) -> Result<IssuedCredential, CredentialError> {
        let keyring = self
            .keyring
            .read()
            .map_err(|_| CredentialError::Signing("keyring lock poisoned".into()))?;
        let key = keyring.active();
        let mut header = Header::new(key.algorithm);
        header.kid = Some(key.kid.clone());
        let token = jsonwebtoken::encode(&header, &claims, &key.encoding)
            .map_err(|e| CredentialError::Signing(e.to_string()))?;
        Ok(IssuedCredential { token, claims })
    }

    /// Validate a presented credential.
    ///
    /// Checks, in order: envelope algorithm, key id, signature,
    /// `nbf <= now <= exp` (±30 s leeway), kind, revocation index, and,
    /// when a presenter fingerprint is supplied, the binding claim in
    /// constant time. With `lenient_binding` a mismatch is logged and
    /// tolerated (NAT and address churn); otherwise it fails with
    /// `BoundMismatch`, distinct from `Invalid`.
    pub async fn validate(
        &self,
        token: &str,
        expected: CredentialKind,
        presenter_fingerprint: Option<&str>,
        lenient_binding: bool,
    ) -> Result<Claims, CredentialError> {
        let header = jsonwebtoken::decode_header(token).map_err(|_| CredentialError::Invalid)?;
        if header.alg != Algorithm::RS256 {
            return Err(CredentialError::Algorithm(format!("{:?}", header.alg)));
        }
        let kid = header
            .kid
            .ok_or_else(|| CredentialError::UnknownKey("(none)".into()))?;

        let claims = {
            let keyring = self
                .keyring
                .read()
                .map_err(|_| CredentialError::Signing("keyring lock poisoned".into()))?;
            let key = keyring
                .find(&kid)
                .ok_or_else(|| CredentialError::UnknownKey(kid.clone()))?;

            let mut validation = Validation::new(Algorithm::RS256);
            validation.leeway = LEEWAY_S;
            validation.validate_nbf = true;
            validation.validate_aud = false;
            jsonwebtoken::decode::<Claims>(token, &key.decoding, &validation)
                .map_err(|e| match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => CredentialError::Expired,
                    jsonwebtoken::errors::ErrorKind::ImmatureSignature => {
                        CredentialError::NotYetValid
                    }
                    _ => CredentialError::Invalid,
                })?
                .claims
        };

        if claims.kind != expected {
            return Err(CredentialError::KindMismatch);
        }

        if let Some(reason) = self
            .store
            .hash_get(&keys::revocation(&claims.jti), "reason")
            .await?
        {
            return Err(CredentialError::Revoked(reason));
        }

        if let Some(presented) = presenter_fingerprint {
            let matches: bool = presented
                .as_bytes()
                .ct_eq(claims.fph.as_bytes())
                .into();
            if !matches {
                if lenient_binding {
                    warn!(jti = %claims.jti, "fingerprint mismatch tolerated (lenient binding)");
                } else {
                    return Err(CredentialError::BoundMismatch);
                }
            }
        }

        Ok(claims)
    }

    /// Whether a waiting credential is due for a refresh: remaining
    /// lifetime at or below half the issue TTL.
    pub fn needs_refresh(&self, claims: &Claims) -> bool {
        claims.remaining_s(clock::epoch_s()) * 2 <= self.waiting_ttl.as_secs()
    }

    /// Reissue a waiting credential with identical claims and fresh
    /// timestamps. The old credential is not revoked; both remain valid
    /// until expiry.
    pub fn refresh_waiting(&self, claims: &Claims) -> Result<IssuedCredential, CredentialError> {
        let now = clock::epoch_s() as i64;
        self.issue(Claims {
            iat: now,
            exp: now + self.waiting_ttl.as_secs() as i64,
            nbf: now,
            ..claims.clone()
        })
    }

    /// Insert the credential id into the revocation index for its remaining
    /// lifetime. Subsequent validations fail with `Revoked`.
    pub async fn revoke(
        &self,
        jti: &str,
        reason: &str,
        remaining: Duration,
    ) -> Result<(), CredentialError> {
        let key = keys::revocation(jti);
        self.store
            .hash_set(&key, &[("reason", reason.to_string())])
            .await?;
        self.store.expire(&key, remaining).await?;
        Ok(())
    }

    /// Rotate the signing key. Previously issued credentials keep
    /// validating through the key id in their envelope.
    pub fn rotate_keys(&self) -> Result<String, CredentialError> {
        self.keyring
            .write()
            .map_err(|_| CredentialError::Signing("keyring lock poisoned".into()))?
            .rotate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn service() -> CredentialService {
        CredentialService::new(
            KeyRing::generate().unwrap(),
            Arc::new(MemoryStore::new()),
            Duration::from_secs(1_800),
        )
    }

    #[tokio::test]
    async fn waiting_roundtrip_carries_claims() {
        let service = service();
        let issued = service
            .issue_waiting("pos-1", "launch", Priority::Vip, "fp-a")
            .unwrap();
        assert_eq!(issued.token.split('.').count(), 3);

        let claims = service
            .validate(&issued.token, CredentialKind::Waiting, Some("fp-a"), false)
            .await
            .unwrap();
        assert_eq!(claims.jti, "pos-1");
        assert_eq!(claims.sub, "launch");
        assert_eq!(claims.pri, Some(2));
        assert_eq!(claims.pos, None);
    }

    #[tokio::test]
    async fn kind_mismatch_is_distinct() {
        let service = service();
        let issued = service
            .issue_waiting("pos-1", "launch", Priority::Normal, "fp-a")
            .unwrap();
        let err = service
            .validate(&issued.token, CredentialKind::Admitted, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::KindMismatch));
    }

    #[tokio::test]
    async fn binding_mismatch_is_distinct_and_lenient_flag_tolerates() {
        let service = service();
        let issued = service
            .issue_waiting("pos-1", "launch", Priority::Normal, "fp-a")
            .unwrap();

        let err = service
            .validate(&issued.token, CredentialKind::Waiting, Some("fp-b"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::BoundMismatch));

        // Lenient mode accepts the same presentation.
        service
            .validate(&issued.token, CredentialKind::Waiting, Some("fp-b"), true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn revocation_sticks_until_expiry() {
        let service = service();
        let issued = service
            .issue_admitted("sess-1", "launch", "pos-1", "fp-a", Duration::from_secs(3600))
            .unwrap();

        service
            .revoke("sess-1", "terminated", Duration::from_secs(3600))
            .await
            .unwrap();
        let err = service
            .validate(&issued.token, CredentialKind::Admitted, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::Revoked(reason) if reason == "terminated"));
    }

    #[tokio::test]
    async fn revocation_is_per_credential_not_per_position() {
        let service = service();
        let first = service
            .issue_waiting("pos-1", "launch", Priority::Normal, "fp-a")
            .unwrap();
        service
            .revoke("pos-1", "admin", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(service
            .validate(&first.token, CredentialKind::Waiting, None, false)
            .await
            .is_err());

        // A credential with a different id for the same client still works.
        let second = service
            .issue_waiting("pos-2", "launch", Priority::Normal, "fp-a")
            .unwrap();
        service
            .validate(&second.token, CredentialKind::Waiting, None, false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn refresh_keeps_id_and_never_shrinks_expiry() {
        let service = service();
        let mut issued = service
            .issue_waiting("pos-1", "launch", Priority::Normal, "fp-a")
            .unwrap();

        for _ in 0..3 {
            let refreshed = service.refresh_waiting(&issued.claims).unwrap();
            assert_eq!(refreshed.claims.jti, "pos-1");
            assert!(refreshed.claims.exp >= issued.claims.exp);
            service
                .validate(&refreshed.token, CredentialKind::Waiting, Some("fp-a"), false)
                .await
                .unwrap();
            issued = refreshed;
        }
    }

    #[tokio::test]
    async fn rotation_keeps_old_credentials_valid() {
        let service = service();
        let old = service
            .issue_waiting("pos-1", "launch", Priority::Normal, "fp-a")
            .unwrap();

        service.rotate_keys().unwrap();
        let new = service
            .issue_waiting("pos-2", "launch", Priority::Normal, "fp-a")
            .unwrap();

        service
            .validate(&old.token, CredentialKind::Waiting, None, false)
            .await
            .expect("pre-rotation credential must stay valid");
        service
            .validate(&new.token, CredentialKind::Waiting, None, false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn foreign_algorithms_are_refused() {
        let service = service();
        // Forge a token signed with a symmetric key and an HS256 envelope.
        let claims = Claims {
            jti: "pos-1".into(),
            sub: "launch".into(),
            kind: CredentialKind::Waiting,
            iat: clock::epoch_s() as i64,
            exp: clock::epoch_s() as i64 + 600,
            nbf: clock::epoch_s() as i64,
            fph: "fp".into(),
            pri: Some(0),
            pos: None,
        };
        let forged = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(b"guessable"),
        )
        .unwrap();

        let err = service
            .validate(&forged, CredentialKind::Waiting, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::Algorithm(_)));
    }

    #[tokio::test]
    async fn tampered_tokens_are_invalid() {
        let service = service();
        let issued = service
            .issue_waiting("pos-1", "launch", Priority::Normal, "fp-a")
            .unwrap();
        let mut tampered = issued.token.clone();
        tampered.truncate(tampered.len() - 4);
        tampered.push_str("AAAA");

        let err = service
            .validate(&tampered, CredentialKind::Waiting, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::Invalid));
    }

    #[tokio::test]
    async fn unknown_key_id_is_refused() {
        let issuer = service();
        let verifier = service();
        let issued = issuer
            .issue_waiting("pos-1", "launch", Priority::Normal, "fp-a")
            .unwrap();
        // A different service instance has a different keyring.
        let err = verifier
            .validate(&issued.token, CredentialKind::Waiting, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::UnknownKey(_)));
    }
}

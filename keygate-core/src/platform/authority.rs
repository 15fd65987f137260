//! Authorization tokens for the software key store.
//!
//! A hardware keystore trusts tokens attested by the secure biometric
//! subsystem. The software equivalent is a [`TokenAuthority`]: a per-process
//! HMAC key held only by the biometric service and the key store. The service
//! mints a token once the user is verified; the store refuses any token whose
//! tag does not verify, so holding the store alone is not enough to finish an
//! operation.

use hmac::digest::Key;
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::types::{AuthToken, OperationId};

type HmacSha256 = Hmac<Sha256>;

const TOKEN_MAC_LABEL: &[u8] = b"keygate:auth-token";
const AUTHORITY_KEY_LEN: usize = 64;

/// Mints and verifies [`AuthToken`]s.
pub struct TokenAuthority {
    mac: HmacSha256,
}

impl TokenAuthority {
    /// Creates an authority with a fresh random key. Tokens never outlive it.
    #[must_use]
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; AUTHORITY_KEY_LEN]);
        OsRng.fill_bytes(key.as_mut_slice());
        Self {
            mac: <HmacSha256 as Mac>::new(Key::<HmacSha256>::from_slice(key.as_slice())),
        }
    }

    fn tagger(&self, operation: OperationId, authenticated_at_ms: u64) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(TOKEN_MAC_LABEL);
        mac.update(operation.as_bytes());
        mac.update(&authenticated_at_ms.to_be_bytes());
        mac
    }

    /// Issues a token for `operation`. Only the biometric service calls this,
    /// after the user was verified.
    #[must_use]
    pub fn mint(&self, operation: OperationId, authenticated_at_ms: u64) -> AuthToken {
        let tag = self
            .tagger(operation, authenticated_at_ms)
            .finalize()
            .into_bytes()
            .to_vec();
        AuthToken::new(operation, authenticated_at_ms, tag)
    }

    /// Whether `token` was minted by this authority. The tag is compared in
    /// constant time.
    #[must_use]
    pub fn verify(&self, token: &AuthToken) -> bool {
        self.tagger(token.operation(), token.authenticated_at_ms())
            .verify_slice(token.tag())
            .is_ok()
    }
}

impl std::fmt::Debug for TokenAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuthority").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minted_token_verifies() {
        let authority = TokenAuthority::generate();
        let token = authority.mint(OperationId::generate(), 5);
        assert!(authority.verify(&token));
    }

    #[test]
    fn test_token_from_other_authority_rejected() {
        let op = OperationId::generate();
        let token = TokenAuthority::generate().mint(op, 5);
        assert!(!TokenAuthority::generate().verify(&token));
    }

    #[test]
    fn test_altered_fields_rejected() {
        let authority = TokenAuthority::generate();
        let token = authority.mint(OperationId::generate(), 5);

        let retargeted = AuthToken::new(OperationId::generate(), 5, token.tag().to_vec());
        assert!(!authority.verify(&retargeted));
        let backdated = AuthToken::new(token.operation(), 4, token.tag().to_vec());
        assert!(!authority.verify(&backdated));
        let untagged = AuthToken::new(token.operation(), 5, Vec::new());
        assert!(!authority.verify(&untagged));
    }
}

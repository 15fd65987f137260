//! Key lifecycle on top of a [`SecureKeyStore`].

use std::sync::Arc;

use crate::error::{KeyStoreError, KeyStoreResult};
use crate::platform::SecureKeyStore;
use crate::types::{KeyAlias, KeyDescriptor, KeyHandle, KeyPair, KeyPolicy, PublicKeyBytes};

/// Creates, finds and deletes device-bound keys by alias.
///
/// `ensure_*` are idempotent: an existing key with the requested policy is
/// reused, and generation only happens when the alias is empty. A key whose
/// policy differs is never silently replaced; delete it first.
#[derive(Clone)]
pub struct KeyManager {
    store: Arc<dyn SecureKeyStore>,
}

impl KeyManager {
    /// Creates a manager over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn SecureKeyStore>) -> Self {
        Self { store }
    }

    /// Ensures an AES key exists under `alias`.
    ///
    /// # Errors
    /// `PolicyRejected` for a policy without user authentication,
    /// `UnsupportedAlgorithm` for a non-symmetric policy, `PolicyMismatch` if
    /// the alias holds a key with another policy, or any store failure.
    pub fn ensure_symmetric_key(&self, alias: &KeyAlias, policy: &KeyPolicy) -> KeyStoreResult<()> {
        if !policy.algorithm.is_symmetric() {
            return Err(KeyStoreError::UnsupportedAlgorithm(format!(
                "{} is not a symmetric algorithm",
                policy.algorithm
            )));
        }
        self.ensure(alias, policy).map(|_| ())
    }

    /// Ensures a P-256 key pair exists under `alias` and returns its public
    /// key (SEC1 uncompressed, 65 bytes).
    ///
    /// # Errors
    /// Same as [`ensure_symmetric_key`](Self::ensure_symmetric_key), with
    /// `UnsupportedAlgorithm` for a symmetric policy.
    pub fn ensure_asymmetric_key(
        &self,
        alias: &KeyAlias,
        policy: &KeyPolicy,
    ) -> KeyStoreResult<PublicKeyBytes> {
        if policy.algorithm.is_symmetric() {
            return Err(KeyStoreError::UnsupportedAlgorithm(format!(
                "{} is not an asymmetric algorithm",
                policy.algorithm
            )));
        }
        let descriptor = self.ensure(alias, policy)?;
        descriptor.public_key.ok_or_else(|| {
            KeyStoreError::Corrupted(format!("key pair `{alias}` has no public key"))
        })
    }

    /// Looks up the key pair under `alias`. Absence is not an error.
    ///
    /// # Errors
    /// `UnsupportedAlgorithm` if the alias holds a symmetric key, or any
    /// store failure.
    pub fn lookup_key_pair(&self, alias: &KeyAlias) -> KeyStoreResult<Option<KeyPair>> {
        let Some(descriptor) = self.store.describe(alias)? else {
            return Ok(None);
        };
        if descriptor.policy.algorithm.is_symmetric() {
            return Err(KeyStoreError::UnsupportedAlgorithm(format!(
                "`{alias}` holds a symmetric key"
            )));
        }
        let private_key = KeyHandle::from_descriptor(&descriptor);
        let public_key = descriptor.public_key.ok_or_else(|| {
            KeyStoreError::Corrupted(format!("key pair `{alias}` has no public key"))
        })?;
        Ok(Some(KeyPair {
            public_key,
            private_key,
        }))
    }

    /// Describes the key under `alias`, if any.
    ///
    /// # Errors
    /// Any store failure.
    pub fn describe(&self, alias: &KeyAlias) -> KeyStoreResult<Option<KeyDescriptor>> {
        self.store.describe(alias)
    }

    /// Deletes the key under `alias`. Returns whether one existed.
    ///
    /// This is the recovery path for invalidated keys: the next `ensure_*`
    /// generates a fresh key.
    ///
    /// # Errors
    /// Any store failure.
    pub fn delete_key(&self, alias: &KeyAlias) -> KeyStoreResult<bool> {
        self.store.delete(alias)
    }

    fn ensure(&self, alias: &KeyAlias, policy: &KeyPolicy) -> KeyStoreResult<KeyDescriptor> {
        policy.check().map_err(KeyStoreError::PolicyRejected)?;
        let descriptor = self.store.generate_if_absent(alias, policy)?;
        if descriptor.policy != *policy {
            return Err(KeyStoreError::PolicyMismatch {
                alias: alias.clone(),
            });
        }
        log::debug!("key `{alias}` is {}", descriptor.key_id);
        Ok(descriptor)
    }
}

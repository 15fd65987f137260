//! Binding stored keys into inert, single-use operations.
//!
//! An [`Operation`] is what the biometric gate authorizes. Binding checks the
//! key is usable and opens the operation in the store, but nothing can be
//! computed with it until the biometric service issues an [`AuthToken`] for
//! it and the store verifies that token.

use std::fmt;
use std::sync::Arc;

use secrecy::SecretSlice;

use crate::error::{KeyStoreError, OperationBindError};
use crate::platform::SecureKeyStore;
use crate::session::Proof;
use crate::types::{
    AuthToken, KeyAlgorithm, KeyAlias, KeyHandle, OperationId, OperationKind, CBC_IV_LEN,
};

/// Direction of a cipher operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    /// Encrypt; the store picks a fresh IV.
    Encrypt,
    /// Decrypt data produced under `iv`.
    Decrypt {
        /// IV returned with the ciphertext.
        iv: [u8; CBC_IV_LEN],
    },
}

impl From<CipherMode> for OperationKind {
    fn from(mode: CipherMode) -> Self {
        match mode {
            CipherMode::Encrypt => Self::Encrypt,
            CipherMode::Decrypt { iv } => Self::Decrypt { iv },
        }
    }
}

/// A bound, not yet authorized cryptographic operation.
///
/// Not `Clone`: exactly one session owns it. Dropping an operation that was
/// never executed aborts it in the store.
pub struct Operation {
    store: Arc<dyn SecureKeyStore>,
    id: OperationId,
    kind: OperationKind,
    alias: KeyAlias,
}

impl Operation {
    /// Store-side identifier of the operation.
    #[must_use]
    pub const fn id(&self) -> OperationId {
        self.id
    }

    /// What the operation will do once authorized.
    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Alias of the bound key.
    #[must_use]
    pub const fn alias(&self) -> &KeyAlias {
        &self.alias
    }

    /// Runs the authorized operation over `input`, consuming it.
    pub(crate) fn execute(self, token: &AuthToken, input: &[u8]) -> Result<Proof, KeyStoreError> {
        if token.operation() != self.id {
            log::warn!("auth token for {} presented to operation {}", token.operation(), self.id);
            return Err(KeyStoreError::NotAuthorized);
        }
        let output = self.store.finish(token, input)?;
        match self.kind {
            OperationKind::Sign => Ok(Proof::Signature {
                message: input.to_vec(),
                signature_der: output,
            }),
            OperationKind::Encrypt => {
                if output.len() < CBC_IV_LEN {
                    return Err(KeyStoreError::Crypto(
                        "encryption output shorter than its IV".to_string(),
                    ));
                }
                let (iv, ciphertext) = output.split_at(CBC_IV_LEN);
                let mut iv_bytes = [0u8; CBC_IV_LEN];
                iv_bytes.copy_from_slice(iv);
                Ok(Proof::Ciphertext {
                    iv: iv_bytes,
                    ciphertext: ciphertext.to_vec(),
                })
            }
            OperationKind::Decrypt { .. } => Ok(Proof::Plaintext(SecretSlice::from(output))),
        }
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        // No-op in the store once the operation was finished.
        self.store.abort(self.id);
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("alias", &self.alias)
            .finish_non_exhaustive()
    }
}

/// Turns ready keys into [`Operation`]s.
#[derive(Clone)]
pub struct OperationBinder {
    store: Arc<dyn SecureKeyStore>,
}

impl OperationBinder {
    /// Creates a binder over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn SecureKeyStore>) -> Self {
        Self { store }
    }

    /// Binds the symmetric key under `alias` into a cipher operation.
    ///
    /// # Errors
    /// [`OperationBindError::KeyInvalidated`] if the key was invalidated since
    /// creation, `KeyNotFound` if there is no key, `WrongKeyKind` or
    /// `PurposeNotAllowed` if the key cannot perform `mode`.
    pub fn bind_cipher(
        &self,
        alias: &KeyAlias,
        mode: CipherMode,
    ) -> Result<Operation, OperationBindError> {
        let descriptor = self
            .store
            .describe(alias)?
            .ok_or_else(|| OperationBindError::KeyNotFound {
                alias: alias.clone(),
            })?;
        if descriptor.invalidated {
            return Err(OperationBindError::KeyInvalidated {
                alias: alias.clone(),
            });
        }
        if !descriptor.policy.algorithm.is_symmetric() {
            return Err(OperationBindError::WrongKeyKind {
                alias: alias.clone(),
                found: descriptor.policy.algorithm,
            });
        }
        let kind = OperationKind::from(mode);
        if !descriptor.policy.allows(kind.purpose()) {
            return Err(OperationBindError::PurposeNotAllowed {
                alias: alias.clone(),
                purpose: kind.purpose(),
            });
        }
        self.begin(&KeyHandle::from_descriptor(&descriptor), kind)
    }

    /// Binds a private key into a signing operation.
    ///
    /// # Errors
    /// [`OperationBindError::KeyInvalidated`] if the key was invalidated or
    /// replaced since the handle was obtained; `WrongKeyKind` for a
    /// non-signing key.
    pub fn bind_signer(&self, key: &KeyHandle) -> Result<Operation, OperationBindError> {
        if key.algorithm() != KeyAlgorithm::EcP256 {
            return Err(OperationBindError::WrongKeyKind {
                alias: key.alias().clone(),
                found: key.algorithm(),
            });
        }
        self.begin(key, OperationKind::Sign)
    }

    fn begin(&self, key: &KeyHandle, kind: OperationKind) -> Result<Operation, OperationBindError> {
        let id = self.store.begin(key, &kind).map_err(|err| match err {
            KeyStoreError::KeyInvalidated { alias } => OperationBindError::KeyInvalidated { alias },
            KeyStoreError::KeyNotFound { alias } => OperationBindError::KeyNotFound { alias },
            KeyStoreError::PolicyRejected(_) => OperationBindError::PurposeNotAllowed {
                alias: key.alias().clone(),
                purpose: kind.purpose(),
            },
            other => OperationBindError::KeyStore(other),
        })?;
        log::debug!("bound {} operation {id} to `{}`", kind.purpose(), key.alias());
        Ok(Operation {
            store: Arc::clone(&self.store),
            id,
            kind,
            alias: key.alias().clone(),
        })
    }
}

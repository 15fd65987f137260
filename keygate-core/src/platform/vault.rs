//! Software key vault.
//!
//! Each alias maps to one CBOR key record in an [`AtomicBlobStore`]. The
//! secret (AES key or P-256 scalar) inside a record is sealed under a
//! [`DeviceKeystore`] with associated data binding the alias and key id, so
//! records cannot be swapped between aliases. Secrets are only unsealed inside
//! [`SecureKeyStore::finish`] and are zeroized before it returns.
//!
//! `finish` only accepts tokens minted by the [`TokenAuthority`] the vault
//! shares with the biometric service.
//!
//! # Enrollment invalidation
//!
//! The vault persists an enrollment epoch. [`SoftwareKeyStore::on_enrollment_changed`]
//! bumps it; a key generated with `invalidate_on_new_enrollment` under an older
//! epoch is permanently invalid from then on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use p256::ecdsa::{signature::Signer, Signature, SigningKey};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{KeyStoreError, KeyStoreResult};
use crate::types::{
    AuthToken, KeyAlgorithm, KeyAlias, KeyDescriptor, KeyHandle, KeyId, KeyPolicy, OperationId,
    OperationKind, PublicKeyBytes, CBC_IV_LEN,
};

use super::{AtomicBlobStore, Clock, DeviceKeystore, SecureKeyStore, TokenAuthority};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const RECORD_VERSION: u32 = 1;
const AES_KEY_LEN: usize = 32;
const EPOCH_BLOB: &str = "enrollment_epoch.cbor";
const RECORD_AD_LABEL: &[u8] = b"keygate:key-record";

#[derive(Clone, Serialize, Deserialize)]
struct KeyRecord {
    version: u32,
    alias: KeyAlias,
    key_id: KeyId,
    policy: KeyPolicy,
    sealed_secret: Vec<u8>,
    public_key: Option<PublicKeyBytes>,
    enrollment_epoch: u64,
    created_at_ms: u64,
}

impl KeyRecord {
    fn serialize(&self) -> KeyStoreResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)
            .map_err(|err| KeyStoreError::Serialization(err.to_string()))?;
        Ok(bytes)
    }

    fn deserialize(bytes: &[u8]) -> KeyStoreResult<Self> {
        let record: Self = ciborium::de::from_reader(bytes)
            .map_err(|err| KeyStoreError::Corrupted(err.to_string()))?;
        if record.version != RECORD_VERSION {
            return Err(KeyStoreError::Corrupted(format!(
                "unsupported key record version {}",
                record.version
            )));
        }
        Ok(record)
    }

    const fn is_invalidated(&self, current_epoch: u64) -> bool {
        self.policy.invalidate_on_new_enrollment && self.enrollment_epoch != current_epoch
    }

    fn descriptor(&self, current_epoch: u64) -> KeyDescriptor {
        KeyDescriptor {
            alias: self.alias.clone(),
            key_id: self.key_id,
            policy: self.policy.clone(),
            public_key: self.public_key.clone(),
            invalidated: self.is_invalidated(current_epoch),
            created_at_ms: self.created_at_ms,
        }
    }
}

struct PendingOperation {
    alias: KeyAlias,
    key_id: KeyId,
    kind: OperationKind,
    encrypt_iv: [u8; CBC_IV_LEN],
}

/// [`SecureKeyStore`] implemented in software over pluggable storage.
pub struct SoftwareKeyStore {
    keystore: Arc<dyn DeviceKeystore>,
    blobs: Arc<dyn AtomicBlobStore>,
    clock: Arc<dyn Clock>,
    authority: Arc<TokenAuthority>,
    operations: Mutex<HashMap<OperationId, PendingOperation>>,
    writes: Mutex<()>,
}

impl SoftwareKeyStore {
    /// Creates a vault sealing records with `keystore` into `blobs`.
    /// Operations finish only with tokens minted by `authority`.
    #[must_use]
    pub fn new(
        keystore: Arc<dyn DeviceKeystore>,
        blobs: Arc<dyn AtomicBlobStore>,
        clock: Arc<dyn Clock>,
        authority: Arc<TokenAuthority>,
    ) -> Self {
        Self {
            keystore,
            blobs,
            clock,
            authority,
            operations: Mutex::new(HashMap::new()),
            writes: Mutex::new(()),
        }
    }

    /// Records that the set of enrolled biometrics changed.
    ///
    /// Keys generated with `invalidate_on_new_enrollment` before this call are
    /// permanently invalidated. Returns the new enrollment epoch.
    ///
    /// # Errors
    /// Returns an error if the epoch cannot be persisted.
    pub fn on_enrollment_changed(&self) -> KeyStoreResult<u64> {
        let _guard = lock(&self.writes)?;
        let epoch = self.current_epoch()? + 1;
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&epoch, &mut bytes)
            .map_err(|err| KeyStoreError::Serialization(err.to_string()))?;
        self.blobs.write_atomic(EPOCH_BLOB, &bytes)?;
        log::info!("biometric enrollment changed, vault epoch is now {epoch}");
        Ok(epoch)
    }

    fn current_epoch(&self) -> KeyStoreResult<u64> {
        self.blobs.read(EPOCH_BLOB)?.map_or(Ok(0), |bytes| {
            ciborium::de::from_reader(bytes.as_slice())
                .map_err(|err| KeyStoreError::Corrupted(format!("enrollment epoch: {err}")))
        })
    }

    fn record_name(alias: &KeyAlias) -> String {
        format!("key-{}.cbor", hex::encode(Sha256::digest(alias.as_str().as_bytes())))
    }

    fn associated_data(alias: &KeyAlias, key_id: KeyId) -> Vec<u8> {
        let mut ad = Vec::with_capacity(RECORD_AD_LABEL.len() + alias.as_str().len() + 18);
        ad.extend_from_slice(RECORD_AD_LABEL);
        ad.push(0);
        ad.extend_from_slice(alias.as_str().as_bytes());
        ad.push(0);
        ad.extend_from_slice(&key_id.0);
        ad
    }

    fn load_record(&self, alias: &KeyAlias) -> KeyStoreResult<Option<KeyRecord>> {
        let Some(bytes) = self.blobs.read(&Self::record_name(alias))? else {
            return Ok(None);
        };
        let record = KeyRecord::deserialize(&bytes)?;
        if &record.alias != alias {
            return Err(KeyStoreError::Corrupted(format!(
                "record for `{alias}` names `{}`",
                record.alias
            )));
        }
        Ok(Some(record))
    }

    /// Loads the record a handle or operation refers to, rejecting replaced
    /// and invalidated keys.
    fn usable_record(&self, alias: &KeyAlias, key_id: KeyId) -> KeyStoreResult<KeyRecord> {
        let record = self
            .load_record(alias)?
            .ok_or_else(|| KeyStoreError::KeyNotFound {
                alias: alias.clone(),
            })?;
        if record.key_id != key_id || record.is_invalidated(self.current_epoch()?) {
            return Err(KeyStoreError::KeyInvalidated {
                alias: alias.clone(),
            });
        }
        Ok(record)
    }

    /// Writes a fresh key record. Callers hold `writes`.
    fn generate_locked(
        &self,
        alias: &KeyAlias,
        policy: &KeyPolicy,
    ) -> KeyStoreResult<KeyDescriptor> {
        let key_id = KeyId::generate();
        let (secret, public_key) = Self::generate_material(policy.algorithm);
        let sealed_secret = self
            .keystore
            .seal(&Self::associated_data(alias, key_id), &secret)?;
        let epoch = self.current_epoch()?;
        let record = KeyRecord {
            version: RECORD_VERSION,
            alias: alias.clone(),
            key_id,
            policy: policy.clone(),
            sealed_secret,
            public_key,
            enrollment_epoch: epoch,
            created_at_ms: self.clock.now_millis(),
        };
        self.blobs
            .write_atomic(&Self::record_name(alias), &record.serialize()?)?;
        log::info!("generated {} key `{alias}` ({key_id})", policy.algorithm);
        Ok(record.descriptor(epoch))
    }

    fn generate_material(
        algorithm: KeyAlgorithm,
    ) -> (Zeroizing<Vec<u8>>, Option<PublicKeyBytes>) {
        match algorithm {
            KeyAlgorithm::Aes256CbcPkcs7 => {
                let mut key = Zeroizing::new(vec![0u8; AES_KEY_LEN]);
                OsRng.fill_bytes(&mut key);
                (key, None)
            }
            KeyAlgorithm::EcP256 => {
                let signing_key = SigningKey::random(&mut OsRng);
                let public = signing_key
                    .verifying_key()
                    .to_encoded_point(false)
                    .as_bytes()
                    .to_vec();
                (
                    Zeroizing::new(signing_key.to_bytes().to_vec()),
                    Some(PublicKeyBytes::new(public)),
                )
            }
        }
    }

    fn execute(
        pending: &PendingOperation,
        secret: &[u8],
        input: &[u8],
    ) -> KeyStoreResult<Vec<u8>> {
        match pending.kind {
            OperationKind::Encrypt => {
                let ciphertext = Aes256CbcEnc::new_from_slices(secret, &pending.encrypt_iv)
                    .map_err(|err| KeyStoreError::Crypto(err.to_string()))?
                    .encrypt_padded_vec_mut::<Pkcs7>(input);
                let mut out = Vec::with_capacity(CBC_IV_LEN + ciphertext.len());
                out.extend_from_slice(&pending.encrypt_iv);
                out.extend_from_slice(&ciphertext);
                Ok(out)
            }
            OperationKind::Decrypt { iv } => Aes256CbcDec::new_from_slices(secret, &iv)
                .map_err(|err| KeyStoreError::Crypto(err.to_string()))?
                .decrypt_padded_vec_mut::<Pkcs7>(input)
                .map_err(|_| KeyStoreError::Crypto("invalid padding".to_string())),
            OperationKind::Sign => {
                let signing_key = SigningKey::from_slice(secret)
                    .map_err(|err| KeyStoreError::Crypto(err.to_string()))?;
                let signature: Signature = signing_key.sign(input);
                Ok(signature.to_der().as_bytes().to_vec())
            }
        }
    }
}

impl SecureKeyStore for SoftwareKeyStore {
    fn describe(&self, alias: &KeyAlias) -> KeyStoreResult<Option<KeyDescriptor>> {
        let epoch = self.current_epoch()?;
        Ok(self
            .load_record(alias)?
            .map(|record| record.descriptor(epoch)))
    }

    fn generate(&self, alias: &KeyAlias, policy: &KeyPolicy) -> KeyStoreResult<KeyDescriptor> {
        policy.check().map_err(KeyStoreError::PolicyRejected)?;
        let _guard = lock(&self.writes)?;
        self.generate_locked(alias, policy)
    }

    fn generate_if_absent(
        &self,
        alias: &KeyAlias,
        policy: &KeyPolicy,
    ) -> KeyStoreResult<KeyDescriptor> {
        policy.check().map_err(KeyStoreError::PolicyRejected)?;
        let _guard = lock(&self.writes)?;
        if let Some(existing) = self.load_record(alias)? {
            return Ok(existing.descriptor(self.current_epoch()?));
        }
        self.generate_locked(alias, policy)
    }

    fn delete(&self, alias: &KeyAlias) -> KeyStoreResult<bool> {
        let _guard = lock(&self.writes)?;
        let name = Self::record_name(alias);
        let existed = self.blobs.read(&name)?.is_some();
        self.blobs.delete(&name)?;
        if existed {
            log::info!("deleted key `{alias}`");
        }
        Ok(existed)
    }

    fn begin(&self, key: &KeyHandle, kind: &OperationKind) -> KeyStoreResult<OperationId> {
        let record = self.usable_record(key.alias(), key.key_id())?;
        let purpose = kind.purpose();
        if !record.policy.allows(purpose) || !record.policy.algorithm.supports(purpose) {
            return Err(KeyStoreError::PolicyRejected(format!(
                "`{}` does not allow {purpose}",
                key.alias()
            )));
        }

        let mut encrypt_iv = [0u8; CBC_IV_LEN];
        if matches!(kind, OperationKind::Encrypt) {
            OsRng.fill_bytes(&mut encrypt_iv);
        }
        let id = OperationId::generate();
        lock(&self.operations)?.insert(
            id,
            PendingOperation {
                alias: key.alias().clone(),
                key_id: key.key_id(),
                kind: *kind,
                encrypt_iv,
            },
        );
        log::debug!("began {purpose} operation {id} on `{}`", key.alias());
        Ok(id)
    }

    fn finish(&self, token: &AuthToken, input: &[u8]) -> KeyStoreResult<Vec<u8>> {
        let operation = token.operation();
        if !self.authority.verify(token) {
            log::warn!("rejected unattested auth token for operation {operation}");
            return Err(KeyStoreError::NotAuthorized);
        }
        let pending = lock(&self.operations)?
            .remove(&operation)
            .ok_or(KeyStoreError::OperationNotFound)?;

        let record = self.usable_record(&pending.alias, pending.key_id)?;
        let secret = Zeroizing::new(self.keystore.open(
            &Self::associated_data(&record.alias, record.key_id),
            &record.sealed_secret,
        )?);
        let output = Self::execute(&pending, &secret, input)?;
        log::debug!("finished operation {operation} on `{}`", pending.alias);
        Ok(output)
    }

    fn abort(&self, operation: OperationId) {
        if let Ok(mut operations) = lock(&self.operations) {
            if operations.remove(&operation).is_some() {
                log::debug!("aborted operation {operation}");
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> KeyStoreResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| KeyStoreError::Unavailable("vault mutex poisoned".to_string()))
}

#[cfg(test)]
mod tests {
    use p256::ecdsa::{signature::Verifier, VerifyingKey};

    use super::*;
    use crate::platform::memory::{ManualClock, MemoryBlobStore};
    use crate::platform::SoftwareDeviceKeystore;

    fn vault() -> (SoftwareKeyStore, Arc<MemoryBlobStore>) {
        let blobs = Arc::new(MemoryBlobStore::new());
        let store = SoftwareKeyStore::new(
            Arc::new(SoftwareDeviceKeystore::generate()),
            blobs.clone(),
            Arc::new(ManualClock::new(1_000)),
            Arc::new(TokenAuthority::generate()),
        );
        (store, blobs)
    }

    fn alias(name: &str) -> KeyAlias {
        KeyAlias::new(name).expect("alias")
    }

    fn token(store: &SoftwareKeyStore, operation: OperationId) -> AuthToken {
        store.authority.mint(operation, 1_000)
    }

    #[test]
    fn test_generate_signing_key_exposes_public_only() {
        let (store, _) = vault();
        let descriptor = store
            .generate(&alias("sign"), &KeyPolicy::signing(true))
            .expect("generate");
        let public = descriptor.public_key.expect("public key");
        assert_eq!(public.as_bytes().len(), 65);
        assert_eq!(public.as_bytes()[0], 0x04);
        assert!(!descriptor.invalidated);
        assert_eq!(descriptor.created_at_ms, 1_000);
    }

    #[test]
    fn test_record_does_not_contain_raw_secret() {
        let (store, blobs) = vault();
        let a = alias("cipher");
        store.generate(&a, &KeyPolicy::symmetric(false)).expect("generate");
        let raw = blobs
            .read(&SoftwareKeyStore::record_name(&a))
            .expect("read")
            .expect("present");
        let record = KeyRecord::deserialize(&raw).expect("record");
        // nonce + 32 byte key + tag
        assert_eq!(record.sealed_secret.len(), 24 + AES_KEY_LEN + 16);
    }

    #[test]
    fn test_sign_requires_matching_token() {
        let (store, _) = vault();
        let a = alias("sign");
        let descriptor = store.generate(&a, &KeyPolicy::signing(true)).expect("generate");
        let handle = KeyHandle::from_descriptor(&descriptor);

        let op = store.begin(&handle, &OperationKind::Sign).expect("begin");
        let forged = AuthToken::new(op, 1_000, vec![0; 32]);
        assert!(matches!(
            store.finish(&forged, b"msg"),
            Err(KeyStoreError::NotAuthorized)
        ));
        let foreign = TokenAuthority::generate().mint(op, 1_000);
        assert!(matches!(
            store.finish(&foreign, b"msg"),
            Err(KeyStoreError::NotAuthorized)
        ));

        let der = store.finish(&token(&store, op), b"msg").expect("finish");
        let key = VerifyingKey::from_sec1_bytes(
            descriptor.public_key.expect("public").as_bytes(),
        )
        .expect("public key");
        let signature = Signature::from_der(&der).expect("der");
        assert!(key.verify(b"msg", &signature).is_ok());
    }

    #[test]
    fn test_operation_finishes_once() {
        let (store, _) = vault();
        let descriptor = store
            .generate(&alias("sign"), &KeyPolicy::signing(false))
            .expect("generate");
        let handle = KeyHandle::from_descriptor(&descriptor);
        let op = store.begin(&handle, &OperationKind::Sign).expect("begin");
        store.finish(&token(&store, op), b"a").expect("first finish");
        assert!(matches!(
            store.finish(&token(&store, op), b"a"),
            Err(KeyStoreError::OperationNotFound)
        ));
    }

    #[test]
    fn test_aborted_operation_cannot_finish() {
        let (store, _) = vault();
        let descriptor = store
            .generate(&alias("sign"), &KeyPolicy::signing(false))
            .expect("generate");
        let op = store
            .begin(&KeyHandle::from_descriptor(&descriptor), &OperationKind::Sign)
            .expect("begin");
        store.abort(op);
        store.abort(op);
        assert!(matches!(
            store.finish(&token(&store, op), b"a"),
            Err(KeyStoreError::OperationNotFound)
        ));
    }

    #[test]
    fn test_encrypt_then_decrypt() {
        let (store, _) = vault();
        let descriptor = store
            .generate(&alias("cipher"), &KeyPolicy::symmetric(true))
            .expect("generate");
        let handle = KeyHandle::from_descriptor(&descriptor);

        let op = store.begin(&handle, &OperationKind::Encrypt).expect("begin");
        let sealed = store.finish(&token(&store, op), b"payload").expect("encrypt");
        let (iv, ciphertext) = sealed.split_at(CBC_IV_LEN);
        assert_eq!(ciphertext.len(), 16);

        let kind = OperationKind::Decrypt {
            iv: iv.try_into().expect("iv"),
        };
        let op = store.begin(&handle, &kind).expect("begin");
        assert_eq!(
            store.finish(&token(&store, op), ciphertext).expect("decrypt"),
            b"payload"
        );
    }

    #[test]
    fn test_purpose_outside_policy_rejected() {
        let (store, _) = vault();
        let descriptor = store
            .generate(&alias("cipher"), &KeyPolicy::symmetric(true))
            .expect("generate");
        assert!(matches!(
            store.begin(&KeyHandle::from_descriptor(&descriptor), &OperationKind::Sign),
            Err(KeyStoreError::PolicyRejected(_))
        ));
    }

    #[test]
    fn test_policy_without_user_auth_never_generated() {
        let (store, _) = vault();
        let mut policy = KeyPolicy::signing(true);
        policy.require_user_authentication = false;
        assert!(matches!(
            store.generate(&alias("sign"), &policy),
            Err(KeyStoreError::PolicyRejected(_))
        ));
        assert!(store.describe(&alias("sign")).expect("describe").is_none());
    }

    #[test]
    fn test_enrollment_change_invalidates_bound_keys_only() {
        let (store, _) = vault();
        let bound = store
            .generate(&alias("bound"), &KeyPolicy::signing(true))
            .expect("generate");
        let free = store
            .generate(&alias("free"), &KeyPolicy::signing(false))
            .expect("generate");

        let pending = store
            .begin(&KeyHandle::from_descriptor(&bound), &OperationKind::Sign)
            .expect("begin");
        assert_eq!(store.on_enrollment_changed().expect("epoch"), 1);

        assert!(store.describe(&alias("bound")).expect("describe").expect("present").invalidated);
        assert!(!store.describe(&alias("free")).expect("describe").expect("present").invalidated);
        assert!(matches!(
            store.begin(&KeyHandle::from_descriptor(&bound), &OperationKind::Sign),
            Err(KeyStoreError::KeyInvalidated { .. })
        ));
        assert!(matches!(
            store.finish(&token(&store, pending), b"m"),
            Err(KeyStoreError::KeyInvalidated { .. })
        ));
        assert!(store
            .begin(&KeyHandle::from_descriptor(&free), &OperationKind::Sign)
            .is_ok());
    }

    #[test]
    fn test_regenerated_key_invalidates_old_handle() {
        let (store, _) = vault();
        let a = alias("sign");
        let old = store.generate(&a, &KeyPolicy::signing(false)).expect("generate");
        store.generate(&a, &KeyPolicy::signing(false)).expect("regenerate");
        assert!(matches!(
            store.begin(&KeyHandle::from_descriptor(&old), &OperationKind::Sign),
            Err(KeyStoreError::KeyInvalidated { .. })
        ));
    }

    #[test]
    fn test_tampered_record_detected() {
        let (store, blobs) = vault();
        let a = alias("sign");
        let descriptor = store.generate(&a, &KeyPolicy::signing(false)).expect("generate");
        let name = SoftwareKeyStore::record_name(&a);
        let mut record =
            KeyRecord::deserialize(&blobs.read(&name).expect("read").expect("present"))
                .expect("record");
        let last = record.sealed_secret.len() - 1;
        record.sealed_secret[last] ^= 0xFF;
        blobs
            .write_atomic(&name, &record.serialize().expect("serialize"))
            .expect("write");

        let op = store
            .begin(&KeyHandle::from_descriptor(&descriptor), &OperationKind::Sign)
            .expect("begin");
        assert!(matches!(
            store.finish(&token(&store, op), b"m"),
            Err(KeyStoreError::Corrupted(_))
        ));
    }

    #[test]
    fn test_generate_if_absent_keeps_existing_key() {
        let (store, _) = vault();
        let a = alias("sign");
        let first = store
            .generate_if_absent(&a, &KeyPolicy::signing(true))
            .expect("generate");
        let second = store
            .generate_if_absent(&a, &KeyPolicy::signing(false))
            .expect("existing");
        assert_eq!(first.key_id, second.key_id);
        assert_eq!(second.policy, KeyPolicy::signing(true));
    }

    #[test]
    fn test_concurrent_generate_if_absent_yields_one_key() {
        let (store, _) = vault();
        let store = Arc::new(store);
        let a = alias("sign");
        let barrier = Arc::new(std::sync::Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                let a = a.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    store
                        .generate_if_absent(&a, &KeyPolicy::signing(true))
                        .expect("generate")
                        .key_id
                })
            })
            .collect();
        let ids: Vec<KeyId> = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread"))
            .collect();
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(
            store.describe(&a).expect("describe").expect("present").key_id,
            ids[0]
        );
    }

    #[test]
    fn test_delete_reports_presence() {
        let (store, _) = vault();
        let a = alias("sign");
        assert!(!store.delete(&a).expect("delete"));
        store.generate(&a, &KeyPolicy::signing(false)).expect("generate");
        assert!(store.delete(&a).expect("delete"));
        assert!(store.describe(&a).expect("describe").is_none());
    }
}

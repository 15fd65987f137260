//! XChaCha20-Poly1305 device keystore for hosts without a hardware keystore.
//!
//! Sealed layout: `nonce (24 bytes) || ciphertext || tag (16 bytes)`.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretBox};

use crate::error::{KeyStoreError, KeyStoreResult};

use super::DeviceKeystore;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 24;
const TAG_SIZE: usize = 16;

/// [`DeviceKeystore`] holding its device key in process memory.
///
/// The key is zeroized on drop. Where the host has an OS keychain, load the
/// device key from it and pass it to [`SoftwareDeviceKeystore::from_key`].
pub struct SoftwareDeviceKeystore {
    key: SecretBox<[u8; KEY_SIZE]>,
}

impl SoftwareDeviceKeystore {
    /// Creates a keystore with a freshly generated random device key.
    #[must_use]
    pub fn generate() -> Self {
        let mut key = Box::new([0u8; KEY_SIZE]);
        OsRng.fill_bytes(key.as_mut_slice());
        Self {
            key: SecretBox::new(key),
        }
    }

    /// Creates a keystore around an existing device key.
    #[must_use]
    pub fn from_key(key: [u8; KEY_SIZE]) -> Self {
        Self {
            key: SecretBox::new(Box::new(key)),
        }
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(self.key.expose_secret()))
    }
}

impl std::fmt::Debug for SoftwareDeviceKeystore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareDeviceKeystore")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl DeviceKeystore for SoftwareDeviceKeystore {
    fn seal(&self, associated_data: &[u8], plaintext: &[u8]) -> KeyStoreResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher()
            .encrypt(
                XNonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: associated_data,
                },
            )
            .map_err(|err| KeyStoreError::Crypto(err.to_string()))?;
        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, associated_data: &[u8], ciphertext: &[u8]) -> KeyStoreResult<Vec<u8>> {
        if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
            return Err(KeyStoreError::Corrupted(
                "sealed record too short".to_string(),
            ));
        }
        let (nonce_bytes, payload) = ciphertext.split_at(NONCE_SIZE);
        self.cipher()
            .decrypt(
                XNonce::from_slice(nonce_bytes),
                Payload {
                    msg: payload,
                    aad: associated_data,
                },
            )
            .map_err(|_| {
                KeyStoreError::Corrupted("sealed record failed authentication".to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let keystore = SoftwareDeviceKeystore::generate();
        let sealed = keystore.seal(b"ad", b"secret").expect("seal");
        assert_eq!(sealed.len(), NONCE_SIZE + 6 + TAG_SIZE);
        assert_eq!(keystore.open(b"ad", &sealed).expect("open"), b"secret");
    }

    #[test]
    fn test_associated_data_mismatch_fails() {
        let keystore = SoftwareDeviceKeystore::generate();
        let sealed = keystore.seal(b"alias-a", b"secret").expect("seal");
        assert!(matches!(
            keystore.open(b"alias-b", &sealed),
            Err(KeyStoreError::Corrupted(_))
        ));
    }

    #[test]
    fn test_other_device_key_fails() {
        let sealed = SoftwareDeviceKeystore::from_key([7; KEY_SIZE])
            .seal(b"ad", b"secret")
            .expect("seal");
        let other = SoftwareDeviceKeystore::from_key([8; KEY_SIZE]);
        assert!(other.open(b"ad", &sealed).is_err());
    }

    #[test]
    fn test_truncated_ciphertext_rejected() {
        let keystore = SoftwareDeviceKeystore::generate();
        assert!(matches!(
            keystore.open(b"ad", &[0u8; NONCE_SIZE]),
            Err(KeyStoreError::Corrupted(_))
        ));
    }
}

//! Content-at-rest encryption with key rotation.
//!
//! Keys are derived from a passphrase with Argon2id and a fresh random
//! salt, so two ciphers built from the same passphrase never share key
//! material. Ciphertext is AES-256-GCM, carried as `enc:` + base64 of
//! `nonce || sealed`; strings without the prefix pass through `decrypt`
//! unchanged so plaintext written before encryption was enabled stays
//! readable.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use zeroize::Zeroize;

use crate::error::SecurityError;

/// Sentinel prefix marking encrypted content.
pub const ENC_PREFIX: &str = "enc:";

const KEY_LEN: usize = 32;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

fn derive_key(passphrase: &str) -> Result<Vec<u8>, SecurityError> {
    if passphrase.is_empty() {
        return Err(SecurityError::InvalidInput(
            "passphrase must not be empty".into(),
        ));
    }
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    let mut key = vec![0u8; KEY_LEN];
    argon2::Argon2::default()
        .hash_password_into(passphrase.as_bytes(), &salt, &mut key)
        .map_err(|e| SecurityError::Encrypt(format!("key derivation failed: {e}")))?;
    Ok(key)
}

/// Authenticated symmetric cipher over string content.
///
/// Readers copy the key out under the read lock before use, so a
/// concurrent rotation can never expose a torn key. Rotation and
/// zeroization take the write lock.
pub struct ContentCipher {
    key: RwLock<Vec<u8>>,
}

impl ContentCipher {
    pub fn new(passphrase: &str) -> Result<Self, SecurityError> {
        Ok(Self {
            key: RwLock::new(derive_key(passphrase)?),
        })
    }

    /// True exactly when `content` carries the ciphertext sentinel.
    pub fn is_encrypted(content: &str) -> bool {
        content.starts_with(ENC_PREFIX)
    }

    fn key_copy(&self) -> Result<Vec<u8>, SecurityError> {
        let key = self.key.read().unwrap().clone();
        if key.len() != KEY_LEN {
            return Err(SecurityError::Decrypt("key has wrong length".into()));
        }
        Ok(key)
    }

    /// Seal `plaintext`. Non-deterministic: every call draws a fresh nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, SecurityError> {
        let mut key = self.key_copy()?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| SecurityError::Encrypt(e.to_string()))?;
        key.zeroize();

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| SecurityError::Encrypt(e.to_string()))?;

        let mut payload = Vec::with_capacity(NONCE_LEN + sealed.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&sealed);
        Ok(format!("{ENC_PREFIX}{}", BASE64.encode(payload)))
    }

    /// Open `content`. Input without the sentinel is returned unchanged.
    pub fn decrypt(&self, content: &str) -> Result<String, SecurityError> {
        let Some(encoded) = content.strip_prefix(ENC_PREFIX) else {
            return Ok(content.to_string());
        };

        let payload = BASE64
            .decode(encoded)
            .map_err(|e| SecurityError::Decrypt(format!("malformed base64: {e}")))?;
        if payload.len() < NONCE_LEN {
            return Err(SecurityError::Decrypt("payload shorter than nonce".into()));
        }
        let (nonce_bytes, sealed) = payload.split_at(NONCE_LEN);

        let mut key = self.key_copy()?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| SecurityError::Decrypt(e.to_string()))?;
        key.zeroize();

        let plain = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|_| SecurityError::Decrypt("authentication failed".into()))?;
        String::from_utf8(plain)
            .map_err(|e| SecurityError::Decrypt(format!("invalid UTF-8: {e}")))
    }

    /// Re-derive the key from a new passphrase with a fresh salt.
    /// Previously encrypted content becomes unreadable.
    pub fn rotate(&self, new_passphrase: &str) -> Result<(), SecurityError> {
        let new_key = derive_key(new_passphrase)?;
        let mut key = self.key.write().unwrap();
        key.zeroize();
        *key = new_key;
        Ok(())
    }

    /// Overwrite and discard key material. Idempotent; the cipher is
    /// unusable afterwards until `rotate` installs a new key.
    pub fn wipe(&self) {
        self.key.write().unwrap().zeroize();
    }
}

impl Drop for ContentCipher {
    fn drop(&mut self) {
        self.key.write().unwrap().zeroize();
    }
}

/// Callback invoked after each successful rotation with the new passphrase.
pub type RotateCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Background rotation of a [`ContentCipher`] on a fixed cadence.
pub struct KeyRotator {
    cipher: Arc<ContentCipher>,
    interval: Duration,
    on_rotate: RotateCallback,
    shutdown: watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl KeyRotator {
    pub fn new(cipher: Arc<ContentCipher>, interval: Duration, on_rotate: RotateCallback) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            cipher,
            interval,
            on_rotate,
            shutdown,
            task: tokio::sync::Mutex::new(None),
        }
    }

    fn rotate_once(
        cipher: &ContentCipher,
        on_rotate: &RotateCallback,
    ) -> Result<(), SecurityError> {
        let mut raw = [0u8; 32];
        OsRng.fill_bytes(&mut raw);
        let passphrase = BASE64.encode(raw);
        cipher.rotate(&passphrase)?;
        on_rotate(&passphrase);
        Ok(())
    }

    /// Rotate immediately, outside the cadence.
    pub fn rotate_now(&self) -> Result<(), SecurityError> {
        Self::rotate_once(&self.cipher, &self.on_rotate)
    }

    /// Spawn the rotation loop. Calling `start` twice is a no-op.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        let cipher = Arc::clone(&self.cipher);
        let on_rotate = Arc::clone(&self.on_rotate);
        let interval = self.interval;
        let mut shutdown = self.shutdown.subscribe();

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so the cadence
            // starts one interval after `start`.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = Self::rotate_once(&cipher, &on_rotate) {
                            tracing::warn!(error = %e, "scheduled key rotation failed");
                        } else {
                            tracing::info!("content key rotated");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    /// Signal the loop and wait for it to exit.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let _ = self.shutdown.send(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn round_trip() {
        let cipher = ContentCipher::new("correct horse").unwrap();
        let sealed = cipher.encrypt("battery staple").unwrap();
        assert!(ContentCipher::is_encrypted(&sealed));
        assert_eq!(cipher.decrypt(&sealed).unwrap(), "battery staple");
    }

    #[test]
    fn encrypt_is_nondeterministic() {
        let cipher = ContentCipher::new("p").unwrap();
        let a = cipher.encrypt("same input").unwrap();
        let b = cipher.encrypt("same input").unwrap();
        assert_ne!(a, b, "fresh nonce per call");
        assert_eq!(cipher.decrypt(&a).unwrap(), cipher.decrypt(&b).unwrap());
    }

    #[test]
    fn plaintext_passes_through() {
        let cipher = ContentCipher::new("p").unwrap();
        assert_eq!(cipher.decrypt("just text").unwrap(), "just text");
        assert!(!ContentCipher::is_encrypted("just text"));
    }

    #[test]
    fn rejects_empty_passphrase() {
        assert!(ContentCipher::new("").is_err());
        let cipher = ContentCipher::new("p").unwrap();
        assert!(cipher.rotate("").is_err());
    }

    #[test]
    fn decrypt_rejects_malformed_input() {
        let cipher = ContentCipher::new("p").unwrap();
        assert!(matches!(
            cipher.decrypt("enc:!!!not-base64!!!"),
            Err(SecurityError::Decrypt(_))
        ));
        // Valid base64 but shorter than a nonce.
        assert!(matches!(
            cipher.decrypt("enc:AAAA"),
            Err(SecurityError::Decrypt(_))
        ));
    }

    #[test]
    fn decrypt_rejects_tampered_ciphertext() {
        let cipher = ContentCipher::new("p").unwrap();
        let sealed = cipher.encrypt("payload").unwrap();
        let mut bytes = BASE64.decode(sealed.strip_prefix(ENC_PREFIX).unwrap()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let tampered = format!("{ENC_PREFIX}{}", BASE64.encode(bytes));
        assert!(matches!(
            cipher.decrypt(&tampered),
            Err(SecurityError::Decrypt(_))
        ));
    }

    #[test]
    fn rotation_invalidates_old_ciphertext() {
        let cipher = ContentCipher::new("first").unwrap();
        let sealed = cipher.encrypt("s").unwrap();

        cipher.rotate("second").unwrap();
        assert!(cipher.decrypt(&sealed).is_err(), "old key is gone");

        let resealed = cipher.encrypt("s").unwrap();
        assert_eq!(cipher.decrypt(&resealed).unwrap(), "s");
    }

    #[test]
    fn same_passphrase_different_salt() {
        // Two ciphers from one passphrase must not share a key.
        let a = ContentCipher::new("shared").unwrap();
        let b = ContentCipher::new("shared").unwrap();
        let sealed = a.encrypt("x").unwrap();
        assert!(b.decrypt(&sealed).is_err());
    }

    #[test]
    fn wipe_is_idempotent_and_disables_the_cipher() {
        let cipher = ContentCipher::new("p").unwrap();
        cipher.wipe();
        cipher.wipe();
        assert!(cipher.encrypt("x").is_err());
        assert!(cipher.decrypt("enc:AAAAAAAAAAAAAAAAAAAAAAAA").is_err());

        // A rotation brings it back.
        cipher.rotate("fresh").unwrap();
        let sealed = cipher.encrypt("x").unwrap();
        assert_eq!(cipher.decrypt(&sealed).unwrap(), "x");
    }

    #[tokio::test(start_paused = true)]
    async fn rotator_fires_on_cadence_and_stops() {
        let cipher = Arc::new(ContentCipher::new("seed").unwrap());
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let rotator = KeyRotator::new(
            Arc::clone(&cipher),
            Duration::from_secs(60),
            Arc::new(move |p| sink.lock().unwrap().push(p.to_string())),
        );

        rotator.start().await;
        rotator.start().await; // idempotent

        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        rotator.stop().await;

        let count = seen.lock().unwrap().len();
        assert!(count >= 1, "expected at least one rotation, saw {count}");
    }

    #[tokio::test]
    async fn rotate_now_invokes_callback() {
        let cipher = Arc::new(ContentCipher::new("seed").unwrap());
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let rotator = KeyRotator::new(
            cipher,
            Duration::from_secs(3600),
            Arc::new(move |p| sink.lock().unwrap().push(p.to_string())),
        );

        rotator.rotate_now().unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}

//! # Cryptographic Primitives
//!
//! This module provides the cryptographic foundation of the vault:
//! - X25519 ephemeral key pairs, one per connection
//! - HKDF derivation of the session cipher and challenge keys
//! - AES-256-GCM sealing of protocol payloads
//! - Argon2id derivation of the master secret
//! - Account identifiers and filenames keyed by the master secret
//!
//! ## Security Considerations
//!
//! - All secret keys are zeroized on drop
//! - MAC comparisons are constant-time
//! - Session nonces are random per message, the key never repeats across
//!   connections

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256, Sha512};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ProtocolError, ProtocolResult};
use crate::{KEY_SIZE, MASTER_SECRET_SIZE, NONCE_SIZE, OPEN_NONCE_SIZE, TAG_SIZE};

/// Ephemeral keypair for the session agreement
///
/// Generated fresh for every connection. The secret stays usable for the
/// lifetime of the connection and is zeroized on drop.
pub struct KeyPair {
    secret: StaticSecret,
    /// The public key for sharing
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Perform Diffie-Hellman with the peer's public key bytes
    ///
    /// Rejects low-order peer keys that would yield an all-zero secret.
    pub fn agree(&self, peer_public: &[u8; KEY_SIZE]) -> ProtocolResult<[u8; KEY_SIZE]> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return Err(ProtocolError::KeyExchangeError(
                "Peer public key is low-order".to_string(),
            ));
        }
        Ok(*shared.as_bytes())
    }

    /// Get the public key bytes for transmission
    pub fn public_bytes(&self) -> [u8; KEY_SIZE] {
        self.public.to_bytes()
    }
}

/// Keys derived from the opening exchange
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    /// Key sealing SESSION/LOGIN/CONFIGURATION/... payloads
    pub cipher_key: [u8; KEY_SIZE],
    /// Key binding challenges to this session
    pub challenge_key: [u8; KEY_SIZE],
}

impl SessionKeys {
    /// Derive session keys from the shared secret using HKDF-SHA256
    ///
    /// The salt is the client nonce followed by the server nonce, so both
    /// sides must pass them in the same order.
    pub fn derive(
        shared_secret: &[u8],
        client_nonce: &[u8; OPEN_NONCE_SIZE],
        server_nonce: &[u8; OPEN_NONCE_SIZE],
    ) -> ProtocolResult<Self> {
        let mut salt = [0u8; OPEN_NONCE_SIZE * 2];
        salt[..OPEN_NONCE_SIZE].copy_from_slice(client_nonce);
        salt[OPEN_NONCE_SIZE..].copy_from_slice(server_nonce);

        let hk = Hkdf::<Sha256>::new(Some(&salt), shared_secret);

        let mut cipher_key = [0u8; KEY_SIZE];
        let mut challenge_key = [0u8; KEY_SIZE];

        hk.expand(b"mnemo session cipher", &mut cipher_key)
            .map_err(|e| ProtocolError::CryptoError(format!("HKDF expand failed: {}", e)))?;
        hk.expand(b"mnemo session challenge", &mut challenge_key)
            .map_err(|e| ProtocolError::CryptoError(format!("HKDF expand failed: {}", e)))?;

        salt.zeroize();

        Ok(Self {
            cipher_key,
            challenge_key,
        })
    }
}

/// AES-256-GCM cipher for protocol payloads
///
/// Output layout: `[12-byte random nonce][ciphertext + tag]`. The command
/// name is passed as associated data.
pub struct SessionCipher {
    cipher: Aes256Gcm,
}

impl SessionCipher {
    /// Create a new cipher context
    pub fn new(key: &[u8; KEY_SIZE]) -> ProtocolResult<Self> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| ProtocolError::CryptoError(format!("Failed to create cipher: {}", e)))?;
        Ok(Self { cipher })
    }

    /// Encrypt plaintext bound to `aad`
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> ProtocolResult<Vec<u8>> {
        let nonce_bytes: [u8; NONCE_SIZE] = random_bytes();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, Payload { msg: plaintext, aad })
            .map_err(|e| ProtocolError::CryptoError(format!("Encryption failed: {}", e)))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt data produced by [`SessionCipher::seal`] with the same `aad`
    pub fn open(&self, data: &[u8], aad: &[u8]) -> ProtocolResult<Vec<u8>> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(ProtocolError::Malformed(format!(
                "Sealed payload too short: {} bytes",
                data.len()
            )));
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, Payload { msg: ciphertext, aad })
            .map_err(|e| ProtocolError::CryptoError(format!("Decryption failed: {}", e)))
    }
}

/// HMAC-SHA256 for challenge transforms
pub struct MacContext {
    key: [u8; KEY_SIZE],
}

impl MacContext {
    /// Create a new MAC context
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self { key: *key }
    }

    /// Compute HMAC over the concatenation of `parts`
    pub fn compute(&self, parts: &[&[u8]]) -> [u8; 32] {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.key)
            .expect("HMAC can take key of any size");
        for part in parts {
            mac.update(part);
        }
        mac.finalize().into_bytes().into()
    }

    /// Verify HMAC in constant time
    pub fn verify(&self, parts: &[&[u8]], expected: &[u8]) -> bool {
        let computed = self.compute(parts);
        constant_time_eq::constant_time_eq(&computed, expected)
    }
}

impl Drop for MacContext {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// HMAC-SHA512 over the concatenation of `parts`
pub fn hmac_sha512(key: &[u8], parts: &[&[u8]]) -> [u8; 64] {
    let mut mac = <Hmac<Sha512> as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 64];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Expand `N` bytes of key material from `ikm` with HKDF-SHA512
pub fn expand_key<const N: usize>(ikm: &[u8], info: &[u8]) -> ProtocolResult<[u8; N]> {
    let hk = Hkdf::<Sha512>::new(None, ikm);
    let mut okm = [0u8; N];
    hk.expand(info, &mut okm)
        .map_err(|e| ProtocolError::CryptoError(format!("HKDF expand failed: {}", e)))?;
    Ok(okm)
}

/// Password-derived account secret
///
/// Source of every long-term key of an account. Never written to disk and
/// only sent sealed under the session key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterSecret([u8; MASTER_SECRET_SIZE]);

impl MasterSecret {
    /// Wrap raw bytes received from the peer
    pub fn from_slice(bytes: &[u8]) -> ProtocolResult<Self> {
        if bytes.len() != MASTER_SECRET_SIZE {
            return Err(ProtocolError::Malformed(format!(
                "Master secret must be {} bytes, got {}",
                MASTER_SECRET_SIZE,
                bytes.len()
            )));
        }
        let mut raw = [0u8; MASTER_SECRET_SIZE];
        raw.copy_from_slice(bytes);
        Ok(Self(raw))
    }

    /// Raw secret bytes
    pub fn as_bytes(&self) -> &[u8; MASTER_SECRET_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterSecret(..)")
    }
}

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    fn to_argon2(self) -> ProtocolResult<Params> {
        Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(MASTER_SECRET_SIZE),
        )
        .map_err(|e| ProtocolError::InvalidConfiguration(format!("Argon2 parameters: {}", e)))
    }

    /// Check the parameters are accepted by Argon2
    pub fn validate(self) -> ProtocolResult<()> {
        self.to_argon2().map(|_| ())
    }
}

/// Derive the master secret from the credentials
///
/// The login is hashed into the salt so equal passwords on different
/// accounts yield unrelated secrets. This is slow on purpose; call it from a
/// blocking worker.
pub fn derive_master_secret(
    login: &str,
    password: &str,
    params: KdfParams,
) -> ProtocolResult<MasterSecret> {
    let salt = Sha256::digest(login.as_bytes());
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.to_argon2()?);

    let mut raw = [0u8; MASTER_SECRET_SIZE];
    argon
        .hash_password_into(password.as_bytes(), &salt, &mut raw)
        .map_err(|e| ProtocolError::CryptoError(format!("Argon2 failed: {}", e)))?;

    let secret = MasterSecret(raw);
    raw.zeroize();
    Ok(secret)
}

/// Compute the client identifier: `SHA-256(HMAC-SHA512(ms, ms || login))`
pub fn client_id(ms: &MasterSecret, login: &str) -> [u8; 32] {
    let mac = hmac_sha512(ms.as_bytes(), &[ms.as_bytes(), login.as_bytes()]);
    Sha256::digest(mac).into()
}

/// Compute the account filename from the master secret and login
///
/// Both halves are keyed hashes; neither the login nor the secret can be
/// read back from the name.
pub fn account_filename(ms: &MasterSecret, login: &str) -> String {
    let id = client_id(ms, login);
    let hlogin: [u8; 32] = Sha256::digest(hmac_sha512(ms.as_bytes(), &[login.as_bytes()])).into();
    format!(
        "{}{}",
        URL_SAFE_NO_PAD.encode(hlogin),
        URL_SAFE_NO_PAD.encode(id)
    )
}

/// Generate cryptographically secure random bytes
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_params() -> KdfParams {
        KdfParams {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn test_key_agreement() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let alice_shared = alice.agree(&bob.public_bytes()).unwrap();
        let bob_shared = bob.agree(&alice.public_bytes()).unwrap();

        assert_eq!(alice_shared, bob_shared);
    }

    #[test]
    fn test_low_order_peer_rejected() {
        let kp = KeyPair::generate();
        let result = kp.agree(&[0u8; KEY_SIZE]);
        assert!(matches!(result, Err(ProtocolError::KeyExchangeError(_))));
    }

    #[test]
    fn test_session_keys_depend_on_nonce_order() {
        let shared = random_bytes::<32>();
        let a = random_bytes::<OPEN_NONCE_SIZE>();
        let b = random_bytes::<OPEN_NONCE_SIZE>();

        let k1 = SessionKeys::derive(&shared, &a, &b).unwrap();
        let k2 = SessionKeys::derive(&shared, &a, &b).unwrap();
        let k3 = SessionKeys::derive(&shared, &b, &a).unwrap();

        assert_eq!(k1.cipher_key, k2.cipher_key);
        assert_ne!(k1.cipher_key, k1.challenge_key);
        assert_ne!(k1.cipher_key, k3.cipher_key);
    }

    #[test]
    fn test_session_cipher_binds_aad() {
        let cipher = SessionCipher::new(&random_bytes()).unwrap();
        let sealed = cipher.seal(b"alice", b"LOGIN").unwrap();

        assert_eq!(cipher.open(&sealed, b"LOGIN").unwrap(), b"alice");
        assert!(cipher.open(&sealed, b"CREATION").is_err());
    }

    #[test]
    fn test_session_cipher_rejects_short_input() {
        let cipher = SessionCipher::new(&random_bytes()).unwrap();
        let result = cipher.open(&[0u8; 8], b"LOGIN");
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_mac_parts() {
        let mac = MacContext::new(&random_bytes());
        let tag = mac.compute(&[b"request", b"LOGIN"]);

        assert!(mac.verify(&[b"request", b"LOGIN"], &tag));
        assert!(mac.verify(&[b"requestLOGIN"], &tag));
        assert!(!mac.verify(&[b"response", b"LOGIN"], &tag));
    }

    #[test]
    fn test_hmac_sha512_keyed_over_parts() {
        let tag = hmac_sha512(b"integrity key", &[b"canonical", b"bytes"]);
        assert_eq!(tag.len(), 64);
        assert_eq!(tag, hmac_sha512(b"integrity key", &[b"canonicalbytes"]));
        assert_ne!(tag, hmac_sha512(b"other key", &[b"canonicalbytes"]));
    }

    #[test]
    fn test_master_secret_is_deterministic_per_login() {
        let a = derive_master_secret("alice", "hunter2", test_params()).unwrap();
        let b = derive_master_secret("alice", "hunter2", test_params()).unwrap();
        let c = derive_master_secret("bob", "hunter2", test_params()).unwrap();

        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn test_invalid_kdf_params() {
        let params = KdfParams {
            memory_kib: 1,
            iterations: 1,
            parallelism: 1,
        };
        assert!(matches!(
            params.validate(),
            Err(ProtocolError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_account_filename_hides_login() {
        let ms = MasterSecret::from_slice(&[7u8; MASTER_SECRET_SIZE]).unwrap();
        let name = account_filename(&ms, "alice");

        assert_eq!(name.len(), 86);
        assert!(!name.contains("alice"));
        assert_eq!(name, account_filename(&ms, "alice"));
        assert_ne!(name, account_filename(&ms, "alicf"));

        let other = MasterSecret::from_slice(&[8u8; MASTER_SECRET_SIZE]).unwrap();
        assert_ne!(name, account_filename(&other, "alice"));
    }

    #[test]
    fn test_master_secret_length_checked() {
        assert!(MasterSecret::from_slice(&[0u8; 10]).is_err());
    }
}

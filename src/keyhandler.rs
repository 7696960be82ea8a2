//! # Layered Field Encryption
//!
//! A [`KeyHandler`] owns the key material for one account: an ordered list
//! of encryption layers derived from the master secret, plus a separate
//! integrity key that only ever feeds the record tag.
//!
//! Each layer is ECIES over X25519: a fresh ephemeral key agrees with the
//! layer's static public key, HKDF turns the shared secret into an AEAD key,
//! and the layer's algorithm seals the data.
//!
//! ```text
//! layer ciphertext = eph_pub[32] || nonce || aead(plaintext)
//! write: p -> L0 -> L1 -> L2        read: c -> L2 -> L1 -> L0
//! ```

use std::fmt;
use std::str::FromStr;

use aes_gcm::Aes256Gcm;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::crypto::{expand_key, hmac_sha512, random_bytes, MasterSecret};
use crate::error::{ProtocolError, ProtocolResult};
use crate::{INTEGRITY_TAG_SIZE, KEY_SIZE, TAG_SIZE};

/// Minimum number of layers in a suite
pub const MIN_LAYERS: usize = 3;

/// AEAD used by one layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerAlgorithm {
    Aes256Gcm,
    XChaCha20Poly1305,
}

impl LayerAlgorithm {
    /// Configuration name
    pub fn name(&self) -> &'static str {
        match self {
            LayerAlgorithm::Aes256Gcm => "aes-256-gcm",
            LayerAlgorithm::XChaCha20Poly1305 => "xchacha20-poly1305",
        }
    }

    fn nonce_len(&self) -> usize {
        match self {
            LayerAlgorithm::Aes256Gcm => 12,
            LayerAlgorithm::XChaCha20Poly1305 => 24,
        }
    }

    fn seal(&self, key: &[u8; KEY_SIZE], plaintext: &[u8], aad: &[u8]) -> ProtocolResult<Vec<u8>> {
        let payload = Payload { msg: plaintext, aad };
        let (nonce, ciphertext) = match self {
            LayerAlgorithm::Aes256Gcm => {
                let nonce: [u8; 12] = random_bytes();
                let cipher = Aes256Gcm::new_from_slice(key)
                    .map_err(|e| ProtocolError::CryptoError(format!("Bad layer key: {}", e)))?;
                let ct = cipher
                    .encrypt(aes_gcm::Nonce::from_slice(&nonce), payload)
                    .map_err(|e| ProtocolError::CryptoError(format!("Layer encryption failed: {}", e)))?;
                (nonce.to_vec(), ct)
            }
            LayerAlgorithm::XChaCha20Poly1305 => {
                let nonce: [u8; 24] = random_bytes();
                let cipher = XChaCha20Poly1305::new_from_slice(key)
                    .map_err(|e| ProtocolError::CryptoError(format!("Bad layer key: {}", e)))?;
                let ct = cipher
                    .encrypt(chacha20poly1305::XNonce::from_slice(&nonce), payload)
                    .map_err(|e| ProtocolError::CryptoError(format!("Layer encryption failed: {}", e)))?;
                (nonce.to_vec(), ct)
            }
        };

        let mut out = nonce;
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, key: &[u8; KEY_SIZE], data: &[u8], aad: &[u8]) -> ProtocolResult<Vec<u8>> {
        let nonce_len = self.nonce_len();
        if data.len() < nonce_len + TAG_SIZE {
            return Err(ProtocolError::CryptoError(
                "Layer ciphertext too short".to_string(),
            ));
        }
        let (nonce, ciphertext) = data.split_at(nonce_len);
        let payload = Payload { msg: ciphertext, aad };

        let result = match self {
            LayerAlgorithm::Aes256Gcm => Aes256Gcm::new_from_slice(key)
                .map_err(|e| ProtocolError::CryptoError(format!("Bad layer key: {}", e)))?
                .decrypt(aes_gcm::Nonce::from_slice(nonce), payload),
            LayerAlgorithm::XChaCha20Poly1305 => XChaCha20Poly1305::new_from_slice(key)
                .map_err(|e| ProtocolError::CryptoError(format!("Bad layer key: {}", e)))?
                .decrypt(chacha20poly1305::XNonce::from_slice(nonce), payload),
        };

        result.map_err(|e| ProtocolError::CryptoError(format!("Layer decryption failed: {}", e)))
    }
}

impl FromStr for LayerAlgorithm {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aes-256-gcm" => Ok(LayerAlgorithm::Aes256Gcm),
            "xchacha20-poly1305" => Ok(LayerAlgorithm::XChaCha20Poly1305),
            other => Err(ProtocolError::InvalidConfiguration(format!(
                "Unknown layer algorithm: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for LayerAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered, validated list of layer algorithms
///
/// Text form is `;`-separated, e.g. `aes-256-gcm;xchacha20-poly1305;aes-256-gcm`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSuite(Vec<LayerAlgorithm>);

impl LayerSuite {
    /// Build a suite, rejecting fewer than [`MIN_LAYERS`] layers
    pub fn new(layers: Vec<LayerAlgorithm>) -> ProtocolResult<Self> {
        if layers.len() < MIN_LAYERS {
            return Err(ProtocolError::InvalidConfiguration(format!(
                "Layer suite needs at least {} layers, got {}",
                MIN_LAYERS,
                layers.len()
            )));
        }
        Ok(Self(layers))
    }

    /// Layers in write order
    pub fn layers(&self) -> &[LayerAlgorithm] {
        &self.0
    }

    /// Number of layers
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false for a validated suite
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for LayerSuite {
    fn default() -> Self {
        Self(vec![
            LayerAlgorithm::Aes256Gcm,
            LayerAlgorithm::XChaCha20Poly1305,
            LayerAlgorithm::Aes256Gcm,
        ])
    }
}

impl FromStr for LayerSuite {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let layers = s
            .split(';')
            .filter(|part| !part.trim().is_empty())
            .map(LayerAlgorithm::from_str)
            .collect::<ProtocolResult<Vec<_>>>()?;
        Self::new(layers)
    }
}

impl fmt::Display for LayerSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(|l| l.name()).collect();
        f.write_str(&names.join(";"))
    }
}

/// One layer's static key pair
struct Layer {
    algorithm: LayerAlgorithm,
    secret: StaticSecret,
    public: PublicKey,
}

/// Derive the AEAD key for one ECIES exchange
fn layer_key(shared: &[u8], eph_public: &[u8], layer_public: &[u8]) -> ProtocolResult<[u8; KEY_SIZE]> {
    let mut salt = Vec::with_capacity(2 * KEY_SIZE);
    salt.extend_from_slice(eph_public);
    salt.extend_from_slice(layer_public);

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut key = [0u8; KEY_SIZE];
    hk.expand(b"mnemo layer key", &mut key)
        .map_err(|e| ProtocolError::CryptoError(format!("HKDF expand failed: {}", e)))?;
    Ok(key)
}

/// Layer keys and integrity key of one account
pub struct KeyHandler {
    suite: LayerSuite,
    layers: Vec<Layer>,
    ikey: [u8; INTEGRITY_TAG_SIZE],
}

impl KeyHandler {
    /// Derive every layer and the integrity key from the master secret
    pub fn new(ms: &MasterSecret, suite: &LayerSuite) -> ProtocolResult<Self> {
        let mut layers = Vec::with_capacity(suite.len());
        for (index, algorithm) in suite.layers().iter().enumerate() {
            let info = format!("mnemo layer {} {}", index, algorithm);
            let mut raw = expand_key::<KEY_SIZE>(ms.as_bytes(), info.as_bytes())?;
            let secret = StaticSecret::from(raw);
            raw.zeroize();
            let public = PublicKey::from(&secret);
            layers.push(Layer {
                algorithm: *algorithm,
                secret,
                public,
            });
        }

        let ikey = expand_key::<INTEGRITY_TAG_SIZE>(ms.as_bytes(), b"mnemo integrity")?;

        Ok(Self {
            suite: suite.clone(),
            layers,
            ikey,
        })
    }

    /// Suite this handler was built from
    pub fn suite(&self) -> &LayerSuite {
        &self.suite
    }

    /// Number of layers
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    fn layer(&self, index: usize) -> ProtocolResult<&Layer> {
        self.layers.get(index).ok_or(ProtocolError::OutOfRangeAccess {
            index,
            capacity: self.layers.len(),
        })
    }

    /// Encrypt with a single layer
    pub fn encrypt(&self, layer_index: usize, plaintext: &[u8]) -> ProtocolResult<Vec<u8>> {
        let layer = self.layer(layer_index)?;

        let eph = EphemeralSecret::random_from_rng(OsRng);
        let eph_public = PublicKey::from(&eph);
        let shared = eph.diffie_hellman(&layer.public);

        let mut key = layer_key(shared.as_bytes(), eph_public.as_bytes(), layer.public.as_bytes())?;
        let sealed = layer.algorithm.seal(&key, plaintext, &[layer_index as u8]);
        key.zeroize();

        let mut out = Vec::with_capacity(KEY_SIZE + plaintext.len() + 64);
        out.extend_from_slice(eph_public.as_bytes());
        out.extend_from_slice(&sealed?);
        Ok(out)
    }

    /// Decrypt a single layer
    pub fn decrypt(&self, layer_index: usize, ciphertext: &[u8]) -> ProtocolResult<Vec<u8>> {
        let layer = self.layer(layer_index)?;
        if ciphertext.len() < KEY_SIZE {
            return Err(ProtocolError::CryptoError(
                "Layer ciphertext too short".to_string(),
            ));
        }

        let (eph_bytes, sealed) = ciphertext.split_at(KEY_SIZE);
        let mut eph = [0u8; KEY_SIZE];
        eph.copy_from_slice(eph_bytes);
        let shared = layer.secret.diffie_hellman(&PublicKey::from(eph));

        let mut key = layer_key(shared.as_bytes(), &eph, layer.public.as_bytes())?;
        let plaintext = layer.algorithm.open(&key, sealed, &[layer_index as u8]);
        key.zeroize();
        plaintext
    }

    /// Apply every layer, innermost first
    pub fn encrypt_layered(&self, plaintext: &[u8]) -> ProtocolResult<Vec<u8>> {
        let mut data = plaintext.to_vec();
        for index in 0..self.layers.len() {
            data = self.encrypt(index, &data)?;
        }
        Ok(data)
    }

    /// Peel every layer, outermost first
    pub fn decrypt_layered(&self, ciphertext: &[u8]) -> ProtocolResult<Vec<u8>> {
        let mut data = ciphertext.to_vec();
        for index in (0..self.layers.len()).rev() {
            data = self.decrypt(index, &data)?;
        }
        Ok(data)
    }

    /// 512-bit keyed tag over canonical bytes
    pub fn integrity_tag(&self, canonical: &[u8]) -> [u8; INTEGRITY_TAG_SIZE] {
        hmac_sha512(&self.ikey, &[canonical])
    }

    /// Constant-time tag check
    pub fn verify_tag(&self, canonical: &[u8], tag: &[u8]) -> bool {
        let expected = self.integrity_tag(canonical);
        constant_time_eq::constant_time_eq(&expected, tag)
    }
}

impl Drop for KeyHandler {
    fn drop(&mut self) {
        self.ikey.zeroize();
    }
}

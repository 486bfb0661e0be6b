//! QR payload codec.
//!
//! Token layout: `base64(JSON{ciphertext, iv, salt, tag})`, every field lower
//! hex. The key is derived per token with Argon2id from the configured
//! secret and a random salt; the payload is sealed with XChaCha20-Poly1305.
//! The plaintext carries its own truncated SHA-256 checksum (`chk`) which is
//! verified after decryption, independently of the AEAD tag.

// chacha20poly1305 0.10 takes generic-array 0.14 types whose `from_slice` is deprecated.
#![allow(deprecated)]

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    Key, Tag, XChaCha20Poly1305, XNonce,
};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{PersonalDataFlags, QrPayload, PAYLOAD_VERSION};

const SALT_LEN: usize = 16;
const IV_LEN: usize = 24;
const TAG_LEN: usize = 16;
const CHECKSUM_LEN: usize = 16;
const MIN_KEY_LEN: usize = 32;
const ASSOCIATED_DATA: &[u8] = b"credential-qr/v1";

/// Codec failures, in the order the decoder can detect them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("malformed token: {0}")]
    Structural(String),

    #[error("token authentication failed")]
    Decryption,

    #[error("token checksum mismatch")]
    Integrity,

    #[error("token expired: {0}")]
    Expired(String),

    /// Issuance-side failure while sealing a payload.
    #[error("token encoding failed: {0}")]
    Encoding(String),
}

impl CodecError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            CodecError::Structural(_) => "structural_error",
            CodecError::Decryption => "decryption_failed",
            CodecError::Integrity => "integrity_mismatch",
            CodecError::Expired(_) => "token_expired",
            CodecError::Encoding(_) => "encoding_failed",
        }
    }
}

/// Argon2id cost parameters for per-token key derivation.
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
            iterations: 3,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    fn to_argon2(self) -> Result<Params, argon2::Error> {
        Params::new(self.memory_kib, self.iterations, self.parallelism, Some(32))
    }
}

/// Explicitly constructed codec configuration. There is no built-in key.
pub struct CodecConfig {
    key: Secret<String>,
    pub max_age: Duration,
    pub clock_skew: Duration,
    pub kdf: KdfParams,
}

impl std::fmt::Debug for CodecConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecConfig")
            .field("key", &"[REDACTED]")
            .field("max_age", &self.max_age)
            .field("clock_skew", &self.clock_skew)
            .field("kdf", &self.kdf)
            .finish()
    }
}

impl CodecConfig {
    pub const DEFAULT_MAX_AGE_SECONDS: i64 = 30 * 24 * 60 * 60;
    pub const DEFAULT_CLOCK_SKEW_SECONDS: i64 = 24 * 60 * 60;

    pub fn new(key: Secret<String>) -> Result<Self, AppError> {
        if key.expose_secret().len() < MIN_KEY_LEN {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "QR encryption key must be at least {} bytes",
                MIN_KEY_LEN
            )));
        }

        Ok(Self {
            key,
            max_age: Duration::seconds(Self::DEFAULT_MAX_AGE_SECONDS),
            clock_skew: Duration::seconds(Self::DEFAULT_CLOCK_SKEW_SECONDS),
            kdf: KdfParams::default(),
        })
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_clock_skew(mut self, clock_skew: Duration) -> Self {
        self.clock_skew = clock_skew;
        self
    }

    pub fn with_kdf(mut self, kdf: KdfParams) -> Result<Self, AppError> {
        kdf.to_argon2().map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("Invalid key derivation parameters: {}", e))
        })?;
        self.kdf = kdf;
        Ok(self)
    }
}

/// Outer JSON object inside the base64 layer.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Envelope {
    ciphertext: String,
    iv: String,
    salt: String,
    tag: String,
}

/// Plaintext as sealed, including the embedded checksum.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WirePayload {
    id: Uuid,
    cred: String,
    evt: Uuid,
    exp: Option<i64>,
    ts: i64,
    v: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pd: Option<PersonalDataFlags>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chk: Option<String>,
}

impl WirePayload {
    fn unsealed(payload: &QrPayload) -> Self {
        Self {
            id: payload.id,
            cred: payload.cred.clone(),
            evt: payload.evt,
            exp: payload.exp,
            ts: payload.ts,
            v: payload.v,
            pd: payload.pd,
            chk: None,
        }
    }

    /// Checksum over the serialization without `chk`.
    fn checksum(&self) -> Result<String, serde_json::Error> {
        let canonical = serde_json::to_vec(&Self {
            chk: None,
            ..self.clone()
        })?;
        let digest = hex::encode(Sha256::digest(&canonical));
        Ok(digest[..CHECKSUM_LEN].to_string())
    }

    fn into_payload(self) -> QrPayload {
        QrPayload {
            id: self.id,
            cred: self.cred,
            evt: self.evt,
            exp: self.exp,
            ts: self.ts,
            v: self.v,
            pd: self.pd,
        }
    }
}

/// SHA-256 of the token text, lower hex. This is the credential's `qr_hash`.
pub fn token_fingerprint(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Encrypts and decrypts QR payloads.
pub struct PayloadCodec {
    config: CodecConfig,
}

impl PayloadCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Seal a payload into an opaque token.
    pub fn encode(&self, payload: &QrPayload) -> Result<String, CodecError> {
        let mut wire = WirePayload::unsealed(payload);
        wire.chk = Some(
            wire.checksum()
                .map_err(|e| CodecError::Encoding(e.to_string()))?,
        );
        self.seal(&wire)
    }

    fn seal(&self, wire: &WirePayload) -> Result<String, CodecError> {
        let mut buffer =
            serde_json::to_vec(wire).map_err(|e| CodecError::Encoding(e.to_string()))?;

        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let key = self
            .derive_key(&salt)
            .map_err(|e| CodecError::Encoding(format!("key derivation failed: {}", e)))?;
        let cipher = XChaCha20Poly1305::new(&key);
        let tag = cipher
            .encrypt_in_place_detached(XNonce::from_slice(&iv), ASSOCIATED_DATA, &mut buffer)
            .map_err(|e| CodecError::Encoding(format!("encryption failed: {}", e)))?;

        let envelope = Envelope {
            ciphertext: hex::encode(&buffer),
            iv: hex::encode(iv),
            salt: hex::encode(salt),
            tag: hex::encode(tag),
        };
        let json =
            serde_json::to_vec(&envelope).map_err(|e| CodecError::Encoding(e.to_string()))?;

        Ok(STANDARD.encode(json))
    }

    /// Decode and verify a token against the current time.
    pub fn decode(&self, token: &str) -> Result<QrPayload, CodecError> {
        self.decode_at(token, Utc::now())
    }

    /// Decode and verify a token as of `now`.
    pub fn decode_at(&self, token: &str, now: DateTime<Utc>) -> Result<QrPayload, CodecError> {
        let raw = STANDARD
            .decode(token)
            .map_err(|e| CodecError::Structural(format!("token is not base64: {}", e)))?;

        let envelope: Envelope = serde_json::from_slice(&raw)
            .map_err(|e| CodecError::Structural(format!("invalid envelope: {}", e)))?;

        // Any byte-level change must either fail here or alter the sealed fields.
        let canonical = serde_json::to_vec(&envelope)
            .map_err(|e| CodecError::Structural(format!("invalid envelope: {}", e)))?;
        if canonical != raw {
            return Err(CodecError::Structural(
                "envelope is not in canonical form".to_string(),
            ));
        }

        let mut buffer = decode_hex_field("ciphertext", &envelope.ciphertext, None)?;
        let iv = decode_hex_field("iv", &envelope.iv, Some(IV_LEN))?;
        let salt = decode_hex_field("salt", &envelope.salt, Some(SALT_LEN))?;
        let tag = decode_hex_field("tag", &envelope.tag, Some(TAG_LEN))?;

        let key = self
            .derive_key(&salt)
            .map_err(|e| CodecError::Structural(format!("key derivation failed: {}", e)))?;
        let cipher = XChaCha20Poly1305::new(&key);
        cipher
            .decrypt_in_place_detached(
                XNonce::from_slice(&iv),
                ASSOCIATED_DATA,
                &mut buffer,
                Tag::from_slice(&tag),
            )
            .map_err(|_| CodecError::Decryption)?;

        let wire: WirePayload = serde_json::from_slice(&buffer)
            .map_err(|e| CodecError::Structural(format!("invalid payload: {}", e)))?;

        let embedded = wire.chk.clone().ok_or(CodecError::Integrity)?;
        let expected = wire.checksum().map_err(|_| CodecError::Integrity)?;
        if !bool::from(expected.as_bytes().ct_eq(embedded.as_bytes())) {
            return Err(CodecError::Integrity);
        }

        if wire.v != PAYLOAD_VERSION {
            return Err(CodecError::Structural(format!(
                "unsupported payload version {}",
                wire.v
            )));
        }

        let payload = wire.into_payload();
        self.check_freshness(&payload, now)?;
        Ok(payload)
    }

    fn check_freshness(&self, payload: &QrPayload, now: DateTime<Utc>) -> Result<(), CodecError> {
        let now_ts = now.timestamp();

        if now_ts - payload.ts > self.config.max_age.num_seconds() {
            return Err(CodecError::Expired("token too old".to_string()));
        }
        if payload.ts - now_ts > self.config.clock_skew.num_seconds() {
            return Err(CodecError::Expired(
                "token issued in the future".to_string(),
            ));
        }
        if let Some(exp) = payload.exp {
            if now_ts > exp {
                return Err(CodecError::Expired("token past expiry".to_string()));
            }
        }

        Ok(())
    }

    fn derive_key(&self, salt: &[u8]) -> Result<Key, argon2::Error> {
        let params = self.config.kdf.to_argon2()?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = Key::default();
        argon2.hash_password_into(
            self.config.key.expose_secret().as_bytes(),
            salt,
            key.as_mut_slice(),
        )?;
        Ok(key)
    }
}

/// Strict lower-hex decoding; uppercase is rejected so each byte string has
/// exactly one accepted spelling.
fn decode_hex_field(
    field: &str,
    value: &str,
    expected_len: Option<usize>,
) -> Result<Vec<u8>, CodecError> {
    if value.bytes().any(|b| b.is_ascii_uppercase()) {
        return Err(CodecError::Structural(format!("{} is not lower hex", field)));
    }

    let bytes = hex::decode(value)
        .map_err(|e| CodecError::Structural(format!("{} is not hex: {}", field, e)))?;

    if let Some(len) = expected_len {
        if bytes.len() != len {
            return Err(CodecError::Structural(format!(
                "{} must be {} bytes, got {}",
                field,
                len,
                bytes.len()
            )));
        }
    }

    Ok(bytes)
}

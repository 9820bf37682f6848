//! At-rest template encryption.
//!
//! Templates are sealed with AES-256-GCM over their little-endian `f32`
//! bytes, so decoding restores the vector bit for bit. The random 96-bit
//! nonce is stored in front of the ciphertext.

use crate::types::Template;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("template corrupt: {0}")]
    TemplateCorrupt(String),
    #[error("key file {path}: {source}")]
    KeyIo {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("key file {path} holds {len} bytes, expected {KEY_LEN}")]
    KeyLength { path: PathBuf, len: usize },
}

/// Whether the key was read from disk or freshly generated.
///
/// A freshly generated key cannot open anything sealed before it existed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrigin {
    Loaded,
    Created,
}

/// Symmetric key for template sealing.
#[derive(Clone)]
pub struct TemplateKey {
    bytes: [u8; KEY_LEN],
}

impl fmt::Debug for TemplateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateKey").field("id", &self.id()).finish()
    }
}

impl TemplateKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Short fingerprint recorded next to sealed templates.
    pub fn id(&self) -> String {
        Sha256::digest(self.bytes)[..8]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    /// Read the key at `path`, or generate and persist one (mode 0600).
    pub fn load_or_create(path: &Path) -> Result<(Self, KeyOrigin), CodecError> {
        let io_err = |source| CodecError::KeyIo {
            path: path.to_path_buf(),
            source,
        };

        match std::fs::read(path) {
            Ok(raw) => {
                let bytes: [u8; KEY_LEN] =
                    raw.as_slice().try_into().map_err(|_| CodecError::KeyLength {
                        path: path.to_path_buf(),
                        len: raw.len(),
                    })?;
                Ok((Self { bytes }, KeyOrigin::Loaded))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(io_err)?;
                }
                let key = Self::generate();
                let mut file = std::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(0o600)
                    .open(path)
                    .map_err(io_err)?;
                file.write_all(&key.bytes).map_err(io_err)?;
                file.sync_all().map_err(io_err)?;
                tracing::warn!(
                    path = %path.display(),
                    key_id = %key.id(),
                    "generated new template key; templates sealed with any previous key are unreadable"
                );
                Ok((key, KeyOrigin::Created))
            }
            Err(e) => Err(io_err(e)),
        }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.bytes))
    }
}

/// Seal a template: `nonce || AES-256-GCM(le_bytes(template))`.
pub fn encode_for_storage(template: &Template, key: &TemplateKey) -> Result<Vec<u8>, CodecError> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let sealed = key
        .cipher()
        .encrypt(Nonce::from_slice(&nonce), template.to_le_bytes().as_slice())
        .map_err(|_| CodecError::TemplateCorrupt("encryption failed".into()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open a template sealed by [`encode_for_storage`].
pub fn decode_from_storage(ciphertext: &[u8], key: &TemplateKey) -> Result<Template, CodecError> {
    if ciphertext.len() < NONCE_LEN {
        return Err(CodecError::TemplateCorrupt("ciphertext truncated".into()));
    }
    let (nonce, body) = ciphertext.split_at(NONCE_LEN);
    let plain = key
        .cipher()
        .decrypt(Nonce::from_slice(nonce), body)
        .map_err(|_| CodecError::TemplateCorrupt("authentication failed".into()))?;
    Template::from_le_bytes(&plain)
        .ok_or_else(|| CodecError::TemplateCorrupt("payload is not a whole number of f32".into()))
}

/// Template as written into pending-capture metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoredTemplate {
    Plain(Vec<f32>),
    Sealed { key_id: String, data: String },
}

/// Storage codec: seals with a key, or passes templates through when
/// encryption is disabled.
#[derive(Debug, Clone)]
pub struct TemplateCodec {
    key: Option<TemplateKey>,
}

impl TemplateCodec {
    pub fn plaintext() -> Self {
        Self { key: None }
    }

    pub fn sealed(key: TemplateKey) -> Self {
        Self { key: Some(key) }
    }

    pub fn is_sealing(&self) -> bool {
        self.key.is_some()
    }

    pub fn encode(&self, template: &Template) -> Result<StoredTemplate, CodecError> {
        match &self.key {
            None => Ok(StoredTemplate::Plain(template.values.clone())),
            Some(key) => Ok(StoredTemplate::Sealed {
                key_id: key.id(),
                data: BASE64.encode(encode_for_storage(template, key)?),
            }),
        }
    }

    /// Plain templates always decode, so captures written before encryption
    /// was enabled stay readable.
    pub fn decode(&self, stored: &StoredTemplate) -> Result<Template, CodecError> {
        match stored {
            StoredTemplate::Plain(values) => Ok(Template::new(values.clone())),
            StoredTemplate::Sealed { key_id, data } => {
                let key = self.key.as_ref().ok_or_else(|| {
                    CodecError::TemplateCorrupt("sealed template but encryption is disabled".into())
                })?;
                if *key_id != key.id() {
                    return Err(CodecError::TemplateCorrupt(format!(
                        "sealed with a different key ({key_id})"
                    )));
                }
                let raw = BASE64
                    .decode(data)
                    .map_err(|e| CodecError::TemplateCorrupt(format!("bad base64: {e}")))?;
                decode_from_storage(&raw, key)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Template {
        Template::new(vec![0.25, -1.5, 3.0e-7, f32::MAX, -0.0, 0.1])
    }

    #[test]
    fn test_round_trip_is_bit_exact() {
        let key = TemplateKey::generate();
        let t = sample();
        let back = decode_from_storage(&encode_for_storage(&t, &key).unwrap(), &key).unwrap();
        let bits = |t: &Template| t.values.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&t), bits(&back));
    }

    #[test]
    fn test_wrong_key_is_template_corrupt() {
        let sealed = encode_for_storage(&sample(), &TemplateKey::generate()).unwrap();
        let err = decode_from_storage(&sealed, &TemplateKey::generate()).unwrap_err();
        assert!(matches!(err, CodecError::TemplateCorrupt(_)));
    }

    #[test]
    fn test_tampered_ciphertext_is_template_corrupt() {
        let key = TemplateKey::generate();
        let mut sealed = encode_for_storage(&sample(), &key).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(
            decode_from_storage(&sealed, &key),
            Err(CodecError::TemplateCorrupt(_))
        ));
        assert!(matches!(
            decode_from_storage(&sealed[..4], &key),
            Err(CodecError::TemplateCorrupt(_))
        ));
    }

    #[test]
    fn test_plaintext_codec_is_identity() {
        let codec = TemplateCodec::plaintext();
        let stored = codec.encode(&sample()).unwrap();
        assert_eq!(stored, StoredTemplate::Plain(sample().values));
        assert_eq!(codec.decode(&stored).unwrap(), sample());
    }

    #[test]
    fn test_sealed_codec_records_key_id() {
        let key = TemplateKey::generate();
        let codec = TemplateCodec::sealed(key.clone());
        let stored = codec.encode(&sample()).unwrap();
        match &stored {
            StoredTemplate::Sealed { key_id, .. } => assert_eq!(*key_id, key.id()),
            other => panic!("expected sealed template, got {other:?}"),
        }
        assert_eq!(codec.decode(&stored).unwrap(), sample());

        let other = TemplateCodec::sealed(TemplateKey::generate());
        assert!(matches!(other.decode(&stored), Err(CodecError::TemplateCorrupt(_))));
        assert!(matches!(
            TemplateCodec::plaintext().decode(&stored),
            Err(CodecError::TemplateCorrupt(_))
        ));
    }

    #[test]
    fn test_load_or_create_persists_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("template.key");

        let (created, origin) = TemplateKey::load_or_create(&path).unwrap();
        assert_eq!(origin, KeyOrigin::Created);

        let (loaded, origin) = TemplateKey::load_or_create(&path).unwrap();
        assert_eq!(origin, KeyOrigin::Loaded);
        assert_eq!(created.id(), loaded.id());

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_load_rejects_short_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("template.key");
        std::fs::write(&path, [0u8; 7]).unwrap();
        assert!(matches!(
            TemplateKey::load_or_create(&path),
            Err(CodecError::KeyLength { len: 7, .. })
        ));
    }
}

//! Cryptographic key management.
//!
//! All key material is configured as strings: inline PEM/base64 content, or a file reference
//! when the value starts with `@` (the remainder is the path). [`KeySet::from_config`] resolves
//! and validates everything exactly once, so any defect in the deployed keys surfaces as a
//! [`ConfigError`] at startup instead of as a failing request later. The resulting [`KeySet`] is
//! immutable and can be shared behind an `Arc`.

use std::collections::HashMap;
use std::fs;

use aes_gcm::aead::{Aead, KeyInit, OsRng as AeadOsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use jsonwebtoken::{DecodingKey, EncodingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error::ConfigError;

/// Raw key configuration, as read from the deployment environment.
///
/// Which fields are required depends on the server role: an authorization server needs all of
/// them, a pure resource server only `public_key`.
#[derive(Clone, Debug, Default)]
pub struct KeyConfig {
    /// RSA private key (PEM) used to sign access and id tokens. `@path` reads a file.
    pub private_key: Option<String>,

    /// Passphrase for `private_key` when it is an encrypted PKCS#8 PEM.
    pub private_key_passphrase: Option<String>,

    /// RSA public key (PEM) used to verify tokens and published via JWKS. `@path` reads a file.
    pub public_key: Option<String>,

    /// Symmetric key for sealing authorization codes and refresh tokens: base64 of 32 bytes.
    pub codes_encryption_key: Option<String>,

    /// Named symmetric keys for encrypting data at rest, each base64 of 32 bytes.
    pub storage_encryption_keys: HashMap<String, String>,

    /// Name of the entry in `storage_encryption_keys` used for new ciphertexts.
    pub default_storage_encryption_key: Option<String>,
}

/// Resolve a configured value, following the `@` file-reference convention.
fn resolve_material(name: &'static str, value: &str) -> Result<String, ConfigError> {
    if let Some(path) = value.strip_prefix('@') {
        fs::read_to_string(path).map_err(|source| ConfigError::KeyFile {
            path: path.to_string(),
            source,
        })
    } else {
        let _ = name;
        Ok(value.to_string())
    }
}

fn decode_symmetric(name: &'static str, value: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = base64::decode(value.trim()).map_err(|err| ConfigError::MalformedKey {
        name,
        reason: format!("not valid base64: {}", err),
    })?;
    if bytes.len() != 32 {
        return Err(ConfigError::MalformedKey {
            name,
            reason: format!("expected 32 bytes after base64 decoding, got {}", bytes.len()),
        });
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Validated, immutable key material.
///
/// Constructed once per server façade. The signing/codes material is only present when built
/// with [`KeySet::from_config`]; [`KeySet::verification_only`] builds the subset a resource
/// server needs.
pub struct KeySet {
    signing: Option<EncodingKey>,
    verification: DecodingKey,
    public: RsaPublicKey,
    key_id: String,
    codes: Option<[u8; 32]>,
    storage: HashMap<String, [u8; 32]>,
    default_storage: Option<String>,
}

impl KeySet {
    /// Build the full key set an authorization server needs.
    ///
    /// Fails fast with a [`ConfigError`] naming the first missing or malformed setting.
    pub fn from_config(config: &KeyConfig) -> Result<Self, ConfigError> {
        let private_pem = config
            .private_key
            .as_deref()
            .ok_or(ConfigError::MissingSetting("private_key"))
            .and_then(|value| resolve_material("private_key", value))?;
        let signing = Self::load_signing_key(&private_pem, config.private_key_passphrase.as_deref())?;

        let (verification, public, key_id) = Self::load_public(config)?;

        let codes = config
            .codes_encryption_key
            .as_deref()
            .ok_or(ConfigError::MissingSetting("codes_encryption_key"))
            .and_then(|value| resolve_material("codes_encryption_key", value))
            .and_then(|value| decode_symmetric("codes_encryption_key", &value))?;

        if config.storage_encryption_keys.is_empty() {
            return Err(ConfigError::MissingSetting("storage_encryption_keys"));
        }
        let mut storage = HashMap::new();
        for (name, value) in &config.storage_encryption_keys {
            let material = resolve_material("storage_encryption_keys", value)?;
            storage.insert(name.clone(), decode_symmetric("storage_encryption_keys", &material)?);
        }

        let default_storage = config
            .default_storage_encryption_key
            .clone()
            .ok_or(ConfigError::MissingSetting("default_storage_encryption_key"))?;
        if !storage.contains_key(&default_storage) {
            return Err(ConfigError::UnknownStorageKey(default_storage));
        }

        Ok(KeySet {
            signing: Some(signing),
            verification,
            public,
            key_id,
            codes: Some(codes),
            storage,
            default_storage: Some(default_storage),
        })
    }

    /// Build the verification-only subset for a pure resource server.
    pub fn verification_only(config: &KeyConfig) -> Result<Self, ConfigError> {
        let (verification, public, key_id) = Self::load_public(config)?;
        Ok(KeySet {
            signing: None,
            verification,
            public,
            key_id,
            codes: None,
            storage: HashMap::new(),
            default_storage: None,
        })
    }

    fn load_public(config: &KeyConfig) -> Result<(DecodingKey, RsaPublicKey, String), ConfigError> {
        let pem = config
            .public_key
            .as_deref()
            .ok_or(ConfigError::MissingSetting("public_key"))
            .and_then(|value| resolve_material("public_key", value))?;

        let verification =
            DecodingKey::from_rsa_pem(pem.as_bytes()).map_err(|err| ConfigError::MalformedKey {
                name: "public_key",
                reason: err.to_string(),
            })?;
        let public =
            RsaPublicKey::from_public_key_pem(&pem).map_err(|err| ConfigError::MalformedKey {
                name: "public_key",
                reason: err.to_string(),
            })?;

        // The key id is stable for a given public key so cached JWKS documents stay valid.
        let digest = Sha256::digest(pem.trim().as_bytes());
        let key_id = base64::encode_config(&digest[..12], base64::URL_SAFE_NO_PAD);

        Ok((verification, public, key_id))
    }

    fn load_signing_key(pem: &str, passphrase: Option<&str>) -> Result<EncodingKey, ConfigError> {
        if let Some(passphrase) = passphrase {
            let private = RsaPrivateKey::from_pkcs8_encrypted_pem(pem, passphrase.as_bytes())
                .map_err(|err| ConfigError::MalformedKey {
                    name: "private_key",
                    reason: format!("could not decrypt pkcs#8 key: {}", err),
                })?;
            let plain = private
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|err| ConfigError::MalformedKey {
                    name: "private_key",
                    reason: err.to_string(),
                })?;
            EncodingKey::from_rsa_pem(plain.as_bytes()).map_err(|err| ConfigError::MalformedKey {
                name: "private_key",
                reason: err.to_string(),
            })
        } else {
            EncodingKey::from_rsa_pem(pem.as_bytes()).map_err(|err| ConfigError::MalformedKey {
                name: "private_key",
                reason: err.to_string(),
            })
        }
    }

    /// The token signing key. Only present on an authorization-server key set.
    pub fn signing_key(&self) -> Option<&EncodingKey> {
        self.signing.as_ref()
    }

    /// The token verification key.
    pub fn verification_key(&self) -> &DecodingKey {
        &self.verification
    }

    /// Stable identifier of the verification key, used as the JWKS `kid`.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// The symmetric key sealing authorization codes and refresh tokens.
    pub fn codes_key(&self) -> Option<&[u8; 32]> {
        self.codes.as_ref()
    }

    /// Look up a storage encryption key, `None` selecting the configured default.
    pub fn storage_key(&self, name: Option<&str>) -> Result<(&str, &[u8; 32]), ConfigError> {
        let name = match name {
            Some(name) => name,
            None => self
                .default_storage
                .as_deref()
                .ok_or(ConfigError::MissingSetting("default_storage_encryption_key"))?,
        };
        self.storage
            .get_key_value(name)
            .map(|(name, key)| (name.as_str(), key))
            .ok_or_else(|| ConfigError::UnknownStorageKey(name.to_string()))
    }

    /// The rfc7517 key set document for the `certs` endpoint.
    pub fn jwks(&self) -> serde_json::Value {
        let n = base64::encode_config(self.public.n().to_bytes_be(), base64::URL_SAFE_NO_PAD);
        let e = base64::encode_config(self.public.e().to_bytes_be(), base64::URL_SAFE_NO_PAD);
        json!({
            "keys": [{
                "kty": "RSA",
                "use": "sig",
                "alg": "RS256",
                "kid": self.key_id,
                "n": n,
                "e": e,
            }]
        })
    }
}

/// Encrypts and decrypts data at rest under the named storage keys.
///
/// The ciphertext envelope embeds the key name (`name.base64(nonce || ciphertext)`), so records
/// written under an old key stay readable after the default is rotated to a new one.
pub struct StorageEncryptor<'a> {
    keys: &'a KeySet,
}

impl<'a> StorageEncryptor<'a> {
    /// Borrow the key set for storage encryption.
    pub fn new(keys: &'a KeySet) -> Self {
        StorageEncryptor { keys }
    }

    /// Encrypt under the named key, or the default when `key_name` is `None`.
    pub fn encrypt(&self, key_name: Option<&str>, plaintext: &[u8]) -> Result<String, ConfigError> {
        let (name, key) = self.keys.storage_key(key_name)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let nonce = Aes256Gcm::generate_nonce(&mut AeadOsRng);
        let sealed = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| ConfigError::MalformedKey {
                name: "storage_encryption_keys",
                reason: "encryption failure".to_string(),
            })?;
        let mut envelope = nonce.to_vec();
        envelope.extend_from_slice(&sealed);
        Ok(format!("{}.{}", name, base64::encode_config(envelope, base64::URL_SAFE_NO_PAD)))
    }

    /// Decrypt a ciphertext produced by [`encrypt`](Self::encrypt), resolving the embedded key
    /// name against the configured keys.
    pub fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, ConfigError> {
        let (name, data) = ciphertext.split_once('.').ok_or(ConfigError::MalformedKey {
            name: "storage_encryption_keys",
            reason: "ciphertext envelope has no key name".to_string(),
        })?;
        let (_, key) = self.keys.storage_key(Some(name))?;
        let envelope =
            base64::decode_config(data, base64::URL_SAFE_NO_PAD).map_err(|err| {
                ConfigError::MalformedKey {
                    name: "storage_encryption_keys",
                    reason: format!("ciphertext is not valid base64: {}", err),
                }
            })?;
        if envelope.len() < 12 {
            return Err(ConfigError::MalformedKey {
                name: "storage_encryption_keys",
                reason: "ciphertext shorter than its nonce".to_string(),
            });
        }
        let (nonce, sealed) = envelope.split_at(12);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| ConfigError::MalformedKey {
                name: "storage_encryption_keys",
                reason: "ciphertext failed authentication".to_string(),
            })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub const PRIVATE_PEM: &str = include_str!("testdata/rsa_private.pem");
    pub const PUBLIC_PEM: &str = include_str!("testdata/rsa_public.pem");
    const ENCRYPTED_PRIVATE_PEM: &str = include_str!("testdata/rsa_private_encrypted.pem");

    /// Base64 of 32 zero bytes, handy as a well-formed symmetric key.
    pub const SYMMETRIC_KEY: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

    pub fn test_config() -> KeyConfig {
        let mut storage = HashMap::new();
        storage.insert("2024".to_string(), SYMMETRIC_KEY.to_string());
        KeyConfig {
            private_key: Some(PRIVATE_PEM.to_string()),
            private_key_passphrase: None,
            public_key: Some(PUBLIC_PEM.to_string()),
            codes_encryption_key: Some(SYMMETRIC_KEY.to_string()),
            storage_encryption_keys: storage,
            default_storage_encryption_key: Some("2024".to_string()),
        }
    }

    #[test]
    fn full_key_set_loads() {
        let keys = KeySet::from_config(&test_config()).unwrap();
        assert!(keys.signing_key().is_some());
        assert!(keys.codes_key().is_some());
        assert_eq!(keys.storage_key(None).unwrap().0, "2024");
    }

    #[test]
    fn missing_file_reference_is_a_config_error() {
        let mut config = test_config();
        config.private_key = Some("@/nonexistent/path/oauth2-private.pem".to_string());
        match KeySet::from_config(&config) {
            Err(ConfigError::KeyFile { path, .. }) => {
                assert_eq!(path, "/nonexistent/path/oauth2-private.pem")
            }
            other => panic!("expected KeyFile error, got {:?}", other.err()),
        }
    }

    #[test]
    fn missing_settings_are_named() {
        let mut config = test_config();
        config.codes_encryption_key = None;
        match KeySet::from_config(&config) {
            Err(ConfigError::MissingSetting(name)) => assert_eq!(name, "codes_encryption_key"),
            other => panic!("expected MissingSetting, got {:?}", other.err()),
        }

        let mut config = test_config();
        config.default_storage_encryption_key = Some("2099".to_string());
        assert!(matches!(
            KeySet::from_config(&config),
            Err(ConfigError::UnknownStorageKey(name)) if name == "2099"
        ));
    }

    #[test]
    fn symmetric_key_length_is_enforced() {
        let mut config = test_config();
        config.codes_encryption_key = Some(base64::encode(b"short"));
        assert!(matches!(
            KeySet::from_config(&config),
            Err(ConfigError::MalformedKey { name: "codes_encryption_key", .. })
        ));
    }

    #[test]
    fn passphrase_protected_private_key_loads() {
        let mut config = test_config();
        config.private_key = Some(ENCRYPTED_PRIVATE_PEM.to_string());
        config.private_key_passphrase = Some("correct-horse".to_string());
        assert!(KeySet::from_config(&config).is_ok());

        config.private_key_passphrase = Some("wrong".to_string());
        assert!(matches!(
            KeySet::from_config(&config),
            Err(ConfigError::MalformedKey { name: "private_key", .. })
        ));
    }

    #[test]
    fn verification_only_needs_just_the_public_key() {
        let config = KeyConfig {
            public_key: Some(PUBLIC_PEM.to_string()),
            ..KeyConfig::default()
        };
        let keys = KeySet::verification_only(&config).unwrap();
        assert!(keys.signing_key().is_none());
        assert!(keys.codes_key().is_none());
    }

    #[test]
    fn jwks_document_shape() {
        let keys = KeySet::from_config(&test_config()).unwrap();
        let jwks = keys.jwks();
        let key = &jwks["keys"][0];
        assert_eq!(key["kty"], "RSA");
        assert_eq!(key["alg"], "RS256");
        assert_eq!(key["kid"], keys.key_id());
        assert!(key["n"].as_str().unwrap().len() > 300);
        assert_eq!(key["e"], "AQAB");
    }

    #[test]
    fn storage_encryptor_round_trip_embeds_key_name() {
        let keys = KeySet::from_config(&test_config()).unwrap();
        let encryptor = StorageEncryptor::new(&keys);
        let sealed = encryptor.encrypt(None, b"user secret").unwrap();
        assert!(sealed.starts_with("2024."));
        assert_eq!(encryptor.decrypt(&sealed).unwrap(), b"user secret");

        let mut tampered = sealed.clone();
        tampered.push('A');
        assert!(encryptor.decrypt(&tampered).is_err());
    }
}

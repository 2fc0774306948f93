//! Sealed payloads for authorization codes and refresh tokens.
//!
//! Both artifacts are self-contained: the grant they represent is serialized, encrypted and
//! authenticated under the codes key, then handed to the client as an opaque url-safe string.
//! The server therefore needs no storage lookup to redeem them; replay protection is the only
//! stateful part and lives in the token store.
//!
//! A kind tag inside the payload separates codes from refresh tokens, so a refresh token can
//! never be redeemed at the place of a code or vice versa. Any tampering, truncation or
//! kind mismatch surfaces as the same opaque decode failure.
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use super::scope::ScopeSet;

/// What a sealed string represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SealedKind {
    /// A single-use authorization code.
    Code,

    /// A refresh token.
    Refresh,
}

/// The grant information carried inside a sealed code or refresh token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SealedPayload {
    /// Whether this is a code or a refresh token.
    pub kind: SealedKind,

    /// Unique id of this artifact, used for single-use enforcement and rotation.
    pub handle_id: String,

    /// The client the grant was issued to.
    pub client_id: String,

    /// The user who authorized the grant, absent for pure client grants.
    pub user_id: Option<String>,

    /// The granted scopes.
    pub scope: ScopeSet,

    /// The redirect uri the code was bound to, codes only.
    pub redirect_uri: Option<Url>,

    /// Expiry of this artifact.
    pub until: DateTime<Utc>,
}

/// Decode failures are deliberately opaque; anything from bad base64 to a kind mismatch ends
/// up here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnsealError;

/// Seals and unseals code/refresh-token payloads under the codes encryption key.
pub struct SealedCodec {
    cipher: Aes256Gcm,
}

impl SealedCodec {
    /// Construct the codec over a 32 byte key.
    pub fn new(key: &[u8; 32]) -> SealedCodec {
        SealedCodec {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Seal a payload into its opaque wire form.
    pub fn seal(&self, payload: &SealedPayload) -> Result<String, UnsealError> {
        let plain = rmp_serde::to_vec(payload).map_err(|_| UnsealError)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self.cipher.encrypt(&nonce, plain.as_slice()).map_err(|_| UnsealError)?;
        let mut envelope = nonce.to_vec();
        envelope.extend_from_slice(&sealed);
        Ok(base64::encode_config(envelope, base64::URL_SAFE_NO_PAD))
    }

    /// Unseal a wire string, requiring the expected kind.
    pub fn unseal(&self, token: &str, expected: SealedKind) -> Result<SealedPayload, UnsealError> {
        let envelope =
            base64::decode_config(token, base64::URL_SAFE_NO_PAD).map_err(|_| UnsealError)?;
        if envelope.len() < 12 {
            return Err(UnsealError);
        }
        let (nonce, sealed) = envelope.split_at(12);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| UnsealError)?;
        let payload: SealedPayload = rmp_serde::from_slice(&plain).map_err(|_| UnsealError)?;
        if payload.kind != expected {
            return Err(UnsealError);
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn codec() -> SealedCodec {
        SealedCodec::new(&[7u8; 32])
    }

    fn payload(kind: SealedKind) -> SealedPayload {
        SealedPayload {
            kind,
            handle_id: "handle-1".to_string(),
            client_id: "PrivateClient".to_string(),
            user_id: Some("alice".to_string()),
            scope: "email profile".parse().unwrap(),
            redirect_uri: Some("https://client.example/redirect".parse().unwrap()),
            until: Utc::now() + Duration::minutes(10),
        }
    }

    #[test]
    fn seal_and_unseal() {
        let codec = codec();
        let original = payload(SealedKind::Code);
        let sealed = codec.seal(&original).unwrap();
        let unsealed = codec.unseal(&sealed, SealedKind::Code).unwrap();
        assert_eq!(original, unsealed);
    }

    #[test]
    fn kind_confusion_is_rejected() {
        let codec = codec();
        let sealed = codec.seal(&payload(SealedKind::Refresh)).unwrap();
        assert_eq!(codec.unseal(&sealed, SealedKind::Code), Err(UnsealError));
    }

    #[test]
    fn tampering_is_rejected() {
        let codec = codec();
        let sealed = codec.seal(&payload(SealedKind::Code)).unwrap();
        let mut bytes = base64::decode_config(&sealed, base64::URL_SAFE_NO_PAD).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = base64::encode_config(bytes, base64::URL_SAFE_NO_PAD);
        assert_eq!(codec.unseal(&tampered, SealedKind::Code), Err(UnsealError));
    }

    #[test]
    fn other_keys_cannot_unseal() {
        let sealed = codec().seal(&payload(SealedKind::Code)).unwrap();
        let other = SealedCodec::new(&[8u8; 32]);
        assert_eq!(other.unseal(&sealed, SealedKind::Code), Err(UnsealError));
    }
}

//! Route service signature — AEAD-sealed detour payload
//!
//! The signature header carries an AES-256-GCM-sealed JSON payload naming
//! the URL the route service must forward back to and the time it was
//! signed. The metadata header carries the nonce. A route service cannot
//! forge or replay a signature outside its freshness window.

use crate::error::{Result, RouterError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

/// The sealed payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignaturePayload {
    /// URL the route service must forward the request back to
    pub forwarded_url: String,
    /// Unix seconds at signing time
    pub signed_time: i64,
}

#[derive(Serialize, Deserialize)]
struct SignatureMetadata {
    /// Base64 nonce used to seal the payload
    nonce: String,
}

/// Symmetric signature key, derived from the configured secret
pub struct SignatureKey {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl SignatureKey {
    /// Derive the AEAD key from a secret of any length
    pub fn new(secret: &str) -> Result<Self> {
        let hashed = digest::digest(&digest::SHA256, secret.as_bytes());
        let unbound = UnboundKey::new(&AES_256_GCM, hashed.as_ref())
            .map_err(|_| RouterError::Config("failed to derive signature key".to_string()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Seal a payload; returns (signature, metadata) header values
    pub fn encode(&self, payload: &SignaturePayload) -> Result<(String, String)> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce_bytes).map_err(|_| {
            RouterError::RouteServiceSignature("nonce generation failed".to_string())
        })?;

        let mut in_out = serde_json::to_vec(payload)?;
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| RouterError::RouteServiceSignature("seal failed".to_string()))?;

        let metadata = SignatureMetadata {
            nonce: URL_SAFE_NO_PAD.encode(nonce_bytes),
        };
        Ok((
            URL_SAFE_NO_PAD.encode(&in_out),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&metadata)?),
        ))
    }

    /// Open a (signature, metadata) header pair back into the payload
    pub fn decode(&self, signature: &str, metadata: &str) -> Result<SignaturePayload> {
        let metadata_raw = URL_SAFE_NO_PAD
            .decode(metadata)
            .map_err(|_| RouterError::RouteServiceSignature("bad metadata encoding".to_string()))?;
        let metadata: SignatureMetadata = serde_json::from_slice(&metadata_raw)
            .map_err(|_| RouterError::RouteServiceSignature("bad metadata".to_string()))?;
        let nonce_bytes: [u8; NONCE_LEN] = URL_SAFE_NO_PAD
            .decode(&metadata.nonce)
            .ok()
            .and_then(|n| n.try_into().ok())
            .ok_or_else(|| RouterError::RouteServiceSignature("bad nonce".to_string()))?;

        let mut in_out = URL_SAFE_NO_PAD.decode(signature).map_err(|_| {
            RouterError::RouteServiceSignature("bad signature encoding".to_string())
        })?;
        let plaintext = self
            .key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| RouterError::RouteServiceSignature("decryption failed".to_string()))?;

        serde_json::from_slice(plaintext)
            .map_err(|_| RouterError::RouteServiceSignature("bad payload".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(url: &str, signed_time: i64) -> SignaturePayload {
        SignaturePayload {
            forwarded_url: url.to_string(),
            signed_time,
        }
    }

    #[test]
    fn test_roundtrip() {
        let key = SignatureKey::new("route-service-secret").unwrap();
        let original = payload("https://app.example.com/x?q=1", 1_750_000_000);
        let (sig, meta) = key.encode(&original).unwrap();
        let decoded = key.decode(&sig, &meta).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key_a = SignatureKey::new("secret-a").unwrap();
        let key_b = SignatureKey::new("secret-b").unwrap();
        let (sig, meta) = key_a.encode(&payload("https://a/x", 1)).unwrap();
        let err = key_b.decode(&sig, &meta).unwrap_err();
        assert!(matches!(err, RouterError::RouteServiceSignature(_)));
    }

    #[test]
    fn test_tampered_signature_fails() {
        let key = SignatureKey::new("secret").unwrap();
        let (sig, meta) = key.encode(&payload("https://a/x", 1)).unwrap();
        let mut tampered = sig.into_bytes();
        let last = tampered.len() - 1;
        tampered[last] = if tampered[last] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(tampered).unwrap();
        assert!(key.decode(&tampered, &meta).is_err());
    }

    #[test]
    fn test_mismatched_nonce_fails() {
        let key = SignatureKey::new("secret").unwrap();
        let (sig_1, _) = key.encode(&payload("https://a/x", 1)).unwrap();
        let (_, meta_2) = key.encode(&payload("https://a/x", 1)).unwrap();
        assert!(key.decode(&sig_1, &meta_2).is_err());
    }

    #[test]
    fn test_garbage_inputs_fail_cleanly() {
        let key = SignatureKey::new("secret").unwrap();
        assert!(key.decode("!!!", "???").is_err());
        assert!(key.decode("", "").is_err());
        let (sig, _) = key.encode(&payload("https://a/x", 1)).unwrap();
        assert!(key.decode(&sig, "bm90LWpzb24").is_err());
    }

    #[test]
    fn test_signatures_are_unique_per_encode() {
        let key = SignatureKey::new("secret").unwrap();
        let p = payload("https://a/x", 1);
        let (sig_1, _) = key.encode(&p).unwrap();
        let (sig_2, _) = key.encode(&p).unwrap();
        // fresh nonce every time
        assert_ne!(sig_1, sig_2);
    }
}

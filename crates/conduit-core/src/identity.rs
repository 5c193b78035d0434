//! Client and server identity: Ed25519 key pairs and public keys.
//!
//! Authentication proves the client's identity by signing a random nonce
//! with the private half of a key pair the server already knows; the server
//! answers with its own public key so callers may pin it. Key material never
//! crosses the wire in raw form, only public keys and detached signatures.
//!
//! # Key Files
//!
//! Key pairs are persisted as a small JSON document with base64-encoded key
//! material:
//!
//! ```json
//! {
//!   "algorithm": "ed25519",
//!   "secret_key": "<base64, 32 bytes>",
//!   "public_key": "<base64, 32 bytes>"
//! }
//! ```
//!
//! Loading fails with [`KeyLoadError`], which is deliberately distinct from
//! any authentication failure: a bad file surfaces before the network is
//! touched.

use std::fmt;
use std::io;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Length of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of an Ed25519 secret key seed in bytes.
pub const SECRET_KEY_LEN: usize = 32;

/// Length of an Ed25519 detached signature in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Length of an authentication nonce in bytes.
pub const NONCE_LEN: usize = 32;

/// Algorithm identifier stored in key files.
const KEY_ALGORITHM: &str = "ed25519";

/// Errors raised while loading or persisting key material.
///
/// Distinct from authentication errors: a [`KeyLoadError`] means the local
/// key file is unusable, not that the server rejected the identity.
#[derive(Debug, Error)]
pub enum KeyLoadError {
    /// The key file could not be read or written.
    #[error("key file I/O error: {0}")]
    Io(#[from] io::Error),

    /// The key file contents are not valid key material.
    #[error("malformed key material: {reason}")]
    Malformed {
        /// Description of what failed to parse or validate.
        reason: String,
    },

    /// The key file declares an algorithm this implementation does not
    /// support.
    #[error("unsupported key algorithm: {algorithm}")]
    UnsupportedAlgorithm {
        /// Algorithm string found in the file.
        algorithm: String,
    },
}

impl KeyLoadError {
    fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

/// An Ed25519 public key identifying one end of the channel.
///
/// The server's public key, returned on successful authentication, doubles
/// as its identity; comparing it against a pinned value is a caller policy
/// decision, not enforced here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Parse a public key from its 32 raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`KeyLoadError::Malformed`] if the bytes are not a valid
    /// curve point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyLoadError> {
        let raw: [u8; PUBLIC_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| KeyLoadError::malformed("public key must be 32 bytes"))?;
        let key = VerifyingKey::from_bytes(&raw)
            .map_err(|e| KeyLoadError::malformed(format!("invalid public key: {e}")))?;
        Ok(Self(key))
    }

    /// Returns the raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        self.0.as_bytes()
    }

    /// Verify a detached signature over `message`.
    ///
    /// Returns `false` for signatures of the wrong length as well as for
    /// signatures that do not verify.
    #[must_use]
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        self.0.verify(message, &signature).is_ok()
    }

    /// Short fingerprint for logs and key stores.
    ///
    /// First 8 bytes of the blake3 digest of the raw key, hex-encoded.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let digest = blake3::hash(self.as_bytes());
        hex::encode(&digest.as_bytes()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint())
    }
}

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write(self.as_bytes());
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        BASE64.encode(self.as_bytes()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = BASE64
            .decode(&encoded)
            .map_err(serde::de::Error::custom)?;
        Self::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// An Ed25519 key pair proving the local identity.
///
/// Owned exclusively by the holding process; only signatures produced from
/// it are transmitted.
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    /// Generate a fresh key pair from the OS random source.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Load a key pair from a JSON key file.
    ///
    /// # Errors
    ///
    /// - [`KeyLoadError::Io`] if the file cannot be read
    /// - [`KeyLoadError::UnsupportedAlgorithm`] for a non-Ed25519 file
    /// - [`KeyLoadError::Malformed`] for undecodable or inconsistent key
    ///   material
    pub fn load(path: impl AsRef<Path>) -> Result<Self, KeyLoadError> {
        let contents = std::fs::read_to_string(path)?;
        let file: KeyFile = serde_json::from_str(&contents)
            .map_err(|e| KeyLoadError::malformed(format!("invalid key file: {e}")))?;

        if file.algorithm != KEY_ALGORITHM {
            return Err(KeyLoadError::UnsupportedAlgorithm {
                algorithm: file.algorithm,
            });
        }

        let secret = BASE64
            .decode(&file.secret_key)
            .map_err(|e| KeyLoadError::malformed(format!("invalid secret key encoding: {e}")))?;
        let seed: [u8; SECRET_KEY_LEN] = secret
            .as_slice()
            .try_into()
            .map_err(|_| KeyLoadError::malformed("secret key must be 32 bytes"))?;
        let signing = SigningKey::from_bytes(&seed);

        // A stored public key that does not match the secret half means the
        // file was corrupted or stitched together from two pairs.
        let stored_public = PublicKey::from_bytes(
            &BASE64
                .decode(&file.public_key)
                .map_err(|e| KeyLoadError::malformed(format!("invalid public key encoding: {e}")))?,
        )?;
        let derived = Self { signing };
        if derived.public_key() != stored_public {
            return Err(KeyLoadError::malformed(
                "public key does not match secret key",
            ));
        }

        Ok(derived)
    }

    /// Persist the key pair as a JSON key file.
    ///
    /// On Unix the file is created with mode 0600.
    ///
    /// # Errors
    ///
    /// Returns [`KeyLoadError::Io`] if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), KeyLoadError> {
        let file = KeyFile {
            algorithm: KEY_ALGORITHM.to_string(),
            secret_key: BASE64.encode(self.signing.to_bytes()),
            public_key: BASE64.encode(self.public_key().as_bytes()),
        };
        let contents =
            serde_json::to_string_pretty(&file).expect("key file serialization cannot fail");
        std::fs::write(&path, contents)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(&path, perms)?;
        }

        Ok(())
    }

    /// Returns the public half of the pair.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key())
    }

    /// Produce a detached signature over `message`.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print secret material.
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key().fingerprint())
            .finish_non_exhaustive()
    }
}

/// Generate a random authentication nonce.
#[must_use]
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// On-disk key file layout.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct KeyFile {
    algorithm: String,
    secret_key: String,
    public_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let pair = KeyPair::generate();
        let sig = pair.sign(b"nonce material");
        assert_eq!(sig.len(), SIGNATURE_LEN);
        assert!(pair.public_key().verify(b"nonce material", &sig));
    }

    #[test]
    fn test_verify_rejects_tampered_message() {
        let pair = KeyPair::generate();
        let sig = pair.sign(b"nonce material");
        assert!(!pair.public_key().verify(b"other material", &sig));
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let pair = KeyPair::generate();
        let other = KeyPair::generate();
        let sig = pair.sign(b"nonce material");
        assert!(!other.public_key().verify(b"nonce material", &sig));
    }

    #[test]
    fn test_verify_rejects_truncated_signature() {
        let pair = KeyPair::generate();
        let sig = pair.sign(b"nonce material");
        assert!(!pair.public_key().verify(b"nonce material", &sig[..40]));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_ed25519.json");

        let pair = KeyPair::generate();
        pair.save(&path).unwrap();

        let loaded = KeyPair::load(&path).unwrap();
        assert_eq!(loaded.public_key(), pair.public_key());

        // Signatures from the reloaded pair verify under the original key.
        let sig = loaded.sign(b"probe");
        assert!(pair.public_key().verify(b"probe", &sig));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = KeyPair::load(dir.path().join("absent.json"));
        assert!(matches!(result, Err(KeyLoadError::Io(_))));
    }

    #[test]
    fn test_load_rejects_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.json");
        std::fs::write(&path, "not json").unwrap();

        let result = KeyPair::load(&path);
        assert!(matches!(result, Err(KeyLoadError::Malformed { .. })));
    }

    #[test]
    fn test_load_rejects_unknown_algorithm() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.json");
        std::fs::write(
            &path,
            r#"{"algorithm":"rsa","secret_key":"AA==","public_key":"AA=="}"#,
        )
        .unwrap();

        let result = KeyPair::load(&path);
        assert!(matches!(
            result,
            Err(KeyLoadError::UnsupportedAlgorithm { algorithm }) if algorithm == "rsa"
        ));
    }

    #[test]
    fn test_load_rejects_truncated_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.json");
        std::fs::write(
            &path,
            r#"{"algorithm":"ed25519","secret_key":"AAECAw==","public_key":"AA=="}"#,
        )
        .unwrap();

        let result = KeyPair::load(&path);
        assert!(matches!(result, Err(KeyLoadError::Malformed { .. })));
    }

    #[test]
    fn test_load_rejects_mismatched_pair() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.json");

        let pair = KeyPair::generate();
        let other = KeyPair::generate();
        let file = serde_json::json!({
            "algorithm": "ed25519",
            "secret_key": BASE64.encode(pair.signing.to_bytes()),
            "public_key": BASE64.encode(other.public_key().as_bytes()),
        });
        std::fs::write(&path, file.to_string()).unwrap();

        let result = KeyPair::load(&path);
        assert!(matches!(result, Err(KeyLoadError::Malformed { .. })));
    }

    #[test]
    fn test_fingerprint_stable_and_distinct() {
        let pair = KeyPair::generate();
        let other = KeyPair::generate();

        assert_eq!(pair.public_key().fingerprint(), pair.public_key().fingerprint());
        assert_ne!(pair.public_key().fingerprint(), other.public_key().fingerprint());
        assert_eq!(pair.public_key().fingerprint().len(), 16);
    }

    #[test]
    fn test_public_key_serde_roundtrip() {
        let pair = KeyPair::generate();
        let json = serde_json::to_string(&pair.public_key()).unwrap();
        let parsed: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, pair.public_key());
    }

    #[test]
    fn test_public_key_rejects_garbage() {
        let result: Result<PublicKey, _> = serde_json::from_str(r#""!!not-base64!!""#);
        assert!(result.is_err());
    }

    #[test]
    fn test_nonce_generation() {
        let a = generate_nonce();
        let b = generate_nonce();
        assert_eq!(a.len(), NONCE_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn test_keypair_debug_hides_secret() {
        let pair = KeyPair::generate();
        let rendered = format!("{pair:?}");
        let secret = BASE64.encode(pair.signing.to_bytes());
        assert!(!rendered.contains(&secret));
    }
}

//! Registered client keys and authentication proof verification.
//!
//! The daemon trusts a client when its authentication proof verifies
//! against a key in the [`AuthorizedKeys`] store. Each registered key
//! carries rights; today the only right is `operator`, which gates
//! capability upgrade.
//!
//! Rejection reasons sent to the peer are deliberately generic — which of
//! "unknown key" or "bad signature" failed is logged server-side only.

use std::collections::HashMap;
use std::path::Path;

use conduit_core::identity::{KeyLoadError, NONCE_LEN, PublicKey};
use conduit_core::wire::AuthRequest;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Rights attached to a registered key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRights {
    /// Whether the identity may upgrade a channel to full capability.
    #[serde(default)]
    pub operator: bool,
}

/// The daemon's record of registered client public keys.
#[derive(Debug, Default)]
pub struct AuthorizedKeys {
    entries: HashMap<PublicKey, KeyRights>,
}

/// One entry of an authorized-keys file.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct KeyEntry {
    public_key: PublicKey,
    #[serde(default)]
    operator: bool,
}

impl AuthorizedKeys {
    /// Create an empty store. Every proof is rejected until keys are added.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a key with default (non-operator) rights.
    #[must_use]
    pub fn allow(mut self, key: PublicKey) -> Self {
        self.entries.insert(key, KeyRights::default());
        self
    }

    /// Register a key with operator rights.
    #[must_use]
    pub fn allow_operator(mut self, key: PublicKey) -> Self {
        self.entries.insert(key, KeyRights { operator: true });
        self
    }

    /// Load a store from a JSON file: an array of
    /// `{"public_key": "<base64>", "operator": bool}` entries.
    ///
    /// # Errors
    ///
    /// Returns [`KeyLoadError`] for unreadable files or malformed entries.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, KeyLoadError> {
        let contents = std::fs::read_to_string(path)?;
        let entries: Vec<KeyEntry> =
            serde_json::from_str(&contents).map_err(|e| KeyLoadError::Malformed {
                reason: format!("invalid authorized keys file: {e}"),
            })?;

        let mut store = Self::new();
        for entry in entries {
            store.entries.insert(
                entry.public_key,
                KeyRights {
                    operator: entry.operator,
                },
            );
        }
        Ok(store)
    }

    /// Number of registered keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no keys are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up the rights of a registered key.
    #[must_use]
    pub fn rights(&self, key: &PublicKey) -> Option<KeyRights> {
        self.entries.get(key).copied()
    }

    /// Verify an authentication proof.
    ///
    /// The key must be registered and the signature must verify over the
    /// nonce. Nonces shorter than [`NONCE_LEN`] are rejected so a client
    /// cannot present a trivially signable proof.
    ///
    /// # Errors
    ///
    /// Returns the generic rejection reason to send to the peer.
    pub fn verify_proof(&self, request: &AuthRequest) -> Result<(PublicKey, KeyRights), String> {
        const REJECTION: &str = "authentication failed";

        if request.nonce.len() < NONCE_LEN {
            warn!(
                key = %request.public_key,
                nonce_len = request.nonce.len(),
                "rejecting auth proof with short nonce"
            );
            return Err(REJECTION.to_string());
        }

        let Some(rights) = self.rights(&request.public_key) else {
            warn!(key = %request.public_key, "rejecting unregistered key");
            return Err(REJECTION.to_string());
        };

        if !request.public_key.verify(&request.nonce, &request.signature) {
            warn!(key = %request.public_key, "rejecting invalid signature");
            return Err(REJECTION.to_string());
        }

        debug!(key = %request.public_key, operator = rights.operator, "proof verified");
        Ok((request.public_key.clone(), rights))
    }
}

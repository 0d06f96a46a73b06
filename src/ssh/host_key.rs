//! Host identity policy for the transport dial
//!
//! The default is [`HostKeyPolicy::AcceptAny`], which matches how stored
//! connections have always been dialed. Deployments that know their targets
//! should pin fingerprints instead.

use std::collections::HashSet;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};

/// Decision taken for a presented server key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept every key (no verification)
    AcceptAny,
    /// Accept only keys whose `SHA256:` fingerprint is listed
    Pinned(HashSet<String>),
}

impl HostKeyPolicy {
    /// Build a pinned policy from a comma-separated fingerprint list
    ///
    /// Returns `AcceptAny` when the list holds no fingerprints.
    pub fn from_list(list: &str) -> Self {
        let pins: HashSet<String> = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(normalize_fingerprint)
            .collect();

        if pins.is_empty() {
            Self::AcceptAny
        } else {
            Self::Pinned(pins)
        }
    }

    /// Whether a key with this fingerprint may be used
    pub fn allows(&self, fingerprint: &str) -> bool {
        match self {
            Self::AcceptAny => true,
            Self::Pinned(pins) => pins.contains(fingerprint),
        }
    }
}

/// Compute SHA256 fingerprint of public key
pub fn fingerprint(key: &PublicKey) -> String {
    fingerprint_bytes(&key.public_key_bytes())
}

fn fingerprint_bytes(key_bytes: &[u8]) -> String {
    let hash = Sha256::digest(key_bytes);
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Accept fingerprints with or without the `SHA256:` prefix and padding
fn normalize_fingerprint(raw: &str) -> String {
    let body = raw.strip_prefix("SHA256:").unwrap_or(raw);
    format!("SHA256:{}", body.trim_end_matches('='))
}

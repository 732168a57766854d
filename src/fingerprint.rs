//! Configuration fingerprints
//!
//! A fingerprint is the identity key of a worker: the submitted configuration
//! document with surrounding whitespace trimmed, nothing else. Byte-identical
//! trimmed documents always collide (a resubmission is a replace); any other
//! difference, down to formatting, yields a distinct fingerprint. There is no
//! semantic canonicalization.

use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// Number of digest bytes rendered in logs
const DISPLAY_DIGEST_BYTES: usize = 8;

/// Identity key derived from a configuration document's trimmed bytes.
///
/// Cheap to clone and usable as a map key. `Display` renders a short SHA-256
/// digest so logs stay readable; the digest is never used for identity.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(Arc<str>);

impl Fingerprint {
    /// Derive a fingerprint from a raw configuration document.
    ///
    /// Total and deterministic for any input: trims leading/trailing
    /// whitespace and keeps the rest verbatim.
    pub fn from_document(raw: &str) -> Self {
        Self(Arc::from(raw.trim()))
    }

    /// The trimmed document this fingerprint was derived from.
    pub fn document(&self) -> &str {
        &self.0
    }

    /// Short hex digest of the key material, for logging.
    pub fn digest(&self) -> String {
        let hash = Sha256::digest(self.0.as_bytes());
        hex::encode(&hash[..DISPLAY_DIGEST_BYTES])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.digest())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.digest())
    }
}

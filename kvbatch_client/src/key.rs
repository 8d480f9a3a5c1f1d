//! Record keys and their routing digest.
use std::{
    fmt::Display,
    hash::{Hash, Hasher},
};

use sha2::{Digest as _, Sha256};

use crate::value::Value;

/// Size of a [`Digest`] in bytes.
pub const DIGEST_SIZE: usize = 20;

/// Number of partitions a namespace is split into.
///
/// Must stay a power of two, see [`Digest::partition_id`].
pub const N_PARTITIONS: u16 = 4096;

/// Canonical routing identity of a record.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_SIZE]);

impl Digest {
    /// Compute the digest of a user key stored in `set_name`.
    pub fn compute(set_name: &str, user_key: &Value) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(set_name.as_bytes());
        hasher.update([user_key.particle_type()]);
        hasher.update(user_key.to_bytes());
        let full = hasher.finalize();

        let mut digest = [0; DIGEST_SIZE];
        digest.copy_from_slice(&full[..DIGEST_SIZE]);
        Self(digest)
    }

    /// Wrap raw digest bytes.
    pub const fn from_bytes(bytes: [u8; DIGEST_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }

    /// Partition this digest belongs to, in `0..N_PARTITIONS`.
    pub fn partition_id(&self) -> u16 {
        u16::from_le_bytes([self.0[0], self.0[1]]) & (N_PARTITIONS - 1)
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({})", hex::encode(self.0))
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Identifies one record by namespace, set and user key.
///
/// Two keys are equal when namespace, set and digest are equal. The user key is kept for
/// reporting only, so a key rebuilt from its digest still compares equal to the original.
#[derive(Debug, Clone)]
pub struct Key {
    namespace: String,
    set_name: String,
    user_key: Option<Value>,
    digest: Digest,
}

impl Key {
    /// Create a key, computing its digest.
    pub fn new(
        namespace: impl Into<String>,
        set_name: impl Into<String>,
        user_key: impl Into<Value>,
    ) -> Self {
        let set_name = set_name.into();
        let user_key = user_key.into();
        let digest = Digest::compute(&set_name, &user_key);
        Self {
            namespace: namespace.into(),
            set_name,
            user_key: Some(user_key),
            digest,
        }
    }

    /// Create a key from an already known digest.
    pub fn from_digest(
        namespace: impl Into<String>,
        set_name: impl Into<String>,
        digest: Digest,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            set_name: set_name.into(),
            user_key: None,
            digest,
        }
    }

    /// Namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Set name.
    pub fn set_name(&self) -> &str {
        &self.set_name
    }

    /// User key, if the key was not built from a digest.
    pub fn user_key(&self) -> Option<&Value> {
        self.user_key.as_ref()
    }

    /// Routing digest.
    pub fn digest(&self) -> &Digest {
        &self.digest
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
            && self.namespace == other.namespace
            && self.set_name == other.set_name
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.namespace.hash(state);
        self.set_name.hash(state);
        self.digest.hash(state);
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.user_key {
            Some(user_key) => write!(
                f,
                "ns={} set={} key={}",
                self.namespace, self.set_name, user_key
            ),
            None => write!(
                f,
                "ns={} set={} digest={}",
                self.namespace, self.set_name, self.digest
            ),
        }
    }
}

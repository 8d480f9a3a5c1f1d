//! Handles to cluster members.
use std::{
    fmt::Display,
    hash::{Hash, Hasher},
    sync::Arc,
};

/// Opaque, cheaply cloneable handle to a cluster node.
///
/// Nodes are identified by name; the address is what a
/// [`ConnectionProvider`](crate::connection::ConnectionProvider) dials.
#[derive(Debug, Clone)]
pub struct NodeRef {
    name: Arc<str>,
    address: Arc<str>,
}

impl NodeRef {
    /// Create a new node handle.
    pub fn new(name: impl Into<Arc<str>>, address: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }

    /// Node name.
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Network address, `host:port`.
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl PartialEq for NodeRef {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for NodeRef {}

impl Hash for NodeRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl Display for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.name, self.address)
    }
}

//! Config for cluster node addresses.
use std::str::FromStr;

use kvbatch_client::NodeRef;

/// Parsable node address, `name=host:port` or just `host:port`.
///
/// A node given without a name is named after its address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    name: String,
    address: String,
}

impl NodeSpec {
    /// Node name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `host:port` to dial.
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl std::fmt::Display for NodeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.name, self.address)
    }
}

impl FromStr for NodeSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, address) = match s.split_once('=') {
            Some((name, address)) => (name.trim(), address.trim()),
            None => (s.trim(), s.trim()),
        };
        if name.is_empty() {
            return Err(format!("Missing node name in '{s}'"));
        }

        let Some((host, port)) = address.rsplit_once(':') else {
            return Err(format!("Cannot parse node address '{address}': missing port"));
        };
        if host.is_empty() {
            return Err(format!("Cannot parse node address '{address}': missing host"));
        }
        if let Err(e) = port.parse::<u16>() {
            return Err(format!("Cannot parse node address '{address}': {e}"));
        }

        Ok(Self {
            name: name.to_string(),
            address: address.to_string(),
        })
    }
}

impl From<&NodeSpec> for NodeRef {
    fn from(spec: &NodeSpec) -> Self {
        Self::new(spec.name.as_str(), spec.address.as_str())
    }
}

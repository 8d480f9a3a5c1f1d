//! CLI config for the batch client.
use std::{collections::HashSet, sync::Arc, time::Duration};

use kvbatch_client::{
    Client, ConsistencyLevel, NodeRef, Policy, StaticPartitionMap, WritePolicy,
    connection::{DEFAULT_MAX_FRAME_SIZE, TcpConnectionProvider},
};
use observability_deps::tracing::info;

use crate::node::NodeSpec;

#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error("node '{0}' is configured more than once")]
    DuplicateNode(String),
}

/// Replica consistency of reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Consistency {
    /// Read from the master replica only.
    #[default]
    One,

    /// Consult every replica.
    All,
}

impl From<Consistency> for ConsistencyLevel {
    fn from(c: Consistency) -> Self {
        match c {
            Consistency::One => Self::One,
            Consistency::All => Self::All,
        }
    }
}

/// CLI config for connecting the batch client to a cluster.
#[derive(Debug, Clone, clap::Parser)]
#[allow(missing_copy_implementations)]
pub struct ClientConfig {
    /// Cluster nodes, as `name=host:port` or `host:port`.
    ///
    /// Can be repeated or given as a comma-delimited list.
    ///
    /// Example: "a=10.0.0.1:3000,b=10.0.0.2:3000"
    #[clap(
        long = "node",
        env = "KVBATCH_NODES",
        required = true,
        num_args = 1..,
        value_delimiter = ',',
        action
    )]
    pub nodes: Vec<NodeSpec>,

    /// Namespaces whose partitions are spread over the nodes.
    #[clap(
        long = "namespace",
        env = "KVBATCH_NAMESPACES",
        default_value = "test",
        num_args = 1..,
        value_delimiter = ',',
        action
    )]
    pub namespaces: Vec<String>,

    /// Bound on one attempt of a request, connect included.
    ///
    /// Waits forever when not set.
    #[clap(
        long = "timeout",
        env = "KVBATCH_TIMEOUT",
        value_parser = humantime::parse_duration,
    )]
    pub timeout: Option<Duration>,

    /// Additional attempts after a connection failure or timeout.
    #[clap(
        long = "max-retries",
        env = "KVBATCH_MAX_RETRIES",
        default_value = "2",
        action
    )]
    pub max_retries: u32,

    /// Pause before each additional attempt.
    #[clap(
        long = "sleep-between-retries",
        env = "KVBATCH_SLEEP_BETWEEN_RETRIES",
        default_value = "500ms",
        value_parser = humantime::parse_duration,
    )]
    pub sleep_between_retries: Duration,

    /// Replica consistency of reads.
    #[clap(
        long = "consistency",
        env = "KVBATCH_CONSISTENCY",
        default_value_t = Consistency::default(),
        value_enum,
        action
    )]
    pub consistency: Consistency,

    /// Idle connections kept per node.
    #[clap(
        long = "max-idle-connections",
        env = "KVBATCH_MAX_IDLE_CONNECTIONS",
        default_value = "16",
        action
    )]
    pub max_idle_connections: usize,

    /// Time allowed for opening a connection.
    #[clap(
        long = "connect-timeout",
        env = "KVBATCH_CONNECT_TIMEOUT",
        default_value = "1s",
        value_parser = humantime::parse_duration,
    )]
    pub connect_timeout: Duration,

    /// Largest response frame body accepted from a node, in bytes.
    ///
    /// A node announcing a bigger frame fails the request with a protocol error.
    #[clap(
        long = "max-frame-size",
        env = "KVBATCH_MAX_FRAME_SIZE",
        default_value_t = DEFAULT_MAX_FRAME_SIZE,
        action
    )]
    pub max_frame_size: usize,
}

impl ClientConfig {
    /// Read policy described by this config.
    pub fn policy(&self) -> Policy {
        Policy {
            timeout: self.timeout,
            max_retries: self.max_retries,
            sleep_between_retries: self.sleep_between_retries,
            consistency: self.consistency.into(),
        }
    }

    /// Write policy described by this config.
    pub fn write_policy(&self, expiration: u32) -> WritePolicy {
        WritePolicy {
            policy: self.policy(),
            expiration,
        }
    }

    /// Partition table spreading every namespace over all configured nodes.
    pub fn partition_map(&self) -> Result<StaticPartitionMap, Error> {
        let mut seen = HashSet::new();
        let nodes = self
            .nodes
            .iter()
            .map(|spec| {
                if !seen.insert(spec.name()) {
                    return Err(Error::DuplicateNode(spec.name().to_string()));
                }
                Ok(NodeRef::from(spec))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(self
            .namespaces
            .iter()
            .fold(StaticPartitionMap::new(), |map, namespace| {
                map.with_namespace(namespace.as_str(), &nodes)
            }))
    }

    /// Client talking TCP to the configured nodes.
    pub fn build_client(&self) -> Result<Client, Error> {
        let partition_map = self.partition_map()?;
        info!(
            nodes = self.nodes.len(),
            namespaces = ?self.namespaces,
            "configured batch client"
        );

        Ok(Client::new(
            Arc::new(partition_map),
            Arc::new(
                TcpConnectionProvider::new(self.max_idle_connections, self.connect_timeout)
                    .with_max_frame_size(self.max_frame_size),
            ),
        ))
    }
}

//! The client facade.
use std::sync::Arc;

use observability_deps::tracing::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::{
    codec::{ReadMode, ResultCode, SingleOp, SingleRequest},
    command::{SingleCommand, SingleResponse},
    connection::ConnectionProvider,
    error::{Error, Result},
    executor::{BatchHandle, Executor},
    key::Key,
    listener::{BatchItem, Delivery, array_channel},
    partition::PartitionMap,
    policy::{Policy, WritePolicy},
    record::Record,
    retry::Retry,
    value::Bin,
};

/// Client of a partitioned key/value cluster.
///
/// Cheap to clone; clones share connections and the shutdown signal.
#[derive(Debug, Clone)]
pub struct Client {
    partition_map: Arc<dyn PartitionMap>,
    provider: Arc<dyn ConnectionProvider>,
    executor: Executor,
    shutdown: CancellationToken,
}

impl Client {
    /// Create a client routing keys with `partition_map` and talking to nodes through
    /// `provider`.
    pub fn new(
        partition_map: Arc<dyn PartitionMap>,
        provider: Arc<dyn ConnectionProvider>,
    ) -> Self {
        Self {
            executor: Executor::new(Arc::clone(&partition_map), Arc::clone(&provider)),
            partition_map,
            provider,
            shutdown: CancellationToken::new(),
        }
    }

    /// Read the records of `keys`.
    ///
    /// An empty `bins` selection reads every bin. Returns at once; results go to `delivery`.
    pub fn batch_get(
        &self,
        policy: &Policy,
        keys: Vec<Key>,
        bins: &[&str],
        delivery: Delivery<Option<Record>>,
    ) -> BatchHandle {
        self.batch(policy, ReadMode::from_bins(bins), keys, delivery)
    }

    /// Check which of `keys` exist.
    pub fn batch_exists(
        &self,
        policy: &Policy,
        keys: Vec<Key>,
        delivery: Delivery<bool>,
    ) -> BatchHandle {
        self.batch(policy, ReadMode::Headers, keys, delivery)
    }

    /// Read generation and expiration of `keys`, without bins.
    pub fn batch_get_headers(
        &self,
        policy: &Policy,
        keys: Vec<Key>,
        delivery: Delivery<Option<Record>>,
    ) -> BatchHandle {
        self.batch(policy, ReadMode::Headers, keys, delivery)
    }

    fn batch<T: BatchItem>(
        &self,
        policy: &Policy,
        read: ReadMode,
        keys: Vec<Key>,
        delivery: Delivery<T>,
    ) -> BatchHandle {
        self.executor
            .execute(policy, read, keys, delivery, self.shutdown.child_token())
    }

    /// [`batch_get`](Self::batch_get) returning the records in key order.
    pub async fn get_many(
        &self,
        policy: &Policy,
        keys: Vec<Key>,
        bins: &[&str],
    ) -> Result<Vec<Option<Record>>> {
        let (delivery, rx) = array_channel();
        self.batch_get(policy, keys, bins, delivery);
        Ok(rx.recv().await?.values)
    }

    /// [`batch_exists`](Self::batch_exists) returning one flag per key.
    pub async fn exists_many(&self, policy: &Policy, keys: Vec<Key>) -> Result<Vec<bool>> {
        let (delivery, rx) = array_channel();
        self.batch_exists(policy, keys, delivery);
        Ok(rx.recv().await?.values)
    }

    /// [`batch_get_headers`](Self::batch_get_headers) returning the headers in key order.
    pub async fn get_headers_many(
        &self,
        policy: &Policy,
        keys: Vec<Key>,
    ) -> Result<Vec<Option<Record>>> {
        let (delivery, rx) = array_channel();
        self.batch_get_headers(policy, keys, delivery);
        Ok(rx.recv().await?.values)
    }

    /// Write `bins` to the record of `key`, creating it if needed.
    pub async fn put(&self, policy: &WritePolicy, key: &Key, bins: Vec<Bin>) -> Result<()> {
        let op = SingleOp::Write {
            bins,
            expiration: policy.expiration,
        };
        let response = self.single("put", &policy.policy, key, op).await?;
        self.expect_ok(key, response.result_code)
    }

    /// Read the record of `key`. An empty `bins` selection reads every bin.
    pub async fn get(&self, policy: &Policy, key: &Key, bins: &[&str]) -> Result<Option<Record>> {
        let op = SingleOp::Read(ReadMode::from_bins(bins));
        let response = self.single("get", policy, key, op).await?;
        self.record(key, response)
    }

    /// Read generation and expiration of `key`.
    pub async fn get_header(&self, policy: &Policy, key: &Key) -> Result<Option<Record>> {
        let op = SingleOp::Read(ReadMode::Headers);
        let response = self.single("get header", policy, key, op).await?;
        self.record(key, response)
    }

    /// Whether the record of `key` exists.
    pub async fn exists(&self, policy: &Policy, key: &Key) -> Result<bool> {
        let op = SingleOp::Read(ReadMode::Headers);
        let response = self.single("exists", policy, key, op).await?;
        self.found(key, response.result_code)
    }

    /// Delete the record of `key`. Returns whether it existed.
    pub async fn delete(&self, policy: &WritePolicy, key: &Key) -> Result<bool> {
        let response = self
            .single("delete", &policy.policy, key, SingleOp::Delete)
            .await?;
        self.found(key, response.result_code)
    }

    /// Cancel every running operation of this client and its clones.
    pub fn close(&self) {
        info!("closing client");
        self.shutdown.cancel();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    async fn single(
        &self,
        operation: &'static str,
        policy: &Policy,
        key: &Key,
        op: SingleOp,
    ) -> Result<SingleResponse> {
        let node = self
            .partition_map
            .resolve_node(key.namespace(), key.digest())
            .ok_or_else(|| Error::ClusterUnavailable {
                namespace: key.namespace().to_string(),
                partition: key.digest().partition_id(),
            })?;
        debug!(%node, %key, operation, "single record operation");

        let request = SingleRequest {
            namespace: key.namespace().to_string(),
            set_name: key.set_name().to_string(),
            digest: *key.digest(),
            op,
            consistency: policy.consistency,
            timeout: policy.timeout,
        };
        let command = SingleCommand::new(node, &request)?;
        let cancel = self.shutdown.child_token();

        let response = Retry::new(policy.retry_config())
            .run(operation, &cancel, Error::is_transient, |_| {
                command.execute(&self.provider, policy.timeout)
            })
            .await?;
        Ok(response)
    }

    fn record(&self, key: &Key, response: SingleResponse) -> Result<Option<Record>> {
        if !self.found(key, response.result_code)? {
            return Ok(None);
        }
        Ok(Some(
            response
                .row
                .map(|row| row.into_record())
                .unwrap_or_default(),
        ))
    }

    fn found(&self, key: &Key, code: ResultCode) -> Result<bool> {
        match code {
            ResultCode::OK => Ok(true),
            ResultCode::KEY_NOT_FOUND => Ok(false),
            code => Err(self.application_error(key, code)),
        }
    }

    fn expect_ok(&self, key: &Key, code: ResultCode) -> Result<()> {
        match code {
            ResultCode::OK => Ok(()),
            code => Err(self.application_error(key, code)),
        }
    }

    fn application_error(&self, key: &Key, code: ResultCode) -> Error {
        let node = self
            .partition_map
            .resolve_node(key.namespace(), key.digest())
            .map(|n| Arc::clone(n.name()))
            .unwrap_or_else(|| Arc::from("unknown"));
        Error::Application { node, code }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{
        assert_impl,
        node::NodeRef,
        testing::{Fault, MockCluster, RoutedPartitionMap},
        value::Value,
    };

    use super::*;

    assert_impl!(client_is_send, Client, Send);
    assert_impl!(client_is_sync, Client, Sync);

    fn setup() -> (Client, MockCluster, NodeRef) {
        let node = NodeRef::new("a", "a:3000");
        let cluster = MockCluster::new();
        let client = Client::new(
            Arc::new(RoutedPartitionMap::new(node.clone())),
            Arc::new(cluster.clone()),
        );
        (client, cluster, node)
    }

    fn write_policy() -> WritePolicy {
        WritePolicy {
            policy: Policy {
                sleep_between_retries: Duration::ZERO,
                ..Default::default()
            },
            expiration: 0,
        }
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let (client, _cluster, _node) = setup();
        let policy = write_policy();
        let key = Key::new("test", "demo", "putgetkey");

        client
            .put(&policy, &key, vec![Bin::new("putgetbin", "value")])
            .await
            .unwrap();
        let record = client.get(&policy.policy, &key, &[]).await.unwrap().unwrap();
        assert_eq!(record.get("putgetbin"), Some(&Value::from("value")));
        assert_eq!(record.generation, 1);

        let header = client.get_header(&policy.policy, &key).await.unwrap().unwrap();
        assert!(header.bins.is_empty());
        assert_eq!(header.generation, 1);

        assert!(client.exists(&policy.policy, &key).await.unwrap());
        assert!(client.delete(&policy, &key).await.unwrap());
        assert!(!client.delete(&policy, &key).await.unwrap());
        assert!(!client.exists(&policy.policy, &key).await.unwrap());
        assert_eq!(client.get(&policy.policy, &key, &[]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_single_op_retries_refused_connection() {
        let (client, cluster, node) = setup();
        let policy = write_policy();
        let key = Key::new("test", "demo", "putgetkey");
        cluster.push_fault(&node, Fault::Refused);

        client
            .put(&policy, &key, vec![Bin::new("putgetbin", 1i64)])
            .await
            .unwrap();
        assert_eq!(cluster.connections_acquired(&node), 2);
        assert_eq!(cluster.requests(&node).len(), 1);
    }

    #[tokio::test]
    async fn test_single_op_application_error() {
        let (client, cluster, node) = setup();
        let key = Key::new("test", "demo", "putgetkey");
        cluster.push_fault(&node, Fault::Application(ResultCode::GENERATION_ERROR));

        let err = client
            .put(&write_policy(), &key, vec![Bin::new("putgetbin", 1i64)])
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::Application { code: ResultCode::GENERATION_ERROR, .. }),
            "{err}"
        );
        assert_eq!(cluster.requests(&node).len(), 1);
    }

    #[tokio::test]
    async fn test_closed_client_refuses_work() {
        let (client, cluster, node) = setup();
        client.close();
        assert!(client.is_closed());

        let key = Key::new("test", "demo", "putgetkey");
        let err = client.get(&Policy::default(), &key, &[]).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled), "{err}");

        let err = client
            .get_many(&Policy::default(), vec![key], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled), "{err}");
        assert!(cluster.requests(&node).is_empty());
    }
}

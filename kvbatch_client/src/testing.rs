//! Test helpers: an in-memory cluster and assorted assertions.
use std::{
    any::Any,
    collections::{HashMap, VecDeque},
    io,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    codec::{
        self, BatchRequest, ProtocolError, ReadMode, Request, ResponseRow, ResultCode, SingleOp,
        SingleRequest,
    },
    connection::{Connection, ConnectionProvider},
    error::Error,
    key::{Digest, Key},
    node::NodeRef,
    partition::PartitionMap,
    record::Record,
    value::Value,
};

/// Emit a test asserting that `$type` implements `$trait`.
#[macro_export]
macro_rules! assert_impl {
    ($name:ident, $type:ty, $trait:path) => {
        #[test]
        fn $name() {
            fn assert_impl<T: $trait + ?Sized>() {}

            assert_impl::<$type>();
        }
    };
}

/// Error with a fixed retry classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestError {
    retry: bool,
}

impl TestError {
    /// Transient error.
    pub const RETRY: Self = Self { retry: true };

    /// Terminal error.
    pub const NO_RETRY: Self = Self { retry: false };

    /// Whether the error should be retried.
    pub fn is_retryable(&self) -> bool {
        self.retry
    }
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "test error, retry={}", self.retry)
    }
}

impl std::error::Error for TestError {}

/// Misbehavior of a [`MockCluster`] node, consumed by one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Refuse the connection.
    Refused,
    /// Send half of the rows, then reset the connection.
    Reset,
    /// Accept the request and never answer.
    Hang,
    /// Cut the response in the middle of the last row.
    Truncated,
    /// Reject the whole request with the given code.
    Application(ResultCode),
    /// Answer after a pause.
    Delay(Duration),
    /// Leave out the row of the key at this request position.
    OmitRow(usize),
    /// Send every record row twice.
    DuplicateRows,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    bins: Vec<(String, Value)>,
    generation: u32,
    expiration: u32,
}

#[derive(Debug, Default)]
struct NodeState {
    faults: VecDeque<Fault>,
    requests: Vec<Request>,
    acquired: usize,
    reused: usize,
    discarded: usize,
}

#[derive(Debug)]
struct State {
    records: HashMap<(String, Digest), StoredRecord>,
    nodes: HashMap<Arc<str>, NodeState>,
    rows_per_frame: usize,
}

/// In-memory cluster serving the wire protocol through [`ConnectionProvider`].
///
/// All nodes share one record store; what differs per node are the scripted [`Fault`]s and
/// the bookkeeping of requests and connections.
#[derive(Debug, Clone)]
pub struct MockCluster {
    state: Arc<Mutex<State>>,
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCluster {
    /// Create an empty cluster sending two rows per response frame.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                records: HashMap::new(),
                nodes: HashMap::new(),
                rows_per_frame: 2,
            })),
        }
    }

    /// Number of rows per response frame.
    pub fn set_rows_per_frame(&self, rows_per_frame: usize) {
        self.state.lock().rows_per_frame = rows_per_frame.max(1);
    }

    /// Store a record. Bin names may repeat to produce duplicates.
    pub fn insert(&self, key: &Key, bins: Vec<(String, Value)>) {
        self.state.lock().records.insert(
            (key.namespace().to_string(), *key.digest()),
            StoredRecord {
                bins,
                generation: 1,
                expiration: 0,
            },
        );
    }

    /// Current content of a record.
    pub fn record(&self, key: &Key) -> Option<Record> {
        self.state
            .lock()
            .records
            .get(&(key.namespace().to_string(), *key.digest()))
            .map(|r| Record::from_row_bins(r.bins.clone(), r.generation, r.expiration))
    }

    /// Script a fault for the next request to `node`.
    pub fn push_fault(&self, node: &NodeRef, fault: Fault) {
        self.state
            .lock()
            .nodes
            .entry(Arc::clone(node.name()))
            .or_default()
            .faults
            .push_back(fault);
    }

    /// Requests received by `node`, in arrival order.
    pub fn requests(&self, node: &NodeRef) -> Vec<Request> {
        self.with_node(node, |n| n.requests.clone())
    }

    /// Connections handed out for `node`.
    pub fn connections_acquired(&self, node: &NodeRef) -> usize {
        self.with_node(node, |n| n.acquired)
    }

    /// Connections given back fully read.
    pub fn connections_reused(&self, node: &NodeRef) -> usize {
        self.with_node(node, |n| n.reused)
    }

    /// Connections given back in an unknown state.
    pub fn connections_discarded(&self, node: &NodeRef) -> usize {
        self.with_node(node, |n| n.discarded)
    }

    fn with_node<R: Default>(&self, node: &NodeRef, f: impl FnOnce(&NodeState) -> R) -> R {
        self.state
            .lock()
            .nodes
            .get(node.name())
            .map(f)
            .unwrap_or_default()
    }

    /// Serve one request frame without faults, returning the response frames.
    pub fn respond(&self, node: &NodeRef, frame: Bytes) -> Result<Vec<Bytes>, ProtocolError> {
        Ok(self.serve(node, frame, None)?.frames.into())
    }

    fn serve(
        &self,
        node: &NodeRef,
        frame: Bytes,
        fault: Option<Fault>,
    ) -> Result<Reply, ProtocolError> {
        let request = Request::decode_frame(frame)?;

        let mut state = self.state.lock();
        state
            .nodes
            .entry(Arc::clone(node.name()))
            .or_default()
            .requests
            .push(request.clone());

        let mut rows = match (&request, &fault) {
            (_, Some(Fault::Application(code))) => vec![ResponseRow::last(*code)],
            (Request::Batch(request), _) => batch_rows(&state, request, fault.as_ref()),
            (Request::Single(request), _) => single_rows(&mut state, request),
        };
        let rows_per_frame = state.rows_per_frame;
        drop(state);

        let mut reply = Reply::default();
        match &fault {
            Some(Fault::Hang) => {
                reply.end = ReplyEnd::Hang;
                return Ok(reply);
            }
            Some(Fault::Reset) => {
                rows.truncate(rows.len().saturating_sub(1) / 2);
                reply.end = ReplyEnd::Reset;
            }
            Some(Fault::Delay(delay)) => reply.delay = Some(*delay),
            _ => {}
        }

        if rows.is_empty() {
            return Ok(reply);
        }
        reply.frames = codec::encode_response(&rows, rows_per_frame)?.into();

        if fault == Some(Fault::Truncated) {
            if let Some(frame) = reply.frames.pop_back() {
                let (_, body) = codec::decode_frame(frame)?;
                let cut = body.slice(..body.len().saturating_sub(5));
                reply
                    .frames
                    .push_back(codec::encode_frame(codec::MessageType::Response, &cut)?);
            }
        }
        Ok(reply)
    }
}

fn batch_rows(state: &State, request: &BatchRequest, fault: Option<&Fault>) -> Vec<ResponseRow> {
    let mut rows = vec![];
    for (position, digest) in request.digests.iter().enumerate() {
        if fault == Some(&Fault::OmitRow(position)) {
            continue;
        }
        let batch_index = u32::try_from(position).unwrap_or(u32::MAX);
        let row = match state.records.get(&(request.namespace.clone(), *digest)) {
            Some(record) => ResponseRow::found(
                batch_index,
                *digest,
                record.generation,
                record.expiration,
                selected_bins(record, &request.read),
            ),
            None => ResponseRow::not_found(batch_index, *digest),
        };
        if fault == Some(&Fault::DuplicateRows) {
            rows.push(row.clone());
        }
        rows.push(row);
    }
    rows.push(ResponseRow::last(ResultCode::OK));
    rows
}

fn single_rows(state: &mut State, request: &SingleRequest) -> Vec<ResponseRow> {
    let id = (request.namespace.clone(), request.digest);
    match &request.op {
        SingleOp::Read(read) => match state.records.get(&id) {
            Some(record) => vec![
                ResponseRow::found(
                    0,
                    request.digest,
                    record.generation,
                    record.expiration,
                    selected_bins(record, read),
                ),
                ResponseRow::last(ResultCode::OK),
            ],
            None => vec![ResponseRow::last(ResultCode::KEY_NOT_FOUND)],
        },
        SingleOp::Write { bins, expiration } => {
            let record = state.records.entry(id).or_insert(StoredRecord {
                bins: vec![],
                generation: 0,
                expiration: 0,
            });
            for bin in bins {
                match record.bins.iter_mut().find(|(name, _)| *name == bin.name) {
                    Some((_, value)) => *value = bin.value.clone(),
                    None => record.bins.push((bin.name.clone(), bin.value.clone())),
                }
            }
            record.generation += 1;
            record.expiration = *expiration;
            vec![ResponseRow::last(ResultCode::OK)]
        }
        SingleOp::Delete => match state.records.remove(&id) {
            Some(_) => vec![ResponseRow::last(ResultCode::OK)],
            None => vec![ResponseRow::last(ResultCode::KEY_NOT_FOUND)],
        },
    }
}

fn selected_bins(record: &StoredRecord, read: &ReadMode) -> Vec<(String, Value)> {
    record
        .bins
        .iter()
        .filter(|(name, _)| read.selects(name))
        .cloned()
        .collect()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum ReplyEnd {
    #[default]
    Complete,
    Reset,
    Hang,
}

#[derive(Debug, Default)]
struct Reply {
    delay: Option<Duration>,
    frames: VecDeque<Bytes>,
    end: ReplyEnd,
}

#[async_trait]
impl ConnectionProvider for MockCluster {
    async fn acquire(&self, node: &NodeRef) -> Result<Box<dyn Connection>, Error> {
        let refused = {
            let mut state = self.state.lock();
            let node_state = state.nodes.entry(Arc::clone(node.name())).or_default();
            node_state.acquired += 1;
            if node_state.faults.front() == Some(&Fault::Refused) {
                node_state.faults.pop_front();
                true
            } else {
                false
            }
        };

        if refused {
            return Err(Error::io(
                node.name(),
                io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
            ));
        }
        Ok(Box::new(MockConnection {
            cluster: self.clone(),
            node: node.clone(),
            reply: Reply::default(),
        }))
    }

    fn release(&self, node: &NodeRef, _conn: Box<dyn Connection>, reusable: bool) {
        let mut state = self.state.lock();
        let node_state = state.nodes.entry(Arc::clone(node.name())).or_default();
        if reusable {
            node_state.reused += 1;
        } else {
            node_state.discarded += 1;
        }
    }
}

/// Connection to one [`MockCluster`] node.
#[derive(Debug)]
pub struct MockConnection {
    cluster: MockCluster,
    node: NodeRef,
    reply: Reply,
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&mut self, frame: Bytes) -> Result<(), Error> {
        let fault = self
            .cluster
            .state
            .lock()
            .nodes
            .get_mut(self.node.name())
            .and_then(|n| n.faults.pop_front());

        self.reply = self
            .cluster
            .serve(&self.node, frame, fault)
            .map_err(|e| Error::protocol(self.node.name(), e))?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Bytes, Error> {
        if let Some(delay) = self.reply.delay.take() {
            tokio::time::sleep(delay).await;
        }

        if let Some(frame) = self.reply.frames.pop_front() {
            let (_, body) =
                codec::decode_frame(frame).map_err(|e| Error::protocol(self.node.name(), e))?;
            return Ok(body);
        }

        match self.reply.end {
            ReplyEnd::Complete => Err(Error::io(
                self.node.name(),
                io::Error::new(io::ErrorKind::UnexpectedEof, "no response pending"),
            )),
            ReplyEnd::Reset => Err(Error::io(
                self.node.name(),
                io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"),
            )),
            ReplyEnd::Hang => futures::future::pending().await,
        }
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// [`PartitionMap`] routing individual keys to chosen nodes.
///
/// Keys without an explicit route go to the default node, if any.
#[derive(Debug, Clone)]
pub struct RoutedPartitionMap {
    routes: HashMap<Digest, NodeRef>,
    default: Option<NodeRef>,
}

impl RoutedPartitionMap {
    /// Route every key to `default` unless told otherwise.
    pub fn new(default: NodeRef) -> Self {
        Self {
            routes: HashMap::new(),
            default: Some(default),
        }
    }

    /// Route nothing unless told otherwise.
    pub fn unrouted() -> Self {
        Self {
            routes: HashMap::new(),
            default: None,
        }
    }

    /// Route `key` to `node`.
    pub fn route(mut self, key: &Key, node: &NodeRef) -> Self {
        self.routes.insert(*key.digest(), node.clone());
        self
    }
}

impl PartitionMap for RoutedPartitionMap {
    fn resolve_node(&self, _namespace: &str, digest: &Digest) -> Option<NodeRef> {
        self.routes
            .get(digest)
            .or(self.default.as_ref())
            .cloned()
    }
}

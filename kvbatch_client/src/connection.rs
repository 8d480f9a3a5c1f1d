//! Transport to cluster nodes.
//!
//! The batch machinery only sees [`ConnectionProvider`] and [`Connection`]. Connections are
//! always borrowed through a [`PooledConnection`], which hands them back to the provider
//! when dropped, whether the attempt succeeded, failed or was abandoned.
use std::{any::Any, collections::HashMap, fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use observability_deps::tracing::{debug, trace};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::{
    codec::{self, HEADER_SIZE, MessageType, ProtocolError},
    error::Error,
    node::NodeRef,
};

/// A bidirectional, framed channel to one node.
#[async_trait]
pub trait Connection: Debug + Send + 'static {
    /// Send one complete frame, header included.
    async fn send(&mut self, frame: Bytes) -> Result<(), Error>;

    /// Receive the body of the next response frame.
    async fn receive(&mut self) -> Result<Bytes, Error>;

    /// Return the connection as [`Any`] so a provider can recover its concrete type.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

/// Hands out connections to nodes.
#[async_trait]
pub trait ConnectionProvider: Debug + Send + Sync + 'static {
    /// Get a connection to `node`, reusing an idle one where possible.
    async fn acquire(&self, node: &NodeRef) -> Result<Box<dyn Connection>, Error>;

    /// Give a connection back.
    ///
    /// `reusable` is only set when the last exchange was read to completion; other
    /// connections must not be handed out again.
    fn release(&self, node: &NodeRef, conn: Box<dyn Connection>, reusable: bool);
}

/// A connection on loan from a [`ConnectionProvider`].
#[derive(Debug)]
pub struct PooledConnection {
    provider: Arc<dyn ConnectionProvider>,
    node: NodeRef,
    conn: Option<Box<dyn Connection>>,
    reusable: bool,
}

impl PooledConnection {
    /// Borrow a connection to `node`.
    pub async fn acquire(
        provider: Arc<dyn ConnectionProvider>,
        node: &NodeRef,
    ) -> Result<Self, Error> {
        let conn = provider.acquire(node).await?;
        trace!(%node, "connection acquired");
        Ok(Self {
            provider,
            node: node.clone(),
            conn: Some(conn),
            reusable: false,
        })
    }

    /// Send one frame. Marks the connection as not reusable until the answer was read.
    pub async fn send(&mut self, frame: Bytes) -> Result<(), Error> {
        self.reusable = false;
        self.conn_mut().send(frame).await
    }

    /// Receive the next response body.
    pub async fn receive(&mut self) -> Result<Bytes, Error> {
        self.conn_mut().receive().await
    }

    /// The full response was consumed; the connection may serve another request.
    pub fn mark_reusable(&mut self) {
        self.reusable = true;
    }

    fn conn_mut(&mut self) -> &mut dyn Connection {
        self.conn
            .as_deref_mut()
            .expect("connection is only taken on drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            trace!(node = %self.node, reusable = self.reusable, "connection released");
            self.provider.release(&self.node, conn, self.reusable);
        }
    }
}

/// Default bound on the body of one response frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Plain TCP connection speaking the [`codec`] framing.
#[derive(Debug)]
pub struct TcpConnection {
    node: Arc<str>,
    stream: TcpStream,
    max_frame_size: usize,
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send(&mut self, frame: Bytes) -> Result<(), Error> {
        self.stream
            .write_all(&frame)
            .await
            .map_err(|e| Error::io(&self.node, e))
    }

    async fn receive(&mut self) -> Result<Bytes, Error> {
        let mut header = [0; HEADER_SIZE];
        self.stream
            .read_exact(&mut header)
            .await
            .map_err(|e| Error::io(&self.node, e))?;

        let (msg_type, len) =
            codec::decode_header(header).map_err(|e| Error::protocol(&self.node, e))?;
        if msg_type != MessageType::Response {
            return Err(Error::protocol(
                &self.node,
                ProtocolError::UnexpectedMessage {
                    expected: MessageType::Response,
                    actual: msg_type,
                },
            ));
        }
        // the length is untrusted, check it before allocating
        let len = usize::try_from(len).unwrap_or(usize::MAX);
        if len > self.max_frame_size {
            return Err(Error::protocol(
                &self.node,
                ProtocolError::TooLong {
                    what: "frame body",
                    len,
                },
            ));
        }

        let mut body = vec![0; len];
        self.stream
            .read_exact(&mut body)
            .await
            .map_err(|e| Error::io(&self.node, e))?;
        Ok(Bytes::from(body))
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// [`ConnectionProvider`] dialing nodes over TCP and keeping a few idle connections per node.
#[derive(Debug)]
pub struct TcpConnectionProvider {
    idle: Mutex<HashMap<NodeRef, Vec<TcpConnection>>>,
    max_idle_per_node: usize,
    connect_timeout: Duration,
    max_frame_size: usize,
}

impl TcpConnectionProvider {
    /// Create a provider.
    pub fn new(max_idle_per_node: usize, connect_timeout: Duration) -> Self {
        Self {
            idle: Default::default(),
            max_idle_per_node,
            connect_timeout,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Reject response frames whose body is larger than `max_frame_size` bytes.
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Number of idle connections kept for `node`.
    pub fn idle_connections(&self, node: &NodeRef) -> usize {
        self.idle.lock().get(node).map(Vec::len).unwrap_or_default()
    }
}

impl Default for TcpConnectionProvider {
    fn default() -> Self {
        Self::new(16, Duration::from_secs(1))
    }
}

#[async_trait]
impl ConnectionProvider for TcpConnectionProvider {
    async fn acquire(&self, node: &NodeRef) -> Result<Box<dyn Connection>, Error> {
        let idle = self.idle.lock().get_mut(node).and_then(Vec::pop);
        if let Some(conn) = idle {
            return Ok(Box::new(conn));
        }

        debug!(%node, "opening connection");
        let connect = TcpStream::connect(node.address());
        let stream = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| Error::Timeout {
                node: Arc::clone(node.name()),
                timeout: self.connect_timeout,
            })?
            .map_err(|e| Error::io(node.name(), e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::io(node.name(), e))?;

        Ok(Box::new(TcpConnection {
            node: Arc::clone(node.name()),
            stream,
            max_frame_size: self.max_frame_size,
        }))
    }

    fn release(&self, node: &NodeRef, conn: Box<dyn Connection>, reusable: bool) {
        if !reusable {
            return;
        }
        let Ok(conn) = conn.into_any().downcast::<TcpConnection>() else {
            return;
        };

        let mut idle = self.idle.lock();
        let pool = idle.entry(node.clone()).or_default();
        if pool.len() < self.max_idle_per_node {
            pool.push(*conn);
        }
    }
}

//! One request/response exchange with one node.
//!
//! A [`BatchCommand`] owns the encoded request of one batch leg. Each call to
//! [`BatchCommand::execute`] is one attempt: it borrows a connection, sends the request and
//! streams the response rows to a callback as frames arrive, without buffering the whole
//! response.
use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use observability_deps::tracing::trace;

use crate::{
    batch::BatchNamespace,
    codec::{
        BatchRequest, ProtocolError, ReadMode, ResponseRow, ResultCode, RowParser, SingleRequest,
    },
    connection::{ConnectionProvider, PooledConnection},
    error::Error,
    key::{Digest, Key},
    node::NodeRef,
    policy::Policy,
};

/// Send `payload` to `node` and feed every response row except the last one to `on_row`.
///
/// Returns the request level result code carried by the last row. The whole exchange,
/// connection setup included, is bounded by `timeout`.
pub(crate) async fn exchange<F>(
    provider: &Arc<dyn ConnectionProvider>,
    node: &NodeRef,
    payload: Bytes,
    timeout: Option<Duration>,
    mut on_row: F,
) -> Result<ResultCode, Error>
where
    F: FnMut(ResponseRow) -> Result<(), Error> + Send,
{
    let attempt = async {
        let mut conn = PooledConnection::acquire(Arc::clone(provider), node).await?;
        conn.send(payload).await?;

        let mut result_code = ResultCode::OK;
        loop {
            let body = conn.receive().await?;
            trace!(%node, bytes = body.len(), "response frame");

            let mut parser = RowParser::new(body);
            for row in parser.by_ref() {
                let row = row.map_err(|e| Error::protocol(node.name(), e))?;
                if row.last {
                    result_code = row.result_code;
                } else {
                    on_row(row)?;
                }
            }

            if parser.is_finished() {
                conn.mark_reusable();
                return Ok(result_code);
            }
        }
    };

    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| Error::Timeout {
                node: Arc::clone(node.name()),
                timeout,
            })?,
        None => attempt.await,
    }
}

/// The command of one batch leg.
#[derive(Debug)]
pub struct BatchCommand {
    leg: BatchNamespace,
    digests: Vec<Digest>,
    payload: Bytes,
}

impl BatchCommand {
    /// Encode the request for `leg`. `keys` is the caller's full key list.
    ///
    /// Fails if the leg refers to a key outside of `keys`.
    pub fn new(
        leg: BatchNamespace,
        keys: &[Key],
        read: &ReadMode,
        policy: &Policy,
    ) -> Result<Self, Error> {
        let digests = leg
            .key_indices
            .iter()
            .map(|&i| {
                keys.get(i).map(|key| *key.digest()).ok_or_else(|| {
                    Error::protocol(
                        leg.node.name(),
                        ProtocolError::BatchIndex {
                            position: u32::try_from(i).unwrap_or(u32::MAX),
                            len: keys.len(),
                        },
                    )
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let payload = BatchRequest {
            namespace: leg.namespace.to_string(),
            digests: digests.clone(),
            read: read.clone(),
            consistency: policy.consistency,
            timeout: policy.timeout,
        }
        .encode()
        .map_err(|e| Error::protocol(leg.node.name(), e))?;

        Ok(Self {
            leg,
            digests,
            payload,
        })
    }

    /// The leg this command serves.
    pub fn leg(&self) -> &BatchNamespace {
        &self.leg
    }

    /// Run one attempt.
    ///
    /// `on_row` receives the caller's key index and the row, once per row received; keys
    /// the server answers twice are reported twice. Returns the number of rows delivered.
    pub async fn execute<F>(
        &self,
        provider: &Arc<dyn ConnectionProvider>,
        timeout: Option<Duration>,
        mut on_row: F,
    ) -> Result<usize, Error>
    where
        F: FnMut(usize, ResponseRow) -> Result<(), Error> + Send,
    {
        let node = &self.leg.node;
        let mut rows = 0;

        let result_code = exchange(provider, node, self.payload.clone(), timeout, |row| {
            let position = self
                .position(&row)
                .map_err(|e| Error::protocol(node.name(), e))?;
            rows += 1;
            on_row(self.leg.key_indices[position], row)
        })
        .await?;

        if result_code != ResultCode::OK {
            return Err(Error::Application {
                node: Arc::clone(node.name()),
                code: result_code,
            });
        }
        Ok(rows)
    }

    fn position(&self, row: &ResponseRow) -> Result<usize, ProtocolError> {
        let out_of_range = || ProtocolError::BatchIndex {
            position: row.batch_index,
            len: self.digests.len(),
        };
        let position = usize::try_from(row.batch_index).map_err(|_| out_of_range())?;
        let expected = self.digests.get(position).ok_or_else(out_of_range)?;
        if *expected != row.digest {
            return Err(ProtocolError::DigestMismatch {
                expected: *expected,
                actual: row.digest,
            });
        }
        Ok(position)
    }
}

/// Outcome of a [`SingleCommand`].
#[derive(Debug)]
pub struct SingleResponse {
    /// Request level result code.
    pub result_code: ResultCode,
    /// The record row, if the server sent one.
    pub row: Option<ResponseRow>,
}

/// The command of a single record operation.
#[derive(Debug)]
pub struct SingleCommand {
    node: NodeRef,
    digest: Digest,
    payload: Bytes,
}

impl SingleCommand {
    /// Encode `request` for `node`.
    pub fn new(node: NodeRef, request: &SingleRequest) -> Result<Self, Error> {
        let payload = request
            .encode()
            .map_err(|e| Error::protocol(node.name(), e))?;
        Ok(Self {
            node,
            digest: request.digest,
            payload,
        })
    }

    /// Run one attempt.
    pub async fn execute(
        &self,
        provider: &Arc<dyn ConnectionProvider>,
        timeout: Option<Duration>,
    ) -> Result<SingleResponse, Error> {
        let mut record_row = None;
        let result_code = exchange(provider, &self.node, self.payload.clone(), timeout, |row| {
            if row.batch_index != 0 {
                return Err(Error::protocol(
                    self.node.name(),
                    ProtocolError::BatchIndex {
                        position: row.batch_index,
                        len: 1,
                    },
                ));
            }
            if row.digest != self.digest {
                return Err(Error::protocol(
                    self.node.name(),
                    ProtocolError::DigestMismatch {
                        expected: self.digest,
                        actual: row.digest,
                    },
                ));
            }
            record_row.get_or_insert(row);
            Ok(())
        })
        .await?;

        Ok(SingleResponse {
            result_code,
            row: record_row,
        })
    }
}

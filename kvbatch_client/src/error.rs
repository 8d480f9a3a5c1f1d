//! Error handling.
//!
//! Every failure of the client is an [`Error`]. Only a few of them are worth retrying, see
//! [`Error::is_transient`]; [`Error::kind`] groups the variants into the coarse classes
//! callers usually branch on.
use std::{io, sync::Arc, time::Duration};

use crate::codec::{ProtocolError, ResultCode};

/// Primary error type of the client.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error("I/O error talking to node {node}: {source}")]
    Io {
        node: Arc<str>,
        #[source]
        source: io::Error,
    },

    #[error("node {node} did not answer within {timeout:?}")]
    Timeout { node: Arc<str>, timeout: Duration },

    #[error("no node owns partition {partition} of namespace '{namespace}'")]
    ClusterUnavailable { namespace: String, partition: u16 },

    #[error("malformed response from node {node}: {source}")]
    Protocol {
        node: Arc<str>,
        #[source]
        source: ProtocolError,
    },

    #[error("node {node} reported {code}")]
    Application { node: Arc<str>, code: ResultCode },

    #[error("giving up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("operation was cancelled")]
    Cancelled,

    #[error("{outstanding} node legs stopped without reporting a result")]
    LegAborted { outstanding: usize },
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection level failure, retried up to the policy budget.
    TransientIo,
    /// Some key could not be routed to a node.
    ClusterUnavailable,
    /// The response could not be parsed.
    ProtocolError,
    /// The server rejected the request or a record.
    ApplicationError,
    /// The caller cancelled the operation.
    Cancelled,
}

/// Result alias using the client [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn io(node: &Arc<str>, source: io::Error) -> Self {
        Self::Io {
            node: Arc::clone(node),
            source,
        }
    }

    pub(crate) fn protocol(node: &Arc<str>, source: ProtocolError) -> Self {
        Self::Protocol {
            node: Arc::clone(node),
            source,
        }
    }

    /// Whether reissuing the identical request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Io { .. } => self
                .error_chain()
                .filter_map(|e| e.downcast_ref::<io::Error>())
                .any(|e| is_transient_io(e.kind())),
            _ => false,
        }
    }

    /// Taxonomy class of this error.
    ///
    /// Exhausted retries report the class of the last failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } | Self::Timeout { .. } => ErrorKind::TransientIo,
            Self::ClusterUnavailable { .. } => ErrorKind::ClusterUnavailable,
            Self::Protocol { .. } | Self::LegAborted { .. } => ErrorKind::ProtocolError,
            Self::Application { .. } => ErrorKind::ApplicationError,
            Self::RetriesExhausted { source, .. } => source.kind(),
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

fn is_transient_io(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::TimedOut
    )
}

/// [Iterator] over error [sources](std::error::Error::source).
#[derive(Debug)]
pub struct ErrorChainIter<'a> {
    current: Option<&'a (dyn std::error::Error + 'static)>,
}

impl<'a> Iterator for ErrorChainIter<'a> {
    type Item = &'a (dyn std::error::Error + 'static);

    fn next(&mut self) -> Option<Self::Item> {
        let mut next = self.current.as_ref().and_then(|e| e.source());
        std::mem::swap(&mut next, &mut self.current);
        next
    }
}

/// Extension trait to access the error source chain.
pub trait ErrorChainExt {
    /// Iterate over error sources, including `self`.
    fn error_chain(&self) -> ErrorChainIter<'_>;
}

impl<E> ErrorChainExt for E
where
    E: std::error::Error + 'static,
{
    fn error_chain(&self) -> ErrorChainIter<'_> {
        ErrorChainIter {
            current: Some(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::assert_impl;

    use super::*;

    assert_impl!(error_is_send, Error, Send);
    assert_impl!(error_is_sync, Error, Sync);

    fn io_error(kind: io::ErrorKind) -> Error {
        Error::io(&Arc::from("node-a"), io::Error::new(kind, "boom"))
    }

    #[test]
    fn test_transient_classification() {
        assert!(io_error(io::ErrorKind::ConnectionRefused).is_transient());
        assert!(io_error(io::ErrorKind::ConnectionReset).is_transient());
        assert!(io_error(io::ErrorKind::TimedOut).is_transient());
        assert!(!io_error(io::ErrorKind::PermissionDenied).is_transient());

        assert!(
            Error::Timeout {
                node: Arc::from("node-a"),
                timeout: Duration::from_millis(50)
            }
            .is_transient()
        );
        assert!(
            !Error::Application {
                node: Arc::from("node-a"),
                code: ResultCode::PARAMETER_ERROR,
            }
            .is_transient()
        );
        assert!(!Error::Cancelled.is_transient());
    }

    #[test]
    fn test_exhausted_is_terminal() {
        let e = Error::RetriesExhausted {
            attempts: 3,
            source: Box::new(io_error(io::ErrorKind::ConnectionReset)),
        };
        assert!(!e.is_transient());
        assert_eq!(e.kind(), ErrorKind::TransientIo);
        assert_eq!(
            e.to_string(),
            "giving up after 3 attempts: I/O error talking to node node-a: boom"
        );
    }

    #[test]
    fn test_chain_iter() {
        let e = Error::RetriesExhausted {
            attempts: 2,
            source: Box::new(io_error(io::ErrorKind::ConnectionReset)),
        };

        let chain = e.error_chain().map(|e| e.to_string()).collect::<Vec<_>>();
        assert_eq!(
            chain,
            vec![
                "giving up after 2 attempts: I/O error talking to node node-a: boom".to_string(),
                "I/O error talking to node node-a: boom".to_string(),
                "boom".to_string(),
            ]
        );
    }
}

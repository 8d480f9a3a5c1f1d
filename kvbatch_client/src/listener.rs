//! How batch results reach the caller.
//!
//! A batch is delivered either as one ordered array once every node answered
//! ([`ArrayListener`]) or row by row while answers arrive ([`SequenceListener`]). Exactly one
//! of the terminal methods is called per batch.
//!
//! [`array_channel`] and [`sequence_channel`] adapt both strategies to `async` code.
use std::{
    fmt::Debug,
    pin::Pin,
    task::{Context, Poll},
};

use futures::Stream;
use observability_deps::tracing::warn;
use tokio::sync::{mpsc, oneshot};

use crate::{
    codec::{ResponseRow, ResultCode},
    error::Error,
    key::Key,
    record::Record,
};

/// Per-key result type of a batch.
pub trait BatchItem: Send + Sized + 'static {
    /// Interpret one response row. Returns the row's code when it is neither a record nor
    /// a "not found".
    fn from_row(row: ResponseRow) -> Result<Self, ResultCode>;

    /// Value of a key no row answered.
    fn absent() -> Self;
}

impl BatchItem for Option<Record> {
    fn from_row(row: ResponseRow) -> Result<Self, ResultCode> {
        match row.result_code {
            ResultCode::OK => Ok(Some(row.into_record())),
            ResultCode::KEY_NOT_FOUND => Ok(None),
            code => Err(code),
        }
    }

    fn absent() -> Self {
        None
    }
}

impl BatchItem for bool {
    fn from_row(row: ResponseRow) -> Result<Self, ResultCode> {
        match row.result_code {
            ResultCode::OK => Ok(true),
            ResultCode::KEY_NOT_FOUND => Ok(false),
            code => Err(code),
        }
    }

    fn absent() -> Self {
        false
    }
}

/// Receives a whole batch at once.
pub trait ArrayListener<T>: Send + 'static {
    /// Every leg succeeded. `values[i]` belongs to `keys[i]`, in request order.
    fn on_success(self: Box<Self>, keys: Vec<Key>, values: Vec<T>);

    /// At least one leg failed. No values are delivered.
    fn on_failure(self: Box<Self>, error: Error);

    /// Fewer keys were answered than requested. Called right before
    /// [`on_success`](Self::on_success); unanswered keys hold [`BatchItem::absent`].
    fn on_size_mismatch(&mut self, expected: usize, received: usize) {
        warn!(expected, received, "batch answered fewer keys than requested");
    }
}

/// Receives a batch row by row.
pub trait SequenceListener<T>: Send + 'static {
    /// One row arrived. Keys answered more than once are reported more than once.
    fn on_item(&mut self, key: Key, value: T);

    /// Every leg succeeded.
    fn on_success(self: Box<Self>);

    /// At least one leg failed. Items already reported stay reported.
    fn on_failure(self: Box<Self>, error: Error);
}

/// Delivery strategy of one batch.
pub enum Delivery<T> {
    /// Deliver one ordered array at the end.
    Array(Box<dyn ArrayListener<T>>),
    /// Deliver rows as they arrive.
    Sequence(Box<dyn SequenceListener<T>>),
}

impl<T> Debug for Delivery<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Array(_) => f.write_str("Delivery::Array"),
            Self::Sequence(_) => f.write_str("Delivery::Sequence"),
        }
    }
}

impl<T> Delivery<T> {
    /// Wrap an array listener.
    pub fn array(listener: impl ArrayListener<T>) -> Self {
        Self::Array(Box::new(listener))
    }

    /// Wrap a sequence listener.
    pub fn sequence(listener: impl SequenceListener<T>) -> Self {
        Self::Sequence(Box::new(listener))
    }
}

/// Successful result of an array delivered through [`array_channel`].
#[derive(Debug, Clone, PartialEq)]
pub struct BatchArray<T> {
    /// Requested keys.
    pub keys: Vec<Key>,
    /// One value per key.
    pub values: Vec<T>,
    /// `(expected, received)` when fewer keys were answered than requested.
    pub mismatch: Option<(usize, usize)>,
}

#[derive(Debug)]
struct ChannelArray<T> {
    tx: oneshot::Sender<Result<BatchArray<T>, Error>>,
    mismatch: Option<(usize, usize)>,
}

impl<T: BatchItem> ArrayListener<T> for ChannelArray<T> {
    fn on_success(self: Box<Self>, keys: Vec<Key>, values: Vec<T>) {
        // nobody waiting any more
        let _ = self.tx.send(Ok(BatchArray {
            keys,
            values,
            mismatch: self.mismatch,
        }));
    }

    fn on_failure(self: Box<Self>, error: Error) {
        let _ = self.tx.send(Err(error));
    }

    fn on_size_mismatch(&mut self, expected: usize, received: usize) {
        warn!(expected, received, "batch answered fewer keys than requested");
        self.mismatch = Some((expected, received));
    }
}

/// Future side of [`array_channel`].
#[derive(Debug)]
pub struct ArrayReceiver<T> {
    rx: oneshot::Receiver<Result<BatchArray<T>, Error>>,
}

impl<T> ArrayReceiver<T> {
    /// Wait for the batch.
    pub async fn recv(self) -> Result<BatchArray<T>, Error> {
        self.rx
            .await
            .unwrap_or(Err(Error::LegAborted { outstanding: 0 }))
    }
}

/// An [`ArrayListener`] that hands the result to an [`ArrayReceiver`].
pub fn array_channel<T: BatchItem>() -> (Delivery<T>, ArrayReceiver<T>) {
    let (tx, rx) = oneshot::channel();
    (
        Delivery::array(ChannelArray { tx, mismatch: None }),
        ArrayReceiver { rx },
    )
}

#[derive(Debug)]
struct ChannelSequence<T> {
    tx: mpsc::UnboundedSender<Result<(Key, T), Error>>,
    finished: bool,
}

impl<T: BatchItem> SequenceListener<T> for ChannelSequence<T> {
    fn on_item(&mut self, key: Key, value: T) {
        let _ = self.tx.send(Ok((key, value)));
    }

    fn on_success(mut self: Box<Self>) {
        self.finished = true;
    }

    fn on_failure(mut self: Box<Self>, error: Error) {
        self.finished = true;
        let _ = self.tx.send(Err(error));
    }
}

impl<T> Drop for ChannelSequence<T> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.tx.send(Err(Error::LegAborted { outstanding: 0 }));
        }
    }
}

/// Stream side of [`sequence_channel`].
///
/// Yields `Ok` per row. A failed batch ends with one `Err`, a successful one just ends.
#[derive(Debug)]
pub struct SequenceReceiver<T> {
    rx: mpsc::UnboundedReceiver<Result<(Key, T), Error>>,
}

impl<T> Stream for SequenceReceiver<T> {
    type Item = Result<(Key, T), Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// A [`SequenceListener`] that streams rows to a [`SequenceReceiver`].
pub fn sequence_channel<T: BatchItem>() -> (Delivery<T>, SequenceReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Delivery::sequence(ChannelSequence {
            tx,
            finished: false,
        }),
        SequenceReceiver { rx },
    )
}

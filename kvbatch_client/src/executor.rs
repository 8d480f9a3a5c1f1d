//! Fan-out of a batch over its node legs.
//!
//! Every leg runs as its own task, retried independently by a [`Retry`] controller. Legs
//! never touch shared state: they send their rows and finally one completion message to a
//! single aggregator task, which owns the count of outstanding legs and the delivery.
//!
//! ```text
//!            ┌────────────┐
//!            │ Executor   │  partition_keys
//!            └─────┬──────┘
//!        ┌─────────┼─────────┐
//!        ▼         ▼         ▼
//!   ┌────────┐┌────────┐┌────────┐
//!   │ leg A  ││ leg B  ││ leg C  │   Row / Done
//!   └───┬────┘└───┬────┘└───┬────┘
//!       └─────────┼─────────┘
//!                 ▼
//!          ┌────────────┐
//!          │ aggregator ├──► Delivery
//!          └────────────┘
//! ```
//!
//! The aggregator calls exactly one terminal method of the delivery, and only after every
//! leg reported completion or failure.
use std::sync::{
    Arc,
    atomic::{AtomicU32, AtomicUsize, Ordering},
};

use observability_deps::tracing::{debug, error, warn};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    batch::partition_keys,
    codec::ReadMode,
    command::BatchCommand,
    connection::ConnectionProvider,
    error::Error,
    key::Key,
    listener::{ArrayListener, BatchItem, Delivery, SequenceListener},
    node::NodeRef,
    partition::PartitionMap,
    policy::Policy,
    retry::Retry,
};

/// Lifecycle of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// Request accepted.
    Created,
    /// Grouping keys by owning node.
    Partitioning,
    /// Waiting for this many legs.
    AwaitingNodes(usize),
    /// Handing the complete result to the caller.
    Delivering,
    /// Failing a batch after some rows were already handed out.
    DeliveringPartial,
    /// Every leg succeeded.
    Completed,
    /// The batch failed before anything was delivered.
    Failed,
    /// The batch failed after some rows were delivered.
    CompletedWithError,
}

/// What one leg did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegReport {
    /// Node serving the leg.
    pub node: NodeRef,
    /// Namespace of the leg.
    pub namespace: Arc<str>,
    /// Keys in the leg.
    pub keys: usize,
    /// Rows delivered over all attempts.
    pub rows: usize,
    /// Attempts made.
    pub attempts: u32,
}

/// Final account of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    /// Terminal state.
    pub state: BatchState,
    /// One report per leg, in completion order.
    pub legs: Vec<LegReport>,
}

/// Handle on a running batch.
///
/// Dropping the handle does not stop the batch.
#[derive(Debug)]
pub struct BatchHandle {
    cancel: CancellationToken,
    task: JoinHandle<BatchSummary>,
}

impl BatchHandle {
    /// Stop starting new attempts.
    ///
    /// Attempts in flight run to completion; the batch then fails with
    /// [`Error::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token cancelling this batch.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wait until the terminal callback ran.
    pub async fn join(self) -> BatchSummary {
        match self.task.await {
            Ok(summary) => summary,
            Err(e) => {
                error!(error = %e, "batch aggregator task failed");
                BatchSummary {
                    state: BatchState::Failed,
                    legs: vec![],
                }
            }
        }
    }
}

enum LegEvent<T> {
    Row { index: usize, value: T },
    Done { report: LegReport, result: Result<(), Error> },
}

/// Runs batches against a cluster.
#[derive(Debug, Clone)]
pub struct Executor {
    partition_map: Arc<dyn PartitionMap>,
    provider: Arc<dyn ConnectionProvider>,
}

impl Executor {
    /// Create an executor.
    pub fn new(
        partition_map: Arc<dyn PartitionMap>,
        provider: Arc<dyn ConnectionProvider>,
    ) -> Self {
        Self {
            partition_map,
            provider,
        }
    }

    /// Start a batch read of `keys` and return immediately.
    ///
    /// Must be called from within a tokio runtime. `cancel` stops the batch; results go to
    /// `delivery`.
    pub fn execute<T: BatchItem>(
        &self,
        policy: &Policy,
        read: ReadMode,
        keys: Vec<Key>,
        delivery: Delivery<T>,
        cancel: CancellationToken,
    ) -> BatchHandle {
        debug!(keys = keys.len(), state = ?BatchState::Created, "batch created");
        debug!(state = ?BatchState::Partitioning, "partitioning batch");

        let commands = partition_keys(&keys, self.partition_map.as_ref()).and_then(|legs| {
            legs.into_iter()
                .map(|leg| BatchCommand::new(leg, &keys, &read, policy))
                .collect::<Result<Vec<_>, _>>()
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let (outstanding, rejected) = match commands {
            Ok(commands) => {
                let n = commands.len();
                for command in commands {
                    tokio::spawn(run_leg(
                        command,
                        Arc::clone(&self.provider),
                        *policy,
                        cancel.clone(),
                        tx.clone(),
                    ));
                }
                (n, None)
            }
            Err(e) => {
                warn!(error = %e, "batch rejected");
                (0, Some(e))
            }
        };
        drop(tx);

        debug!(state = ?BatchState::AwaitingNodes(outstanding), "legs started");
        let task = tokio::spawn(aggregate(
            keys,
            outstanding,
            rx,
            delivery,
            rejected,
            cancel.clone(),
        ));

        BatchHandle { cancel, task }
    }
}

async fn run_leg<T: BatchItem>(
    command: BatchCommand,
    provider: Arc<dyn ConnectionProvider>,
    policy: Policy,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<LegEvent<T>>,
) {
    let leg = command.leg();
    let node = &leg.node;
    debug!(%node, namespace = %leg.namespace, keys = leg.key_indices.len(), "leg started");

    let attempts = AtomicU32::new(0);
    let rows = AtomicUsize::new(0);
    let result = Retry::new(policy.retry_config())
        .run("batch leg", &cancel, Error::is_transient, |attempt| {
            attempts.store(attempt, Ordering::Relaxed);
            let (command, provider, tx, rows) = (&command, &provider, &tx, &rows);
            async move {
                command
                    .execute(provider, policy.timeout, |index, row| {
                        let value = T::from_row(row).map_err(|code| Error::Application {
                            node: Arc::clone(node.name()),
                            code,
                        })?;
                        rows.fetch_add(1, Ordering::Relaxed);
                        // the aggregator outlives every leg
                        let _ = tx.send(LegEvent::Row { index, value });
                        Ok(())
                    })
                    .await
            }
        })
        .await
        .map(|_| ())
        .map_err(Error::from);

    let report = LegReport {
        node: node.clone(),
        namespace: Arc::clone(&leg.namespace),
        keys: leg.key_indices.len(),
        rows: rows.load(Ordering::Relaxed),
        attempts: attempts.load(Ordering::Relaxed),
    };
    match &result {
        Ok(()) => debug!(%node, rows = report.rows, attempts = report.attempts, "leg completed"),
        Err(e) => debug!(%node, attempts = report.attempts, error = %e, "leg failed"),
    }
    let _ = tx.send(LegEvent::Done { report, result });
}

async fn aggregate<T: BatchItem>(
    keys: Vec<Key>,
    mut outstanding: usize,
    mut rx: mpsc::UnboundedReceiver<LegEvent<T>>,
    delivery: Delivery<T>,
    rejected: Option<Error>,
    cancel: CancellationToken,
) -> BatchSummary {
    let mut sink = Sink::new(delivery, keys.len());
    let mut first_error = rejected;
    let mut legs = vec![];

    while outstanding > 0 {
        match rx.recv().await {
            Some(LegEvent::Row { index, value }) => sink.row(&keys, index, value),
            Some(LegEvent::Done { report, result }) => {
                outstanding -= 1;
                legs.push(report);
                if let Err(e) = result {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                debug!(state = ?BatchState::AwaitingNodes(outstanding), "leg finished");
            }
            None => {
                error!(outstanding, "legs stopped without reporting a result");
                first_error.get_or_insert(Error::LegAborted { outstanding });
                break;
            }
        }
    }

    if cancel.is_cancelled() {
        first_error = Some(Error::Cancelled);
    }

    let state = sink.finish(keys, first_error);
    debug!(?state, legs = legs.len(), "batch finished");
    BatchSummary { state, legs }
}

enum Sink<T> {
    Array {
        listener: Box<dyn ArrayListener<T>>,
        slots: Vec<Option<T>>,
    },
    Sequence {
        listener: Box<dyn SequenceListener<T>>,
        delivered: usize,
    },
}

impl<T: BatchItem> Sink<T> {
    fn new(delivery: Delivery<T>, n_keys: usize) -> Self {
        match delivery {
            Delivery::Array(listener) => Self::Array {
                listener,
                slots: (0..n_keys).map(|_| None).collect(),
            },
            Delivery::Sequence(listener) => Self::Sequence {
                listener,
                delivered: 0,
            },
        }
    }

    fn row(&mut self, keys: &[Key], index: usize, value: T) {
        match self {
            // a later row for the same key replaces the earlier one
            Self::Array { slots, .. } => slots[index] = Some(value),
            Self::Sequence {
                listener,
                delivered,
            } => {
                *delivered += 1;
                listener.on_item(keys[index].clone(), value);
            }
        }
    }

    fn finish(self, keys: Vec<Key>, error: Option<Error>) -> BatchState {
        match (self, error) {
            (Self::Array { listener, .. }, Some(e)) => {
                listener.on_failure(e);
                BatchState::Failed
            }
            (Self::Array { mut listener, slots }, None) => {
                debug!(state = ?BatchState::Delivering, "delivering batch");
                let received = slots.iter().filter(|s| s.is_some()).count();
                if received < slots.len() {
                    listener.on_size_mismatch(slots.len(), received);
                }
                let values = slots
                    .into_iter()
                    .map(|s| s.unwrap_or_else(T::absent))
                    .collect();
                listener.on_success(keys, values);
                BatchState::Completed
            }
            (Self::Sequence { listener, delivered }, Some(e)) => {
                listener.on_failure(e);
                if delivered > 0 {
                    debug!(
                        state = ?BatchState::DeliveringPartial,
                        delivered,
                        "failing partially delivered batch"
                    );
                    BatchState::CompletedWithError
                } else {
                    BatchState::Failed
                }
            }
            (Self::Sequence { listener, .. }, None) => {
                listener.on_success();
                BatchState::Completed
            }
        }
    }
}

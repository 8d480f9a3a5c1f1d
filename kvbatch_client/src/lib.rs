//! Asynchronous batch client for a partitioned key/value cluster.
//!
//! A batch request names a set of [`Key`]s that may live on many nodes. The client
//! [partitions](batch::partition_keys) the keys by owning node, sends one command per node
//! leg, parses each leg's streamed response and hands the rows to the caller through a
//! [`Delivery`] strategy: either one ordered array once every leg is done, or a live
//! sequence of rows. Each leg is retried independently on transient I/O failures.
//!
//! ```text
//!   keys ──► partition_keys ──► leg(node A) ──┐
//!                           ├─► leg(node B) ──┼──► aggregator ──► Delivery
//!                           └─► leg(node C) ──┘
//! ```
#![warn(
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr,
    clippy::todo,
    clippy::dbg_macro
)]

pub mod batch;
pub mod client;
pub mod codec;
pub mod command;
pub mod connection;
pub mod error;
pub mod executor;
pub mod key;
pub mod listener;
pub mod node;
pub mod partition;
pub mod policy;
pub mod record;
pub mod retry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod value;

pub use client::Client;
pub use error::{Error, ErrorKind, Result};
pub use executor::{BatchHandle, BatchState, BatchSummary, Executor, LegReport};
pub use key::{Digest, Key};
pub use listener::{
    ArrayListener, BatchItem, Delivery, SequenceListener, array_channel, sequence_channel,
};
pub use node::NodeRef;
pub use partition::{PartitionMap, StaticPartitionMap};
pub use policy::{ConsistencyLevel, Policy, WritePolicy};
pub use record::Record;
pub use value::{Bin, Value};

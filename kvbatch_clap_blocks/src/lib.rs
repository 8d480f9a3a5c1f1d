//! Building blocks for [`clap`]-driven configs of the batch client.
//!
//! They can easily be re-used using `#[clap(flatten)]`.
#![warn(missing_docs, clippy::use_self, clippy::clone_on_ref_ptr)]

pub mod client;
pub mod node;

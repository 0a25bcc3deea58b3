//! Partition and exchange for a shared-nothing parallel query engine.
//!
//! A query fragment running on one worker ends in a
//! [`Producer`](producer::Producer). The producer pulls
//! [`TupleBatch`](batch::TupleBatch)es from its child operator, routes
//! every row with a [`PartitionFunction`](partition::PartitionFunction)
//! and pushes the resulting sub-batches over one
//! [`OutputChannel`](channel::OutputChannel) per destination
//! (operator, worker) pair. Writes never block the pull loop unless
//! the query runs in blocking mode; a channel that cannot take more
//! keeps its data queued.
//!
//! Destinations that go away are handled according to the query's
//! [`FtMode`](config::FtMode). Under `REJOIN` every channel keeps a
//! backup buffer ([`streaming_state`]) that is replayed when the
//! worker comes back.
//!
//! The crate logs with `tracing`; see [`tracing`](crate::tracing) to
//! install a subscriber and an optional OTLP exporter, and [`metrics`]
//! for the Prometheus exporter.

pub mod batch;
pub mod channel;
pub mod config;
pub mod errors;
pub mod hashing;
pub mod metrics;
pub mod operator;
pub mod partition;
pub mod producer;
pub mod streaming_state;
pub mod tracing;

pub use batch::TupleBatch;
pub use config::{ExchangeConfig, ExecutionMode, FtMode};
pub use errors::{ExchangeError, ExchangeResult};
pub use partition::PartitionFunction;
pub use producer::{Producer, ProducerKind};

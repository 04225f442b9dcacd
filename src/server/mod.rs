// The parameter server keeps horizontal slices of large matrices in memory
// and lets training workers read and write them concurrently. Each slice is a
// partition, addressed by (matrix id, partition id), and is the unit of
// consistency: every task that writes to a partition reports a clock, and the
// slowest task's clock is the partition's ready clock. A read that asks for a
// newer clock than that gets NOTREADY and is expected to poll again.

// Every connection has exactly one receive task. It decodes frame headers and
// decides where each request runs. GET_CLOCKS is cheap and is polled by
// workers deciding whether to proceed, so it runs right on the receive task
// and observes this connection's requests in the order they arrived.
// Everything else may be expensive (whole-partition fetches, user functions)
// and goes to a shared worker pool so the receive task never stalls. Pooled
// responses come back in whatever order they finish; the seq id is the only
// thing tying a response to its request.

// The store is the only shared mutable state. The server never holds a lock
// across a store call, and the only lock it takes on the request path is the
// per-connection write guard that keeps two responses from interleaving.
mod config;
mod conn;
mod dispatch;
mod error;
mod listener;
mod memory;
mod partition;
mod scheduler;
pub mod udf;
pub mod wire;

pub use config::ServerConfig;
pub use conn::{serve, FrameReader, ResponseWriter, ServerContext};
pub use dispatch::Dispatcher;
pub use error::Error;
pub use listener::Server;
pub use memory::{encode_row_deltas, MemoryStore};
pub use partition::{
    Clock, ClockTable, PartitionKey, PartitionSnapshot, PartitionStore, Row,
    StoreError,
};
pub use scheduler::{Execution, WorkerPool};

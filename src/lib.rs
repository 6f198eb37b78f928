//! Binds the lifecycle of a named performance trace to the lifecycle of an
//! arbitrary asynchronous stream.
//!
//! A *trace* is a named, timed measurement window with attached numeric
//! metrics and string attributes, submitted to a performance-monitoring
//! backend when it is stopped. This crate measures the duration and outcome
//! of an operation without hand-written start/stop bookkeeping at every
//! call site: a [`TraceStream`] runs one trace for exactly as long as it is
//! held, and the [`TracedStreamExt`] operators start and stop traces in
//! response to the values, completion and lifetime of the stream they wrap.
//!
//! The backend itself is out of scope: callers supply it through the
//! [`PerformanceClient`] and [`TraceHandle`] traits, acquired once per
//! process by a caller-provided async handshake and shared by every trace.
//!
//! # Getting started
//!
//! ```
//! use futures_util::{stream, StreamExt};
//! use perfstream::{PerfError, Performance, TraceOptions, TracedStreamExt};
//!
//! // Without a client loader every trace is a no-op; pass your backend's
//! // acquisition future to `with_client_loader` in production.
//! let perf = Performance::builder().build();
//!
//! // Measure how long the whole download takes.
//! let chunks = stream::iter(vec![Ok::<_, PerfError>(64), Ok(128), Ok(32)]);
//! let chunks = chunks.trace_until_complete(&perf, "download", TraceOptions::default());
//! let total: i64 = futures_executor::block_on(
//!     chunks.fold(0, |acc, chunk| async move { acc + chunk.unwrap_or(0) }),
//! );
//! assert_eq!(total, 224);
//! ```
//!
//! # Lifecycle operators
//!
//! | operator | starts | stops |
//! |---|---|---|
//! | [`trace`] | on the first value | once that instance is live, or on completion |
//! | [`trace_until_first`] | immediately | on the first value |
//! | [`trace_until_complete`] | immediately | on completion |
//! | [`trace_until`] | immediately | on the first value matching a predicate |
//! | [`trace_while`] | whenever a predicate turns true | whenever it turns false |
//!
//! Dropping the stream an operator returns always stops (or abandons) the
//! trace it holds, so a trace never outlives its caller's interest. A trace
//! whose client never resolved is never started and therefore never
//! stopped.
//!
//! # Feature flags
//!
//! * `internal-logs`: Enables internal logging via `tracing` (default).
//! * `testing`: Exposes the in-memory client in [`testing`].
//! * `rt-tokio`: Adds a Tokio [`runtime::Runtime`] for auto-instrumentation.
//!
//! [`trace`]: TracedStreamExt::trace
//! [`trace_until_first`]: TracedStreamExt::trace_until_first
//! [`trace_until_complete`]: TracedStreamExt::trace_until_complete
//! [`trace_until`]: TracedStreamExt::trace_until
//! [`trace_while`]: TracedStreamExt::trace_while
#![warn(missing_debug_implementations, missing_docs, unreachable_pub)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg), deny(rustdoc::broken_intra_doc_links))]

mod client;
mod error;
mod factory;
mod internal_logging;
mod options;
mod performance;
mod policy;
mod provider;
pub mod runtime;

#[cfg(any(feature = "testing", test))]
pub mod testing;

pub use client::{NoopClient, NoopTraceHandle, PerformanceClient, TraceHandle};
pub use error::PerfError;
pub use factory::TraceStream;
pub use options::{
    AttributeStream, IncrementStream, MetricStream, TraceOptions, DEFAULT_INCREMENT,
};
pub use performance::{Performance, PerformanceBuilder};
pub use policy::{Traced, TracedStreamExt};

#[doc(hidden)]
#[cfg(feature = "internal-logs")]
pub mod _private {
    pub use tracing::{debug, info, warn};
}

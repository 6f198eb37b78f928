//! Provides an abstraction of async runtimes.
//!
//! The core of this crate rides on whatever executor polls its streams and
//! introduces no scheduling of its own. The one exception is
//! auto-instrumentation, which needs somewhere to drive its stability
//! subscription in the background; [`Runtime`] is that seam. There is a
//! builtin implementation for [Tokio] behind the `rt-tokio` feature.
//!
//! [Tokio]: https://crates.io/crates/tokio

use futures_util::future::BoxFuture;

/// An abstraction of an async runtime, used to run background
/// subscriptions outside the caller's polling loop.
pub trait Runtime: Clone + Send + Sync + 'static {
    /// Spawn a new task or thread, which executes the given future.
    ///
    /// # Note
    ///
    /// The function does not return a handle: spawned subscriptions are
    /// fire-and-forget and end on their own when their source completes.
    fn spawn(&self, future: BoxFuture<'static, ()>);
}

/// Runtime implementation, which works with Tokio.
#[cfg(feature = "rt-tokio")]
#[cfg_attr(docsrs, doc(cfg(feature = "rt-tokio")))]
#[derive(Debug, Clone)]
pub struct Tokio;

#[cfg(feature = "rt-tokio")]
#[cfg_attr(docsrs, doc(cfg(feature = "rt-tokio")))]
impl Runtime for Tokio {
    fn spawn(&self, future: BoxFuture<'static, ()>) {
        #[allow(clippy::let_underscore_future)]
        // we don't have to await on the returned future to execute
        let _ = tokio::spawn(future);
    }
}

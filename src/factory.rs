use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;

use crate::client::{PerformanceClient, TraceHandle};
use crate::error::PerfError;
use crate::options::{DynamicFeed, TraceOptions};
use crate::perf_debug;
use crate::provider::ClientFuture;

/// A recipe for trace instances: name plus options.
///
/// `new_stream` can be called more than once; each call produces an
/// independent [`TraceStream`] with its own handle and its own dynamic
/// feeds. Two concurrent instances with the same name never share state.
pub(crate) struct TraceSpec {
    name: String,
    options: TraceOptions,
}

impl TraceSpec {
    pub(crate) fn new(name: String, options: TraceOptions) -> Self {
        TraceSpec { name, options }
    }

    pub(crate) fn new_stream(&mut self, client: &ClientFuture) -> TraceStream {
        TraceStream {
            state: State::Resolving(PendingTrace {
                client: client.clone(),
                name: self.name.clone(),
                metrics: self.options.metrics.clone(),
                attributes: self.options.attributes.clone(),
                feeds: self.options.build_feeds(),
            }),
        }
    }
}

/// A trace instance waiting for the client to resolve.
///
/// Nothing has been created on the backend yet: dropping the stream in this
/// state abandons the instance without ever starting (or stopping) a trace.
struct PendingTrace {
    client: ClientFuture,
    name: String,
    metrics: HashMap<String, i64>,
    attributes: HashMap<String, String>,
    feeds: Vec<DynamicFeed>,
}

impl PendingTrace {
    fn into_active(self, client: Arc<dyn PerformanceClient>) -> ActiveTrace {
        let mut handle = client.new_trace(&self.name);
        for (key, value) in &self.metrics {
            handle.set_metric(key, *value);
        }
        for (key, value) in &self.attributes {
            handle.set_attribute(key, value);
        }
        handle.start();
        perf_debug!(name: "Trace.Started", trace = self.name.as_str());
        ActiveTrace {
            handle,
            feeds: self.feeds,
            name: self.name,
        }
    }
}

/// A started trace handle together with its live dynamic feeds.
///
/// Dropping it is the one and only stop path: `stop()` runs first, then the
/// feeds are released. The handle is stopped exactly once because the value
/// is constructed exactly once per started trace and never cloned.
struct ActiveTrace {
    handle: Box<dyn TraceHandle>,
    feeds: Vec<DynamicFeed>,
    name: String,
}

impl ActiveTrace {
    fn poll_feeds(&mut self, cx: &mut Context<'_>) {
        let handle = self.handle.as_mut();
        for feed in self.feeds.iter_mut() {
            feed.poll_apply(handle, cx);
        }
    }
}

impl Drop for ActiveTrace {
    fn drop(&mut self) {
        // `stop` happens-before the feed subscriptions are released, which
        // follows when the fields drop.
        self.handle.stop();
        perf_debug!(name: "Trace.Stopped", trace = self.name.as_str());
    }
}

enum State {
    Resolving(PendingTrace),
    Live { trace: ActiveTrace, emitted: bool },
    Terminated,
}

/// A live trace bound to this stream's lifetime, produced by
/// [`Performance::create_trace`].
///
/// The stream resolves the shared client, creates and starts a trace handle
/// with all static metrics and attributes applied, and then yields exactly
/// one `Ok(())` lifecycle token. After the token it stays pending: every
/// subsequent poll drains the dynamic metric/attribute/increment feeds into
/// the handle. Dropping the stream stops the trace and releases the feeds.
///
/// If client acquisition fails the stream yields the error once and
/// terminates; no handle was created, so nothing is stopped. Dropping the
/// stream before the client resolves likewise starts nothing.
///
/// ```
/// use futures_util::StreamExt;
/// use perfstream::{Performance, TraceOptions};
///
/// let perf = Performance::builder().build();
/// let mut startup = perf.create_trace("startup", TraceOptions::default());
/// futures_executor::block_on(startup.next()); // trace is live
/// drop(startup); // trace is stopped
/// ```
///
/// [`Performance::create_trace`]: crate::Performance::create_trace
pub struct TraceStream {
    state: State,
}

impl Stream for TraceStream {
    type Item = Result<(), PerfError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                State::Resolving(pending) => {
                    let client = match Pin::new(&mut pending.client).poll(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(err)) => {
                            this.state = State::Terminated;
                            return Poll::Ready(Some(Err(err)));
                        }
                        Poll::Ready(Ok(client)) => client,
                    };
                    let State::Resolving(pending) =
                        mem::replace(&mut this.state, State::Terminated)
                    else {
                        return Poll::Ready(None);
                    };
                    this.state = State::Live {
                        trace: pending.into_active(client),
                        emitted: false,
                    };
                }
                State::Live { trace, emitted } => {
                    // Values already sitting in the dynamic sources are
                    // applied as part of coming live, before the token.
                    trace.poll_feeds(cx);
                    if !*emitted {
                        *emitted = true;
                        return Poll::Ready(Some(Ok(())));
                    }
                    return Poll::Pending;
                }
                State::Terminated => return Poll::Ready(None),
            }
        }
    }
}

impl fmt::Debug for TraceStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            State::Resolving(pending) => ("resolving", pending.name.as_str()),
            State::Live { trace, .. } => ("live", trace.name.as_str()),
            State::Terminated => ("terminated", ""),
        };
        f.debug_struct("TraceStream")
            .field("state", &state.0)
            .field("trace", &state.1)
            .finish()
    }
}

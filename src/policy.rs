//! Lifecycle policies: stream operators that bind a trace to the observed
//! behavior of an arbitrary source stream.
//!
//! Every operator relays the source's values, errors and completion
//! unchanged; the only observable difference is the trace side effect. The
//! five start/stop rules share one state machine (`Idle` / `Armed` /
//! `Stopped`) holding at most one live trace instance at a time.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use pin_project_lite::pin_project;

use crate::error::PerfError;
use crate::factory::{TraceSpec, TraceStream};
use crate::options::TraceOptions;
use crate::performance::Performance;
use crate::provider::ClientFuture;

enum Rule<T> {
    FirstValue,
    UntilFirst,
    UntilComplete,
    Until {
        test: Box<dyn FnMut(&T) -> bool + Send>,
        or_complete: bool,
    },
    While {
        test: Box<dyn FnMut(&T) -> bool + Send>,
        or_complete: bool,
    },
}

/// The per-invocation trace lifecycle.
///
/// `Armed` holds the single outstanding factory subscription; replacing the
/// state drops it, which is what stops a started trace (or abandons an
/// unresolved one). Only the `While` rule ever returns to `Idle`.
enum TraceState {
    Idle,
    Armed {
        trace: TraceStream,
        stop_when_live: bool,
    },
    Stopped,
}

impl TraceState {
    fn arm(spec: &mut TraceSpec, client: &ClientFuture, stop_when_live: bool) -> Self {
        TraceState::Armed {
            trace: spec.new_stream(client),
            stop_when_live,
        }
    }

    fn dispose(&mut self) {
        *self = TraceState::Stopped;
    }

    fn is_idle(&self) -> bool {
        matches!(self, TraceState::Idle)
    }

    fn is_armed(&self) -> bool {
        matches!(self, TraceState::Armed { .. })
    }
}

pin_project! {
    /// Stream returned by the [`TracedStreamExt`] operators.
    ///
    /// Dropping this stream cascades to the live trace instance, so a trace
    /// never outlives its caller's interest. Dropping after the policy has
    /// already stopped its trace does not stop it a second time.
    #[must_use = "streams do nothing unless polled"]
    pub struct Traced<S, T> {
        #[pin]
        source: S,
        rule: Rule<T>,
        state: TraceState,
        spec: TraceSpec,
        client: ClientFuture,
    }
}

impl<S, T> Traced<S, T> {
    fn new(
        source: S,
        perf: &Performance,
        name: String,
        options: TraceOptions,
        rule: Rule<T>,
    ) -> Self {
        let client = perf.client_future();
        let mut spec = TraceSpec::new(name, options);
        // Immediate-start rules hold their subscription from construction;
        // value-triggered rules arm lazily.
        let state = match &rule {
            Rule::UntilFirst | Rule::UntilComplete | Rule::Until { .. } => {
                TraceState::arm(&mut spec, &client, false)
            }
            Rule::FirstValue | Rule::While { .. } => TraceState::Idle,
        };
        Traced {
            source,
            rule,
            state,
            spec,
            client,
        }
    }
}

impl<S, T> fmt::Debug for Traced<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            TraceState::Idle => "idle",
            TraceState::Armed { .. } => "armed",
            TraceState::Stopped => "stopped",
        };
        f.debug_struct("Traced")
            .field("state", &state)
            .finish_non_exhaustive()
    }
}

impl<S, T, E> Stream for Traced<S, T>
where
    S: Stream<Item = Result<T, E>>,
    E: From<PerfError>,
{
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        // Drive the outstanding trace subscription first: it finishes client
        // acquisition, starts the handle, and applies dynamic feed values.
        if let TraceState::Armed {
            trace,
            stop_when_live,
        } = &mut *this.state
        {
            match Pin::new(trace).poll_next(cx) {
                Poll::Ready(Some(Ok(()))) => {
                    if *stop_when_live {
                        this.state.dispose();
                    }
                }
                Poll::Ready(Some(Err(err))) => {
                    // Acquisition failed: no handle exists and none will.
                    this.state.dispose();
                    return Poll::Ready(Some(Err(err.into())));
                }
                Poll::Ready(None) => this.state.dispose(),
                Poll::Pending => {}
            }
        }

        match this.source.poll_next(cx) {
            Poll::Ready(Some(Ok(value))) => {
                match this.rule {
                    Rule::FirstValue => {
                        // Start on the first value and schedule the stop for
                        // the moment the same instance comes live.
                        if this.state.is_idle() {
                            *this.state = TraceState::arm(this.spec, this.client, true);
                        }
                    }
                    Rule::UntilFirst => this.state.dispose(),
                    Rule::UntilComplete => {}
                    Rule::Until { test, .. } => {
                        if test(&value) {
                            this.state.dispose();
                        }
                    }
                    Rule::While { test, .. } => {
                        if test(&value) {
                            if this.state.is_idle() {
                                *this.state = TraceState::arm(this.spec, this.client, false);
                            }
                        } else if this.state.is_armed() {
                            // Close the current segment; a later
                            // false-to-true transition re-arms.
                            *this.state = TraceState::Idle;
                        }
                    }
                }
                Poll::Ready(Some(Ok(value)))
            }
            // A source error is relayed without stopping the trace; see the
            // module docs of [`TracedStreamExt`].
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err))),
            Poll::Ready(None) => {
                match this.rule {
                    Rule::FirstValue | Rule::UntilComplete => this.state.dispose(),
                    Rule::Until { or_complete, .. } | Rule::While { or_complete, .. }
                        if *or_complete =>
                    {
                        this.state.dispose()
                    }
                    _ => {}
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Extension trait attaching trace lifecycles to fallible streams.
///
/// All operators observe a `Stream<Item = Result<T, E>>` and produce a
/// stream with identical items. The error type must absorb [`PerfError`] so
/// a client acquisition failure can be surfaced through the same channel.
///
/// Error asymmetry, kept deliberately from the measured semantics: a source
/// *error* never stops a running trace — only values, completion (where the
/// rule says so) and dropping the returned stream do. Callers that need a
/// guaranteed stop when a stream can fail should use a value-based rule, or
/// pass [`TraceOptions::with_or_complete`] and terminate the source on
/// error.
///
/// ```
/// use futures_util::{stream, StreamExt};
/// use perfstream::{PerfError, Performance, TraceOptions, TracedStreamExt};
///
/// let perf = Performance::builder().build();
/// let pages = stream::iter(vec![Ok::<_, PerfError>(1), Ok(2), Ok(3)]);
/// let traced = pages.trace_until_complete(&perf, "pagination", TraceOptions::default());
/// let pages: Vec<_> = futures_executor::block_on(traced.collect::<Vec<_>>());
/// assert_eq!(pages.len(), 3);
/// ```
pub trait TracedStreamExt: Sized {
    /// Starts a trace on the source's first value and stops it as soon as
    /// that same instance is live, or on completion.
    fn trace<T, E>(
        self,
        perf: &Performance,
        name: impl Into<String>,
        options: TraceOptions,
    ) -> Traced<Self, T>
    where
        Self: Stream<Item = Result<T, E>>,
        E: From<PerfError>,
    {
        Traced::new(self, perf, name.into(), options, Rule::FirstValue)
    }

    /// Starts a trace immediately and stops it on the source's first value.
    fn trace_until_first<T, E>(
        self,
        perf: &Performance,
        name: impl Into<String>,
        options: TraceOptions,
    ) -> Traced<Self, T>
    where
        Self: Stream<Item = Result<T, E>>,
        E: From<PerfError>,
    {
        Traced::new(self, perf, name.into(), options, Rule::UntilFirst)
    }

    /// Starts a trace immediately and stops it when the source completes.
    fn trace_until_complete<T, E>(
        self,
        perf: &Performance,
        name: impl Into<String>,
        options: TraceOptions,
    ) -> Traced<Self, T>
    where
        Self: Stream<Item = Result<T, E>>,
        E: From<PerfError>,
    {
        Traced::new(self, perf, name.into(), options, Rule::UntilComplete)
    }

    /// Starts a trace immediately and stops it on the first value for which
    /// `test` returns true, or on completion if
    /// [`TraceOptions::with_or_complete`] was set.
    fn trace_until<T, E, P>(
        self,
        perf: &Performance,
        name: impl Into<String>,
        test: P,
        options: TraceOptions,
    ) -> Traced<Self, T>
    where
        Self: Stream<Item = Result<T, E>>,
        E: From<PerfError>,
        P: FnMut(&T) -> bool + Send + 'static,
    {
        let or_complete = options.or_complete;
        Traced::new(
            self,
            perf,
            name.into(),
            options,
            Rule::Until {
                test: Box::new(test),
                or_complete,
            },
        )
    }

    /// Runs a trace instance for every span of values where `test` holds:
    /// a false-to-true transition starts a new instance, a true-to-false
    /// transition stops the current one. With
    /// [`TraceOptions::with_or_complete`] an instance still open at
    /// completion is stopped as well; without it, it stays open until the
    /// returned stream is dropped.
    ///
    /// This is the only re-arming operator; dynamic entries that should
    /// feed every instance must be registered with the
    /// [`TraceOptions`] `with_*_source` variants.
    fn trace_while<T, E, P>(
        self,
        perf: &Performance,
        name: impl Into<String>,
        test: P,
        options: TraceOptions,
    ) -> Traced<Self, T>
    where
        Self: Stream<Item = Result<T, E>>,
        E: From<PerfError>,
        P: FnMut(&T) -> bool + Send + 'static,
    {
        let or_complete = options.or_complete;
        Traced::new(
            self,
            perf,
            name.into(),
            options,
            Rule::While {
                test: Box::new(test),
                or_complete,
            },
        )
    }
}

impl<S: Stream> TracedStreamExt for S {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InMemoryClient, TraceRecord};
    use futures_util::stream;
    use futures_util::task::noop_waker;
    use futures_util::StreamExt;

    fn perf_for(client: &InMemoryClient) -> Performance {
        Performance::builder()
            .with_client_loader(futures_util::future::ready(Ok(client.as_client())))
            .build()
    }

    fn ok_stream(values: Vec<i64>) -> impl Stream<Item = Result<i64, PerfError>> + Unpin {
        stream::iter(values.into_iter().map(Ok))
    }

    fn poll<S>(stream: &mut S) -> Poll<Option<S::Item>>
    where
        S: Stream + Unpin,
    {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        stream.poll_next_unpin(&mut cx)
    }

    fn record(client: &InMemoryClient, index: usize) -> TraceRecord {
        client.records().unwrap().remove(index)
    }

    #[test]
    fn trace_starts_on_first_value_and_stops_once_live() {
        let client = InMemoryClient::default();
        let perf = perf_for(&client);
        let mut traced = ok_stream(vec![10, 20]).trace(&perf, "op", TraceOptions::default());

        // First value arms the trace; nothing has started yet.
        assert!(matches!(poll(&mut traced), Poll::Ready(Some(Ok(10)))));
        assert!(client.records().unwrap().is_empty());

        // The next poll brings the instance live and immediately stops it.
        assert!(matches!(poll(&mut traced), Poll::Ready(Some(Ok(20)))));
        let rec = record(&client, 0);
        assert_eq!(rec.start_count(), 1);
        assert_eq!(rec.stop_count(), 1);

        assert!(matches!(poll(&mut traced), Poll::Ready(None)));
        drop(traced);
        let rec = record(&client, 0);
        assert_eq!(rec.stop_count(), 1);
    }

    #[test]
    fn trace_until_first_stops_on_first_value_and_stays_stopped() {
        let client = InMemoryClient::default();
        let perf = perf_for(&client);
        let mut traced =
            ok_stream(vec![1, 2]).trace_until_first(&perf, "first-paint", TraceOptions::default());

        assert!(matches!(poll(&mut traced), Poll::Ready(Some(Ok(1)))));
        let rec = record(&client, 0);
        assert_eq!(rec.start_count(), 1);
        assert_eq!(rec.stop_count(), 1);

        assert!(matches!(poll(&mut traced), Poll::Ready(Some(Ok(2)))));
        assert!(matches!(poll(&mut traced), Poll::Ready(None)));
        drop(traced);
        let rec = record(&client, 0);
        assert_eq!(rec.stop_count(), 1, "no second stop on drop");
    }

    #[test]
    fn trace_until_complete_stops_only_on_completion() {
        let client = InMemoryClient::default();
        let perf = perf_for(&client);
        let mut traced =
            ok_stream(vec![1, 2, 3]).trace_until_complete(&perf, "load", TraceOptions::default());

        for expected in [1, 2, 3] {
            match poll(&mut traced) {
                Poll::Ready(Some(Ok(value))) => assert_eq!(value, expected),
                other => panic!("unexpected poll result: {other:?}"),
            }
            assert_eq!(record(&client, 0).stop_count(), 0);
        }
        assert!(matches!(poll(&mut traced), Poll::Ready(None)));
        let rec = record(&client, 0);
        assert_eq!(rec.start_count(), 1);
        assert_eq!(rec.stop_count(), 1);
    }

    #[test]
    fn trace_until_stops_on_matching_value() {
        let client = InMemoryClient::default();
        let perf = perf_for(&client);
        let mut traced = ok_stream(vec![1, 3, 7, 9]).trace_until(
            &perf,
            "threshold",
            |n| *n > 5,
            TraceOptions::default(),
        );

        assert!(matches!(poll(&mut traced), Poll::Ready(Some(Ok(1)))));
        let rec = record(&client, 0);
        assert_eq!(rec.start_count(), 1, "starts on subscription");
        assert_eq!(rec.stop_count(), 0);

        assert!(matches!(poll(&mut traced), Poll::Ready(Some(Ok(3)))));
        assert_eq!(record(&client, 0).stop_count(), 0);

        assert!(matches!(poll(&mut traced), Poll::Ready(Some(Ok(7)))));
        assert_eq!(record(&client, 0).stop_count(), 1);

        assert!(matches!(poll(&mut traced), Poll::Ready(Some(Ok(9)))));
        assert_eq!(record(&client, 0).stop_count(), 1, "stays stopped");
        assert!(matches!(poll(&mut traced), Poll::Ready(None)));
    }

    #[test]
    fn trace_until_with_or_complete_stops_on_completion() {
        let client = InMemoryClient::default();
        let perf = perf_for(&client);
        let mut traced = ok_stream(vec![1, 2]).trace_until(
            &perf,
            "threshold",
            |n| *n > 5,
            TraceOptions::default().with_or_complete(true),
        );

        // No value ever matches; the trace stays open until completion.
        assert!(matches!(poll(&mut traced), Poll::Ready(Some(Ok(1)))));
        assert!(matches!(poll(&mut traced), Poll::Ready(Some(Ok(2)))));
        assert_eq!(record(&client, 0).stop_count(), 0);

        assert!(matches!(poll(&mut traced), Poll::Ready(None)));
        let rec = record(&client, 0);
        assert_eq!(rec.start_count(), 1);
        assert_eq!(rec.stop_count(), 1);
    }

    #[test]
    fn trace_while_opens_one_instance_per_matching_span() {
        let client = InMemoryClient::default();
        let perf = perf_for(&client);
        let mut traced = ok_stream(vec![1, 2, 4, 5, 6]).trace_while(
            &perf,
            "busy",
            |n| *n % 2 == 0,
            TraceOptions::default().with_or_complete(true),
        );

        assert!(matches!(poll(&mut traced), Poll::Ready(Some(Ok(1)))));
        assert!(client.records().unwrap().is_empty());

        // `2` arms the first instance, which starts on the next poll.
        assert!(matches!(poll(&mut traced), Poll::Ready(Some(Ok(2)))));
        assert!(matches!(poll(&mut traced), Poll::Ready(Some(Ok(4)))));
        assert_eq!(record(&client, 0).start_count(), 1);
        assert_eq!(record(&client, 0).stop_count(), 0);

        // `5` closes the first span.
        assert!(matches!(poll(&mut traced), Poll::Ready(Some(Ok(5)))));
        assert_eq!(record(&client, 0).stop_count(), 1);

        // `6` arms a second, independent instance.
        assert!(matches!(poll(&mut traced), Poll::Ready(Some(Ok(6)))));
        assert!(matches!(poll(&mut traced), Poll::Ready(None)));
        let records = client.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].start_count(), 1);
        assert_eq!(records[1].stop_count(), 1, "or_complete closes the span");
    }

    #[test]
    fn trace_while_without_or_complete_leaves_last_span_open() {
        let client = InMemoryClient::default();
        let perf = perf_for(&client);
        let mut traced =
            ok_stream(vec![2, 3, 6]).trace_while(&perf, "busy", |n| *n % 2 == 0, TraceOptions::default());

        assert!(matches!(poll(&mut traced), Poll::Ready(Some(Ok(2)))));
        assert!(matches!(poll(&mut traced), Poll::Ready(Some(Ok(3)))));
        assert!(matches!(poll(&mut traced), Poll::Ready(Some(Ok(6)))));
        assert!(matches!(poll(&mut traced), Poll::Ready(None)));

        let records = client.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].start_count(), 1);
        assert_eq!(records[1].stop_count(), 0, "left open by design");

        // The caller dropping its subscription still reclaims the trace.
        drop(traced);
        assert_eq!(record(&client, 1).stop_count(), 1);
    }

    #[test]
    fn client_failure_propagates_and_creates_no_handle() {
        let client = InMemoryClient::default();
        let perf = Performance::builder()
            .with_client_loader(futures_util::future::ready(Err(
                PerfError::ClientAcquisition("offline".into()),
            )))
            .build();
        let mut traced =
            ok_stream(vec![1]).trace_until_complete(&perf, "load", TraceOptions::default());

        assert!(matches!(
            poll(&mut traced),
            Poll::Ready(Some(Err(PerfError::ClientAcquisition(_))))
        ));
        assert!(client.records().unwrap().is_empty());
    }

    #[test]
    fn source_values_flow_while_client_is_resolving() {
        let client = InMemoryClient::default();
        let perf = Performance::builder()
            .with_client_loader(futures_util::future::pending())
            .build();
        let mut traced =
            ok_stream(vec![1, 2]).trace_until(&perf, "load", |n| *n > 1, TraceOptions::default());

        // The trace can never start, but the source is not blocked and the
        // predicate still runs.
        assert!(matches!(poll(&mut traced), Poll::Ready(Some(Ok(1)))));
        assert!(matches!(poll(&mut traced), Poll::Ready(Some(Ok(2)))));
        drop(traced);
        assert!(
            client.records().unwrap().is_empty(),
            "never started, never stopped"
        );
    }

    #[test]
    fn source_error_is_relayed_without_stopping_the_trace() {
        let client = InMemoryClient::default();
        let perf = perf_for(&client);
        let source = stream::iter(vec![
            Ok(1),
            Err(PerfError::Internal("boom".into())),
            Ok(2),
        ]);
        let mut traced = source.trace_until_complete(&perf, "load", TraceOptions::default());

        assert!(matches!(poll(&mut traced), Poll::Ready(Some(Ok(1)))));
        assert!(matches!(poll(&mut traced), Poll::Ready(Some(Err(_)))));
        assert_eq!(record(&client, 0).stop_count(), 0, "error does not stop");
        assert!(matches!(poll(&mut traced), Poll::Ready(Some(Ok(2)))));
        assert!(matches!(poll(&mut traced), Poll::Ready(None)));
        assert_eq!(record(&client, 0).stop_count(), 1);
    }

    #[test]
    fn while_instances_get_fresh_dynamic_feeds_from_sources() {
        let client = InMemoryClient::default();
        let perf = perf_for(&client);
        let options = TraceOptions::default()
            .with_increment_source("events", || stream::iter(vec![None, Some(2)]))
            .with_or_complete(true);
        let mut traced =
            ok_stream(vec![2, 3, 4]).trace_while(&perf, "busy", |n| *n % 2 == 0, options);

        while let Poll::Ready(Some(_)) = poll(&mut traced) {}
        let records = client.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].metrics["events"], 3);
        assert_eq!(records[1].metrics["events"], 3);
    }

    #[test]
    fn traced_debug_reports_the_lifecycle_state() {
        let client = InMemoryClient::default();
        let perf = perf_for(&client);
        let mut traced =
            ok_stream(vec![1]).trace_until_complete(&perf, "load", TraceOptions::default());
        assert!(format!("{traced:?}").contains("armed"));

        assert!(matches!(poll(&mut traced), Poll::Ready(Some(Ok(1)))));
        assert!(matches!(poll(&mut traced), Poll::Ready(None)));
        assert!(format!("{traced:?}").contains("stopped"));
    }

    #[test]
    fn dropping_the_policy_cascades_to_a_live_trace() {
        let client = InMemoryClient::default();
        let perf = perf_for(&client);
        let (_tx, rx) = futures_channel::mpsc::unbounded::<Result<i64, PerfError>>();
        let mut traced = rx.trace_until_complete(&perf, "session", TraceOptions::default());

        assert!(poll(&mut traced).is_pending());
        assert_eq!(record(&client, 0).start_count(), 1);
        assert_eq!(record(&client, 0).stop_count(), 0);

        drop(traced);
        let rec = record(&client, 0);
        assert_eq!(rec.stop_count(), 1);
    }
}

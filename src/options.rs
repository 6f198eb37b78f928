use std::collections::HashMap;
use std::fmt;
use std::task::{Context, Poll};

use futures_core::Stream;
use futures_util::stream::{self, BoxStream, StreamExt};

use crate::client::TraceHandle;

/// Stream of attribute values; each value overwrites the attribute.
pub type AttributeStream = BoxStream<'static, String>;
/// Stream of metric values; each value overwrites the metric.
pub type MetricStream = BoxStream<'static, i64>;
/// Stream of metric deltas; `None` increments by [`DEFAULT_INCREMENT`].
pub type IncrementStream = BoxStream<'static, Option<i64>>;

/// Increment applied when an increment stream emits `None`.
pub const DEFAULT_INCREMENT: i64 = 1;

type AttributeSource = Box<dyn FnMut() -> AttributeStream + Send>;
type MetricSource = Box<dyn FnMut() -> MetricStream + Send>;
type IncrementSource = Box<dyn FnMut() -> IncrementStream + Send>;

/// Everything attached to a trace at creation time.
///
/// Static `metrics` and `attributes` are written to the handle once, before
/// the trace is started. Dynamic entries are streams whose values are pushed
/// into the handle for as long as the trace is live: attribute and metric
/// streams overwrite on every value, increment streams add their delta (or
/// [`DEFAULT_INCREMENT`] for `None`) on every value.
///
/// Rust streams are one-shot values, so dynamic entries are registered as
/// *sources*. `with_*_stream` registers a source that yields the given
/// stream to the first trace instance and an empty feed to any later one;
/// this is all the single-instance operators ever need. [`trace_while`]
/// creates a new trace instance on every false-to-true transition of its
/// predicate, so dynamic entries that should feed every instance must be
/// registered with the `with_*_source` variants instead.
///
/// ```
/// use futures_util::stream;
/// use perfstream::TraceOptions;
///
/// let options = TraceOptions::default()
///     .with_metric("items", 0)
///     .with_attribute("mode", "cold")
///     .with_metric_stream("progress", stream::iter(vec![10, 60, 100]));
/// ```
///
/// [`trace_while`]: crate::TracedStreamExt::trace_while
#[derive(Default)]
pub struct TraceOptions {
    pub(crate) metrics: HashMap<String, i64>,
    pub(crate) attributes: HashMap<String, String>,
    attribute_sources: HashMap<String, AttributeSource>,
    metric_sources: HashMap<String, MetricSource>,
    increment_sources: HashMap<String, IncrementSource>,
    pub(crate) or_complete: bool,
}

impl TraceOptions {
    /// Sets the metric `key` to `value` once, before the trace starts.
    pub fn with_metric(mut self, key: impl Into<String>, value: i64) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }

    /// Sets the attribute `key` to `value` once, before the trace starts.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Overwrites the attribute `key` with every value of `stream` while the
    /// trace is live. Feeds the first trace instance only.
    pub fn with_attribute_stream<S>(mut self, key: impl Into<String>, stream: S) -> Self
    where
        S: Stream<Item = String> + Send + 'static,
    {
        self.attribute_sources.insert(key.into(), one_shot(stream));
        self
    }

    /// Overwrites the attribute `key` from a fresh stream per trace
    /// instance, produced by `source`.
    pub fn with_attribute_source<S, F>(mut self, key: impl Into<String>, mut source: F) -> Self
    where
        F: FnMut() -> S + Send + 'static,
        S: Stream<Item = String> + Send + 'static,
    {
        self.attribute_sources
            .insert(key.into(), Box::new(move || source().fuse().boxed()));
        self
    }

    /// Overwrites the metric `key` with every value of `stream` while the
    /// trace is live. Feeds the first trace instance only.
    pub fn with_metric_stream<S>(mut self, key: impl Into<String>, stream: S) -> Self
    where
        S: Stream<Item = i64> + Send + 'static,
    {
        self.metric_sources.insert(key.into(), one_shot(stream));
        self
    }

    /// Overwrites the metric `key` from a fresh stream per trace instance,
    /// produced by `source`.
    pub fn with_metric_source<S, F>(mut self, key: impl Into<String>, mut source: F) -> Self
    where
        F: FnMut() -> S + Send + 'static,
        S: Stream<Item = i64> + Send + 'static,
    {
        self.metric_sources
            .insert(key.into(), Box::new(move || source().fuse().boxed()));
        self
    }

    /// Increments the metric `key` on every value of `stream` while the
    /// trace is live, by the emitted delta or [`DEFAULT_INCREMENT`] for
    /// `None`. Feeds the first trace instance only.
    pub fn with_increment_stream<S>(mut self, key: impl Into<String>, stream: S) -> Self
    where
        S: Stream<Item = Option<i64>> + Send + 'static,
    {
        self.increment_sources.insert(key.into(), one_shot(stream));
        self
    }

    /// Increments the metric `key` from a fresh stream per trace instance,
    /// produced by `source`.
    pub fn with_increment_source<S, F>(mut self, key: impl Into<String>, mut source: F) -> Self
    where
        F: FnMut() -> S + Send + 'static,
        S: Stream<Item = Option<i64>> + Send + 'static,
    {
        self.increment_sources
            .insert(key.into(), Box::new(move || source().fuse().boxed()));
        self
    }

    /// Also stop the trace when the observed stream completes.
    ///
    /// Only consulted by [`trace_until`] and [`trace_while`]; the other
    /// operators have fixed stop rules.
    ///
    /// [`trace_until`]: crate::TracedStreamExt::trace_until
    /// [`trace_while`]: crate::TracedStreamExt::trace_while
    pub fn with_or_complete(mut self, or_complete: bool) -> Self {
        self.or_complete = or_complete;
        self
    }

    /// Builds one feed per dynamic entry for a new trace instance.
    pub(crate) fn build_feeds(&mut self) -> Vec<DynamicFeed> {
        let mut feeds = Vec::with_capacity(
            self.attribute_sources.len() + self.metric_sources.len() + self.increment_sources.len(),
        );
        for (key, source) in self.attribute_sources.iter_mut() {
            feeds.push(DynamicFeed::Attribute {
                key: key.clone(),
                stream: source(),
            });
        }
        for (key, source) in self.metric_sources.iter_mut() {
            feeds.push(DynamicFeed::Metric {
                key: key.clone(),
                stream: source(),
            });
        }
        for (key, source) in self.increment_sources.iter_mut() {
            feeds.push(DynamicFeed::Increment {
                key: key.clone(),
                stream: source(),
            });
        }
        feeds
    }
}

impl fmt::Debug for TraceOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceOptions")
            .field("metrics", &self.metrics)
            .field("attributes", &self.attributes)
            .field(
                "attribute_sources",
                &self.attribute_sources.keys().collect::<Vec<_>>(),
            )
            .field(
                "metric_sources",
                &self.metric_sources.keys().collect::<Vec<_>>(),
            )
            .field(
                "increment_sources",
                &self.increment_sources.keys().collect::<Vec<_>>(),
            )
            .field("or_complete", &self.or_complete)
            .finish()
    }
}

/// One live dynamic-source subscription, writing into the trace handle.
///
/// A feed is only polled between the handle's `start()` and `stop()`; all
/// ready values are drained on every poll so the handle reflects the latest
/// state of each source.
pub(crate) enum DynamicFeed {
    Attribute { key: String, stream: AttributeStream },
    Metric { key: String, stream: MetricStream },
    Increment { key: String, stream: IncrementStream },
}

impl DynamicFeed {
    pub(crate) fn poll_apply(&mut self, handle: &mut dyn TraceHandle, cx: &mut Context<'_>) {
        match self {
            DynamicFeed::Attribute { key, stream } => {
                while let Poll::Ready(Some(value)) = stream.as_mut().poll_next(cx) {
                    handle.set_attribute(key, &value);
                }
            }
            DynamicFeed::Metric { key, stream } => {
                while let Poll::Ready(Some(value)) = stream.as_mut().poll_next(cx) {
                    handle.set_metric(key, value);
                }
            }
            DynamicFeed::Increment { key, stream } => {
                while let Poll::Ready(Some(delta)) = stream.as_mut().poll_next(cx) {
                    handle.increment_metric(key, delta.unwrap_or(DEFAULT_INCREMENT));
                }
            }
        }
    }
}

/// Wraps a plain stream as a source: the first call yields the stream, any
/// later call an empty feed.
fn one_shot<S, I>(stream: S) -> Box<dyn FnMut() -> BoxStream<'static, I> + Send>
where
    S: Stream<Item = I> + Send + 'static,
    I: Send + 'static,
{
    let mut slot = Some(stream);
    Box::new(move || match slot.take() {
        Some(stream) => stream.fuse().boxed(),
        None => stream::empty().boxed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::PerformanceClient;
    use crate::testing::InMemoryClient;
    use futures_util::task::noop_waker;

    #[test]
    fn one_shot_sources_feed_the_first_instance_only() {
        let mut options =
            TraceOptions::default().with_metric_stream("m", stream::iter(vec![1, 2]));
        let first = options.build_feeds();
        let second = options.build_feeds();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);

        let client = InMemoryClient::default();
        let mut handle = client.new_trace("t");
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        for mut feed in second {
            feed.poll_apply(handle.as_mut(), &mut cx);
        }
        assert!(client.records().unwrap()[0].metrics.is_empty());
    }

    #[test]
    fn increment_feed_uses_default_increment_for_none() {
        let mut options = TraceOptions::default()
            .with_increment_stream("count", stream::iter(vec![Some(5), None, None]));
        let mut feeds = options.build_feeds();

        let client = InMemoryClient::default();
        let mut handle = client.new_trace("t");
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        feeds[0].poll_apply(handle.as_mut(), &mut cx);
        assert_eq!(client.records().unwrap()[0].metrics["count"], 7);
    }
}

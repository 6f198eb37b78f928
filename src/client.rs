//! Interface to the external performance-monitoring backend.
//!
//! perfstream never talks to a backend itself. Callers supply a
//! [`PerformanceClient`] through
//! [`PerformanceBuilder::with_client_loader`], and every measurement is
//! recorded through the [`TraceHandle`] the client hands out. Network
//! transmission of the collected metrics and attributes is entirely the
//! handle's business and happens when it is stopped.
//!
//! [`PerformanceBuilder::with_client_loader`]: crate::PerformanceBuilder::with_client_loader

/// A connection to the performance-monitoring backend.
///
/// Produced at most once per [`Performance`] instance by a one-time async
/// acquisition, then shared read-only by every trace. The enable/disable
/// setters are called at most once, right after acquisition, and only when
/// the corresponding configuration flag was explicitly set to `false`.
///
/// [`Performance`]: crate::Performance
pub trait PerformanceClient: Send + Sync {
    /// Creates a new, not yet started trace handle for `name`.
    fn new_trace(&self, name: &str) -> Box<dyn TraceHandle>;

    /// Enables or disables instrumentation-level trace collection.
    fn set_instrumentation_enabled(&self, enabled: bool);

    /// Enables or disables upload of collected data.
    fn set_data_collection_enabled(&self, enabled: bool);
}

/// One in-flight measurement: a named, timed window with attached numeric
/// metrics and string attributes.
///
/// A handle is exclusively owned by the trace stream that created it, which
/// is why every mutator takes `&mut self`. It is started at most once and
/// stopped at most once; perfstream guarantees that a handle which was never
/// started is never stopped.
pub trait TraceHandle: Send {
    /// Marks the start of the measurement window.
    fn start(&mut self);

    /// Marks the end of the measurement window and submits the collected
    /// data to the backend.
    fn stop(&mut self);

    /// Sets (overwriting) the metric `key` to `value`.
    fn set_metric(&mut self, key: &str, value: i64);

    /// Sets (overwriting) the attribute `key` to `value`.
    fn set_attribute(&mut self, key: &str, value: &str);

    /// Increments the metric `key` by `delta`.
    fn increment_metric(&mut self, key: &str, delta: i64);
}

/// A no-op client.
///
/// This is used when no client loader is configured. It is also useful for
/// testing purposes as it has minimal resource utilization and runtime
/// impact.
#[derive(Clone, Debug, Default)]
pub struct NoopClient {
    _private: (),
}

impl NoopClient {
    /// Create a new no-op client.
    pub fn new() -> Self {
        NoopClient { _private: () }
    }
}

impl PerformanceClient for NoopClient {
    /// Returns a new `NoopTraceHandle` instance.
    fn new_trace(&self, _name: &str) -> Box<dyn TraceHandle> {
        Box::new(NoopTraceHandle::new())
    }

    /// Ignores the flag.
    fn set_instrumentation_enabled(&self, _enabled: bool) {}

    /// Ignores the flag.
    fn set_data_collection_enabled(&self, _enabled: bool) {}
}

/// A no-op instance of a [`TraceHandle`].
#[derive(Debug, Default)]
pub struct NoopTraceHandle {
    _private: (),
}

impl NoopTraceHandle {
    /// Create a new no-op trace handle.
    pub fn new() -> Self {
        NoopTraceHandle { _private: () }
    }
}

impl TraceHandle for NoopTraceHandle {
    /// Ignores the start.
    fn start(&mut self) {}

    /// Ignores the stop.
    fn stop(&mut self) {}

    /// Ignores all metrics.
    fn set_metric(&mut self, _key: &str, _value: i64) {}

    /// Ignores all attributes.
    fn set_attribute(&mut self, _key: &str, _value: &str) {}

    /// Ignores all increments.
    fn increment_metric(&mut self, _key: &str, _delta: i64) {}
}

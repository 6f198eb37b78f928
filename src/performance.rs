use std::env;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use futures_core::Stream;
use futures_util::future::{self, FutureExt};
use futures_util::StreamExt;

use crate::client::{NoopClient, PerformanceClient};
use crate::error::PerfError;
use crate::factory::{TraceSpec, TraceStream};
use crate::options::TraceOptions;
use crate::perf_debug;
use crate::policy::TracedStreamExt;
use crate::provider::{noop_loader, ClientFuture, ClientProvider};
use crate::runtime::Runtime;

/// Environment variable overriding [`PerformanceBuilder::with_instrumentation_enabled`].
pub(crate) const PERFSTREAM_INSTRUMENTATION_ENABLED: &str = "PERFSTREAM_INSTRUMENTATION_ENABLED";
/// Environment variable overriding [`PerformanceBuilder::with_data_collection_enabled`].
pub(crate) const PERFSTREAM_DATA_COLLECTION_ENABLED: &str = "PERFSTREAM_DATA_COLLECTION_ENABLED";
/// Environment variable overriding [`PerformanceBuilder::with_auto_core_metrics`].
pub(crate) const PERFSTREAM_AUTO_TRACE: &str = "PERFSTREAM_AUTO_TRACE";

/// Trace name used by auto-instrumentation for the host's stability signal.
const STABILITY_TRACE_NAME: &str = "isStable";

/// Entry point for creating traces and attaching lifecycle operators.
///
/// A `Performance` owns the shared, lazily acquired client connection.
/// Build one per process at composition time and pass it (or a cheap clone)
/// wherever traces are created; all traces share the single client, while
/// every trace instance keeps its own exclusive handle.
#[derive(Clone)]
pub struct Performance {
    provider: ClientProvider,
}

impl Performance {
    /// Returns a builder with all flags at their defaults.
    pub fn builder() -> PerformanceBuilder {
        PerformanceBuilder::default()
    }

    /// Creates a stream that runs one trace instance for as long as it is
    /// held; see [`TraceStream`].
    pub fn create_trace(&self, name: impl Into<String>, options: TraceOptions) -> TraceStream {
        TraceSpec::new(name.into(), options).new_stream(&self.provider.resolve())
    }

    pub(crate) fn client_future(&self) -> ClientFuture {
        self.provider.resolve()
    }
}

impl fmt::Debug for Performance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Performance").finish_non_exhaustive()
    }
}

/// Configures and builds a [`Performance`].
///
/// Recognized flags, all defaulting to `true` and overridable through the
/// `PERFSTREAM_INSTRUMENTATION_ENABLED`, `PERFSTREAM_DATA_COLLECTION_ENABLED`
/// and `PERFSTREAM_AUTO_TRACE` environment variables:
///
/// * instrumentation enabled — when explicitly `false`, trace collection is
///   disabled on the client right after acquisition;
/// * data collection enabled — when explicitly `false`, data upload is
///   disabled on the client right after acquisition;
/// * auto core metrics — when `true` and a stability signal is supplied,
///   the time to the host application's first stable moment is traced
///   automatically.
pub struct PerformanceBuilder {
    client_loader: Option<futures_util::future::BoxFuture<'static, ClientResult>>,
    instrumentation_enabled: bool,
    data_collection_enabled: bool,
    auto_core_metrics: bool,
    stability: Option<Box<dyn FnOnce(Performance) + Send>>,
}

type ClientResult = Result<Arc<dyn PerformanceClient>, PerfError>;

impl Default for PerformanceBuilder {
    fn default() -> Self {
        PerformanceBuilder {
            client_loader: None,
            instrumentation_enabled: flag_from_env(PERFSTREAM_INSTRUMENTATION_ENABLED)
                .unwrap_or(true),
            data_collection_enabled: flag_from_env(PERFSTREAM_DATA_COLLECTION_ENABLED)
                .unwrap_or(true),
            auto_core_metrics: flag_from_env(PERFSTREAM_AUTO_TRACE).unwrap_or(true),
            stability: None,
        }
    }
}

impl PerformanceBuilder {
    /// Supplies the one-time async acquisition of the performance client.
    ///
    /// The future runs at most once, lazily, when the first trace stream is
    /// polled; its outcome is cached and replayed to every trace. Without a
    /// loader the built `Performance` records nothing ([`NoopClient`]).
    pub fn with_client_loader<F>(mut self, acquire: F) -> Self
    where
        F: Future<Output = ClientResult> + Send + 'static,
    {
        self.client_loader = Some(acquire.boxed());
        self
    }

    /// Explicitly enables or disables trace collection at the client level.
    pub fn with_instrumentation_enabled(mut self, enabled: bool) -> Self {
        self.instrumentation_enabled = enabled;
        self
    }

    /// Explicitly enables or disables data upload at the client level.
    pub fn with_data_collection_enabled(mut self, enabled: bool) -> Self {
        self.data_collection_enabled = enabled;
        self
    }

    /// Enables or disables automatic tracing of core host metrics.
    pub fn with_auto_core_metrics(mut self, enabled: bool) -> Self {
        self.auto_core_metrics = enabled;
        self
    }

    /// Supplies the host framework's "became stable" signal.
    ///
    /// Unless auto core metrics are disabled, building the `Performance`
    /// spawns a background subscription on `runtime` that waits for the
    /// signal's first `true` and measures the time from construction to
    /// that moment as a trace named `isStable`.
    pub fn with_stability_signal<S, R>(mut self, signal: S, runtime: R) -> Self
    where
        S: Stream<Item = bool> + Send + 'static,
        R: Runtime,
    {
        self.stability = Some(Box::new(move |perf: Performance| {
            let drain = signal
                .filter(|stable| future::ready(*stable))
                .take(1)
                .map(Ok::<bool, PerfError>)
                .trace_until_complete(&perf, STABILITY_TRACE_NAME, TraceOptions::default())
                .for_each(|_| future::ready(()));
            runtime.spawn(drain.boxed());
            perf_debug!(name: "Performance.AutoTraceInstalled", trace = STABILITY_TRACE_NAME);
        }));
        self
    }

    /// Builds the `Performance` and, when configured, installs
    /// auto-instrumentation.
    pub fn build(self) -> Performance {
        let loader = self
            .client_loader
            .unwrap_or_else(|| noop_loader(Arc::new(NoopClient::new())));
        let provider = ClientProvider::new(
            loader,
            self.instrumentation_enabled,
            self.data_collection_enabled,
        );
        let performance = Performance { provider };
        if self.auto_core_metrics {
            if let Some(install) = self.stability {
                install(performance.clone());
            }
        }
        performance
    }
}

impl fmt::Debug for PerformanceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerformanceBuilder")
            .field("instrumentation_enabled", &self.instrumentation_enabled)
            .field("data_collection_enabled", &self.data_collection_enabled)
            .field("auto_core_metrics", &self.auto_core_metrics)
            .field("stability", &self.stability.is_some())
            .finish_non_exhaustive()
    }
}

fn flag_from_env(var: &str) -> Option<bool> {
    env::var(var).ok().and_then(|v| bool::from_str(&v).ok())
}

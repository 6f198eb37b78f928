use std::fmt;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};

use crate::client::PerformanceClient;
use crate::error::PerfError;
use crate::{perf_info, perf_warn};

/// The shared, replayed result of the one-time client acquisition.
///
/// Cloning is cheap and every clone observes the same resolution: the
/// expensive handshake runs once, late subscribers get the cached value (or
/// the cached failure) without re-triggering it.
pub(crate) type ClientFuture =
    Shared<BoxFuture<'static, Result<Arc<dyn PerformanceClient>, PerfError>>>;

/// Resolves the long-lived performance client.
///
/// Wraps the caller-supplied acquisition future so that it runs at most
/// once, applies the configured enable/disable overrides on first
/// resolution, and replays the outcome to every subsequent caller.
/// Acquisition is lazy: nothing runs until the first trace stream is polled.
pub(crate) struct ClientProvider {
    client: ClientFuture,
}

impl ClientProvider {
    pub(crate) fn new(
        acquire: BoxFuture<'static, Result<Arc<dyn PerformanceClient>, PerfError>>,
        instrumentation_enabled: bool,
        data_collection_enabled: bool,
    ) -> Self {
        let client = async move {
            match acquire.await {
                Ok(client) => {
                    if !instrumentation_enabled {
                        client.set_instrumentation_enabled(false);
                    }
                    if !data_collection_enabled {
                        client.set_data_collection_enabled(false);
                    }
                    perf_info!(
                        name: "ClientProvider.Resolved",
                        instrumentation_enabled = instrumentation_enabled,
                        data_collection_enabled = data_collection_enabled
                    );
                    Ok(client)
                }
                Err(err) => {
                    perf_warn!(
                        name: "ClientProvider.AcquisitionFailed",
                        error = format!("{err}")
                    );
                    Err(err)
                }
            }
        }
        .boxed()
        .shared();

        ClientProvider { client }
    }

    /// Returns a handle on the (possibly still pending) resolved client.
    pub(crate) fn resolve(&self) -> ClientFuture {
        self.client.clone()
    }
}

impl Clone for ClientProvider {
    fn clone(&self) -> Self {
        ClientProvider {
            client: self.client.clone(),
        }
    }
}

impl fmt::Debug for ClientProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientProvider").finish_non_exhaustive()
    }
}

pub(crate) fn noop_loader(
    client: Arc<dyn PerformanceClient>,
) -> BoxFuture<'static, Result<Arc<dyn PerformanceClient>, PerfError>> {
    futures_util::future::ready(Ok(client)).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryClient;
    use futures_executor::block_on;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_loader(
        client: InMemoryClient,
        runs: Arc<AtomicUsize>,
    ) -> BoxFuture<'static, Result<Arc<dyn PerformanceClient>, PerfError>> {
        async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(client.as_client())
        }
        .boxed()
    }

    #[test]
    fn acquisition_runs_once_and_is_replayed() {
        let client = InMemoryClient::default();
        let runs = Arc::new(AtomicUsize::new(0));
        let provider = ClientProvider::new(counting_loader(client, runs.clone()), true, true);

        assert_eq!(runs.load(Ordering::SeqCst), 0, "acquisition must be lazy");
        block_on(provider.resolve()).unwrap();
        block_on(provider.resolve()).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn explicit_false_flags_are_applied_on_resolution() {
        let client = InMemoryClient::default();
        let provider = ClientProvider::new(
            noop_loader(client.as_client()),
            false,
            true,
        );
        block_on(provider.resolve()).unwrap();
        assert!(!client.instrumentation_enabled());
        assert!(client.data_collection_enabled());
    }

    #[test]
    fn default_true_flags_leave_client_untouched() {
        let client = InMemoryClient::default();
        let provider = ClientProvider::new(noop_loader(client.as_client()), true, true);
        block_on(provider.resolve()).unwrap();
        assert!(client.instrumentation_enabled());
        assert!(client.data_collection_enabled());
    }

    #[test]
    fn acquisition_failure_is_replayed_to_every_caller() {
        let provider = ClientProvider::new(
            futures_util::future::ready(Err(PerfError::ClientAcquisition("offline".into())))
                .boxed(),
            true,
            true,
        );
        let first = block_on(provider.resolve()).err();
        let second = block_on(provider.resolve()).err();
        assert_eq!(first, second);
        assert!(matches!(first, Some(PerfError::ClientAcquisition(_))));
    }
}

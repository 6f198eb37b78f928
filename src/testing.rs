//! In-memory test doubles for the performance backend.
//!
//! [`InMemoryClient`] stands in for a real [`PerformanceClient`] and records
//! every handle operation, so tests can assert on start/stop counts, final
//! metric and attribute values, and operation ordering without a backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::client::{PerformanceClient, TraceHandle};
use crate::error::PerfError;

/// Everything one trace handle was asked to do, in order.
#[derive(Clone, Debug, Default)]
pub struct TraceRecord {
    /// Trace name the handle was created for.
    pub name: String,
    /// Latest value per metric, overwrites and increments applied.
    pub metrics: HashMap<String, i64>,
    /// Latest value per attribute.
    pub attributes: HashMap<String, String>,
    /// Every operation in call order, e.g. `start`, `set_metric:items=3`.
    pub ops: Vec<String>,
}

impl TraceRecord {
    /// Number of `start` calls observed.
    pub fn start_count(&self) -> usize {
        self.ops.iter().filter(|op| *op == "start").count()
    }

    /// Number of `stop` calls observed.
    pub fn stop_count(&self) -> usize {
        self.ops.iter().filter(|op| *op == "stop").count()
    }
}

#[derive(Debug, Default)]
struct ClientState {
    records: Mutex<Vec<TraceRecord>>,
    instrumentation_enabled: Mutex<bool>,
    data_collection_enabled: Mutex<bool>,
}

/// An in-memory performance client that stores trace records in memory.
///
/// Useful for testing and debugging. Clones share state, so a test can keep
/// one clone and hand another to [`PerformanceBuilder::with_client_loader`].
///
/// # Example
///
/// ```
/// use futures_util::{future, StreamExt};
/// use perfstream::testing::InMemoryClient;
/// use perfstream::{Performance, TraceOptions};
///
/// let client = InMemoryClient::default();
/// let perf = Performance::builder()
///     .with_client_loader(future::ready(Ok(client.as_client())))
///     .build();
///
/// let mut trace = perf.create_trace("op", TraceOptions::default());
/// futures_executor::block_on(trace.next());
/// let records = client.records().unwrap();
/// assert_eq!(records[0].start_count(), 1);
/// ```
///
/// [`PerformanceBuilder::with_client_loader`]: crate::PerformanceBuilder::with_client_loader
#[derive(Clone, Debug)]
pub struct InMemoryClient {
    state: Arc<ClientState>,
}

impl Default for InMemoryClient {
    fn default() -> Self {
        InMemoryClient {
            state: Arc::new(ClientState {
                records: Mutex::new(Vec::new()),
                instrumentation_enabled: Mutex::new(true),
                data_collection_enabled: Mutex::new(true),
            }),
        }
    }
}

impl InMemoryClient {
    /// Returns this client as the trait object the builder expects.
    pub fn as_client(&self) -> Arc<dyn PerformanceClient> {
        Arc::new(self.clone())
    }

    /// Returns a snapshot of every record created so far, in creation
    /// order, including still-running traces.
    ///
    /// # Errors
    ///
    /// Returns a [`PerfError`] if the internal lock cannot be acquired.
    pub fn records(&self) -> Result<Vec<TraceRecord>, PerfError> {
        self.state
            .records
            .lock()
            .map(|records| records.clone())
            .map_err(|_| PerfError::Internal("InMemoryClient records lock poisoned".into()))
    }

    /// Clears the internal record storage.
    pub fn reset(&self) {
        let _ = self.state.records.lock().map(|mut records| records.clear());
    }

    /// Current instrumentation flag, as last set by the provider.
    pub fn instrumentation_enabled(&self) -> bool {
        self.state
            .instrumentation_enabled
            .lock()
            .map(|flag| *flag)
            .unwrap_or(false)
    }

    /// Current data collection flag, as last set by the provider.
    pub fn data_collection_enabled(&self) -> bool {
        self.state
            .data_collection_enabled
            .lock()
            .map(|flag| *flag)
            .unwrap_or(false)
    }
}

impl PerformanceClient for InMemoryClient {
    fn new_trace(&self, name: &str) -> Box<dyn TraceHandle> {
        let index = match self.state.records.lock() {
            Ok(mut records) => {
                records.push(TraceRecord {
                    name: name.to_owned(),
                    ..TraceRecord::default()
                });
                records.len() - 1
            }
            Err(_) => 0,
        };
        Box::new(InMemoryTraceHandle {
            state: self.state.clone(),
            index,
        })
    }

    fn set_instrumentation_enabled(&self, enabled: bool) {
        if let Ok(mut flag) = self.state.instrumentation_enabled.lock() {
            *flag = enabled;
        }
    }

    fn set_data_collection_enabled(&self, enabled: bool) {
        if let Ok(mut flag) = self.state.data_collection_enabled.lock() {
            *flag = enabled;
        }
    }
}

/// Handle returned by [`InMemoryClient::new_trace`]; appends every call to
/// its [`TraceRecord`].
#[derive(Debug)]
pub struct InMemoryTraceHandle {
    state: Arc<ClientState>,
    index: usize,
}

impl InMemoryTraceHandle {
    fn with_record(&mut self, f: impl FnOnce(&mut TraceRecord)) {
        if let Ok(mut records) = self.state.records.lock() {
            if let Some(record) = records.get_mut(self.index) {
                f(record);
            }
        }
    }
}

impl TraceHandle for InMemoryTraceHandle {
    fn start(&mut self) {
        self.with_record(|record| record.ops.push("start".into()));
    }

    fn stop(&mut self) {
        self.with_record(|record| record.ops.push("stop".into()));
    }

    fn set_metric(&mut self, key: &str, value: i64) {
        self.with_record(|record| {
            record.metrics.insert(key.to_owned(), value);
            record.ops.push(format!("set_metric:{key}={value}"));
        });
    }

    fn set_attribute(&mut self, key: &str, value: &str) {
        self.with_record(|record| {
            record.attributes.insert(key.to_owned(), value.to_owned());
            record.ops.push(format!("set_attribute:{key}={value}"));
        });
    }

    fn increment_metric(&mut self, key: &str, delta: i64) {
        self.with_record(|record| {
            let metric = record.metrics.entry(key.to_owned()).or_insert(0);
            *metric += delta;
            record.ops.push(format!("increment_metric:{key}={delta}"));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_recorded_traces() {
        let client = InMemoryClient::default();
        let mut handle = client.new_trace("op");
        handle.start();
        handle.stop();
        assert_eq!(client.records().unwrap().len(), 1);

        client.reset();
        assert!(client.records().unwrap().is_empty());

        // Recording continues after a reset.
        let mut handle = client.new_trace("next");
        handle.start();
        let records = client.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "next");
        assert_eq!(records[0].start_count(), 1);
    }
}

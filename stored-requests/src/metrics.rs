//! Reporting of cache effectiveness and backend latency.
//!
//! The crate only reports through the [`MetricsEngine`] trait; exporting the values
//! (Prometheus, StatsD, ...) is the embedding server's concern.

use core::fmt;
use std::time::Duration;

use crate::fetcher::DataType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheResult {
    Hit,
    Miss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchType {
    /// A load of every stored object, at startup.
    All,
    /// A load of the objects changed since the last poll.
    Delta,
    /// A fetch of specific IDs on the request path.
    Ids,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoredDataError {
    Network,
    Undefined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoredDataLabels {
    pub data_type: DataType,
    pub fetch_type: FetchType,
}

pub trait MetricsEngine: fmt::Debug + Send + Sync {
    fn record_cache_result(&self, data_type: DataType, result: CacheResult, count: usize);

    fn record_stored_data_fetch_time(&self, labels: StoredDataLabels, elapsed: Duration);

    fn record_stored_data_error(&self, labels: StoredDataLabels, error: StoredDataError);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsEngine for NoopMetrics {
    fn record_cache_result(&self, _data_type: DataType, _result: CacheResult, _count: usize) {}

    fn record_stored_data_fetch_time(&self, _labels: StoredDataLabels, _elapsed: Duration) {}

    fn record_stored_data_error(&self, _labels: StoredDataLabels, _error: StoredDataError) {}
}

/// Emits every measurement as a `trace` level event under the `stored_requests::metrics`
/// target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl MetricsEngine for TracingMetrics {
    fn record_cache_result(&self, data_type: DataType, result: CacheResult, count: usize) {
        if count > 0 {
            tracing::trace!(target: "stored_requests::metrics", %data_type, ?result, count, "cache result");
        }
    }

    fn record_stored_data_fetch_time(&self, labels: StoredDataLabels, elapsed: Duration) {
        tracing::trace!(
            target: "stored_requests::metrics",
            data_type = %labels.data_type,
            fetch_type = ?labels.fetch_type,
            elapsed_ms = elapsed.as_millis() as u64,
            "stored data fetch time"
        );
    }

    fn record_stored_data_error(&self, labels: StoredDataLabels, error: StoredDataError) {
        tracing::trace!(
            target: "stored_requests::metrics",
            data_type = %labels.data_type,
            fetch_type = ?labels.fetch_type,
            ?error,
            "stored data error"
        );
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Accumulates everything it's told, for assertions.
    #[derive(Debug, Default)]
    pub struct RecordingMetrics {
        cache: Mutex<Vec<(DataType, CacheResult, usize)>>,
        fetch_times: Mutex<Vec<StoredDataLabels>>,
        errors: Mutex<Vec<(StoredDataLabels, StoredDataError)>>,
    }

    #[allow(clippy::expect_used)] // this implementation is intended for tests only
    impl RecordingMetrics {
        pub fn cache_results(&self) -> Vec<(DataType, CacheResult, usize)> {
            self.cache.lock().expect("poison lock").clone()
        }

        pub fn fetch_times(&self) -> Vec<StoredDataLabels> {
            self.fetch_times.lock().expect("poison lock").clone()
        }

        pub fn errors(&self) -> Vec<(StoredDataLabels, StoredDataError)> {
            self.errors.lock().expect("poison lock").clone()
        }
    }

    #[allow(clippy::expect_used)]
    impl MetricsEngine for RecordingMetrics {
        fn record_cache_result(&self, data_type: DataType, result: CacheResult, count: usize) {
            self.cache.lock().expect("poison lock").push((data_type, result, count));
        }

        fn record_stored_data_fetch_time(&self, labels: StoredDataLabels, _elapsed: Duration) {
            self.fetch_times.lock().expect("poison lock").push(labels);
        }

        fn record_stored_data_error(&self, labels: StoredDataLabels, error: StoredDataError) {
            self.errors.lock().expect("poison lock").push((labels, error));
        }
    }
}

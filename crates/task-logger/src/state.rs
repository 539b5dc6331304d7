//! Application state

use std::path::Path;
use std::sync::Arc;

use relay_core::stream::EventStream;

use crate::config::LoggerConfig;
use crate::correlator::CorrelatorMetrics;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: LoggerConfig,
    stream: Arc<dyn EventStream>,
    metrics: Arc<CorrelatorMetrics>,
}

impl AppState {
    pub fn new(
        config: LoggerConfig,
        stream: Arc<dyn EventStream>,
        metrics: Arc<CorrelatorMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                stream,
                metrics,
            }),
        }
    }

    pub fn config(&self) -> &LoggerConfig {
        &self.inner.config
    }

    pub fn logs_dir(&self) -> &Path {
        &self.inner.config.logs_dir
    }

    pub fn stream(&self) -> &Arc<dyn EventStream> {
        &self.inner.stream
    }

    pub fn metrics(&self) -> &CorrelatorMetrics {
        &self.inner.metrics
    }
}

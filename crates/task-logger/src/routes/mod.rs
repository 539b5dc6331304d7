//! Route handlers

use axum::{http::StatusCode, Json};
use serde::Serialize;

pub mod health;
pub mod logs;
pub mod metrics;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub type RouteError = (StatusCode, Json<ErrorResponse>);

pub(crate) fn route_error(status: StatusCode, error: impl Into<String>) -> RouteError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use relay_core::stream::MemoryEventStream;
    use tempfile::TempDir;

    use crate::config::LoggerConfig;
    use crate::correlator::Correlator;
    use crate::state::AppState;

    pub(crate) struct Harness {
        pub stream: Arc<MemoryEventStream>,
        pub correlator: Correlator,
        pub state: AppState,
        pub temp_dir: TempDir,
    }

    pub(crate) async fn harness() -> Harness {
        let temp_dir = TempDir::new().unwrap();
        let config = LoggerConfig {
            logs_dir: temp_dir.path().join("logs"),
            read_block: Duration::from_millis(10),
            ..Default::default()
        };
        let stream = Arc::new(MemoryEventStream::new());
        let mut correlator = Correlator::new(config.clone(), stream.clone());
        correlator.start().await.unwrap();
        let state = AppState::new(config, stream.clone(), correlator.metrics());
        Harness {
            stream,
            correlator,
            state,
            temp_dir,
        }
    }
}

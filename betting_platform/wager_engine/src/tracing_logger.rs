//! Logging with tracing and correlation IDs

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::error::EngineError;

/// Correlation ID carried through every engine call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(id: String) -> Self {
        Self(id)
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `default_level`.
/// Returns false if a subscriber was already installed.
pub fn init_subscriber(default_level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .is_ok();

    if installed {
        info!("Tracing logger initialized");
    }
    installed
}

/// Times one engine operation and logs the result on `finish`
#[derive(Debug)]
pub struct OperationTimer {
    operation: &'static str,
    correlation_id: CorrelationId,
    start: Instant,
}

/// Anything above this is logged as slow
const SLOW_OPERATION: Duration = Duration::from_millis(500);

impl OperationTimer {
    pub fn start(operation: &'static str) -> Self {
        let correlation_id = CorrelationId::new();
        debug!(operation, correlation_id = %correlation_id, "Operation started");
        Self {
            operation,
            correlation_id,
            start: Instant::now(),
        }
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Log completion and hand the result back
    pub fn finish<T>(self, result: Result<T, EngineError>) -> Result<T, EngineError> {
        let duration = self.elapsed();
        match &result {
            Ok(_) if duration > SLOW_OPERATION => {
                warn!(
                    operation = self.operation,
                    correlation_id = %self.correlation_id,
                    duration_ms = duration.as_millis() as u64,
                    "Slow operation"
                );
            }
            Ok(_) => {
                debug!(
                    operation = self.operation,
                    correlation_id = %self.correlation_id,
                    duration_ms = duration.as_millis() as u64,
                    "Operation completed"
                );
            }
            Err(e) => {
                info!(
                    operation = self.operation,
                    correlation_id = %self.correlation_id,
                    duration_ms = duration.as_millis() as u64,
                    error_id = %e.context.error_id,
                    kind = e.kind.code(),
                    "Operation failed: {}", e.message
                );
            }
        }
        result
    }
}

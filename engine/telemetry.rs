//! Telemetry handle shared across engine components.

use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use tokio::runtime::{Handle, Runtime};

/// Builder for [`EngineTelemetry`].
pub struct EngineTelemetryBuilder {
    component: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl EngineTelemetryBuilder {
    /// Creates the builder for the named component.
    #[must_use]
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            log_path: None,
            min_level: LogLevel::Debug,
            event_publisher: None,
        }
    }

    /// Sets the JSONL log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Drops log records below the given level.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<EngineTelemetry> {
        EngineTelemetry::new(
            self.component,
            self.log_path,
            self.min_level,
            self.event_publisher,
        )
    }
}

/// Cheap-to-clone telemetry handle combining structured logs and bus events.
#[derive(Clone)]
pub struct EngineTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for EngineTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineTelemetry")
            .field("component", &self.inner.component)
            .finish_non_exhaustive()
    }
}

struct TelemetryInner {
    component: String,
    logger: Option<JsonLogger>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl EngineTelemetry {
    fn new(
        component: String,
        log_path: Option<PathBuf>,
        min_level: LogLevel,
        publisher: Option<Arc<dyn EventPublisher>>,
    ) -> Result<Self> {
        let logger = match log_path {
            Some(path) => Some(JsonLogger::with_min_level(path, min_level)?),
            None => None,
        };
        Ok(Self {
            inner: Arc::new(TelemetryInner {
                component,
                logger,
                publisher,
            }),
        })
    }

    /// Returns a builder for the named component.
    #[must_use]
    pub fn builder(component: impl Into<String>) -> EngineTelemetryBuilder {
        EngineTelemetryBuilder::new(component)
    }

    /// Derives a handle for a sub-component sharing the same sinks.
    #[must_use]
    pub fn scoped(&self, component: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                component: component.into(),
                logger: None,
                publisher: self.inner.publisher.clone(),
            }),
        }
    }

    /// Writes a structured log record.
    pub fn log(&self, level: LogLevel, message: &str, fields: Value) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            let record =
                LogRecord::new(&self.inner.component, level, message).with_fields(fields);
            logger.log(&record)?;
        }
        Ok(())
    }

    /// Emits an event on the bus. Spawns on the ambient runtime when inside
    /// one, otherwise blocks on a throwaway runtime.
    pub fn event(&self, kind: &str, payload: Value) -> Result<()> {
        let Some(publisher) = &self.inner.publisher else {
            return Ok(());
        };
        let record = EventRecord::new(&self.inner.component, kind).with_payload(payload);
        if Handle::try_current().is_ok() {
            let publisher = Arc::clone(publisher);
            tokio::spawn(async move {
                if let Err(err) = publisher.publish(record).await {
                    eprintln!("telemetry event publish failed: {err:?}");
                }
            });
            Ok(())
        } else {
            Runtime::new()?.block_on(publisher.publish(record))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_event_bus::MemoryEventBus;
    use tempfile::tempdir;

    #[test]
    fn telemetry_writes_log_and_event() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("engine.log");
        let bus = Arc::new(MemoryEventBus::new(16));
        let telemetry = EngineTelemetry::builder("scheduler")
            .log_path(&path)
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        telemetry
            .log(LogLevel::Info, "scheduler.pass.completed", json!({ "ready": 2 }))
            .unwrap();
        telemetry
            .event("scheduler.pass.completed", json!({ "dispatched": 2 }))
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("scheduler.pass.completed"));
        assert_eq!(bus.snapshot().len(), 1);
    }

    #[test]
    fn scoped_handle_shares_publisher() {
        let bus = Arc::new(MemoryEventBus::new(16));
        let telemetry = EngineTelemetry::builder("engine")
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        let scoped = telemetry.scoped("engine.feedback");
        scoped.event("feedback.cycle.completed", json!({})).unwrap();
        assert_eq!(bus.snapshot()[0].source, "engine.feedback");
    }
}

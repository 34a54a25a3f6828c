//! Log capture for asserting on emitted records.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

#[derive(Debug, Clone)]
pub struct Record {
    pub level: Level,
    pub critical: bool,
    pub message: String,
}

#[derive(Clone, Default)]
pub struct CapturedLogs {
    records: Arc<Mutex<Vec<Record>>>,
}

impl CapturedLogs {
    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.records()
            .into_iter()
            .filter(|r| r.level == Level::WARN)
            .map(|r| r.message)
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.records()
            .into_iter()
            .filter(|r| r.level == Level::ERROR && !r.critical)
            .map(|r| r.message)
            .collect()
    }

    pub fn criticals(&self) -> Vec<String> {
        self.records()
            .into_iter()
            .filter(|r| r.critical)
            .map(|r| r.message)
            .collect()
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: String,
    critical: bool,
}

impl Visit for RecordVisitor {
    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == "critical" {
            self.critical = value;
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }
}

impl<S: Subscriber> Layer<S> for CapturedLogs {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        // INFO and below are noise for these assertions
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }
        self.records.lock().push(Record {
            level,
            critical: visitor.critical,
            message: visitor.message,
        });
    }
}

/// Capture WARN and above on the current thread until the guard drops
pub fn capture_logs() -> (CapturedLogs, DefaultGuard) {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::registry().with(logs.clone());
    let guard = tracing::subscriber::set_default(subscriber);
    (logs, guard)
}

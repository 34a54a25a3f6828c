/// Log at the highest severity. `tracing` has no level above ERROR, so the
/// record is an ERROR event flagged with `critical = true`.
macro_rules! critical {
    ($($arg:tt)+) => {
        tracing::error!(critical = true, $($arg)+)
    };
}

pub mod config;
pub mod control;
pub mod delayed_delivery;
pub mod dispatch;
pub mod eager;
pub mod executor;
pub mod handler;
pub mod retry;
pub mod revoked;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{BrokerUrls, ConfigError, WorkerConfig};
pub use control::{ControlAction, ControlCommand};
pub use delayed_delivery::DelayedDelivery;
pub use dispatch::Dispatcher;
pub use eager::{EagerResult, EagerRunner};
pub use executor::TaskExecutor;
pub use handler::{AttemptContext, FnHandler, Outcome, RetryRequest, TaskHandler, TaskHandlerRegistry};
pub use retry::{Disposition, ErrorClassifier, KindClassifier, RetryController};
pub use revoked::{Clock, MonotonicClock, RevocationRegistry};
pub use worker::{SystemClock, WallClock, Worker};

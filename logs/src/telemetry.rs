use std::panic;
use std::path::PathBuf;

use tracing::{subscriber::set_global_default, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

/// Where and under which name the node writes its rolling log files.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub log_dir: PathBuf,
    pub file_name: String,
    /// Filter used when `RUST_LOG` is not set.
    pub default_filter: String,
}

impl TelemetryConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        let service_name = service_name.into();
        Self {
            log_dir: PathBuf::from(".logs"),
            file_name: format!("{service_name}.log"),
            default_filter: "info".to_owned(),
            service_name,
        }
    }

    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = log_dir.into();
        self
    }
}

/// Builds the bunyan-formatted hourly-rolling file subscriber. The returned
/// guard must stay alive for the buffered writer to keep flushing.
pub fn get_subscriber(config: TelemetryConfig) -> (impl Subscriber + Send + Sync, WorkerGuard) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_filter));
    let file_appender = tracing_appender::rolling::hourly(config.log_dir, config.file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = BunyanFormattingLayer::new(config.service_name, non_blocking);
    let subscriber = Registry::default()
        .with(env_filter)
        .with(JsonStorageLayer)
        .with(file_layer);
    (subscriber, guard)
}

/// Register a subscriber as global default to process span data.
///
/// It should only be called once!
pub fn init_subscriber(subscriber: impl Subscriber + Send + Sync) {
    // Redirect all `log`'s events to our subscriber
    LogTracer::init().expect("Failed to set logger");
    set_global_default(subscriber).expect("Failed to set subscriber");
}

/// Routes panics into the log stream so a dying writer or repair task
/// leaves a trace in the node's own logs.
pub fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = payload
            .downcast_ref::<String>()
            .map(String::as_str)
            .or_else(|| payload.downcast_ref::<&str>().copied())
            .unwrap_or("unknown panic payload");
        let location = panic_info
            .location()
            .unwrap_or_else(|| panic::Location::caller());
        super::error!(
            "Panic at {}:{}: {}",
            location.file(),
            location.line(),
            message
        );
    }));
}

#[cfg(test)]
mod tests {
    use super::TelemetryConfig;

    #[test]
    fn config_derives_file_name_from_service() {
        let config = TelemetryConfig::new("blobnest").with_log_dir("/var/log/blobnest");
        assert_eq!(config.file_name, "blobnest.log");
        assert_eq!(config.log_dir.to_str(), Some("/var/log/blobnest"));
        assert_eq!(config.default_filter, "info");
    }
}

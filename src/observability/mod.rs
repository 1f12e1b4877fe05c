// Logging configuration
pub mod config;

// Cache counters and Prometheus export
pub mod metrics;

// Subscriber setup
pub mod logging;

pub use self::config::{LogConfig, LogFormat};
pub use self::logging::init_logging;
pub use self::metrics::{install_prometheus_exporter, LookupOutcome, StoreOperation};

pub use tracing::{debug, error, info, instrument, trace, warn};

mod telemetry;

pub use telemetry::{get_subscriber, init_subscriber, set_panic_hook, TelemetryConfig};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Output shape of the process-wide subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Line-oriented output for terminals.
    Text,
    /// JSON events for log shippers.
    Json,
}

impl LogFormat {
    /// Resolve the format from the environment (`AGNOX_LOG_JSON=1`).
    pub fn from_env() -> Self {
        match std::env::var("AGNOX_LOG_JSON") {
            Ok(v) if v == "1" || v.eq_ignore_ascii_case("true") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Install the process-wide tracing subscriber.
///
/// Filter precedence: `RUST_LOG` when set, otherwise `default_directives`
/// (e.g. `"info"` or `"ax_bridge=debug,info"`). Installation is
/// first-wins — repeated calls (tests, embedded use) are no-ops, and only
/// the call that actually installed the subscriber announces itself.
pub fn init(service: &str, default_directives: &str, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));

    let installed = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
            .is_ok(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
            .is_ok(),
    };

    if installed {
        tracing::info!(service, format = ?format, "tracing subscriber installed");
    }
}

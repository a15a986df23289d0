use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod open_telemetry;
use open_telemetry::init_otel_layer;

pub const OTLP_ENDPOINT_ENV: &str = "OPENTELEMETRY_OTLP_GRPC_ENDPOINT";

pub struct TracingConfig {
    /// reported as `service.name` on exported spans
    pub service_name: &'static str,
    /// used when `RUST_LOG` is not set
    pub default_filter: String,
    pub otlp_endpoint: Option<String>,
}

impl TracingConfig {
    pub fn new(service_name: &'static str, default_filter: impl Into<String>) -> Self {
        Self {
            service_name,
            default_filter: default_filter.into(),
            otlp_endpoint: std::env::var(OTLP_ENDPOINT_ENV)
                .ok()
                .filter(|v| !v.is_empty()),
        }
    }
}

fn init_env_layer(default_filter: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter))
}

/// Install the global subscriber: env filter, stdout formatter and, when an
/// OTLP endpoint is configured, span export.
///
/// Should be called after `.env` has been loaded so `RUST_LOG` from it applies.
/// A second call is reported on stderr and otherwise ignored.
pub fn init_tracing_to_stdout(config: &TracingConfig) {
    let env_layer = init_env_layer(&config.default_filter);

    let stdout_layer = tracing_subscriber::fmt::layer().with_ansi(true);

    let telemetry_layer = config
        .otlp_endpoint
        .as_deref()
        .and_then(|endpoint| init_otel_layer(config.service_name, endpoint));

    if let Err(e) = tracing_subscriber::registry()
        .with(env_layer)
        .with(stdout_layer)
        .with(telemetry_layer)
        .try_init()
    {
        eprintln!("tracing already initialized: {}", e);
    }
}

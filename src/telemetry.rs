//! Logging and OpenTelemetry tracing setup
//!
//! Logs go to stdout, as JSON when `LOG_FORMAT=json`. When
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set, spans are also exported over OTLP
//! with a batch processor on the Tokio runtime.

use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    runtime,
    trace::{self, Tracer},
    Resource,
};
use tracing::{info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{Error, Result};

pub const SERVICE_NAME: &str = "elassandra-operator";

const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub json_logs: bool,
    pub otlp_endpoint: Option<String>,
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        Self {
            json_logs: std::env::var(LOG_FORMAT_ENV)
                .map(|format| format.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
            otlp_endpoint: std::env::var(OTLP_ENDPOINT_ENV)
                .ok()
                .filter(|endpoint| !endpoint.is_empty()),
        }
    }
}

/// Install the global subscriber: env filter (default `info`), fmt layer, optional OTLP layer
pub fn init_tracing(config: &TelemetryConfig) -> Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let (text_layer, json_layer) = if config.json_logs {
        (None, Some(fmt::layer().json().with_target(true)))
    } else {
        (Some(fmt::layer().with_target(true)), None)
    };

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => Some(tracing_opentelemetry::layer().with_tracer(otlp_tracer(endpoint)?)),
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(text_layer)
        .with(json_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| Error::ConfigError(format!("Failed to install tracing subscriber: {e}")))?;

    match &config.otlp_endpoint {
        Some(endpoint) => info!(endpoint = %endpoint, "OpenTelemetry tracing initialized"),
        None => info!("OpenTelemetry tracing disabled ({} not set)", OTLP_ENDPOINT_ENV),
    }
    Ok(())
}

fn otlp_tracer(endpoint: &str) -> Result<Tracer> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(trace::config().with_resource(Resource::new(vec![
            KeyValue::new("service.name", SERVICE_NAME),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])))
        .install_batch(runtime::Tokio)
        .map_err(|e| Error::ConfigError(format!("Failed to install OTLP exporter: {e}")))
}

/// Flush pending spans
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

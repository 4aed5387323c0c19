//! Logging and OpenTelemetry tracing
//!
//! Every turn runs inside a `turn` span with `llm_call` and `code_execution`
//! children, all carrying the turn's `trace_id`. Console output goes through a
//! fmt layer; when an OTLP endpoint is configured the same spans are exported
//! to a collector.
//!
//! # Architecture
//!
//! ```text
//! codebox-interpreter → fmt layer (stderr)
//!                     → OTLP (gRPC) → OTel Collector → Tempo / Jaeger
//! ```

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_FILTER: &str = "info,codebox_interpreter=debug";

/// Initialize the tracing subsystem
///
/// This sets up:
/// - Console logging to stderr, filtered by `RUST_LOG` (or `default_filter`)
/// - OpenTelemetry trace export when `otlp_endpoint` is given
///
/// # Arguments
/// * `service_name` - Name for the service in traces
/// * `otlp_endpoint` - Optional OTLP endpoint URL (e.g., "http://localhost:4317")
/// * `default_filter` - Filter directives used when `RUST_LOG` is unset
///
/// # Example
/// ```ignore
/// init_tracing("codebox-interpreter", None, DEFAULT_FILTER)?;
/// ```
pub fn init_tracing(
    service_name: &str,
    otlp_endpoint: Option<&str>,
    default_filter: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let otel_layer = match otlp_endpoint {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint);

            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(exporter)
                .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(vec![
                    KeyValue::new("service.name", service_name.to_string()),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])))
                .install_batch(runtime::Tokio)?;

            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()?;

    if let Some(endpoint) = otlp_endpoint {
        tracing::info!(service = service_name, endpoint, "OpenTelemetry tracing initialized");
    }
    Ok(())
}

/// Shutdown the tracing subsystem gracefully
///
/// Flushes any pending spans to the collector
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
}

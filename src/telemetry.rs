//! Logging and trace export for the command line tool.
//!
//! Logs are written to stderr so rows printed on stdout can be piped.
//! Spans are also exported over OTLP when `OTEL_EXPORTER_OTLP_ENDPOINT`
//! is set.

use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use std::sync::OnceLock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Install the global subscriber.
///
/// # Environment Variables
/// - `RUST_LOG`: filter directives, overriding `default_level`
/// - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint URL (enables export when set)
/// - `OTEL_SERVICE_NAME`: service name on exported spans (default: "bqt")
/// - `BQT_TRACE_INCLUDE_SQL`: record query text on spans (default: "true")
pub fn init_telemetry(default_level: tracing::Level) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_str().to_lowercase()));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(default_level >= tracing::Level::DEBUG)
        .with_writer(std::io::stderr);

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();
    let otel_layer = match &endpoint {
        Some(endpoint) => {
            opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
            let provider = otlp_provider(endpoint)?;
            let tracer = provider.tracer("bqt");
            let _ = TRACER_PROVIDER.set(provider);
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()?;

    if let Some(endpoint) = endpoint {
        tracing::debug!(endpoint = %endpoint, "Exporting spans over OTLP");
    }
    Ok(())
}

fn otlp_provider(endpoint: &str) -> anyhow::Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    let service_name = std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "bqt".to_string());
    Ok(SdkTracerProvider::builder()
        .with_resource(Resource::builder().with_service_name(service_name).build())
        .with_batch_exporter(exporter)
        .build())
}

/// Flush spans still buffered by the batch exporter.
pub fn shutdown_telemetry() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Error shutting down tracer provider: {:?}", e);
        }
    }
}

/// Whether query text should be recorded on spans.
pub fn include_sql_in_traces() -> bool {
    std::env::var("BQT_TRACE_INCLUDE_SQL")
        .map(|v| v != "false" && v != "0")
        .unwrap_or(true)
}

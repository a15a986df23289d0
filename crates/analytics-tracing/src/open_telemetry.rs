use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing_opentelemetry::OpenTelemetryLayer;

/// OTLP/gRPC span exporter. `None` when the pipeline cannot be built, the
/// service then keeps logging locally.
pub(crate) fn init_otel_layer<S>(
    service_name: &'static str,
    endpoint: &str,
) -> Option<OpenTelemetryLayer<S, sdktrace::Tracer>>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    let otlp_exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint);

    let otlp_config = sdktrace::config().with_resource(Resource::new(vec![
        opentelemetry::KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            service_name,
        ),
    ]));

    match opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(otlp_exporter)
        .with_trace_config(otlp_config)
        .install_batch(runtime::Tokio)
    {
        Ok(tracer) => Some(tracing_opentelemetry::layer::<S>().with_tracer(tracer)),
        Err(e) => {
            eprintln!(
                "Failed to create OpenTelemetry tracer with otlp exporter for {}: {}",
                endpoint, e
            );
            None
        }
    }
}

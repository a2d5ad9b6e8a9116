//! Logging and tracing setup

use std::env;

use opentelemetry::KeyValue;
use opentelemetry::trace::{TraceContextExt as _, TraceId, TracerProvider as _};
use opentelemetry_otlp::SpanExporter;
use opentelemetry_resource_detectors::{K8sResourceDetector, ProcessResourceDetector};
use opentelemetry_sdk::{
    Resource,
    trace::{SdkTracer, SdkTracerProvider},
};
use tracing::Subscriber;
use tracing_opentelemetry::{OpenTelemetryLayer, OpenTelemetrySpanExt as _};
use tracing_subscriber::{
    EnvFilter, Layer, Registry, layer::SubscriberExt, registry::LookupSpan,
    util::SubscriberInitExt,
};

/// Trace id of the current span, `TraceId::INVALID` without an exporter
pub fn get_trace_id() -> TraceId {
    tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
}

fn resource() -> Resource {
    Resource::builder()
        .with_detector(Box::new(K8sResourceDetector))
        .with_detector(Box::new(ProcessResourceDetector))
        .with_service_name(env!("CARGO_PKG_NAME"))
        .with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
        .build()
}

fn init_tracer() -> anyhow::Result<SdkTracer> {
    let exporter = SpanExporter::builder().with_tonic().build()?;

    let provider = SdkTracerProvider::builder()
        .with_resource(resource())
        .with_batch_exporter(exporter)
        .build();

    Ok(provider.tracer("csrgate"))
}

fn is_otel_enabled() -> bool {
    env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok()
}

fn is_json() -> bool {
    env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"))
}

fn logger<S>() -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    if is_json() {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    }
}

/// Installs the global subscriber.
///
/// `LOG_LEVEL` holds the filter directives, `LOG_FORMAT=json` switches to
/// JSON lines and `OTEL_EXPORTER_OTLP_ENDPOINT` enables span export.
///
/// # Errors
///
/// Will return `Err` if a subscriber is already installed or the exporter
/// cannot be built
pub fn init() -> anyhow::Result<()> {
    let reg = Registry::default()
        .with(EnvFilter::from_env("LOG_LEVEL"))
        .with(logger());

    if is_otel_enabled() {
        reg.with(OpenTelemetryLayer::new(init_tracer()?)).try_init()?;
    } else {
        reg.try_init()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_is_case_insensitive() {
        temp_env::with_var("LOG_FORMAT", Some("JSON"), || assert!(is_json()));
        temp_env::with_var("LOG_FORMAT", Some("text"), || assert!(!is_json()));
        temp_env::with_var_unset("LOG_FORMAT", || assert!(!is_json()));
    }

    #[test]
    fn otel_follows_the_endpoint() {
        temp_env::with_var("OTEL_EXPORTER_OTLP_ENDPOINT", Some("http://collector:4317"), || {
            assert!(is_otel_enabled());
        });
        temp_env::with_var_unset("OTEL_EXPORTER_OTLP_ENDPOINT", || {
            assert!(!is_otel_enabled());
        });
    }

    #[test]
    fn no_trace_without_a_span() {
        assert_eq!(get_trace_id(), TraceId::INVALID);
    }
}

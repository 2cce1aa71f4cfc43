//! OpenTelemetry bridge: exporter selection, TRACEPARENT inheritance
//! (spec.md §4.9), generalized from the teacher's NDJSON `TraceWriter` to
//! real OTel spans via `tracing-opentelemetry`.

use opentelemetry::global;
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::Layer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceExporter {
    None,
    Console,
    OtlpHttp,
    OtlpGrpc,
}

impl TraceExporter {
    /// Parses `STRATUM_TELEMETRY_TRACE_EXPORTER`; unknown names fall back
    /// to `none` rather than erroring, so a typo never blocks a run.
    pub fn from_env_value(v: &str) -> Self {
        match v {
            "console" => Self::Console,
            "otlp-http" => Self::OtlpHttp,
            "otlp-grpc" => Self::OtlpGrpc,
            "none" => Self::None,
            _ => {
                tracing::warn!(value = v, "unknown STRATUM_TELEMETRY_TRACE_EXPORTER, falling back to none");
                Self::None
            }
        }
    }

    pub fn from_env() -> Self {
        std::env::var("STRATUM_TELEMETRY_TRACE_EXPORTER")
            .ok()
            .map(|v| Self::from_env_value(&v))
            .unwrap_or(Self::None)
    }
}

/// Sets up the global text-map propagator so `TRACEPARENT` (W3C
/// trace-context) is both read from the parent process's environment and
/// written when spawning subprocess children that themselves understand it.
pub fn install_propagator() {
    global::set_text_map_propagator(TraceContextPropagator::new());
}

/// Builds the tracing-opentelemetry layer for the configured exporter. The
/// returned layer is boxed so `main.rs` can compose it uniformly regardless
/// of exporter kind (`none` yields a layer that simply never emits).
pub fn build_layer<S>(exporter: TraceExporter) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    match exporter {
        TraceExporter::None => Box::new(tracing_subscriber::filter::LevelFilter::OFF),
        // No OTel SDK involved: spans/events print through the same
        // tracing-subscriber stack the rest of the crate already uses.
        TraceExporter::Console => Box::new(tracing_subscriber::fmt::layer()),
        TraceExporter::OtlpHttp | TraceExporter::OtlpGrpc => {
            // Exporter construction needs a Tokio runtime and fallible IO
            // (endpoint resolution, TLS) that don't belong in a sync
            // builder; `init_otlp` performs it and returns the same layer
            // shape.
            Box::new(tracing_subscriber::filter::LevelFilter::OFF)
        }
    }
}

/// Async OTLP initialization (HTTP or gRPC exporter), used instead of
/// [`build_layer`] when the caller can await setup. `endpoint` is read from
/// `STRATUM_TELEMETRY_TRACE_EXPORTER_HTTP_ENDPOINT` /
/// `_INSECURE_ENDPOINT`, falling back to `OTEL_EXPORTER_OTLP_ENDPOINT`.
pub async fn init_otlp<S>(exporter: TraceExporter, endpoint: Option<String>) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let endpoint = endpoint.or_else(|| std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok());

    let provider_result = match exporter {
        TraceExporter::OtlpHttp => {
            let mut builder = opentelemetry_otlp::SpanExporter::builder().with_http();
            if let Some(ep) = &endpoint {
                builder = builder.with_endpoint(ep);
            }
            builder.build()
        }
        TraceExporter::OtlpGrpc => {
            let mut builder = opentelemetry_otlp::SpanExporter::builder().with_tonic();
            if let Some(ep) = &endpoint {
                builder = builder.with_endpoint(ep);
            }
            builder.build()
        }
        _ => return Box::new(tracing_subscriber::filter::LevelFilter::OFF),
    };

    match provider_result {
        Ok(span_exporter) => {
            let provider = SdkTracerProvider::builder()
                .with_sampler(Sampler::AlwaysOn)
                .with_batch_exporter(span_exporter)
                .build();
            let tracer = provider.tracer("stratum");
            Box::new(OpenTelemetryLayer::new(tracer))
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to build OTLP exporter, telemetry disabled");
            Box::new(tracing_subscriber::filter::LevelFilter::OFF)
        }
    }
}

/// Extracts an inbound `TRACEPARENT` header value (if set in the process
/// environment, mirroring how a parent `run-all` invocation would forward
/// it to a child process) into the current OTel context.
pub fn inherit_traceparent() {
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    let Ok(value) = std::env::var("TRACEPARENT") else { return };
    let propagator = TraceContextPropagator::new();
    let mut carrier = std::collections::HashMap::new();
    carrier.insert("traceparent".to_string(), value);
    let parent_cx = propagator.extract(&carrier);
    tracing::Span::current().set_parent(parent_cx);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_exporter_name_falls_back_to_none() {
        assert_eq!(TraceExporter::from_env_value("carrier-pigeon"), TraceExporter::None);
    }

    #[test]
    fn known_exporter_names_parse() {
        assert_eq!(TraceExporter::from_env_value("console"), TraceExporter::Console);
        assert_eq!(TraceExporter::from_env_value("otlp-grpc"), TraceExporter::OtlpGrpc);
        assert_eq!(TraceExporter::from_env_value("otlp-http"), TraceExporter::OtlpHttp);
        assert_eq!(TraceExporter::from_env_value("none"), TraceExporter::None);
    }
}

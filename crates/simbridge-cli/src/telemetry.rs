//! Log and span output for the `simbridge` node.
//!
//! | Variable | Effect |
//! |---|---|
//! | `RUST_LOG` | Filter directives, `info` when unset or invalid. |
//! | `SIMBRIDGE_LOG_FORMAT` | `json` for newline-delimited JSON, anything else for compact text. |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | Collector URL; enables OTLP/HTTP span export. |

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing::Subscriber;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Console output style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        Self::parse(std::env::var("SIMBRIDGE_LOG_FORMAT").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }

    /// The console formatter for this style.
    fn layer<S>(self) -> Box<dyn Layer<S> + Send + Sync + 'static>
    where
        S: Subscriber + for<'a> LookupSpan<'a> + 'static,
    {
        match self {
            LogFormat::Json => fmt::layer().json().boxed(),
            LogFormat::Compact => fmt::layer().compact().boxed(),
        }
    }
}

/// Install the global subscriber: env filter, console formatter and, when a
/// collector is configured, the OpenTelemetry layer.
///
/// Keep the returned guard alive for the life of the process.
pub fn init_tracing(service_name: &str) -> TracerProviderGuard {
    let provider = otlp_provider(service_name);
    let otel = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("simbridge")));

    tracing_subscriber::registry()
        .with(LogFormat::from_env().layer())
        .with(otel)
        .with(env_filter())
        .init();

    TracerProviderGuard(provider)
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Flushes and shuts down the span exporter when dropped.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        let Some(provider) = self.0.take() else {
            return;
        };
        if let Err(e) = provider.shutdown() {
            eprintln!("[simbridge] span exporter shutdown failed: {e}");
        }
    }
}

/// `None` without `OTEL_EXPORTER_OTLP_ENDPOINT` or when the exporter cannot
/// be built.
fn otlp_provider(service_name: &str) -> Option<SdkTracerProvider> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
    {
        Ok(exporter) => exporter,
        Err(e) => {
            eprintln!("[simbridge] span export disabled: {e}");
            return None;
        }
    };

    let provider = SdkTracerProvider::builder()
        .with_resource(Resource::builder().with_service_name(service_name.to_string()).build())
        // No async runtime in the node; spans are sent from the closing thread.
        .with_simple_exporter(exporter)
        .build();
    Some(provider)
}

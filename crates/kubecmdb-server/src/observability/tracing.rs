//! Log Subscriber and Trace Export
//!
//! Environment variables:
//! - `RUST_LOG` - filter directives (default: `info`)
//! - `LOG_FORMAT` - `json` for JSON lines (default: `text`)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT` - enables OTLP span export when set
//! - `OTEL_SERVICE_NAME` - service name on exported spans (default: `kubecmdb-server`)

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_sdk::Resource;
use std::sync::OnceLock;
use tracing::level_filters::LevelFilter;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_SERVICE_NAME: &str = "kubecmdb-server";

static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    pub otlp_endpoint: Option<String>,
    pub service_name: String,
    pub json: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            json: false,
        }
    }
}

impl TracingConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            otlp_endpoint: lookup("OTEL_EXPORTER_OTLP_ENDPOINT").filter(|v| !v.is_empty()),
            service_name: lookup("OTEL_SERVICE_NAME")
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
            json: lookup("LOG_FORMAT").is_some_and(|v| v.eq_ignore_ascii_case("json")),
        }
    }
}

/// Install the global subscriber.
///
/// Console output is always on; spans are additionally exported over OTLP
/// when an endpoint is configured.
pub fn init_tracing(config: TracingConfig) -> anyhow::Result<()> {
    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()?;
            let provider = SdkTracerProvider::builder()
                .with_sampler(Sampler::AlwaysOn)
                .with_resource(
                    Resource::builder()
                        .with_service_name(config.service_name.clone())
                        .build(),
                )
                .with_batch_exporter(exporter)
                .build();
            let tracer = provider.tracer(DEFAULT_SERVICE_NAME);
            let _ = TRACER_PROVIDER.set(provider);
            Some(OpenTelemetryLayer::new(tracer))
        }
        None => None,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(otel_layer)
        .with(config.json.then(|| fmt::layer().json()))
        .with((!config.json).then(fmt::layer))
        .try_init()?;

    match &config.otlp_endpoint {
        Some(endpoint) => tracing::info!(
            endpoint = %endpoint,
            service_name = %config.service_name,
            "OpenTelemetry tracing initialized"
        ),
        None => tracing::debug!("Tracing initialized without OTLP export"),
    }
    Ok(())
}

/// Flush pending spans; call once during shutdown.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error = %e, "Error shutting down tracer provider");
        }
    }
}

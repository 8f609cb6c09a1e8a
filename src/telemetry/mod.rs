//! Logging, tracing and metrics setup.
//!
//! Every process (API server, each language worker) installs a
//! tracing-subscriber registry with an env filter and a fmt layer. When an
//! OTLP endpoint is configured, spans, metrics and log records are also
//! exported there.

pub mod metrics;
pub mod task;

use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;

use crate::error::{Error, Result};

/// Configuration for telemetry initialization.
pub struct TelemetryConfig {
    /// Optional OTLP gRPC endpoint (e.g. "http://localhost:4317").
    pub endpoint: Option<String>,
    /// Service name reported in telemetry signals (e.g. "taskq-worker-rust").
    pub service_name: String,
    /// Filter used when `RUST_LOG` is unset.
    pub default_filter: String,
}

/// Holds the OTel providers. Flushes and shuts them down on drop, so keep it
/// alive for the lifetime of the process.
#[derive(Default)]
pub struct TelemetryGuard {
    providers: Option<Providers>,
}

struct Providers {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

impl TelemetryGuard {
    /// Push buffered signals to the exporter now.
    pub fn force_flush(&self) {
        if let Some(p) = &self.providers {
            let _ = p.tracer.force_flush();
            let _ = p.meter.force_flush();
            let _ = p.logger.force_flush();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(p) = self.providers.take() {
            let _ = p.logger.shutdown();
            let _ = p.meter.shutdown();
            let _ = p.tracer.shutdown();
        }
    }
}

/// Install the global tracing subscriber, and the OTLP pipelines when an
/// endpoint is configured.
///
/// # Errors
///
/// Fails if an OTLP exporter cannot be built or a global subscriber is
/// already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use opentelemetry::trace::TracerProvider as _;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().compact());

    let Some(endpoint) = config.endpoint else {
        registry
            .try_init()
            .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;
        return Ok(TelemetryGuard::default());
    };

    let providers = build_providers(&endpoint, config.service_name)?;
    opentelemetry::global::set_meter_provider(providers.meter.clone());

    let tracer = providers.tracer.tracer("taskq");
    registry
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .with(
            opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(
                &providers.logger,
            ),
        )
        .try_init()
        .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;

    Ok(TelemetryGuard {
        providers: Some(providers),
    })
}

fn build_providers(endpoint: &str, service_name: String) -> Result<Providers> {
    use opentelemetry_otlp::WithExportConfig as _;

    let resource = Resource::builder()
        .with_service_name(service_name)
        .with_attribute(KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ))
        .build();

    let spans = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| Error::Other(format!("failed to create OTLP span exporter: {e}")))?;
    let tracer = SdkTracerProvider::builder()
        .with_batch_exporter(spans)
        .with_resource(resource.clone())
        .build();

    let metrics = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| Error::Other(format!("failed to create OTLP metric exporter: {e}")))?;
    let meter = SdkMeterProvider::builder()
        .with_periodic_exporter(metrics)
        .with_resource(resource.clone())
        .build();

    let logs = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| Error::Other(format!("failed to create OTLP log exporter: {e}")))?;
    let logger = SdkLoggerProvider::builder()
        .with_batch_exporter(logs)
        .with_resource(resource)
        .build();

    Ok(Providers {
        tracer,
        meter,
        logger,
    })
}

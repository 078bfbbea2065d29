//! Tracing subscriber initialization with structured logging and optional
//! OpenTelemetry trace export.
//!
//! # Usage
//!
//! ```no_run
//! use nuoc_types::config::LoggingConfig;
//!
//! nuoc_observe::tracing_setup::init_tracing(&LoggingConfig::default()).unwrap();
//! // ...
//! nuoc_observe::tracing_setup::shutdown_tracing();
//! ```

use std::sync::OnceLock;

use nuoc_types::config::LoggingConfig;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Filter used when neither `RUST_LOG` nor the config sets one.
pub const DEFAULT_FILTER: &str = "info";

/// Stores the OTel tracer provider so it can be shut down cleanly on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Pick the filter directive: `RUST_LOG`, then the config, then [`DEFAULT_FILTER`].
pub fn filter_directive(rust_log: Option<String>, config: &LoggingConfig) -> String {
    rust_log
        .filter(|s| !s.trim().is_empty())
        .or_else(|| config.filter.clone())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

/// Initialize the global tracing subscriber.
///
/// - Installs a `fmt` layer: human-readable with span close timing, or one
///   JSON object per line when `config.json` is set.
/// - When `config.otel` is set, additionally bridges tracing spans to
///   OpenTelemetry using a stdout exporter.
///
/// # Errors
///
/// Returns an error if the filter directive is invalid or a global
/// subscriber has already been set.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let directive = filter_directive(std::env::var("RUST_LOG").ok(), config);
    let env_filter = EnvFilter::try_new(&directive)?;

    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.json {
        layers.push(
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .boxed(),
        );
    } else {
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_span_events(FmtSpan::CLOSE)
                .boxed(),
        );
    }

    if config.otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("nuoc");
        layers.push(tracing_opentelemetry::layer().with_tracer(tracer).boxed());

        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()?;

    tracing::debug!(filter = %directive, json = config.json, otel = config.otel, "tracing initialized");
    Ok(())
}

/// Flush pending traces and shut down the OpenTelemetry tracer provider.
///
/// No-op when OTel was not enabled.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rust_log_wins_over_config() {
        let config = LoggingConfig {
            filter: Some("nuoc_core=debug".to_string()),
            ..Default::default()
        };
        assert_eq!(
            filter_directive(Some("warn".to_string()), &config),
            "warn"
        );
        assert_eq!(filter_directive(None, &config), "nuoc_core=debug");
        assert_eq!(
            filter_directive(Some("  ".to_string()), &config),
            "nuoc_core=debug"
        );
    }

    #[test]
    fn test_default_filter() {
        let directive = filter_directive(None, &LoggingConfig::default());
        assert_eq!(directive, DEFAULT_FILTER);
        assert!(EnvFilter::try_new(directive).is_ok());
    }
}

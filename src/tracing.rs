use anyhow::Result;
use opentelemetry::{global, trace::TracerProvider};
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::trace::{SdkTracerProvider, TracerProviderBuilder};
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::config::ServerConfig;

const TRACER_NAME: &str = "sandkeep";

pub fn get_env_filter() -> tracing_subscriber::EnvFilter {
    // RUST_LOG used to control logging level.
    tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::default()
            .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
    })
}

pub fn get_log_layer<S>(config: &ServerConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    S: tracing::Subscriber,
{
    if config.structured_logging() {
        return Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_span_list(false)
                .with_current_span(true)
                .flatten_event(true),
        );
    }

    Box::new(tracing_subscriber::fmt::layer().compact())
}

/// Layer forwarding `tracing` spans to the given provider.
pub fn get_span_layer<S>(tracer_provider: &SdkTracerProvider) -> impl Layer<S> + Send + Sync
where
    S: for<'a> tracing_subscriber::registry::LookupSpan<'a> + Send + Sync,
    S: tracing::Subscriber,
{
    tracing_opentelemetry::layer().with_tracer(tracer_provider.tracer(TRACER_NAME))
}

fn build_tracer_provider(config: &ServerConfig) -> Result<Option<SdkTracerProvider>> {
    if !config.telemetry.enable_tracing {
        return Ok(None);
    }

    let mut span_exporter = SpanExporter::builder().with_tonic();
    if let Some(endpoint) = &config.telemetry.endpoint {
        span_exporter = span_exporter.with_endpoint(endpoint.clone());
    }
    let span_exporter = span_exporter.build()?;

    let tracer_provider = TracerProviderBuilder::default()
        .with_batch_exporter(span_exporter)
        .build();
    global::set_tracer_provider(tracer_provider.clone());
    Ok(Some(tracer_provider))
}

pub fn setup_tracing(config: &ServerConfig) -> Result<Option<SdkTracerProvider>> {
    let tracer_provider = build_tracer_provider(config)?;

    let log_layer = get_log_layer(config).with_filter(get_env_filter());
    let span_layer = tracer_provider
        .as_ref()
        .map(|provider| get_span_layer(provider).with_filter(get_env_filter()));
    let subscriber = tracing_subscriber::Registry::default()
        .with(log_layer)
        .with(span_layer);
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        error!("logger was already initiated, continuing: {:?}", e);
    }

    Ok(tracer_provider)
}

#[cfg(test)]
mod tests {
    use opentelemetry_sdk::trace::InMemorySpanExporter;

    use super::*;

    #[test]
    fn test_tracing_disabled_builds_no_provider() {
        let config = ServerConfig::default();
        assert!(build_tracer_provider(&config).unwrap().is_none());
    }

    #[test]
    fn test_spans_reach_the_exporter() {
        let exporter = InMemorySpanExporter::default();
        let tracer_provider = TracerProviderBuilder::default()
            .with_simple_exporter(exporter.clone())
            .build();
        let subscriber =
            tracing_subscriber::Registry::default().with(get_span_layer(&tracer_provider));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("restore", sandbox_id = "chat-1001");
            span.in_scope(|| tracing::info!("extracting"));
        });
        tracer_provider.force_flush().unwrap();

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "restore");
    }
}

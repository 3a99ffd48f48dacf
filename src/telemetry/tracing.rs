//! Log and span pipeline.
//!
//! `RUST_LOG` wins when set. Otherwise the configured level applies to the
//! `dispatchd` crate while HTTP and storage internals stay at `warn`, so a
//! `debug` level shows dispatch decisions without client connection chatter.
//!
//! Spans are exported over OTLP when an endpoint is configured. The resource
//! describes this instance: store backend, configured vendors and the
//! channels with weighted selection.

use anyhow::Result;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    runtime,
    trace::{RandomIdGenerator, Sampler, Tracer},
    Resource,
};
use tracing::info;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::{Config, StorageBackend};

const SERVICE_NAME: &str = "dispatchd";

/// Crates whose logs stay at `warn` unless `RUST_LOG` says otherwise.
const QUIET_TARGETS: &[&str] = &[
    "hyper",
    "hyper_util",
    "h2",
    "reqwest",
    "tower",
    "fjall",
    "lsm_tree",
];

/// Tracing configuration
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Level for the `dispatchd` targets
    pub log_level: String,

    pub json_logs: bool,

    /// OTLP endpoint (if set, enables span export)
    pub otlp_endpoint: Option<String>,

    /// Sample rate for root spans (0.0 - 1.0)
    pub sample_rate: f64,

    /// Extra OTEL resource attributes describing this instance
    pub resource: Vec<KeyValue>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            otlp_endpoint: None,
            sample_rate: 1.0,
            resource: Vec::new(),
        }
    }
}

impl TracingConfig {
    pub fn from_config(config: &Config) -> Self {
        let settings = &config.settings;
        Self {
            log_level: settings.log_level.clone(),
            json_logs: settings.json_logs,
            otlp_endpoint: settings.otlp_endpoint.clone(),
            sample_rate: settings.trace_sample_rate,
            resource: resource_attributes(config),
        }
    }

    /// Filter directives used when `RUST_LOG` is unset.
    pub fn directives(&self) -> String {
        // crates not listed follow the configured level
        let mut directives = vec![
            self.log_level.clone(),
            format!("{}={}", SERVICE_NAME, self.log_level),
        ];
        directives.extend(QUIET_TARGETS.iter().map(|t| format!("{}=warn", t)));
        directives.join(",")
    }

    fn sampler(&self) -> Sampler {
        let root = if self.sample_rate >= 1.0 {
            Sampler::AlwaysOn
        } else if self.sample_rate <= 0.0 {
            Sampler::AlwaysOff
        } else {
            Sampler::TraceIdRatioBased(self.sample_rate)
        };
        // retries and webhook handling follow the decision of their parent
        Sampler::ParentBased(Box::new(root))
    }
}

fn resource_attributes(config: &Config) -> Vec<KeyValue> {
    let backend = match config.store.backend {
        StorageBackend::Memory => "memory",
        StorageBackend::Fjall => "fjall",
    };
    let vendors: Vec<&str> = config.vendors.iter().map(|v| v.vendor.as_str()).collect();
    let mut channels: Vec<&str> = config.selector.keys().map(|c| c.as_str()).collect();
    channels.sort_unstable();

    vec![
        KeyValue::new("dispatchd.store.backend", backend),
        KeyValue::new("dispatchd.vendors", vendors.join(",")),
        KeyValue::new("dispatchd.selector.channels", channels.join(",")),
    ]
}

/// Initialize tracing with optional OTLP export
pub fn init_tracing(config: &TracingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.directives()))?;

    let json = config.json_logs.then(|| {
        fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_target(true)
    });
    let pretty = (!config.json_logs).then(|| {
        fmt::layer()
            .compact()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
    });
    let otel = config
        .otlp_endpoint
        .as_deref()
        .map(|endpoint| init_otlp_tracer(config, endpoint))
        .transpose()?
        .map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json)
        .with(pretty)
        .with(otel)
        .try_init()?;

    info!(
        log_level = %config.log_level,
        json_logs = config.json_logs,
        otlp = config.otlp_endpoint.is_some(),
        sample_rate = config.sample_rate,
        "tracing initialized"
    );

    Ok(())
}

fn init_otlp_tracer(config: &TracingConfig, endpoint: &str) -> Result<Tracer> {
    let mut attributes = vec![
        KeyValue::new("service.name", SERVICE_NAME),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ];
    attributes.extend(config.resource.iter().cloned());

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let provider = opentelemetry_sdk::trace::TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_sampler(config.sampler())
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(Resource::new(attributes))
        .build();

    let tracer = provider.tracer(SERVICE_NAME);
    opentelemetry::global::set_tracer_provider(provider);

    Ok(tracer)
}

/// Flush pending spans
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
    info!("tracing shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
settings:
  log_level: debug
  json_logs: true
  trace_sample_rate: 0.25
store:
  backend: fjall
vendors:
  - vendor: gupshup
    base_url: "https://gupshup.test"
    channels:
      - channel: SMS
      - channel: WHATSAPP
  - vendor: karix
    base_url: "https://karix.test"
    channels:
      - channel: SMS
selector:
  WHATSAPP:
    gupshup: 1
  SMS:
    gupshup: 3
    karix: 1
"#;

    fn attribute(config: &TracingConfig, key: &str) -> Option<String> {
        config
            .resource
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| kv.value.to_string())
    }

    #[test]
    fn test_from_config() {
        let config = TracingConfig::from_config(&Config::from_yaml(CONFIG).unwrap());
        assert_eq!(config.log_level, "debug");
        assert!(config.json_logs);
        assert!(config.otlp_endpoint.is_none());
        assert_eq!(config.sample_rate, 0.25);

        assert_eq!(attribute(&config, "dispatchd.store.backend").as_deref(), Some("fjall"));
        assert_eq!(attribute(&config, "dispatchd.vendors").as_deref(), Some("gupshup,karix"));
        assert_eq!(
            attribute(&config, "dispatchd.selector.channels").as_deref(),
            Some("SMS,WHATSAPP")
        );
    }

    #[test]
    fn test_directives_quiet_transport_crates() {
        let config = TracingConfig {
            log_level: "debug".into(),
            ..TracingConfig::default()
        };
        let directives = config.directives();
        assert!(directives.starts_with("debug,dispatchd=debug,"));
        assert!(directives.contains("reqwest=warn"));
        assert!(directives.contains("fjall=warn"));
        assert!(EnvFilter::try_new(&directives).is_ok());
    }

    #[test]
    fn test_sampler_is_parent_based() {
        let ratio = TracingConfig {
            sample_rate: 0.5,
            ..TracingConfig::default()
        };
        assert!(matches!(ratio.sampler(), Sampler::ParentBased(_)));
    }
}

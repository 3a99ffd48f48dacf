use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::message::Channel;
use crate::vendor::selector::SelectorWeights;
use crate::vendor::VendorId;

/// Root configuration for dispatchd
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub settings: Settings,

    /// Admin API configuration
    #[serde(default)]
    pub admin: AdminConfig,

    /// Event and webhook ingress
    #[serde(default)]
    pub ingress: IngressConfig,

    /// Acknowledgement storage
    #[serde(default)]
    pub store: StoreConfig,

    /// Delivery vendors and the channels each one serves
    #[serde(default)]
    pub vendors: Vec<VendorConfig>,

    /// Per-channel vendor weights
    #[serde(default)]
    pub selector: HashMap<Channel, BTreeMap<VendorId, u32>>,

    /// Retry budget
    #[serde(default)]
    pub retry: RetryConfig,

    /// Downstream event streams
    #[serde(default)]
    pub events: EventsConfig,

    /// WhatsApp opt-in gate
    #[serde(default)]
    pub optin: OptInConfig,

    /// Inbound webhook reconciliation
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Static template catalog
    #[serde(default)]
    pub templates: Vec<TemplateConfig>,
}

impl Config {
    /// Selector weights in the form the live selector consumes.
    pub fn selector_weights(&self) -> SelectorWeights {
        self.selector.clone()
    }

    /// Look up a vendor's configuration.
    pub fn vendor(&self, vendor: VendorId) -> Option<&VendorConfig> {
        self.vendors.iter().find(|v| v.vendor == vendor)
    }
}

/// Vendor configuration
#[derive(Debug, Clone, Deserialize)]
pub struct VendorConfig {
    /// Vendor identity
    pub vendor: VendorId,

    /// API base URL (no trailing path)
    pub base_url: String,

    /// Credentials
    #[serde(default)]
    pub credentials: VendorCredentials,

    /// Channels served by this vendor
    #[serde(default)]
    pub channels: Vec<VendorChannelConfig>,
}

/// Vendor credentials. Which fields are needed depends on the vendor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VendorCredentials {
    pub api_key: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Sender id / from address
    pub sender: Option<String>,
}

/// Per-channel settings of a vendor
#[derive(Debug, Clone, Deserialize)]
pub struct VendorChannelConfig {
    pub channel: Channel,

    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Retry budget configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Default maximum retries for channels with a retry policy
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Per-channel overrides
    #[serde(default)]
    pub channels: HashMap<Channel, u32>,
}

impl RetryConfig {
    pub fn max_retries_for(&self, channel: Channel) -> u32 {
        self.channels
            .get(&channel)
            .copied()
            .unwrap_or(self.max_retries)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            channels: HashMap::new(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

/// Event sink type
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Memory,
    Http,
    #[default]
    Log,
}

/// Downstream event stream configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    #[serde(default)]
    pub sink: SinkKind,

    /// Base URL for the http sink; events are posted to `{url}/{topic}`
    pub url: Option<String>,

    #[serde(default = "default_ack_topic")]
    pub ack_topic: String,

    #[serde(default = "default_dead_letter_topic")]
    pub dead_letter_topic: String,

    #[serde(default = "default_campaign_topic")]
    pub campaign_topic: String,

    /// Campaign name prefixes that qualify for the campaign stream
    #[serde(default = "default_campaign_prefixes")]
    pub campaign_prefixes: Vec<String>,

    /// Total publish attempts per event
    #[serde(default = "default_publish_attempts")]
    pub publish_attempts: u32,

    /// Backoff before the second attempt; doubles afterwards
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Request timeout for the http sink
    #[serde(default = "default_sink_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            sink: SinkKind::default(),
            url: None,
            ack_topic: default_ack_topic(),
            dead_letter_topic: default_dead_letter_topic(),
            campaign_topic: default_campaign_topic(),
            campaign_prefixes: default_campaign_prefixes(),
            publish_attempts: default_publish_attempts(),
            initial_backoff: default_initial_backoff(),
            timeout: default_sink_timeout(),
        }
    }
}

fn default_ack_topic() -> String {
    "dispatch.acknowledgements".to_string()
}

fn default_dead_letter_topic() -> String {
    "dispatch.dead-letter".to_string()
}

fn default_campaign_topic() -> String {
    "dispatch.campaign-analytics".to_string()
}

fn default_campaign_prefixes() -> Vec<String> {
    vec!["CMP_".to_string()]
}

fn default_publish_attempts() -> u32 {
    2
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_sink_timeout() -> Duration {
    Duration::from_secs(5)
}

/// WhatsApp opt-in gate configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OptInConfig {
    /// How long a NO_ACCNT user is skipped before being tried again
    #[serde(default = "default_no_account_cooldown", with = "humantime_serde")]
    pub no_account_cooldown: Duration,
}

impl Default for OptInConfig {
    fn default() -> Self {
        Self {
            no_account_cooldown: default_no_account_cooldown(),
        }
    }
}

fn default_no_account_cooldown() -> Duration {
    Duration::from_secs(60 * 24 * 60 * 60)
}

/// Webhook reconciliation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Re-dispatches allowed per original reference id for in-flight statuses
    #[serde(default = "default_max_local_retries")]
    pub max_local_retries: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_local_retries: default_max_local_retries(),
        }
    }
}

fn default_max_local_retries() -> usize {
    2
}

/// Static template definition
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateConfig {
    pub name: String,
    pub channel: Channel,
    #[serde(default = "default_language")]
    pub language: String,
    /// Body with `{{placeholder}}` markers
    pub body: String,
    /// Email subject / push title
    pub subject: Option<String>,
    /// Force the unicode flag; derived from the rendered content otherwise
    pub unicode: Option<bool>,
}

fn default_language() -> String {
    "en".to_string()
}

/// Storage backend type
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Fjall,
}

/// Storage configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    #[serde(default)]
    pub fjall: FjallConfig,
}

impl StoreConfig {
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn fjall(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: StorageBackend::Fjall,
            fjall: FjallConfig {
                path: Some(path.into()),
            },
        }
    }
}

/// Fjall storage settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FjallConfig {
    /// Data directory; resolved from the environment when unset
    pub path: Option<PathBuf>,
}

/// Ingress configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IngressConfig {
    #[serde(default = "default_ingress_address")]
    pub address: SocketAddr,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            address: default_ingress_address(),
        }
    }
}

fn default_ingress_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Admin API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    /// HTTP API address
    #[serde(default = "default_admin_address")]
    pub address: SocketAddr,

    /// Enable metrics endpoint
    #[serde(default = "default_true")]
    pub metrics: bool,

    /// Enable health endpoint
    #[serde(default = "default_true")]
    pub health: bool,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            address: default_admin_address(),
            metrics: true,
            health: true,
        }
    }
}

fn default_admin_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9090))
}

fn default_true() -> bool {
    true
}

/// Global settings
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Enable structured JSON logging
    #[serde(default)]
    pub json_logs: bool,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// OTLP endpoint for distributed tracing
    pub otlp_endpoint: Option<String>,

    /// Trace sample rate (0.0 - 1.0)
    #[serde(default = "default_sample_rate")]
    pub trace_sample_rate: f64,

    /// Language used when neither the event nor the resolver supplies one
    #[serde(default = "default_language")]
    pub default_language: String,

    /// Shutdown configuration
    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Enable hot reload of selector weights
    #[serde(default = "default_true")]
    pub hot_reload: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            json_logs: false,
            log_level: default_log_level(),
            otlp_endpoint: None,
            trace_sample_rate: default_sample_rate(),
            default_language: default_language(),
            shutdown: ShutdownConfig::default(),
            hot_reload: true,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sample_rate() -> f64 {
    1.0
}

/// Shutdown configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// How long to wait for in-flight dispatches before cancelling them
    #[serde(default = "default_drain_timeout", with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: default_drain_timeout(),
        }
    }
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Humantime serde support module
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

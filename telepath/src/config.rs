//! Endpoint configuration.
//!
//! Nothing here is global: a [`TelepathConfig`] is passed to every channel
//! at construction.

use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use telepath_transport::{NotificationConfig, IDENTIFY_TIMEOUT};

use crate::ChannelError;

/// Relay used when none is configured.
pub const DEFAULT_SERVICE_URL: &str = "https://telepath.cogito.mobi";

/// Default period of background queue polling.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of recent inbound request ids remembered per channel.
pub const DEFAULT_DEDUP_WINDOW: usize = 256;

/// Configuration shared by all channels of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelepathConfig {
    /// Base URL of the relay.
    pub service_url: String,
    /// How long the relay gets to acknowledge `identify`.
    pub identify_timeout: Duration,
    /// Default wait for a response; `None` waits until the channel closes.
    pub request_timeout: Option<Duration>,
    /// Period of background queue polling; `None` polls only on demand.
    pub poll_interval: Option<Duration>,
    /// Recent inbound request ids remembered for duplicate suppression.
    pub dedup_window: usize,
}

impl Default for TelepathConfig {
    fn default() -> Self {
        Self {
            service_url: DEFAULT_SERVICE_URL.to_owned(),
            identify_timeout: IDENTIFY_TIMEOUT,
            request_timeout: None,
            poll_interval: Some(DEFAULT_POLL_INTERVAL),
            dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }
}

impl TelepathConfig {
    /// Start building a configuration from the defaults.
    pub fn builder() -> TelepathConfigBuilder {
        TelepathConfigBuilder::new()
    }

    /// Reject configurations no channel could run with.
    pub fn validate(&self) -> Result<(), ChannelError> {
        Url::parse(&self.service_url).map_err(|e| {
            ChannelError::InvalidConfig(format!("service_url {:?}: {e}", self.service_url))
        })?;
        if self.dedup_window == 0 {
            return Err(ChannelError::InvalidConfig(
                "dedup_window must be at least 1".into(),
            ));
        }
        if self.poll_interval == Some(Duration::ZERO) {
            return Err(ChannelError::InvalidConfig(
                "poll_interval must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Settings for the push client.
    pub fn notification_config(&self) -> NotificationConfig {
        NotificationConfig {
            identify_timeout: self.identify_timeout,
        }
    }
}

/// Builder for [`TelepathConfig`].
pub struct TelepathConfigBuilder {
    config: TelepathConfig,
}

impl TelepathConfigBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: TelepathConfig::default(),
        }
    }

    /// Set the relay URL.
    pub fn service_url(mut self, url: impl Into<String>) -> Self {
        self.config.service_url = url.into();
        self
    }

    /// Set the identify acknowledgement timeout.
    pub fn identify_timeout(mut self, timeout: Duration) -> Self {
        self.config.identify_timeout = timeout;
        self
    }

    /// Set the default response timeout.
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the background polling period.
    pub fn poll_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the duplicate suppression window.
    pub fn dedup_window(mut self, window: usize) -> Self {
        self.config.dedup_window = window;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<TelepathConfig, ChannelError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for TelepathConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

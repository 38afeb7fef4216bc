//! # Telepath
//!
//! Encrypted JSON-RPC channels between an application and an identity
//! wallet, relayed through an untrusted service.
//!
//! Pairing happens out of band: one side creates a [`ChannelAddress`] and
//! shows it (usually as a QR code of a connect URL), the other side decodes
//! it. Both then open a [`SecureChannel`] on the same address in opposite
//! [`ChannelRole`]s.
//!
//! ```text
//! ┌─────────────┐   ChannelAddress   ┌─────────────┐
//! │ Application │ ◄───── (QR) ────── │   Wallet    │
//! │  Initiator  │                    │  Responder  │
//! └──────┬──────┘                    └──────┬──────┘
//!        │   <id>.red  ─────────────────►   │
//!        │   <id>.blue ◄─────────────────   │
//!        │          socket room <id>        │
//!        └────────────► relay ◄─────────────┘
//! ```
//!
//! This crate provides:
//! - **Framing**: JSON-RPC 2.0 envelopes and id correlation ([`jsonrpc`])
//! - **Channels**: sealing, dual-transport delivery and dispatch ([`channel`])
//! - **Services**: method routing and the wallet key-value store
//! - **Attestation**: single-use nonce bookkeeping for OpenID logins

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod attestation;
pub mod channel;
pub mod config;
pub mod jsonrpc;
pub mod key_value;
pub mod service;

use std::sync::Arc;

use thiserror::Error;

pub use attestation::{
    AttestationConfig, AttestationError, AttestationEvent, AttestationFlow, AttestationInProgress,
    AttestationOutcome, AttestationStatus, AttestationStore, AuthorizationRequest, LoginLauncher,
};
pub use channel::{ChannelHooks, ChannelRole, ChannelTransports, PendingResponse, SecureChannel};
pub use config::{TelepathConfig, TelepathConfigBuilder};
pub use jsonrpc::{InboundMessage, JsonRpcError, JsonRpcId, JsonRpcRequest, JsonRpcResponse};
pub use key_value::{KeyValueError, KeyValueService};
pub use service::{RequestHandler, ServiceRouter, TelepathService};
pub use telepath_crypto::{ChannelAddress, ChannelId, ChannelKey, CryptoError};
pub use telepath_transport::{
    MemoryRelay, NotificationState, QueuingServiceClient, SocketIoConnector, TransportError,
};

/// Errors surfaced by a channel.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChannelError {
    /// Pairing data or ciphertext problem.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// The relay could not deliver.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A message could not be encoded.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// The peer answered with an error.
    #[error(transparent)]
    Rpc(JsonRpcError),

    /// No response arrived in time.
    #[error("Request timed out")]
    Timeout,

    /// The channel was closed.
    #[error("Channel closed")]
    ChannelClosed,

    /// A request with this id is already waiting for a response.
    #[error("Request id {0} is already pending")]
    DuplicateRequestId(JsonRpcId),

    /// The configuration cannot be used.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Opens channels against one relay with one configuration.
#[derive(Debug, Clone)]
pub struct Telepath {
    config: TelepathConfig,
    transports: ChannelTransports,
}

impl Telepath {
    /// Endpoint using the relay at `config.service_url`: HTTP queues plus
    /// Socket.IO push.
    pub fn new(config: TelepathConfig) -> Result<Self> {
        config.validate()?;
        let queuing = QueuingServiceClient::new(&config.service_url)?;
        let sockets = SocketIoConnector::new(&config.service_url)?;
        Ok(Self {
            transports: ChannelTransports::new(Arc::new(queuing)).with_sockets(Arc::new(sockets)),
            config,
        })
    }

    /// Relay services channels are opened on.
    pub fn transports(&self) -> &ChannelTransports {
        &self.transports
    }

    /// Endpoint using the given relay services.
    pub fn with_transports(config: TelepathConfig, transports: ChannelTransports) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, transports })
    }

    /// Configuration channels are opened with.
    pub fn config(&self) -> &TelepathConfig {
        &self.config
    }

    /// Fresh address to pair on.
    pub fn create_channel(&self) -> ChannelAddress {
        ChannelAddress::generate()
    }

    /// Open the initiator side of a pairing.
    pub async fn connect(
        &self,
        address: ChannelAddress,
        app_name: impl Into<String>,
    ) -> Result<SecureChannel> {
        self.connect_with(address, app_name, ChannelHooks::new()).await
    }

    /// Open the initiator side with its handler and subscribers installed.
    pub async fn connect_with(
        &self,
        address: ChannelAddress,
        app_name: impl Into<String>,
        hooks: ChannelHooks,
    ) -> Result<SecureChannel> {
        self.open(address, app_name, ChannelRole::Initiator, hooks).await
    }

    /// Open the initiator side from a connect URL or bare fragment.
    pub async fn connect_url(&self, url: &str, app_name: impl Into<String>) -> Result<SecureChannel> {
        let address: ChannelAddress = url.parse()?;
        self.connect(address, app_name).await
    }

    /// Open the responder side of a pairing.
    pub async fn accept(
        &self,
        address: ChannelAddress,
        app_name: impl Into<String>,
    ) -> Result<SecureChannel> {
        self.accept_with(address, app_name, ChannelHooks::new()).await
    }

    /// Open the responder side with its handler and subscribers installed,
    /// so requests already queued by the initiator are answered.
    pub async fn accept_with(
        &self,
        address: ChannelAddress,
        app_name: impl Into<String>,
        hooks: ChannelHooks,
    ) -> Result<SecureChannel> {
        self.open(address, app_name, ChannelRole::Responder, hooks).await
    }

    async fn open(
        &self,
        address: ChannelAddress,
        app_name: impl Into<String>,
        role: ChannelRole,
        hooks: ChannelHooks,
    ) -> Result<SecureChannel> {
        SecureChannel::open_with(
            address,
            app_name,
            role,
            self.transports.clone(),
            &self.config,
            hooks,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_bad_service_url() {
        let config = TelepathConfig {
            service_url: "::".into(),
            ..TelepathConfig::default()
        };
        assert!(matches!(
            Telepath::new(config),
            Err(ChannelError::InvalidConfig(_))
        ));
        let telepath = Telepath::new(TelepathConfig::default()).unwrap();
        assert!(telepath.transports().sockets.is_some());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(ChannelError::ChannelClosed.to_string(), "Channel closed");
        assert_eq!(
            ChannelError::from(TransportError::Relay { status: 503 }).to_string(),
            "Relay rejected request with status 503"
        );
        assert_eq!(
            ChannelError::Rpc(JsonRpcError::new(3, "no value for key")).to_string(),
            "JSON-RPC error 3: no value for key"
        );
    }

    #[tokio::test]
    async fn test_connect_url_rejects_bad_fragment() {
        let telepath = Telepath::with_transports(
            TelepathConfig::default(),
            ChannelTransports::new(Arc::new(MemoryRelay::new())),
        )
        .unwrap();
        let result = telepath
            .connect_url("https://example.com/telepath/connect#I=abc", "app")
            .await;
        assert!(matches!(result, Err(ChannelError::Crypto(CryptoError::InvalidFragment(_)))));
    }
}

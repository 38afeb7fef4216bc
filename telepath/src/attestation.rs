//! # Attestation Handshake
//!
//! Binds an OpenID login to a single-use nonce. Starting an attestation
//! records a fresh nonce and opens the identity provider's login page with
//! it; finishing validates the returned ID token's `nonce` claim against the
//! nonces still pending. A nonce is retired by its first terminal outcome,
//! so replaying a redirect is rejected.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use rand::RngCore;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use telepath_crypto::{base64url_decode, ChannelId};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

/// Redirect parameter carrying the ID token.
pub const ID_TOKEN_PARAM: &str = "id_token";

/// Random bytes in a nonce.
pub const NONCE_SIZE: usize = 32;

const MISSING_ID_TOKEN: &str = "id token missing";
const UNEXPECTED_NONCE: &str = "unexpected nonce";

/// Where an attestation attempt stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttestationStatus {
    /// Nonce recorded, login not yet opened.
    Pending,
    /// Login page opened.
    Started,
    /// The login page could not be opened.
    StartRejected,
    /// A token with this nonce came back.
    Fulfilled,
    /// The returned token was rejected.
    FinishRejected,
}

impl AttestationStatus {
    /// True for outcomes that retire the nonce.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::StartRejected | Self::Fulfilled | Self::FinishRejected
        )
    }
}

/// One attestation attempt, keyed by its nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationInProgress {
    /// Single-use nonce.
    pub nonce: String,
    /// Current status.
    pub status: AttestationStatus,
    /// Why the attempt failed.
    pub error: Option<String>,
    /// Token received on success.
    pub id_token: Option<String>,
    /// Channel whose request triggered the attestation.
    pub requested_on_channel: Option<ChannelId>,
}

/// Terminal result of an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttestationOutcome {
    /// The login could not be started.
    StartRejected(String),
    /// The login returned a token carrying the nonce.
    Fulfilled(String),
    /// The login returned something unusable.
    FinishRejected(String),
}

/// Attestation bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationStore {
    pending_nonces: BTreeSet<String>,
    entries: HashMap<String, AttestationInProgress>,
    provided: HashMap<ChannelId, Vec<String>>,
}

impl AttestationStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new attempt.
    pub fn begin(&mut self, nonce: &str, requested_on_channel: Option<ChannelId>) {
        self.pending_nonces.insert(nonce.to_owned());
        self.entries.insert(
            nonce.to_owned(),
            AttestationInProgress {
                nonce: nonce.to_owned(),
                status: AttestationStatus::Pending,
                error: None,
                id_token: None,
                requested_on_channel,
            },
        );
    }

    /// Note that the login page was opened. False if the attempt is unknown
    /// or no longer pending.
    pub fn mark_started(&mut self, nonce: &str) -> bool {
        match self.entries.get_mut(nonce) {
            Some(entry) if entry.status == AttestationStatus::Pending => {
                entry.status = AttestationStatus::Started;
                true
            }
            _ => false,
        }
    }

    /// Record a terminal outcome and retire the nonce.
    pub fn complete(&mut self, nonce: &str, outcome: AttestationOutcome) {
        self.pending_nonces.remove(nonce);
        let Some(entry) = self.entries.get_mut(nonce) else {
            return;
        };
        match outcome {
            AttestationOutcome::StartRejected(error) => {
                entry.status = AttestationStatus::StartRejected;
                entry.error = Some(error);
            }
            AttestationOutcome::Fulfilled(id_token) => {
                entry.status = AttestationStatus::Fulfilled;
                entry.id_token = Some(id_token);
            }
            AttestationOutcome::FinishRejected(error) => {
                entry.status = AttestationStatus::FinishRejected;
                entry.error = Some(error);
            }
        }
    }

    /// True while a token carrying `nonce` would be accepted.
    pub fn is_pending(&self, nonce: &str) -> bool {
        self.pending_nonces.contains(nonce)
    }

    /// The attempt recorded for `nonce`.
    pub fn get(&self, nonce: &str) -> Option<&AttestationInProgress> {
        self.entries.get(nonce)
    }

    /// Nonces still accepting a token.
    pub fn pending_nonces(&self) -> impl Iterator<Item = &str> {
        self.pending_nonces.iter().map(String::as_str)
    }

    /// Remember that `id_token` was handed to `channel`. False if it already
    /// was.
    pub fn record_provided(&mut self, channel: &ChannelId, id_token: &str) -> bool {
        let tokens = self.provided.entry(channel.clone()).or_default();
        if tokens.iter().any(|token| token == id_token) {
            return false;
        }
        tokens.push(id_token.to_owned());
        true
    }

    /// Tokens handed to `channel`, oldest first.
    pub fn provided(&self, channel: &ChannelId) -> &[String] {
        self.provided
            .get(channel)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Progress reported by [`AttestationFlow`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttestationEvent {
    /// A nonce was recorded.
    Pending {
        /// The new nonce.
        nonce: String,
    },
    /// The login page was opened.
    Started {
        /// Nonce of the attempt.
        nonce: String,
    },
    /// The login page could not be opened.
    StartRejected {
        /// Nonce of the attempt.
        nonce: String,
        /// Launcher or URL error.
        error: String,
    },
    /// A token with a pending nonce came back.
    Fulfilled {
        /// Nonce of the attempt.
        nonce: String,
        /// The raw ID token.
        id_token: String,
    },
    /// The redirect was rejected.
    FinishRejected {
        /// The token's nonce claim, if one could be read.
        nonce: Option<String>,
        /// Why the redirect was rejected.
        error: String,
    },
}

/// OpenID client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationConfig {
    /// Client id registered with the identity provider.
    pub client_id: String,
    /// Where the provider sends the user back to.
    pub redirect_uri: String,
}

/// Login request handed to a [`LoginLauncher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    /// Nonce the returned token must carry.
    pub nonce: String,
    /// Implicit-flow authorization URL.
    pub url: Url,
}

impl AuthorizationRequest {
    /// Build the implicit-flow URL for the realm at `realm_url`.
    pub fn new(
        realm_url: &str,
        nonce: &str,
        config: &AttestationConfig,
    ) -> Result<Self, AttestationError> {
        let mut url =
            Url::parse(realm_url).map_err(|e| AttestationError::InvalidRealmUrl(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| AttestationError::InvalidRealmUrl(realm_url.to_owned()))?
            .pop_if_empty()
            .extend(["protocol", "openid-connect", "auth"]);
        url.query_pairs_mut()
            .append_pair("client_id", &config.client_id)
            .append_pair("redirect_uri", &config.redirect_uri)
            .append_pair("response_type", "id_token")
            .append_pair("scope", "openid")
            .append_pair("nonce", nonce);
        Ok(Self {
            nonce: nonce.to_owned(),
            url,
        })
    }
}

/// Opens the identity provider's login page.
#[async_trait]
pub trait LoginLauncher: Send + Sync {
    /// Present the login; an error means it could not be opened.
    async fn launch(&self, request: &AuthorizationRequest) -> Result<(), AttestationError>;
}

/// Why an attestation could not start.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttestationError {
    /// The realm URL cannot carry the authorization path.
    #[error("invalid realm url: {0}")]
    InvalidRealmUrl(String),
    /// The login page could not be opened.
    #[error("{0}")]
    LaunchFailed(String),
}

/// Why an ID token could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdTokenError {
    /// Not three dot-separated segments.
    #[error("malformed id token: expected 3 segments, found {0}")]
    Segments(usize),
    /// The payload is not base64url.
    #[error("malformed id token: payload is not base64url")]
    Encoding,
    /// The payload is not a JSON object.
    #[error("malformed id token: {0}")]
    Claims(String),
}

/// Read the claims of a JWT without verifying its signature.
pub fn decode_claims(id_token: &str) -> Result<Map<String, Value>, IdTokenError> {
    let segments: Vec<&str> = id_token.split('.').collect();
    if segments.len() != 3 {
        return Err(IdTokenError::Segments(segments.len()));
    }
    let payload = base64url_decode(segments[1]).ok_or(IdTokenError::Encoding)?;
    serde_json::from_slice(&payload).map_err(|e| IdTokenError::Claims(e.to_string()))
}

/// Fresh hex-encoded nonce.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Runs attestation attempts against one identity provider client.
pub struct AttestationFlow<L> {
    launcher: L,
    config: AttestationConfig,
    store: Mutex<AttestationStore>,
    events: mpsc::UnboundedSender<AttestationEvent>,
}

impl<L: LoginLauncher> AttestationFlow<L> {
    /// Create a flow reporting progress on `events`.
    pub fn new(
        launcher: L,
        config: AttestationConfig,
        events: mpsc::UnboundedSender<AttestationEvent>,
    ) -> Self {
        Self {
            launcher,
            config,
            store: Mutex::new(AttestationStore::new()),
            events,
        }
    }

    fn emit(&self, event: AttestationEvent) {
        let _ = self.events.send(event);
    }

    /// Start an attestation with the realm at `oidc_realm_url`; returns the
    /// nonce.
    pub async fn start(&self, oidc_realm_url: &str) -> String {
        self.start_for(oidc_realm_url, None).await
    }

    /// Start an attestation on behalf of `channel`.
    pub async fn start_for(&self, oidc_realm_url: &str, channel: Option<ChannelId>) -> String {
        let nonce = generate_nonce();
        self.store.lock().await.begin(&nonce, channel);
        self.emit(AttestationEvent::Pending {
            nonce: nonce.clone(),
        });

        let launched = match AuthorizationRequest::new(oidc_realm_url, &nonce, &self.config) {
            Ok(request) => self.launcher.launch(&request).await,
            Err(e) => Err(e),
        };

        match launched {
            Ok(()) => {
                self.store.lock().await.mark_started(&nonce);
                info!("Attestation started at {}", oidc_realm_url);
                self.emit(AttestationEvent::Started {
                    nonce: nonce.clone(),
                });
            }
            Err(error) => {
                let error = error.to_string();
                warn!("Attestation could not start: {}", error);
                self.store
                    .lock()
                    .await
                    .complete(&nonce, AttestationOutcome::StartRejected(error.clone()));
                self.emit(AttestationEvent::StartRejected {
                    nonce: nonce.clone(),
                    error,
                });
            }
        }
        nonce
    }

    /// Handle the provider's redirect parameters.
    pub async fn finish(&self, params: &HashMap<String, String>) -> AttestationEvent {
        let event = self.evaluate(params).await;
        match &event {
            AttestationEvent::Fulfilled { nonce, .. } => info!("Attestation {} fulfilled", nonce),
            AttestationEvent::FinishRejected { error, .. } => {
                warn!("Attestation rejected: {}", error)
            }
            _ => {}
        }
        self.emit(event.clone());
        event
    }

    async fn evaluate(&self, params: &HashMap<String, String>) -> AttestationEvent {
        let Some(id_token) = params.get(ID_TOKEN_PARAM) else {
            return AttestationEvent::FinishRejected {
                nonce: None,
                error: MISSING_ID_TOKEN.into(),
            };
        };

        let claims = match decode_claims(id_token) {
            Ok(claims) => claims,
            Err(e) => {
                return AttestationEvent::FinishRejected {
                    nonce: None,
                    error: e.to_string(),
                }
            }
        };

        let nonce = claims
            .get("nonce")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let mut store = self.store.lock().await;
        match nonce {
            Some(nonce) if store.is_pending(&nonce) => {
                store.complete(&nonce, AttestationOutcome::Fulfilled(id_token.clone()));
                AttestationEvent::Fulfilled {
                    nonce,
                    id_token: id_token.clone(),
                }
            }
            nonce => AttestationEvent::FinishRejected {
                nonce,
                error: UNEXPECTED_NONCE.into(),
            },
        }
    }

    /// Remember that `id_token` was handed to `channel`.
    pub async fn record_provided(&self, channel: &ChannelId, id_token: &str) -> bool {
        self.store.lock().await.record_provided(channel, id_token)
    }

    /// Copy of the current bookkeeping.
    pub async fn snapshot(&self) -> AttestationStore {
        self.store.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use telepath_crypto::base64url_encode;

    #[derive(Default)]
    struct RecordingLauncher {
        refuse: bool,
        launched: StdMutex<Vec<AuthorizationRequest>>,
    }

    #[async_trait]
    impl LoginLauncher for RecordingLauncher {
        async fn launch(&self, request: &AuthorizationRequest) -> Result<(), AttestationError> {
            self.launched.lock().unwrap().push(request.clone());
            if self.refuse {
                Err(AttestationError::LaunchFailed("no browser".into()))
            } else {
                Ok(())
            }
        }
    }

    fn config() -> AttestationConfig {
        AttestationConfig {
            client_id: "cogito".into(),
            redirect_uri: "cogito://attestation".into(),
        }
    }

    fn token(claims: Value) -> String {
        format!(
            "{}.{}.{}",
            base64url_encode(br#"{"alg":"RS256","typ":"JWT"}"#),
            base64url_encode(claims.to_string().as_bytes()),
            base64url_encode(b"signature")
        )
    }

    fn redirect(id_token: &str) -> HashMap<String, String> {
        HashMap::from([(ID_TOKEN_PARAM.to_owned(), id_token.to_owned())])
    }

    fn flow(
        launcher: RecordingLauncher,
    ) -> (
        AttestationFlow<RecordingLauncher>,
        mpsc::UnboundedReceiver<AttestationEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (AttestationFlow::new(launcher, config(), tx), rx)
    }

    #[test]
    fn test_nonce_format() {
        let nonce = generate_nonce();
        assert_eq!(nonce.len(), 64);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(nonce, generate_nonce());
    }

    #[test]
    fn test_authorization_url() {
        let request =
            AuthorizationRequest::new("https://id.example.com/auth/realms/main/", "abc", &config())
                .unwrap();
        assert_eq!(
            request.url.as_str(),
            "https://id.example.com/auth/realms/main/protocol/openid-connect/auth\
             ?client_id=cogito&redirect_uri=cogito%3A%2F%2Fattestation\
             &response_type=id_token&scope=openid&nonce=abc"
        );
        assert!(matches!(
            AuthorizationRequest::new("not a url", "abc", &config()),
            Err(AttestationError::InvalidRealmUrl(_))
        ));
        assert!(matches!(
            AuthorizationRequest::new("mailto:id@example.com", "abc", &config()),
            Err(AttestationError::InvalidRealmUrl(_))
        ));
    }

    #[test]
    fn test_decode_claims() {
        let claims = decode_claims(&token(json!({"nonce": "n1", "sub": "me"}))).unwrap();
        assert_eq!(claims["nonce"], json!("n1"));

        assert_eq!(decode_claims("a.b"), Err(IdTokenError::Segments(2)));
        assert_eq!(decode_claims("a.*.c"), Err(IdTokenError::Encoding));
        assert!(matches!(
            decode_claims(&format!("a.{}.c", base64url_encode(b"[1]"))),
            Err(IdTokenError::Claims(_))
        ));
    }

    #[test]
    fn test_store_lifecycle() {
        let mut store = AttestationStore::new();
        store.begin("n1", None);
        assert!(store.is_pending("n1"));
        assert_eq!(store.get("n1").unwrap().status, AttestationStatus::Pending);

        assert!(store.mark_started("n1"));
        assert!(!store.mark_started("n1"));
        assert!(!store.mark_started("unknown"));

        store.complete("n1", AttestationOutcome::Fulfilled("tok".into()));
        assert!(!store.is_pending("n1"));
        let entry = store.get("n1").unwrap();
        assert_eq!(entry.status, AttestationStatus::Fulfilled);
        assert_eq!(entry.id_token.as_deref(), Some("tok"));
        assert!(entry.status.is_terminal());
    }

    #[test]
    fn test_provided_without_duplicates() {
        let mut store = AttestationStore::new();
        let channel = ChannelId::new("c");
        assert!(store.record_provided(&channel, "t1"));
        assert!(!store.record_provided(&channel, "t1"));
        assert!(store.record_provided(&channel, "t2"));
        assert_eq!(store.provided(&channel), ["t1", "t2"]);
        assert!(store.provided(&ChannelId::new("other")).is_empty());
    }

    #[tokio::test]
    async fn test_start_then_fulfil() {
        let (flow, mut events) = flow(RecordingLauncher::default());
        let nonce = flow.start("https://id.example.com/realms/main").await;

        assert_eq!(
            events.recv().await,
            Some(AttestationEvent::Pending { nonce: nonce.clone() })
        );
        assert_eq!(
            events.recv().await,
            Some(AttestationEvent::Started { nonce: nonce.clone() })
        );
        let launched = flow.launcher.launched.lock().unwrap().clone();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].nonce, nonce);

        let id_token = token(json!({"nonce": nonce}));
        let event = flow.finish(&redirect(&id_token)).await;
        assert_eq!(
            event,
            AttestationEvent::Fulfilled {
                nonce: nonce.clone(),
                id_token: id_token.clone()
            }
        );
        assert_eq!(events.recv().await, Some(event));

        let store = flow.snapshot().await;
        assert!(!store.is_pending(&nonce));
        assert_eq!(store.get(&nonce).unwrap().status, AttestationStatus::Fulfilled);
    }

    #[tokio::test]
    async fn test_start_rejected() {
        let (flow, mut events) = flow(RecordingLauncher {
            refuse: true,
            ..Default::default()
        });
        let nonce = flow.start("https://id.example.com/realms/main").await;

        events.recv().await;
        assert_eq!(
            events.recv().await,
            Some(AttestationEvent::StartRejected {
                nonce: nonce.clone(),
                error: "no browser".into()
            })
        );
        let store = flow.snapshot().await;
        assert!(!store.is_pending(&nonce));
        assert_eq!(store.get(&nonce).unwrap().error.as_deref(), Some("no browser"));
    }

    #[tokio::test]
    async fn test_invalid_realm_is_start_rejected() {
        let (flow, mut events) = flow(RecordingLauncher::default());
        flow.start("not a url").await;

        events.recv().await;
        assert!(matches!(
            events.recv().await,
            Some(AttestationEvent::StartRejected { .. })
        ));
        assert!(flow.launcher.launched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finish_without_token() {
        let (flow, _events) = flow(RecordingLauncher::default());
        let event = flow.finish(&HashMap::new()).await;
        assert_eq!(
            event,
            AttestationEvent::FinishRejected {
                nonce: None,
                error: "id token missing".into()
            }
        );
    }

    #[tokio::test]
    async fn test_finish_with_malformed_token() {
        let (flow, _events) = flow(RecordingLauncher::default());
        let event = flow.finish(&redirect("not-a-jwt")).await;
        assert_eq!(
            event,
            AttestationEvent::FinishRejected {
                nonce: None,
                error: IdTokenError::Segments(1).to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_finish_with_unknown_nonce() {
        let (flow, _events) = flow(RecordingLauncher::default());
        flow.start("https://id.example.com/realms/main").await;

        let event = flow.finish(&redirect(&token(json!({"nonce": "other"})))).await;
        assert_eq!(
            event,
            AttestationEvent::FinishRejected {
                nonce: Some("other".into()),
                error: "unexpected nonce".into()
            }
        );

        let event = flow.finish(&redirect(&token(json!({"sub": "me"})))).await;
        assert!(matches!(event, AttestationEvent::FinishRejected { nonce: None, .. }));
    }

    #[tokio::test]
    async fn test_nonce_is_single_use() {
        let (flow, _events) = flow(RecordingLauncher::default());
        let nonce = flow.start("https://id.example.com/realms/main").await;
        let id_token = token(json!({"nonce": nonce}));

        assert!(matches!(
            flow.finish(&redirect(&id_token)).await,
            AttestationEvent::Fulfilled { .. }
        ));
        assert_eq!(
            flow.finish(&redirect(&id_token)).await,
            AttestationEvent::FinishRejected {
                nonce: Some(nonce.clone()),
                error: "unexpected nonce".into()
            }
        );
        // the replay leaves the fulfilled entry alone
        let store = flow.snapshot().await;
        assert_eq!(store.get(&nonce).unwrap().status, AttestationStatus::Fulfilled);
    }

    #[tokio::test]
    async fn test_start_for_channel_and_record_provided() {
        let (flow, _events) = flow(RecordingLauncher::default());
        let channel = ChannelId::new("c1");
        let nonce = flow
            .start_for("https://id.example.com/realms/main", Some(channel.clone()))
            .await;

        let store = flow.snapshot().await;
        assert_eq!(
            store.get(&nonce).unwrap().requested_on_channel.as_ref(),
            Some(&channel)
        );

        assert!(flow.record_provided(&channel, "tok").await);
        assert!(!flow.record_provided(&channel, "tok").await);
    }
}

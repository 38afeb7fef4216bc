//! Request handlers and method routing.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::channel::SecureChannel;
use crate::jsonrpc::{JsonRpcError, JsonRpcRequest};

/// Receives every inbound request of a channel.
///
/// Called on its own task, so an implementation may issue requests on the
/// same channel. It is responsible for answering with
/// [`SecureChannel::respond`] when the request has an id.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one request.
    async fn on_request(&self, request: JsonRpcRequest, channel: &SecureChannel);
}

/// A set of JSON-RPC methods.
#[async_trait]
pub trait TelepathService: Send + Sync {
    /// Method names this service answers.
    fn methods(&self) -> &[&'static str];

    /// Compute the result of one call.
    async fn handle(
        &self,
        request: &JsonRpcRequest,
        channel: &SecureChannel,
    ) -> Result<Value, JsonRpcError>;
}

/// Routes requests to services by method name and frames their answers.
#[derive(Clone, Default)]
pub struct ServiceRouter {
    routes: HashMap<String, Arc<dyn TelepathService>>,
}

impl ServiceRouter {
    /// Router without services.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve all methods of `service`. Later registrations win.
    pub fn register(mut self, service: Arc<dyn TelepathService>) -> Self {
        for method in service.methods() {
            self.routes.insert((*method).to_owned(), Arc::clone(&service));
        }
        self
    }

    /// True if some service answers `method`.
    pub fn handles(&self, method: &str) -> bool {
        self.routes.contains_key(method)
    }

    /// Run the call and return its outcome without responding.
    pub async fn dispatch(
        &self,
        request: &JsonRpcRequest,
        channel: &SecureChannel,
    ) -> Result<Value, JsonRpcError> {
        match self.routes.get(&request.method) {
            Some(service) => service.handle(request, channel).await,
            None => Err(JsonRpcError::method_not_found(&request.method)),
        }
    }
}

impl fmt::Debug for ServiceRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<_> = self.routes.keys().collect();
        methods.sort();
        f.debug_struct("ServiceRouter")
            .field("methods", &methods)
            .finish()
    }
}

#[async_trait]
impl RequestHandler for ServiceRouter {
    async fn on_request(&self, request: JsonRpcRequest, channel: &SecureChannel) {
        let outcome = self.dispatch(&request, channel).await;
        if request.is_notification() {
            return;
        }
        if let Err(e) = channel.respond(request.id.clone(), outcome).await {
            tracing::warn!("Could not answer {} on {}: {}", request.method, channel.id(), e);
        }
    }
}

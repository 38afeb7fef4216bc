//! The wallet's key-value store ("garbage bin"), served over a channel.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::channel::SecureChannel;
use crate::jsonrpc::{JsonRpcError, JsonRpcRequest};
use crate::service::TelepathService;

/// Stores a value under a key.
pub const ADD_KEY_VALUE_PAIR: &str = "addKeyValuePair";
/// Reads the value stored under a key.
pub const GET_VALUE_FOR_KEY: &str = "getValueForKey";
/// Removes a key.
pub const DELETE_KEY: &str = "deleteKey";

const SUCCESS: &str = "success";

/// Failures of the key-value methods. Discriminants are the wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyValueError {
    /// Parameter `key` missing.
    KeyNotFound = 1,
    /// Parameter `value` missing.
    ValueNotFound = 2,
    /// Nothing stored under the key.
    NoValueForKey = 3,
    /// Key to delete is not in the store.
    NoKeyInStore = 4,
}

impl KeyValueError {
    /// JSON-RPC error code.
    pub fn code(self) -> i64 {
        self as i64
    }

    /// Error message sent to the peer.
    pub fn message(self) -> &'static str {
        match self {
            Self::KeyNotFound => "key not found",
            Self::ValueNotFound => "value not found",
            Self::NoValueForKey => "no value for key",
            Self::NoKeyInStore => "no key in store",
        }
    }
}

impl From<KeyValueError> for JsonRpcError {
    fn from(error: KeyValueError) -> Self {
        JsonRpcError::new(error.code(), error.message())
    }
}

/// In-memory key-value service.
#[derive(Debug, Default)]
pub struct KeyValueService {
    entries: Mutex<HashMap<String, String>>,
}

impl KeyValueService {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Value stored under `key`.
    pub async fn value_for_key(&self, key: &str) -> Option<String> {
        self.entries.lock().await.get(key).cloned()
    }

    /// Number of stored keys.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// True when nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Execute one key-value method.
    pub async fn call(&self, request: &JsonRpcRequest) -> Result<Value, JsonRpcError> {
        let key = request
            .param_str("key")
            .ok_or(KeyValueError::KeyNotFound)?;

        match request.method.as_str() {
            ADD_KEY_VALUE_PAIR => {
                let value = request
                    .param_str("value")
                    .ok_or(KeyValueError::ValueNotFound)?;
                self.entries
                    .lock()
                    .await
                    .insert(key.to_owned(), value.to_owned());
                Ok(json!(SUCCESS))
            }
            GET_VALUE_FOR_KEY => self
                .value_for_key(key)
                .await
                .map(Value::String)
                .ok_or_else(|| KeyValueError::NoValueForKey.into()),
            DELETE_KEY => match self.entries.lock().await.remove(key) {
                Some(_) => Ok(json!(SUCCESS)),
                None => Err(KeyValueError::NoKeyInStore.into()),
            },
            other => Err(JsonRpcError::method_not_found(other)),
        }
    }
}

#[async_trait]
impl TelepathService for KeyValueService {
    fn methods(&self) -> &[&'static str] {
        &[ADD_KEY_VALUE_PAIR, GET_VALUE_FOR_KEY, DELETE_KEY]
    }

    async fn handle(
        &self,
        request: &JsonRpcRequest,
        _channel: &SecureChannel,
    ) -> Result<Value, JsonRpcError> {
        self.call(request).await
    }
}

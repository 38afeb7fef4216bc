//! # Queuing Service
//!
//! Pull-based store-and-forward queues on the relay. Senders enqueue opaque
//! blobs under a queue id; the receiver polls and dequeues them one at a time.
//! Delivery is at-least-once.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};

use crate::{ChannelId, Result, TransportError};

/// Identifier of a relay queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueId(String);

impl QueueId {
    /// Wrap an existing queue identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Queue for one direction of a channel: `<channel id>.<lane>`.
    pub fn for_channel(channel: &ChannelId, lane: &str) -> Self {
        Self(format!("{channel}.{lane}"))
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store-and-forward message queues.
#[async_trait]
pub trait QueuingService: Send + Sync {
    /// Append a message to a queue.
    async fn send(&self, queue_id: &QueueId, message: Bytes) -> Result<()>;

    /// Take the oldest message from a queue, if any.
    async fn receive(&self, queue_id: &QueueId) -> Result<Option<Bytes>>;
}

/// HTTP client for the relay's queuing endpoints.
///
/// - `POST <service_url>/<queue id>` enqueues the request body
/// - `GET <service_url>/<queue id>` answers `200` with a message or `204`
///   when the queue is empty
#[derive(Debug, Clone)]
pub struct QueuingServiceClient {
    base_url: Url,
    client: reqwest::Client,
}

impl QueuingServiceClient {
    /// Create a client for the relay at `service_url`.
    pub fn new(service_url: &str) -> Result<Self> {
        let base_url =
            Url::parse(service_url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(TransportError::InvalidUrl(format!(
                "{service_url} cannot hold a queue path"
            )));
        }
        Ok(Self {
            base_url,
            client: reqwest::Client::new(),
        })
    }

    /// Relay base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn queue_url(&self, queue_id: &QueueId) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push(queue_id.as_str());
        Ok(url)
    }
}

#[async_trait]
impl QueuingService for QueuingServiceClient {
    async fn send(&self, queue_id: &QueueId, message: Bytes) -> Result<()> {
        let url = self.queue_url(queue_id)?;

        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(message)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!("Queued message on {}", queue_id);
            Ok(())
        } else {
            tracing::warn!("Relay refused message for {}: {}", queue_id, status);
            Err(TransportError::Relay {
                status: status.as_u16(),
            })
        }
    }

    async fn receive(&self, queue_id: &QueueId) -> Result<Option<Bytes>> {
        let url = self.queue_url(queue_id)?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| TransportError::Network(e.to_string()))?;
                Ok(Some(body))
            }
            StatusCode::NO_CONTENT => Ok(None),
            status => Err(TransportError::Relay {
                status: status.as_u16(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Serve exactly one canned HTTP response; yields the raw request text.
    async fn serve_once(status_line: &'static str, body: &'static [u8]) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/queues", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let content_length = text[..head_end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }

            let head = format!(
                "{status_line}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(head.as_bytes()).await.unwrap();
            stream.write_all(body).await.unwrap();
            stream.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });

        (url, handle)
    }

    #[test]
    fn test_queue_id_for_channel() {
        let queue = QueueId::for_channel(&ChannelId::new("abc"), "red");
        assert_eq!(queue.as_str(), "abc.red");
    }

    #[test]
    fn test_queue_url() {
        let client = QueuingServiceClient::new("https://relay.example.com/api/").unwrap();
        let url = client.queue_url(&QueueId::new("abc.blue")).unwrap();
        assert_eq!(url.as_str(), "https://relay.example.com/api/abc.blue");

        let client = QueuingServiceClient::new("https://relay.example.com").unwrap();
        let url = client.queue_url(&QueueId::new("abc.red")).unwrap();
        assert_eq!(url.as_str(), "https://relay.example.com/abc.red");
    }

    #[test]
    fn test_invalid_url() {
        assert!(matches!(
            QueuingServiceClient::new("not a url"),
            Err(TransportError::InvalidUrl(_))
        ));
        assert!(matches!(
            QueuingServiceClient::new("mailto:relay@example.com"),
            Err(TransportError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_send_posts_body() {
        let (url, server) = serve_once("HTTP/1.1 200 OK", b"").await;
        let client = QueuingServiceClient::new(&url).unwrap();

        client
            .send(&QueueId::new("abc.red"), Bytes::from_static(b"sealed"))
            .await
            .unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /queues/abc.red HTTP/1.1"));
        assert!(request.ends_with("sealed"));
    }

    #[tokio::test]
    async fn test_send_rejected() {
        let (url, _server) = serve_once("HTTP/1.1 503 Service Unavailable", b"").await;
        let client = QueuingServiceClient::new(&url).unwrap();

        let result = client
            .send(&QueueId::new("abc.red"), Bytes::from_static(b"sealed"))
            .await;
        assert_eq!(result, Err(TransportError::Relay { status: 503 }));
    }

    #[tokio::test]
    async fn test_receive_message() {
        let (url, server) = serve_once("HTTP/1.1 200 OK", b"payload").await;
        let client = QueuingServiceClient::new(&url).unwrap();

        let message = client.receive(&QueueId::new("abc.blue")).await.unwrap();
        assert_eq!(message, Some(Bytes::from_static(b"payload")));

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /queues/abc.blue HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_receive_empty_queue() {
        let (url, _server) = serve_once("HTTP/1.1 204 No Content", b"").await;
        let client = QueuingServiceClient::new(&url).unwrap();

        let message = client.receive(&QueueId::new("abc.blue")).await.unwrap();
        assert_eq!(message, None);
    }

    #[tokio::test]
    async fn test_receive_relay_error() {
        let (url, _server) = serve_once("HTTP/1.1 500 Internal Server Error", b"").await;
        let client = QueuingServiceClient::new(&url).unwrap();

        let result = client.receive(&QueueId::new("abc.blue")).await;
        assert_eq!(result, Err(TransportError::Relay { status: 500 }));
    }

    #[tokio::test]
    async fn test_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let client = QueuingServiceClient::new(&url).unwrap();
        let result = client.receive(&QueueId::new("abc.blue")).await;
        assert!(matches!(result, Err(TransportError::Network(_))));
    }
}

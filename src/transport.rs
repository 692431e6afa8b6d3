//! The HTTP seam of the channel.
//!
//! A [`Transport`] starts exchanges, an [`Exchange`] yields progress events for one
//! of them. Channels only ever talk to these traits so tests can script a server.

mod reqwest_client;

pub use reqwest_client::ReqwestTransport;

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub uri: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn get(uri: Url) -> Self {
        Self {
            method: Method::Get,
            uri,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(uri: Url, body: String) -> Self {
        Self {
            method: Method::Post,
            uri,
            headers: vec![(
                "Content-Type".to_string(),
                "application/x-www-form-urlencoded".to_string(),
            )],
            body: Some(body),
        }
    }

    /// Value of a query parameter of the request uri
    pub fn param(&self, name: &str) -> Option<String> {
        self.uri
            .query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Progress of one exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Response headers arrived
    Status(u16),
    /// Another piece of the body
    Data(Bytes),
    /// Body finished
    Done,
}

#[async_trait]
pub trait Exchange: Send {
    /// Waits for the next progress event.
    ///
    /// Must be cancel safe: dropping the returned future before it resolves
    /// loses no event.
    async fn next_event(&mut self) -> Result<TransportEvent, TransportError>;

    /// Stops the exchange, further events are irrelevant
    fn abort(&mut self);
}

pub trait Transport: Send + Sync + 'static {
    fn send(&self, request: HttpRequest) -> Box<dyn Exchange>;

    /// Whether partial bodies really arrive while the response is still open
    fn supports_streaming(&self) -> bool {
        true
    }
}

use async_trait::async_trait;
use bytes::Bytes;
use futures::{future::BoxFuture, stream::BoxStream, FutureExt, StreamExt};

use super::{Exchange, HttpRequest, Method, Transport, TransportEvent};
use crate::error::TransportError;

/// Transport backed by a shared [`reqwest::Client`]
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Transport for ReqwestTransport {
    fn send(&self, request: HttpRequest) -> Box<dyn Exchange> {
        let mut builder = match request.method {
            Method::Get => self.client.get(request.uri),
            Method::Post => self.client.post(request.uri),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        Box::new(ReqwestExchange {
            state: ExchangeState::Pending(builder.send().boxed()),
        })
    }
}

enum ExchangeState {
    Pending(BoxFuture<'static, reqwest::Result<reqwest::Response>>),
    Streaming(BoxStream<'static, reqwest::Result<Bytes>>),
    Finished,
}

struct ReqwestExchange {
    state: ExchangeState,
}

impl From<reqwest::Error> for TransportError {
    fn from(value: reqwest::Error) -> Self {
        TransportError(value.to_string())
    }
}

#[async_trait]
impl Exchange for ReqwestExchange {
    async fn next_event(&mut self) -> Result<TransportEvent, TransportError> {
        match &mut self.state {
            ExchangeState::Pending(response) => match response.await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    self.state = ExchangeState::Streaming(response.bytes_stream().boxed());
                    Ok(TransportEvent::Status(status))
                }
                Err(e) => {
                    self.state = ExchangeState::Finished;
                    Err(e.into())
                }
            },
            ExchangeState::Streaming(body) => match body.next().await {
                Some(Ok(bytes)) => Ok(TransportEvent::Data(bytes)),
                Some(Err(e)) => {
                    self.state = ExchangeState::Finished;
                    Err(e.into())
                }
                None => {
                    self.state = ExchangeState::Finished;
                    Ok(TransportEvent::Done)
                }
            },
            ExchangeState::Finished => Ok(TransportEvent::Done),
        }
    }

    fn abort(&mut self) {
        tracing::trace!("Aborting http exchange");
        self.state = ExchangeState::Finished;
    }
}

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tracing::info;

use crate::error::BusError;
use crate::transport::{Message, MessageStream, Transport};

/// Transport backed by a NATS server.
///
/// The client reconnects with backoff on its own; publishes issued while
/// disconnected are buffered by the client up to its limits.
pub struct NatsTransport {
  client: async_nats::Client,
}

impl NatsTransport {
  /// Connect to `url`. Failure here is fatal for the caller.
  pub async fn connect(url: &str) -> Result<Self, BusError> {
    let client = async_nats::connect(url)
      .await
      .map_err(|e| BusError::TransportUnavailable(format!("{url}: {e}")))?;

    info!(url, "connected to nats");
    Ok(Self { client })
  }
}

#[async_trait]
impl Transport for NatsTransport {
  async fn publish(&self, subject: &str, reply: Option<&str>, payload: Bytes) -> Result<(), BusError> {
    let result = match reply {
      Some(reply) => {
        self
          .client
          .publish_with_reply(subject.to_string(), reply.to_string(), payload)
          .await
      }
      None => self.client.publish(subject.to_string(), payload).await,
    };

    result.map_err(|e| BusError::Publish {
      subject: subject.to_string(),
      reason: e.to_string(),
    })
  }

  async fn subscribe(&self, pattern: &str) -> Result<MessageStream, BusError> {
    let subscriber = self
      .client
      .subscribe(pattern.to_string())
      .await
      .map_err(|e| BusError::Subscribe {
        subject: pattern.to_string(),
        reason: e.to_string(),
      })?;

    let stream = subscriber.map(|m| Message {
      subject: m.subject.to_string(),
      reply: m.reply.map(|r| r.to_string()),
      payload: m.payload,
    });
    Ok(Box::pin(stream))
  }

  async fn flush(&self) -> Result<(), BusError> {
    self
      .client
      .flush()
      .await
      .map_err(|e| BusError::TransportUnavailable(e.to_string()))
  }

  async fn close(&self) -> Result<(), BusError> {
    self.flush().await
  }
}

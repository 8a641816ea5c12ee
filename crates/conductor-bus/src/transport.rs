use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::de::DeserializeOwned;

use crate::error::BusError;

/// A message as delivered by a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
  pub subject: String,
  pub reply: Option<String>,
  pub payload: Bytes,
}

impl Message {
  pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
    Self {
      subject: subject.into(),
      reply: None,
      payload: payload.into(),
    }
  }

  /// Decode the JSON payload into the subject's message type.
  pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BusError> {
    serde_json::from_slice(&self.payload).map_err(|e| BusError::MalformedMessage {
      subject: self.subject.clone(),
      reason: e.to_string(),
    })
  }
}

/// Stream of messages for one subscription. Ends when the transport closes.
pub type MessageStream = Pin<Box<dyn Stream<Item = Message> + Send>>;

/// A publish/subscribe transport.
///
/// Delivery is at-most-once and fire-and-forget: a successful `publish` only
/// means the transport accepted the message.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn publish(&self, subject: &str, reply: Option<&str>, payload: Bytes) -> Result<(), BusError>;

  /// Subscribe to a subject or wildcard pattern.
  async fn subscribe(&self, pattern: &str) -> Result<MessageStream, BusError>;

  /// Wait until every accepted message has been handed to the server.
  async fn flush(&self) -> Result<(), BusError>;

  /// Stop delivering messages. Open subscription streams end.
  async fn close(&self) -> Result<(), BusError>;
}

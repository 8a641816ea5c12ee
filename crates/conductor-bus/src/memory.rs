use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::BusError;
use crate::subject;
use crate::transport::{Message, MessageStream, Transport};

/// In-process transport based on a tokio broadcast channel.
///
/// Every subscriber sees every message published after it subscribed and
/// filters by its own pattern. A subscriber that falls more than `capacity`
/// messages behind loses the oldest ones, like a slow NATS consumer.
pub struct InMemoryTransport {
  tx: broadcast::Sender<Message>,
  closed: CancellationToken,
  journal: Option<Arc<Mutex<Vec<Message>>>>,
}

impl InMemoryTransport {
  pub fn new(capacity: usize) -> Self {
    let (tx, _) = broadcast::channel(capacity.max(1));
    Self {
      tx,
      closed: CancellationToken::new(),
      journal: None,
    }
  }

  /// Keep a copy of every published message, readable via [`published`].
  ///
  /// [`published`]: InMemoryTransport::published
  pub fn with_journal(mut self) -> Self {
    self.journal = Some(Arc::default());
    self
  }

  /// Messages published so far, oldest first. Empty without a journal.
  pub async fn published(&self) -> Vec<Message> {
    match &self.journal {
      Some(journal) => journal.lock().await.clone(),
      None => Vec::new(),
    }
  }

  /// Published messages whose subject matches `pattern`.
  pub async fn published_to(&self, pattern: &str) -> Vec<Message> {
    self
      .published()
      .await
      .into_iter()
      .filter(|m| subject::matches(pattern, &m.subject))
      .collect()
  }
}

impl Default for InMemoryTransport {
  fn default() -> Self {
    Self::new(1024)
  }
}

#[async_trait]
impl Transport for InMemoryTransport {
  async fn publish(&self, subject: &str, reply: Option<&str>, payload: Bytes) -> Result<(), BusError> {
    if self.closed.is_cancelled() {
      return Err(BusError::TransportUnavailable("transport closed".to_string()));
    }

    let message = Message {
      subject: subject.to_string(),
      reply: reply.map(str::to_string),
      payload,
    };
    if let Some(journal) = &self.journal {
      journal.lock().await.push(message.clone());
    }

    // No subscribers is not an error: delivery is at-most-once.
    let _ = self.tx.send(message);
    Ok(())
  }

  async fn subscribe(&self, pattern: &str) -> Result<MessageStream, BusError> {
    if self.closed.is_cancelled() {
      return Err(BusError::Subscribe {
        subject: pattern.to_string(),
        reason: "transport closed".to_string(),
      });
    }

    let mut rx = self.tx.subscribe();
    let closed = self.closed.clone();
    let pattern = pattern.to_string();

    let stream = async_stream::stream! {
      loop {
        let received = tokio::select! {
          _ = closed.cancelled() => break,
          received = rx.recv() => received,
        };

        match received {
          Ok(message) => {
            if subject::matches(&pattern, &message.subject) {
              yield message;
            }
          }
          Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(pattern = %pattern, skipped, "subscriber lagged, messages dropped");
          }
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    };

    Ok(Box::pin(stream))
  }

  async fn flush(&self) -> Result<(), BusError> {
    Ok(())
  }

  async fn close(&self) -> Result<(), BusError> {
    self.closed.cancel();
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use futures::StreamExt;

  #[tokio::test]
  async fn test_subscriber_receives_matching_messages() {
    let transport = InMemoryTransport::default();
    let mut stream = transport.subscribe("task.*.request").await.unwrap();

    transport
      .publish("workflow.plan.request", None, Bytes::from_static(b"{}"))
      .await
      .unwrap();
    transport
      .publish("task.build.request", Some("task.build.response"), Bytes::from_static(b"{\"n\":1}"))
      .await
      .unwrap();

    let message = stream.next().await.unwrap();
    assert_eq!(message.subject, "task.build.request");
    assert_eq!(message.reply.as_deref(), Some("task.build.response"));
    assert_eq!(message.payload, Bytes::from_static(b"{\"n\":1}"));
  }

  #[tokio::test]
  async fn test_publish_without_subscribers_is_ok() {
    let transport = InMemoryTransport::default();
    transport
      .publish("workflow.logs.stream", None, Bytes::new())
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn test_close_ends_streams_and_rejects_publishes() {
    let transport = InMemoryTransport::default();
    let mut stream = transport.subscribe(">").await.unwrap();

    transport.close().await.unwrap();

    assert!(stream.next().await.is_none());
    let err = transport
      .publish("a.b", None, Bytes::new())
      .await
      .unwrap_err();
    assert!(matches!(err, BusError::TransportUnavailable(_)));
  }

  #[tokio::test]
  async fn test_journal_records_publishes() {
    let transport = InMemoryTransport::default().with_journal();
    transport.publish("task.build.request", None, Bytes::new()).await.unwrap();
    transport.publish("task.test.request", None, Bytes::new()).await.unwrap();
    transport.publish("workflow.logs.stream", None, Bytes::new()).await.unwrap();

    assert_eq!(transport.published().await.len(), 3);
    let tasks = transport.published_to("task.*.request").await;
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[1].subject, "task.test.request");
  }
}

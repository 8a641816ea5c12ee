use std::convert::Infallible;
use std::time::Duration;

use async_stream::stream;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use conductor_bus::{Transport, subject};
use futures::{Stream, StreamExt};
use tracing::debug;

use crate::error::ApiResult;
use crate::state::AppState;

/// Stream every `workflow.events.>` message as a server-sent event named by
/// the event kind.
pub async fn stream_events(
  State(state): State<AppState>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
  let mut messages = state.transport().subscribe(subject::ALL_EVENTS).await?;
  let shutdown = state.shutdown.clone();

  let events = stream! {
    loop {
      let next = tokio::select! {
        _ = shutdown.cancelled() => None,
        message = messages.next() => message,
      };
      let Some(message) = next else {
        break;
      };

      let kind = message
        .subject
        .strip_prefix("workflow.events.")
        .unwrap_or(&message.subject)
        .to_string();
      let data = String::from_utf8_lossy(&message.payload).into_owned();
      yield Ok(Event::default().event(kind).data(data));
    }
    debug!("event stream closed");
  };

  Ok(Sse::new(events).keep_alive(
    KeepAlive::new()
      .interval(Duration::from_secs(15))
      .text("keepalive"),
  ))
}

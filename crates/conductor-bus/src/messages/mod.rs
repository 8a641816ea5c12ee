//! Versioned message types per subject.

pub mod v1;

use bytes::Bytes;
use serde::Serialize;

use crate::error::BusError;

pub use v1::{
  AutofixRequest, AutofixResponse, LogEntry, LogLevel, PatchEnvelope, PlanRequest, PlanResponse,
  ReportedStatus, TaskRequest, TaskResponse,
};

/// Encode a message as a JSON payload.
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, BusError> {
  Ok(Bytes::from(serde_json::to_vec(message)?))
}

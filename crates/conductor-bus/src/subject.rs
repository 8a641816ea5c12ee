//! Subject names and NATS-style matching.
//!
//! Subjects are `.`-separated tokens. In a subscription pattern `*` matches
//! exactly one token and a trailing `>` matches one or more tokens.

pub const PLAN_REQUEST: &str = "workflow.plan.request";
pub const PLAN_RESPONSE: &str = "workflow.plan.response";
pub const AUTOFIX_REQUEST: &str = "workflow.autofix.request";
pub const AUTOFIX_RESPONSE: &str = "workflow.autofix.response";
pub const LOGS_STREAM: &str = "workflow.logs.stream";

/// Every workflow event.
pub const ALL_EVENTS: &str = "workflow.events.>";

/// Every executor's result subject.
pub const TASK_RESPONSES: &str = "task.*.response";

pub fn task_request(task_type: &str) -> String {
  format!("task.{task_type}.request")
}

pub fn task_response(task_type: &str) -> String {
  format!("task.{task_type}.response")
}

/// Subject a workflow event of `kind` (e.g. `run.started`) is published on.
pub fn event(kind: &str) -> String {
  format!("workflow.events.{kind}")
}

/// Whether `subject` is matched by the subscription `pattern`.
pub fn matches(pattern: &str, subject: &str) -> bool {
  let mut subject_tokens = subject.split('.');

  for token in pattern.split('.') {
    match token {
      ">" => return subject_tokens.next().is_some(),
      "*" => {
        if subject_tokens.next().is_none() {
          return false;
        }
      }
      literal => {
        if subject_tokens.next() != Some(literal) {
          return false;
        }
      }
    }
  }

  subject_tokens.next().is_none()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_exact_match() {
    assert!(matches(PLAN_RESPONSE, "workflow.plan.response"));
    assert!(!matches(PLAN_RESPONSE, "workflow.plan.request"));
    assert!(!matches(PLAN_RESPONSE, "workflow.plan"));
    assert!(!matches(PLAN_RESPONSE, "workflow.plan.response.extra"));
  }

  #[test]
  fn test_single_token_wildcard() {
    assert!(matches(TASK_RESPONSES, "task.build.response"));
    assert!(matches(TASK_RESPONSES, "task.security-scan.response"));
    assert!(!matches(TASK_RESPONSES, "task.build.request"));
    assert!(!matches(TASK_RESPONSES, "task.a.b.response"));
  }

  #[test]
  fn test_tail_wildcard() {
    assert!(matches(ALL_EVENTS, "workflow.events.run.started"));
    assert!(matches(ALL_EVENTS, "workflow.events.x"));
    assert!(!matches(ALL_EVENTS, "workflow.events"));
    assert!(!matches(ALL_EVENTS, "workflow.logs.stream"));
  }

  #[test]
  fn test_subject_builders() {
    assert_eq!(task_request("build"), "task.build.request");
    assert_eq!(task_response("build"), "task.build.response");
    assert_eq!(event("run.completed"), "workflow.events.run.completed");
  }
}

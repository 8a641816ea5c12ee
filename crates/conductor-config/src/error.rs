use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to parse workflow document: {0}")]
  Yaml(#[from] serde_yaml::Error),

  #[error("failed to decode workflow document: {0}")]
  Json(#[from] serde_json::Error),

  #[error("missing '{field}' field in {context}")]
  MissingField {
    field: &'static str,
    context: String,
  },

  #[error("duplicate task id '{0}'")]
  DuplicateTask(String),

  #[error("task '{task_id}' has type '{task_type}' which cannot be used as a subject token")]
  InvalidTaskType { task_id: String, task_type: String },
}

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result, bail};
use conductor_orchestrator::OrchestratorConfig;
use serde::{Deserialize, Serialize};

/// Settings file read when `--config` is not given.
pub const DEFAULT_PATH: &str = "conductor.yaml";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
  /// In-process broadcast; publishers and subscribers share the process.
  #[default]
  Memory,
  Nats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
  Json,
  Pretty,
  #[default]
  Compact,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
  /// Filter used when `RUST_LOG` is unset.
  pub level: String,
  pub format: LogFormat,
}

impl Default for LogSettings {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      format: LogFormat::default(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
  pub transport: TransportKind,
  pub nats_url: String,

  /// `sqlite://path.db`, `sqlite::memory:` or `memory` for the non-persistent
  /// in-memory store.
  pub database_url: String,

  pub listen: SocketAddr,
  pub log: LogSettings,
  pub orchestrator: OrchestratorConfig,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      transport: TransportKind::default(),
      nats_url: "nats://127.0.0.1:4222".to_string(),
      database_url: "sqlite::memory:".to_string(),
      listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
      log: LogSettings::default(),
      orchestrator: OrchestratorConfig::default(),
    }
  }
}

impl Settings {
  /// Load settings from `path`, or from [`DEFAULT_PATH`] when it exists,
  /// then apply environment overrides and validate.
  pub fn load(path: Option<&Path>) -> Result<Self> {
    let lookup = |key: &str| std::env::var(key).ok();

    let mut settings = match path {
      Some(path) => Self::read(path, lookup)?,
      None if Path::new(DEFAULT_PATH).exists() => Self::read(Path::new(DEFAULT_PATH), lookup)?,
      None => Self::default(),
    };

    settings.apply_env(lookup)?;
    settings.validate()?;
    Ok(settings)
  }

  fn read(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let content = std::fs::read_to_string(path)
      .with_context(|| format!("failed to read settings file: {}", path.display()))?;
    Self::parse(&content, lookup)
      .with_context(|| format!("failed to parse settings file: {}", path.display()))
  }

  /// Parse a settings document after substituting `${VAR}` references.
  pub fn parse(content: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let content = substitute_env(content, lookup);
    if content.trim().is_empty() {
      return Ok(Self::default());
    }
    Ok(serde_yaml::from_str(&content)?)
  }

  /// Apply `CONDUCTOR_*` environment overrides.
  pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(url) = lookup("CONDUCTOR_NATS_URL") {
      self.nats_url = url;
      self.transport = TransportKind::Nats;
    }
    if let Some(url) = lookup("CONDUCTOR_DATABASE_URL") {
      self.database_url = url;
    }
    if let Some(listen) = lookup("CONDUCTOR_LISTEN") {
      self.listen = listen
        .parse()
        .with_context(|| format!("invalid CONDUCTOR_LISTEN address: {listen}"))?;
    }
    Ok(())
  }

  pub fn validate(&self) -> Result<()> {
    if self.orchestrator.max_concurrent_handlers == 0 {
      bail!("orchestrator.max_concurrent_handlers must be greater than zero");
    }
    if self.orchestrator.store_retry_attempts == 0 {
      bail!("orchestrator.store_retry_attempts must be greater than zero");
    }
    if self.transport == TransportKind::Nats && self.nats_url.trim().is_empty() {
      bail!("nats_url is required when transport is nats");
    }
    if self.database_url.trim().is_empty() {
      bail!("database_url must not be empty");
    }
    Ok(())
  }
}

/// Replace every `${VAR}` that `lookup` resolves. Unresolved references are
/// left as written.
fn substitute_env(content: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
  let mut out = String::with_capacity(content.len());
  let mut rest = content;

  while let Some(start) = rest.find("${") {
    out.push_str(&rest[..start]);
    let after = &rest[start + 2..];
    match after.find('}') {
      Some(end) => {
        let key = &after[..end];
        match lookup(key) {
          Some(value) => out.push_str(&value),
          None => out.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after[end + 1..];
      }
      None => {
        out.push_str(&rest[start..]);
        rest = "";
      }
    }
  }

  out.push_str(rest);
  out
}

#[cfg(test)]
mod tests {
  use std::collections::HashMap;
  use std::time::Duration;

  use super::*;

  fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();
    move |key| vars.get(key).cloned()
  }

  #[test]
  fn test_substitute_env() {
    let lookup = env(&[("HOST", "db.local"), ("EMPTY", "")]);
    assert_eq!(
      substitute_env("url: ${HOST}:${PORT} ${EMPTY}x", &lookup),
      "url: db.local:${PORT} x"
    );
    assert_eq!(substitute_env("tail ${OPEN", &lookup), "tail ${OPEN");
  }

  #[test]
  fn test_parse_with_defaults() {
    let settings = Settings::parse(
      r#"
transport: nats
nats_url: nats://${NATS_HOST}:4222
log:
  format: json
orchestrator:
  task_timeout: 30s
"#,
      env(&[("NATS_HOST", "bus")]),
    )
    .unwrap();

    assert_eq!(settings.transport, TransportKind::Nats);
    assert_eq!(settings.nats_url, "nats://bus:4222");
    assert_eq!(settings.log.format, LogFormat::Json);
    assert_eq!(settings.log.level, "info");
    assert_eq!(
      settings.orchestrator.task_timeout,
      Some(Duration::from_secs(30))
    );
    assert_eq!(settings.orchestrator.max_patch_attempts, 3);
    assert_eq!(settings.database_url, "sqlite::memory:");
  }

  #[test]
  fn test_empty_document_is_default() {
    let settings = Settings::parse("\n", env(&[])).unwrap();
    assert_eq!(settings, Settings::default());
  }

  #[test]
  fn test_env_overrides() {
    let mut settings = Settings::default();
    settings
      .apply_env(env(&[
        ("CONDUCTOR_NATS_URL", "nats://other:4222"),
        ("CONDUCTOR_DATABASE_URL", "sqlite://conductor.db"),
        ("CONDUCTOR_LISTEN", "0.0.0.0:9000"),
      ]))
      .unwrap();

    assert_eq!(settings.transport, TransportKind::Nats);
    assert_eq!(settings.nats_url, "nats://other:4222");
    assert_eq!(settings.database_url, "sqlite://conductor.db");
    assert_eq!(settings.listen.port(), 9000);

    let err = settings
      .apply_env(env(&[("CONDUCTOR_LISTEN", "nowhere")]))
      .unwrap_err();
    assert!(err.to_string().contains("CONDUCTOR_LISTEN"));
  }

  #[test]
  fn test_validate() {
    assert!(Settings::default().validate().is_ok());

    let mut settings = Settings::default();
    settings.orchestrator.max_concurrent_handlers = 0;
    assert!(settings.validate().is_err());

    let mut settings = Settings::default();
    settings.orchestrator.store_retry_attempts = 0;
    assert!(settings.validate().is_err());

    let mut settings = Settings::default();
    settings.transport = TransportKind::Nats;
    settings.nats_url = " ".to_string();
    assert!(settings.validate().is_err());
  }

  #[test]
  fn test_load_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conductor.yaml");
    std::fs::write(&path, "listen: 127.0.0.1:7070\ndatabase_url: memory\n").unwrap();

    let settings = Settings::load(Some(&path)).unwrap();
    assert_eq!(settings.database_url, "memory");

    let missing = Settings::load(Some(&dir.path().join("missing.yaml")));
    assert!(missing.is_err());
  }
}

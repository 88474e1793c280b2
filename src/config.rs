//! Configuration loader and validator for the scheduled table mailer.
use crate::model::{AttachmentRequest, DeliverySpec};
use crate::scheduler::{Schedule, ScheduleError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
    #[error("invalid schedule: {0}")]
    Schedule(#[from] ScheduleError),
}

/// Root configuration struct. JSON config files load as well since YAML is a
/// superset of JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub email: EmailConfig,
    pub db: DbConfig,
    #[serde(default)]
    pub post: Vec<PostConfig>,
    pub time: String,
}

/// SMTP submission server settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmailConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// Database server settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DbConfig {
    #[serde(default = "default_driver")]
    pub driver: String,
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub database: Option<String>,
}

/// One message to assemble and send to every address in `to`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostConfig {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub attachment: Vec<TableAttachmentConfig>,
}

/// A relation exported into a spreadsheet attachment named `excel`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableAttachmentConfig {
    pub table: String,
    pub excel: String,
}

const KNOWN_DRIVERS: &[&str] = &["postgres", "mysql", "sqlite"];

fn default_driver() -> String {
    "postgres".to_string()
}

impl Config {
    /// Parsed trigger schedule for `time`.
    pub fn schedule(&self) -> Result<Schedule, ScheduleError> {
        Schedule::parse(&self.time)
    }

    /// One delivery spec per configured post, in file order.
    pub fn delivery_specs(&self) -> Vec<DeliverySpec> {
        self.post.iter().map(PostConfig::to_delivery_spec).collect()
    }
}

impl PostConfig {
    pub fn to_delivery_spec(&self) -> DeliverySpec {
        DeliverySpec {
            from: self.from.clone(),
            subject: self.subject.clone(),
            body_text: self.body.clone(),
            attachments: self
                .attachment
                .iter()
                .map(|a| AttachmentRequest {
                    relation: a.table.clone(),
                    file_name: a.excel.clone(),
                })
                .collect(),
            recipients: self.to.clone(),
        }
    }
}

impl DbConfig {
    /// Connection URL for the configured driver with credentials
    /// percent-encoded. For `sqlite` the host is taken as the file path.
    pub fn connection_url(&self) -> Result<String, ConfigError> {
        if self.driver == "sqlite" {
            return Ok(format!("sqlite://{}", self.host));
        }
        let mut url = Url::parse(&format!("{}://{}:{}", self.driver, self.host, self.port))
            .map_err(|_| ConfigError::Invalid("db.host is not a valid host name"))?;
        url.set_username(&self.username)
            .map_err(|_| ConfigError::Invalid("db.username cannot be encoded"))?;
        url.set_password(Some(&self.password))
            .map_err(|_| ConfigError::Invalid("db.password cannot be encoded"))?;
        if let Some(db) = self.database.as_deref().filter(|d| !d.trim().is_empty()) {
            url.set_path(&format!("/{}", db.trim_start_matches('/')));
        }
        Ok(url.to_string())
    }
}

/// Load configuration from a YAML (or JSON) file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.email.host.trim().is_empty() {
        return Err(ConfigError::Invalid("email.host must be non-empty"));
    }
    if cfg.email.port == 0 {
        return Err(ConfigError::Invalid("email.port must be > 0"));
    }
    if cfg.email.username.trim().is_empty() || cfg.email.password.is_empty() {
        return Err(ConfigError::Invalid("email.username and email.password must be non-empty"));
    }

    if !KNOWN_DRIVERS.contains(&cfg.db.driver.as_str()) {
        return Err(ConfigError::Invalid("db.driver must be one of postgres, mysql, sqlite"));
    }
    if cfg.db.host.trim().is_empty() {
        return Err(ConfigError::Invalid("db.host must be non-empty"));
    }
    if cfg.db.driver != "sqlite" {
        if cfg.db.port == 0 {
            return Err(ConfigError::Invalid("db.port must be > 0"));
        }
        if cfg.db.username.trim().is_empty() || cfg.db.password.is_empty() {
            return Err(ConfigError::Invalid("db.username and db.password must be non-empty"));
        }
    }

    for post in &cfg.post {
        if post.from.trim().is_empty() {
            return Err(ConfigError::Invalid("post.from must be non-empty"));
        }
        if post.to.is_empty() || post.to.iter().any(|r| r.trim().is_empty()) {
            return Err(ConfigError::Invalid("post.to must list at least one non-empty address"));
        }
        for att in &post.attachment {
            if att.table.trim().is_empty() {
                return Err(ConfigError::Invalid("post.attachment.table must be non-empty"));
            }
            if att.excel.trim().is_empty() {
                return Err(ConfigError::Invalid("post.attachment.excel must be non-empty"));
            }
        }
    }

    if cfg.time.trim().is_empty() {
        return Err(ConfigError::Invalid("time must be non-empty"));
    }
    cfg.schedule()?;

    Ok(())
}

/// Example configuration covering every field.
pub fn example() -> &'static str {
    r#"email:
  host: "smtp.example.com"
  port: 465
  username: "USERNAME"
  password: "PASSWORD"

db:
  driver: "postgres"
  host: "10.0.0.5"
  port: 5432
  username: "USERNAME"
  password: "PASSWORD"
  database: "reports"

post:
  - from: "reports@example.com"
    to:
      - "alice@example.com"
      - "bob@example.com"
    subject: "Daily export"
    body: "Attached are today's tables."
    attachment:
      - table: "TEST_01"
        excel: "01.xlsx"
      - table: "TEST_02"
        excel: "02.xlsx"

time: "0 0 0 * * *"
"#
}

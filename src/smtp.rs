//! Outbound mail: the transport seam the job sends through and its SMTPS
//! implementation on `lettre`.

use crate::config::EmailConfig;
use async_trait::async_trait;
use lettre::address::{AddressError, Envelope};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use std::fmt;
use thiserror::Error;
use tracing::{error, info, instrument};

#[derive(Debug, Error)]
pub enum SendError {
    #[error("invalid address {address:?}: {source}")]
    Address {
        address: String,
        #[source]
        source: AddressError,
    },
    #[error("invalid envelope: {0}")]
    Envelope(#[from] lettre::error::Error),
    #[error("smtp error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// Delivers an already encoded message to exactly one envelope recipient.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, from: &str, to: &str, message: &[u8]) -> Result<(), SendError>;
}

/// SMTP submission over implicit TLS (SMTPS) with PLAIN authentication.
///
/// Server certificates are always verified. Connections are not pooled: every
/// `send` opens, authenticates and closes its own session.
pub struct SmtpTransport {
    inner: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
    port: u16,
}

impl fmt::Debug for SmtpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpTransport")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl SmtpTransport {
    pub fn from_config(cfg: &EmailConfig) -> Result<Self, SendError> {
        let inner = AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.host)?
            .port(cfg.port)
            .credentials(Credentials::new(cfg.username.clone(), cfg.password.clone()))
            .authentication(vec![Mechanism::Plain])
            .build();
        Ok(Self {
            inner,
            host: cfg.host.clone(),
            port: cfg.port,
        })
    }
}

fn parse_address(address: &str) -> Result<Address, SendError> {
    address
        .trim()
        .parse::<Address>()
        .map_err(|source| SendError::Address {
            address: address.to_string(),
            source,
        })
}

#[async_trait]
impl MailTransport for SmtpTransport {
    #[instrument(skip(self, message), fields(host = %self.host, port = self.port, bytes = message.len()))]
    async fn send(&self, from: &str, to: &str, message: &[u8]) -> Result<(), SendError> {
        let envelope = Envelope::new(Some(parse_address(from)?), vec![parse_address(to)?])?;
        match self.inner.send_raw(&envelope, message).await {
            Ok(response) => {
                info!(code = %response.code(), "message accepted");
                Ok(())
            }
            Err(err) => {
                error!(%err, "smtp delivery failed");
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email_cfg() -> EmailConfig {
        EmailConfig {
            host: "smtp.example.com".into(),
            port: 465,
            username: "user".into(),
            password: "secret".into(),
        }
    }

    #[test]
    fn debug_hides_credentials() {
        let transport = SmtpTransport::from_config(&email_cfg()).unwrap();
        let dbg = format!("{transport:?}");
        assert!(dbg.contains("smtp.example.com"));
        assert!(!dbg.contains("secret"));
    }

    #[tokio::test]
    async fn bad_recipient_fails_before_connecting() {
        let transport = SmtpTransport::from_config(&email_cfg()).unwrap();
        let err = transport
            .send("reports@example.com", "not an address", b"Subject: x\r\n\r\n")
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Address { ref address, .. } if address == "not an address"));
    }
}

//! Mail delivery

use apolo_core::config::MailerConfig;
use apolo_core::AppResult;
use async_trait::async_trait;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

/// Sends one message; retries belong to the caller
#[async_trait]
pub trait Mailer: Send + Sync {
    fn from_address(&self) -> &str;

    async fn send(&self, message: &MailMessage) -> AppResult<()>;
}

/// Mailer that records messages in the log instead of sending them
pub struct LogMailer {
    server: String,
    from: String,
}

impl LogMailer {
    pub fn new(config: &MailerConfig) -> Self {
        Self {
            server: config.server.clone(),
            from: config.from_address.clone(),
        }
    }
}

#[async_trait]
impl Mailer for LogMailer {
    fn from_address(&self) -> &str {
        &self.from
    }

    async fn send(&self, message: &MailMessage) -> AppResult<()> {
        info!(
            server = %self.server,
            to = ?message.to,
            subject = %message.subject,
            "Mail: {}",
            message.body
        );
        Ok(())
    }
}

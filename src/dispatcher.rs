//! Outbound delivery collaborator for the NotificationWorker.
//!
//! Push/SMS gateways are external services; the default dispatcher logs
//! those channels (the gateway integration plugs in behind the same trait)
//! and delivers email over SMTP when a relay is configured.

use anyhow::Result;
use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
    message::{Mailbox, Message, header::ContentType},
    transport::smtp::{authentication::Credentials, client::TlsParametersBuilder},
};
use std::sync::Arc;
use tracing::info;

use crate::notifications::{NotificationChannel, NotificationJob};
use crate::users::User;

#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Deliver `job` to `recipient` over one channel. The caller has
    /// already verified the recipient is addressable on that channel.
    async fn dispatch(
        &self,
        channel: NotificationChannel,
        recipient: &User,
        job: &NotificationJob,
    ) -> Result<()>;
}

pub type DynDispatcher = Arc<dyn Dispatcher>;

/// SMTP relay settings; `None` disables the email channel transport.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_email: String,
    pub from_name: String,
}

fn create_mailbox(name: &str, email: &str) -> Result<Mailbox> {
    Ok(Mailbox::new(
        Some(name.to_string()),
        email
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid email address '{}': {}", email, e))?,
    ))
}

/// Default production dispatcher: SMTP for email, structured log delivery
/// for the externally-gatewayed channels.
pub struct OutboundDispatcher {
    mailer: Option<AsyncSmtpTransport<Tokio1Executor>>,
    from_email: String,
    from_name: String,
}

impl OutboundDispatcher {
    /// Log-only dispatcher for development and tests.
    pub fn log_only() -> Self {
        Self {
            mailer: None,
            from_email: String::new(),
            from_name: String::new(),
        }
    }

    pub fn with_smtp(settings: SmtpSettings) -> Result<Self> {
        let creds = Credentials::new(settings.username.clone(), settings.password.clone());

        // Port 465 is implicit TLS; 587 and friends use STARTTLS.
        let mailer = if settings.port == 465 {
            let tls_params = TlsParametersBuilder::new(settings.server.clone())
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create TLS parameters: {}", e))?;
            AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.server)?
                .port(settings.port)
                .credentials(creds)
                .tls(lettre::transport::smtp::client::Tls::Wrapper(tls_params))
                .build()
        } else {
            let tls_params = TlsParametersBuilder::new(settings.server.clone())
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create TLS parameters: {}", e))?;
            AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.server)?
                .port(settings.port)
                .credentials(creds)
                .tls(lettre::transport::smtp::client::Tls::Required(tls_params))
                .build()
        };

        Ok(Self {
            mailer: Some(mailer),
            from_email: settings.from_email,
            from_name: settings.from_name,
        })
    }

    async fn send_email(&self, recipient: &User, job: &NotificationJob) -> Result<()> {
        let mailer = self
            .mailer
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No SMTP relay configured"))?;
        let to_email = recipient
            .email
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Recipient has no email address"))?;

        let email = Message::builder()
            .from(create_mailbox(&self.from_name, &self.from_email)?)
            .to(create_mailbox(&recipient.display_name(), to_email)?)
            .subject(&job.title)
            .header(ContentType::TEXT_PLAIN)
            .body(job.body.clone())?;

        mailer.send(email).await?;
        Ok(())
    }
}

#[async_trait]
impl Dispatcher for OutboundDispatcher {
    async fn dispatch(
        &self,
        channel: NotificationChannel,
        recipient: &User,
        job: &NotificationJob,
    ) -> Result<()> {
        match channel {
            NotificationChannel::Email if self.mailer.is_some() => {
                self.send_email(recipient, job).await?;
            }
            _ => {
                info!(
                    user_id = %recipient.id,
                    channel = ?channel,
                    title = %job.title,
                    "Delivered notification"
                );
            }
        }
        metrics::counter!("notify.dispatched_total", "channel" => format!("{channel:?}"))
            .increment(1);
        Ok(())
    }
}

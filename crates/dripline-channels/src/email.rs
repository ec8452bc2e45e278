//! SMTP transport — sends rendered templates through an SMTP relay (async lettre).

use std::time::Duration;

use async_trait::async_trait;
use dripline_core::config::SmtpConfig;
use dripline_core::error::{DriplineError, Result};
use dripline_core::traits::DeliveryTransport;
use dripline_core::types::{LeadIdentity, MessageTemplate};
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as LettreMessage, Tokio1Executor};

use crate::render::render_message;

/// SMTP delivery transport. The relay connection pool is built once.
pub struct SmtpTransport {
    from: Mailbox,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpTransport {
    pub fn new(config: SmtpConfig) -> Result<Self> {
        let from = sender_mailbox(&config)?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| DriplineError::Config(format!("SMTP relay: {e}")))?
            .port(config.port)
            .timeout(Some(Duration::from_secs(config.timeout_secs)));
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        Ok(Self {
            from,
            mailer: builder.build(),
        })
    }
}

fn sender_mailbox(config: &SmtpConfig) -> Result<Mailbox> {
    let raw = match &config.from_name {
        Some(name) => format!("{name} <{}>", config.from_email),
        None => config.from_email.clone(),
    };
    raw.parse()
        .map_err(|e| DriplineError::Config(format!("Invalid from address: {e}")))
}

/// Build the outgoing message for one lead.
fn build_message(from: &Mailbox, template: &MessageTemplate, lead: &LeadIdentity) -> Result<LettreMessage> {
    let to = lead
        .email
        .as_deref()
        .ok_or_else(|| DriplineError::recipient(format!("lead {} has no email address", lead.id)))?;
    let to_mailbox: Mailbox = to
        .parse()
        .map_err(|e| DriplineError::recipient(format!("Invalid to: {e}")))?;

    let rendered = render_message(template, lead);
    LettreMessage::builder()
        .from(from.clone())
        .to(to_mailbox)
        .subject(rendered.subject)
        .header(ContentType::TEXT_PLAIN)
        .body(rendered.body)
        .map_err(|e| DriplineError::delivery(format!("Build email: {e}")))
}

#[async_trait]
impl DeliveryTransport for SmtpTransport {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, template: &MessageTemplate, lead: &LeadIdentity) -> Result<()> {
        let message = build_message(&self.from, template, lead)?;
        self.mailer
            .send(message)
            .await
            .map_err(|e| DriplineError::delivery(format!("SMTP send: {e}")))?;
        tracing::info!(
            "📤 Email sent to {} (template {})",
            lead.email.as_deref().unwrap_or_default(),
            template.id
        );
        Ok(())
    }
}

//! Generic HTTP webhook transport — POSTs the rendered message as JSON.

use std::time::Duration;

use async_trait::async_trait;
use dripline_core::config::WebhookConfig;
use dripline_core::error::{DriplineError, Result};
use dripline_core::traits::DeliveryTransport;
use dripline_core::types::{LeadIdentity, MessageTemplate};

use crate::render::render_message;

pub struct WebhookTransport {
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookTransport {
    pub fn new(config: WebhookConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DriplineError::Config(format!("Webhook client: {e}")))?;
        Ok(Self { config, client })
    }
}

/// JSON body sent to the webhook.
fn build_payload(template: &MessageTemplate, lead: &LeadIdentity) -> serde_json::Value {
    let rendered = render_message(template, lead);
    serde_json::json!({
        "template_id": template.id,
        "lead_id": lead.id,
        "to": {
            "email": lead.email,
            "external_id": lead.external_id,
            "first_name": lead.first_name,
            "last_name": lead.last_name,
        },
        "subject": rendered.subject,
        "body": rendered.body,
        "traits": lead.traits,
    })
}

#[async_trait]
impl DeliveryTransport for WebhookTransport {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, template: &MessageTemplate, lead: &LeadIdentity) -> Result<()> {
        let mut req = self
            .client
            .post(&self.config.url)
            .json(&build_payload(template, lead));
        for (key, value) in &self.config.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| DriplineError::delivery(format!("Webhook send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::info!("✅ Webhook delivered to {}: {}", self.config.url, template.id);
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(DriplineError::delivery(format!("Webhook error {status}: {body}")))
        }
    }
}

//! Log-only transport — records the rendered message and always succeeds.
//! Useful for local runs and as the last link of a failover chain.

use async_trait::async_trait;
use dripline_core::error::Result;
use dripline_core::traits::DeliveryTransport;
use dripline_core::types::{LeadIdentity, MessageTemplate};

use crate::render::render_message;

#[derive(Debug, Default)]
pub struct LogTransport;

impl LogTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DeliveryTransport for LogTransport {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, template: &MessageTemplate, lead: &LeadIdentity) -> Result<()> {
        let message = render_message(template, lead);
        let to = lead.email.as_deref().unwrap_or(&lead.external_id);
        tracing::info!("📨 [log] to={} subject={:?}", to, message.subject);
        tracing::debug!("📨 [log] body={:?}", message.body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dripline_core::types::{AccountId, Traits};

    #[tokio::test]
    async fn test_log_transport_always_succeeds() {
        let account = AccountId::parse("a1").unwrap();
        let template = MessageTemplate::new(&account, "t", "Hello", "Body");
        let lead = LeadIdentity {
            id: "l1".into(),
            account_id: "a1".into(),
            external_id: "ext".into(),
            email: None,
            first_name: None,
            last_name: None,
            traits: Traits::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(LogTransport::new().send(&template, &lead).await.is_ok());
    }
}

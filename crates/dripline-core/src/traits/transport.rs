//! Delivery transport trait — the outbound provider capability.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{LeadIdentity, MessageTemplate};

/// Sends one rendered template to one lead.
///
/// A returned error is recorded against the step; it never aborts a pass.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    /// Provider name, used in logs and health reports.
    fn name(&self) -> &str;

    async fn send(&self, template: &MessageTemplate, lead: &LeadIdentity) -> Result<()>;
}

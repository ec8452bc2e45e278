//! # Dripline Channels
//! Delivery transport implementations.
//!
//! Every transport implements [`dripline_core::traits::DeliveryTransport`]
//! and is injected into the dispatch engine; nothing here knows about runs
//! or steps.

pub mod email;
pub mod failover;
pub mod log;
pub mod render;
pub mod webhook;

use std::sync::Arc;

use dripline_core::config::DeliveryConfig;
use dripline_core::error::{DriplineError, Result};
use dripline_core::traits::DeliveryTransport;

pub use email::SmtpTransport;
pub use failover::{BenchPolicy, FailoverTransport};
pub use log::LogTransport;
pub use webhook::WebhookTransport;

/// Build a single transport by provider name.
pub fn transport_by_name(name: &str, config: &DeliveryConfig) -> Result<Box<dyn DeliveryTransport>> {
    match name {
        "log" => Ok(Box::new(LogTransport::new())),
        "smtp" => {
            let smtp = config
                .smtp
                .as_ref()
                .ok_or_else(|| DriplineError::Config("delivery.smtp section is missing".into()))?;
            Ok(Box::new(SmtpTransport::new(smtp.clone())?))
        }
        "webhook" => {
            let webhook = config.webhook.as_ref().ok_or_else(|| {
                DriplineError::Config("delivery.webhook section is missing".into())
            })?;
            Ok(Box::new(WebhookTransport::new(webhook.clone())?))
        }
        other => Err(DriplineError::Config(format!(
            "unknown delivery provider '{other}'"
        ))),
    }
}

/// Build the configured transport, wrapping it in a failover chain when a
/// fallback provider is set.
pub fn transport_from_config(config: &DeliveryConfig) -> Result<Arc<dyn DeliveryTransport>> {
    let primary = transport_by_name(&config.provider, config)?;
    match config.fallback.as_deref() {
        Some(fallback) if fallback != config.provider => {
            let fallback = transport_by_name(fallback, config)?;
            tracing::info!(
                "📮 Delivery via {} (fallback: {})",
                primary.name(),
                fallback.name()
            );
            Ok(Arc::new(FailoverTransport::new(
                vec![primary, fallback],
                BenchPolicy::from_config(config),
            )))
        }
        _ => {
            tracing::info!("📮 Delivery via {}", primary.name());
            Ok(Arc::from(primary))
        }
    }
}

//! Delivery failover chain.
//!
//! Links are tried in order until one accepts the message. A link whose
//! transport keeps failing is benched for a cooldown and skipped meanwhile;
//! once the cooldown ends it gets one attempt before being benched again.
//! A [`DriplineError::Recipient`] rejection is about the lead, not the
//! transport: it neither counts against the link nor moves on to the next one.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dripline_core::config::DeliveryConfig;
use dripline_core::error::{DriplineError, Result};
use dripline_core::traits::DeliveryTransport;
use dripline_core::types::{LeadIdentity, MessageTemplate};

/// When a failing link is benched, and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchPolicy {
    pub max_failures: u32,
    pub cooldown: Duration,
}

impl Default for BenchPolicy {
    fn default() -> Self {
        Self::from_config(&DeliveryConfig::default())
    }
}

impl BenchPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_failures: config.failover_max_failures.max(1),
            cooldown: Duration::from_secs(config.failover_cooldown_secs),
        }
    }
}

#[derive(Debug, Default)]
struct LinkState {
    strikes: u32,
    benched_until: Option<Instant>,
}

struct Link {
    transport: Box<dyn DeliveryTransport>,
    state: Mutex<LinkState>,
}

impl Link {
    fn state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn available(&self, now: Instant) -> bool {
        self.state().benched_until.is_none_or(|until| now >= until)
    }

    fn clear(&self) {
        *self.state() = LinkState::default();
    }

    /// Count a transport failure. Returns true when this strike benched the link.
    fn strike(&self, policy: &BenchPolicy, now: Instant) -> bool {
        let mut state = self.state();
        state.strikes += 1;
        if state.strikes >= policy.max_failures {
            state.benched_until = Some(now + policy.cooldown);
            return true;
        }
        false
    }
}

/// Ordered chain of transports; the first one is primary.
pub struct FailoverTransport {
    links: Vec<Link>,
    policy: BenchPolicy,
}

impl FailoverTransport {
    /// An empty chain fails every send.
    pub fn new(transports: Vec<Box<dyn DeliveryTransport>>, policy: BenchPolicy) -> Self {
        let links = transports
            .into_iter()
            .map(|transport| Link {
                transport,
                state: Mutex::new(LinkState::default()),
            })
            .collect();
        Self { links, policy }
    }
}

#[async_trait]
impl DeliveryTransport for FailoverTransport {
    fn name(&self) -> &str {
        self.links
            .first()
            .map(|l| l.transport.name())
            .unwrap_or("failover")
    }

    async fn send(&self, template: &MessageTemplate, lead: &LeadIdentity) -> Result<()> {
        let mut last_error = None;

        for (idx, link) in self.links.iter().enumerate() {
            let name = link.transport.name();
            if !link.available(Instant::now()) {
                tracing::debug!("⏭️ Transport {name} is benched, skipping");
                continue;
            }

            match link.transport.send(template, lead).await {
                Ok(()) => {
                    link.clear();
                    if idx > 0 {
                        tracing::info!("🔄 Lead {} delivered via fallback {name}", lead.id);
                    }
                    return Ok(());
                }
                Err(e @ DriplineError::Recipient(_)) => {
                    tracing::warn!("⚠️ Transport {name} cannot address lead {}: {e}", lead.id);
                    return Err(e);
                }
                Err(e) => {
                    if link.strike(&self.policy, Instant::now()) {
                        tracing::warn!(
                            "🚫 Transport {name} benched for {}s: {e}",
                            self.policy.cooldown.as_secs()
                        );
                    } else {
                        tracing::warn!("⚠️ Transport {name} failed: {e}");
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            DriplineError::delivery(format!(
                "all {} delivery transport(s) are benched",
                self.links.len()
            ))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dripline_core::types::{AccountId, Traits};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy)]
    enum Behaviour {
        Accept,
        Down,
        NoAddress,
    }

    struct Stub {
        name: &'static str,
        behaviour: Behaviour,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DeliveryTransport for Stub {
        fn name(&self) -> &str {
            self.name
        }

        async fn send(&self, _: &MessageTemplate, lead: &LeadIdentity) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Accept => Ok(()),
                Behaviour::Down => Err(DriplineError::delivery(format!("{} down", self.name))),
                Behaviour::NoAddress => Err(DriplineError::recipient(format!(
                    "lead {} has no email address",
                    lead.id
                ))),
            }
        }
    }

    fn stub(name: &'static str, behaviour: Behaviour) -> (Box<dyn DeliveryTransport>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Box::new(Stub {
                name,
                behaviour,
                calls: calls.clone(),
            }),
            calls,
        )
    }

    fn policy(max_failures: u32, cooldown_secs: u64) -> BenchPolicy {
        BenchPolicy {
            max_failures,
            cooldown: Duration::from_secs(cooldown_secs),
        }
    }

    fn fixtures() -> (MessageTemplate, LeadIdentity) {
        let account = AccountId::parse("a1").unwrap();
        let lead = LeadIdentity {
            id: "l1".into(),
            account_id: "a1".into(),
            external_id: "ext".into(),
            email: Some("a@b.com".into()),
            first_name: None,
            last_name: None,
            traits: Traits::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        (MessageTemplate::new(&account, "t", "s", "b"), lead)
    }

    #[test]
    fn test_policy_from_config() {
        let config = DeliveryConfig {
            failover_max_failures: 0,
            failover_cooldown_secs: 15,
            ..Default::default()
        };
        assert_eq!(BenchPolicy::from_config(&config), policy(1, 15));
        assert_eq!(BenchPolicy::default(), policy(3, 60));
    }

    #[tokio::test]
    async fn test_falls_back_when_primary_fails() {
        let (primary, primary_calls) = stub("primary", Behaviour::Down);
        let (fallback, fallback_calls) = stub("fallback", Behaviour::Accept);
        let chain = FailoverTransport::new(vec![primary, fallback], BenchPolicy::default());
        let (template, lead) = fixtures();

        assert!(chain.send(&template, &lead).await.is_ok());
        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 1);
        assert_eq!(chain.name(), "primary");
        assert_eq!(chain.links[0].state().strikes, 1);
    }

    #[tokio::test]
    async fn test_primary_is_benched_after_repeated_failures() {
        let (primary, primary_calls) = stub("primary", Behaviour::Down);
        let (fallback, _) = stub("fallback", Behaviour::Accept);
        let chain = FailoverTransport::new(vec![primary, fallback], policy(3, 600));
        let (template, lead) = fixtures();

        for _ in 0..5 {
            chain.send(&template, &lead).await.unwrap();
        }
        assert_eq!(primary_calls.load(Ordering::SeqCst), 3);
        assert!(!chain.links[0].available(Instant::now()));
        assert!(chain.links[1].available(Instant::now()));
    }

    #[tokio::test]
    async fn test_benched_link_returns_after_cooldown() {
        let (primary, primary_calls) = stub("primary", Behaviour::Down);
        let (fallback, _) = stub("fallback", Behaviour::Accept);
        let chain = FailoverTransport::new(vec![primary, fallback], policy(1, 0));
        let (template, lead) = fixtures();

        chain.send(&template, &lead).await.unwrap();
        chain.send(&template, &lead).await.unwrap();
        // a zero cooldown expires immediately, so every send tries the primary once
        assert_eq!(primary_calls.load(Ordering::SeqCst), 2);
        assert_eq!(chain.links[0].state().strikes, 2);
    }

    #[tokio::test]
    async fn test_success_clears_strikes() {
        let (primary, _) = stub("primary", Behaviour::Accept);
        let chain = FailoverTransport::new(vec![primary], policy(3, 600));
        chain.links[0].strike(&chain.policy, Instant::now());
        let (template, lead) = fixtures();

        chain.send(&template, &lead).await.unwrap();
        let state = chain.links[0].state();
        assert_eq!(state.strikes, 0);
        assert!(state.benched_until.is_none());
    }

    #[tokio::test]
    async fn test_recipient_rejection_skips_fallback() {
        let (primary, _) = stub("smtp", Behaviour::NoAddress);
        let (fallback, fallback_calls) = stub("log", Behaviour::Accept);
        let chain = FailoverTransport::new(vec![primary, fallback], policy(1, 600));
        let (template, lead) = fixtures();

        for _ in 0..3 {
            let err = chain.send(&template, &lead).await.unwrap_err();
            assert!(matches!(err, DriplineError::Recipient(_)));
        }
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 0);
        // not the transport's fault, so the link stays in rotation
        assert_eq!(chain.links[0].state().strikes, 0);
        assert!(chain.links[0].available(Instant::now()));
    }

    #[tokio::test]
    async fn test_all_failing_returns_last_error() {
        let (a, _) = stub("a", Behaviour::Down);
        let (b, _) = stub("b", Behaviour::Down);
        let chain = FailoverTransport::new(vec![a, b], BenchPolicy::default());
        let (template, lead) = fixtures();

        let err = chain.send(&template, &lead).await.unwrap_err();
        assert_eq!(err.to_string(), "Delivery error: b down");
    }

    #[tokio::test]
    async fn test_everything_benched_or_empty_fails() {
        let (template, lead) = fixtures();
        let empty = FailoverTransport::new(Vec::new(), BenchPolicy::default());
        assert_eq!(empty.name(), "failover");
        assert!(empty.send(&template, &lead).await.is_err());

        let (a, calls) = stub("a", Behaviour::Down);
        let chain = FailoverTransport::new(vec![a], policy(1, 600));
        chain.send(&template, &lead).await.unwrap_err();
        let err = chain.send(&template, &lead).await.unwrap_err();
        assert_eq!(err.to_string(), "Delivery error: all 1 delivery transport(s) are benched");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

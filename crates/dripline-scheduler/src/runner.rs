//! Background poll loop that runs a dispatch pass for every account with
//! due work. Uses `tokio::time::interval`, so it sleeps between ticks.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use dripline_core::config::DispatchConfig;
use dripline_core::error::Result;
use dripline_core::traits::AutomationStore;
use dripline_core::types::{AccountId, DispatchSummary};
use futures::StreamExt;
use tokio::task::JoinHandle;

use crate::service::AutomationService;

pub struct Dispatcher {
    service: Arc<AutomationService>,
    interval: Duration,
    /// Empty means every account with due steps.
    accounts: Vec<AccountId>,
    concurrency: usize,
}

impl Dispatcher {
    pub fn new(service: Arc<AutomationService>, config: &DispatchConfig) -> Result<Self> {
        let accounts = config
            .accounts
            .iter()
            .map(|raw| AccountId::parse(raw))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            service,
            interval: Duration::from_secs(config.interval_secs.max(1)),
            accounts,
            concurrency: config.max_concurrent_accounts.max(1),
        })
    }

    /// One poll tick. A failing account is logged and does not stop the others.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<DispatchSummary> {
        let now = now.trunc_subsecs(3);
        let stale_before = self
            .service
            .engine()
            .settings()
            .stale_claim
            .map(|age| now - age);
        let due = self
            .service
            .store()
            .accounts_with_due_steps(now, stale_before)
            .await?;

        let selected: Vec<AccountId> = due
            .into_iter()
            .filter(|account| self.accounts.is_empty() || self.accounts.contains(account))
            .collect();

        let service = &self.service;
        let mut passes = futures::stream::iter(selected)
            .map(|account| async move {
                let result = service.dispatch_due_at(&account, None, now).await;
                (account, result)
            })
            .buffer_unordered(self.concurrency);

        let mut total = DispatchSummary::default();
        while let Some((account, result)) = passes.next().await {
            match result {
                Ok(summary) => {
                    total.matched += summary.matched;
                    total.sent += summary.sent;
                    total.failed += summary.failed;
                }
                Err(e) => tracing::error!("❌ Dispatch for account {account} failed: {e}"),
            }
        }
        Ok(total)
    }

    /// Poll forever.
    pub async fn run(self) {
        tracing::info!(
            "⏰ Dispatcher started (check every {}s, {})",
            self.interval.as_secs(),
            if self.accounts.is_empty() {
                "all accounts".to_string()
            } else {
                format!("{} account(s)", self.accounts.len())
            }
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            match self.tick(Utc::now()).await {
                Ok(total) if total.matched > 0 => tracing::info!(
                    "📣 Tick: matched={} sent={} failed={}",
                    total.matched,
                    total.sent,
                    total.failed
                ),
                Ok(_) => {}
                Err(e) => tracing::warn!("⚠️ Dispatcher tick failed: {e}"),
            }
        }
    }
}

/// Spawn the poll loop as a background tokio task.
pub fn spawn_dispatcher(
    service: Arc<AutomationService>,
    config: &DispatchConfig,
) -> Result<JoinHandle<()>> {
    let dispatcher = Dispatcher::new(service, config)?;
    Ok(tokio::spawn(dispatcher.run()))
}

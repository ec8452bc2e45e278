//! Run status synchronisation.

use chrono::{DateTime, Utc};
use dripline_core::error::Result;
use dripline_core::traits::AutomationStore;
use dripline_core::types::RunStatus;

/// Recompute a run's aggregate status after its steps changed.
///
/// `Error` is sticky and `Completed` is final, so either short-circuits
/// without writing. Otherwise the run completes once it has no open steps.
/// Returns whether the run moved to `Completed`.
pub async fn sync_run_status(
    store: &dyn AutomationStore,
    run_id: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let Some(run) = store.get_run_by_id(run_id).await? else {
        return Ok(false);
    };
    if matches!(run.status, RunStatus::Error | RunStatus::Completed) {
        return Ok(false);
    }
    if store.count_open_steps(run_id).await? > 0 {
        return Ok(false);
    }

    let completed = store.complete_run(run_id, now).await?;
    if completed {
        tracing::info!("🏁 Run {} completed", run_id);
    }
    Ok(completed)
}

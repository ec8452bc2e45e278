//! Lead resolution: find-or-create a lead within an account and merge the
//! supplied fields into it.

use chrono::{DateTime, Utc};
use dripline_core::error::{DriplineError, Result};
use dripline_core::traits::{AutomationStore, LeadUpdate};
use dripline_core::types::{AccountId, LeadIdentity, LeadInput, new_id};

/// Trimmed, non-empty value or `None`.
fn clean(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Reject lead input that carries neither an email nor an external id.
pub fn validate_lead_input(input: &LeadInput) -> Result<()> {
    if clean(&input.email).is_none() && clean(&input.external_id).is_none() {
        return Err(DriplineError::validation(
            "Lead email or external id is required",
        ));
    }
    Ok(())
}

fn to_update(input: &LeadInput) -> LeadUpdate {
    LeadUpdate {
        email: clean(&input.email),
        external_id: clean(&input.external_id),
        first_name: clean(&input.first_name),
        last_name: clean(&input.last_name),
        traits: input.traits.clone(),
    }
}

/// Find the lead matching `input` (external id first, then email) and merge
/// the provided fields into it, or create it.
///
/// Exactly one write happens per call: a merge or an insert. When a
/// concurrent enrollment inserts the same external id first, the losing
/// insert writes nothing and the input is merged into the winner instead.
pub async fn resolve_lead(
    store: &dyn AutomationStore,
    account: &AccountId,
    input: &LeadInput,
    now: DateTime<Utc>,
) -> Result<LeadIdentity> {
    validate_lead_input(input)?;
    let update = to_update(input);

    let existing = store
        .find_lead(account, update.external_id.as_deref(), update.email.as_deref())
        .await?;
    if let Some(lead) = existing {
        tracing::debug!("👤 Lead {} matched, merging fields", lead.id);
        return store.merge_lead(&lead.id, &update, now).await;
    }

    let Some(external_id) = update.external_id.clone().or_else(|| update.email.clone()) else {
        return Err(DriplineError::validation(
            "Lead email or external id is required",
        ));
    };
    let lead = LeadIdentity {
        id: new_id(),
        account_id: account.as_str().to_string(),
        external_id,
        email: update.email.clone(),
        first_name: update.first_name.clone(),
        last_name: update.last_name.clone(),
        traits: update.traits.clone(),
        created_at: now,
        updated_at: now,
    };

    if store.insert_lead(&lead).await? {
        tracing::info!("👤 Lead created: {} ({})", lead.external_id, lead.id);
        return Ok(lead);
    }

    // Lost the insert race on (account, external_id).
    let winner = store
        .find_lead(account, Some(&lead.external_id), update.email.as_deref())
        .await?
        .ok_or_else(|| {
            DriplineError::Database(format!(
                "lead '{}' conflicted on insert but could not be found",
                lead.external_id
            ))
        })?;
    tracing::debug!("👤 Lead {} created concurrently, merging", winner.id);
    store.merge_lead(&winner.id, &update, now).await
}

//! The cascade engine: policy-driven propagation of strip/remove through
//! the link graph.
//!
//! The engine is a bounded iterative loop rather than a recursion, so
//! termination is a configuration-visible property (`max_cascade_cycles`).
//! Within one cycle every product owning link rows is a candidate, unless
//! it is younger than the grace period; a product stripped or removed by
//! one cycle can trigger the next.

use chrono::Utc;

use crate::archive::Archive;
use crate::error::{Error, Result};
use crate::plugin::{CascadeAction, CascadeRule};

pub(crate) async fn run(archive: &mut Archive) -> Result<()> {
    let mut first_error: Option<Error> = None;
    for cycle in 0..archive.max_cascade_cycles {
        let changes = run_cycle(archive, &mut first_error).await?;
        tracing::debug!(cycle, changes, "cascade cycle complete");
        if changes == 0 {
            break;
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn run_cycle(archive: &mut Archive, first_error: &mut Option<Error>) -> Result<u32> {
    let now = Utc::now().naive_utc();
    let grace = chrono::Duration::minutes(archive.cascade_grace_period);
    let owners = archive.database.link_owners().await?;

    let mut changes = 0;
    for owner in owners {
        // A freshly catalogued product gets a reprieve: a late ingestion
        // may still re-establish its sources.
        if archive.cascade_grace_period > 0 && owner.metadata_date > now - grace {
            continue;
        }
        let sources = archive.database.sources_of(owner.uuid).await?;
        if sources.is_empty() {
            continue;
        }
        let states = archive.database.source_state(&sources).await?;
        let removed = sources.len() - states.len();
        let stripped = states.iter().filter(|s| !s.archived).count();
        let remaining = states.len() - stripped;

        let rule = match rule_for(archive, owner.uuid).await {
            Ok(rule) => rule,
            Err(err) => {
                if first_error.is_none() {
                    *first_error = Some(err);
                }
                continue;
            }
        };
        let action = if removed == sources.len() {
            rule.on_sources_removed()
        } else if remaining == 0 && removed == 0 {
            rule.on_sources_stripped()
        } else {
            // Mixed or partially intact source sets never cascade.
            CascadeAction::None
        };

        let outcome = match action {
            CascadeAction::None => Ok(false),
            CascadeAction::Strip => {
                if owner.archived {
                    archive.strip_product(owner.uuid, false).await.map(|_| true)
                } else {
                    Ok(false)
                }
            }
            CascadeAction::Remove => archive.remove_product(owner.uuid, true).await.map(|_| true),
        };
        match outcome {
            Ok(true) => changes += 1,
            Ok(false) => {}
            Err(err) => {
                tracing::error!(uuid = %owner.uuid, error = %err, "cascade action failed");
                if first_error.is_none() {
                    *first_error = Some(err);
                }
            }
        }
    }
    Ok(changes)
}

async fn rule_for(archive: &mut Archive, uuid: uuid::Uuid) -> Result<CascadeRule> {
    let properties = {
        let expr = crate::archive::uuid_condition(uuid);
        let mut rows = archive
            .database
            .search(Some(&expr), &crate::database::SearchOptions::default())
            .await?;
        match rows.pop() {
            Some(properties) => properties,
            // Already gone (removed earlier in this cycle).
            None => return Ok(CascadeRule::Ignore),
        }
    };
    Ok(properties
        .product_type()
        .and_then(|name| archive.registry.product_type(name).ok())
        .map(|plugin| plugin.cascade_rule())
        .unwrap_or(CascadeRule::Ignore))
}

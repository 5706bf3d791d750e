//! Periodic cleanup of stale unverified users.
//!
//! Runs on a fixed interval (default hourly) until cancelled. The sweep is a
//! direct store call: no hooks, no locks beyond the store's own.

use std::sync::Arc;
use std::time::Duration;

use depot_query::{Clause, Operator, Query};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::registry::ResourceRegistry;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3600);

/// Start the sweeper task. Returns its join handle; cancel the token to
/// stop it.
pub fn start(
    registry: Arc<ResourceRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The immediate first tick would race startup loading; skip it.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => sweep(&registry).await,
            }
        }
    })
}

/// Remove users whose verification window is over:
/// `isVerified = false` and `verificationExpires < now`.
pub async fn sweep(registry: &ResourceRegistry) {
    let Some(users) = registry.get("users") else {
        return;
    };
    let mut query = Query::default();
    query
        .filter
        .clauses
        .push(Clause::eq("isVerified", Value::Bool(false)));
    query.filter.clauses.push(Clause::new(
        "verificationExpires",
        Operator::Lt,
        json!(depot_core::now_rfc3339()),
    ));

    match users.store().remove(&query).await {
        Ok(0) => {}
        Ok(removed) => info!(removed, "swept expired unverified users"),
        Err(err) => warn!(error = %err, "user sweep failed"),
    }
}

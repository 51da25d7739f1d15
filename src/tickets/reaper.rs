//! Background removal of dead tickets.
//!
//! Validity never depends on the reaper: every read checks expiry itself. The reaper only
//! reclaims storage for tickets that are expired or revoked, and for consumed tickets
//! whose lifetime has ended.

use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{debug, error, info};

use super::{
    Ticket, TicketState,
    store::{StoreError, TicketStore},
};

/// A consumed ticket stays until its own deadline so replays keep failing with
/// `TicketAlreadyConsumed` whether or not the reaper ran in between.
fn is_reapable(ticket: &Ticket, now: DateTime<Utc>) -> bool {
    match ticket.state(now) {
        TicketState::Created | TicketState::Active => false,
        TicketState::Expired | TicketState::Revoked => true,
        TicketState::Consumed => ticket.expires_at().map_or_else(
            || {
                ticket
                    .expiration
                    .is_expired(ticket.created_at, ticket.last_used_at, 0, now)
            },
            |deadline| now >= deadline,
        ),
    }
}

/// Delete every reapable ticket once. Returns how many were removed.
///
/// # Errors
/// Returns an error if the store cannot be listed or written.
pub async fn reap_once(store: &dyn TicketStore, now: DateTime<Utc>) -> Result<usize, StoreError> {
    let dead: Vec<String> = store
        .tickets(None)
        .await?
        .into_iter()
        .filter(|ticket| is_reapable(ticket, now))
        .map(|ticket| ticket.id)
        .collect();
    if dead.is_empty() {
        return Ok(0);
    }
    store.delete(&dead).await
}

pub fn spawn_reaper(store: Arc<dyn TicketStore>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_seconds = interval.as_secs(),
            store = store.name(),
            "ticket reaper started"
        );
        loop {
            sleep(interval).await;
            match reap_once(store.as_ref(), Utc::now()).await {
                Ok(0) => {}
                Ok(removed) => debug!(removed, "reaped tickets"),
                Err(err) => error!("ticket reaper failed: {err}"),
            }
        }
    })
}

//! Ticket store contract and the in-memory implementation.
//!
//! Writes go through [`TicketStore::commit`], which applies a [`TicketBatch`] atomically:
//! every written ticket must still carry the version the caller read (new tickets carry 0),
//! and the optional [`SessionGuard`] is evaluated against the principal's current sessions
//! inside the same critical section.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{Instrument, debug, info_span};

use super::{Ticket, TicketData, TicketKind};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("ticket store unavailable: {0}")]
    Unavailable(String),
    #[error("ticket serialization failed: {0}")]
    Serialization(String),
    #[error("ticket store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Worth retrying with backoff.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Concurrent-session constraint checked atomically with a commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionGuard {
    /// No other live SSO session may exist for the principal.
    UniquePrincipal {
        principal_id: String,
        exclude: Vec<String>,
        now: DateTime<Utc>,
    },
    /// No other live SSO session may exist for the principal at the same service.
    /// `service: None` stands for logins without a service.
    UniquePrincipalPerService {
        principal_id: String,
        service: Option<String>,
        exclude: Vec<String>,
        now: DateTime<Utc>,
    },
}

impl SessionGuard {
    #[must_use]
    pub fn principal_id(&self) -> &str {
        match self {
            Self::UniquePrincipal { principal_id, .. }
            | Self::UniquePrincipalPerService { principal_id, .. } => principal_id,
        }
    }

    /// True when an existing session conflicts with the one being written.
    pub fn is_violated<'a>(&self, tickets: impl IntoIterator<Item = &'a Ticket>) -> bool {
        let (principal_id, exclude, now) = match self {
            Self::UniquePrincipal {
                principal_id,
                exclude,
                now,
            }
            | Self::UniquePrincipalPerService {
                principal_id,
                exclude,
                now,
                ..
            } => (principal_id, exclude, *now),
        };

        tickets.into_iter().any(|ticket| {
            if ticket.principal_id != *principal_id
                || exclude.contains(&ticket.id)
                || !ticket.is_usable(now)
            {
                return false;
            }
            let TicketData::TicketGranting {
                sso,
                origin_service,
                services,
                ..
            } = &ticket.data
            else {
                return false;
            };
            if !sso {
                return false;
            }
            match self {
                Self::UniquePrincipal { .. } => true,
                Self::UniquePrincipalPerService { service, .. } => match service {
                    None => origin_service.is_none(),
                    Some(service) => {
                        origin_service.as_deref() == Some(service.as_str())
                            || services.contains(service)
                    }
                },
            }
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct TicketBatch {
    pub writes: Vec<Ticket>,
    pub deletes: Vec<String>,
    pub guard: Option<SessionGuard>,
}

impl TicketBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn write(mut self, ticket: Ticket) -> Self {
        self.writes.push(ticket);
        self
    }

    #[must_use]
    pub fn delete(mut self, id: impl Into<String>) -> Self {
        self.deletes.push(id.into());
        self
    }

    #[must_use]
    pub fn guarded(mut self, guard: Option<SessionGuard>) -> Self {
        self.guard = guard;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The named ticket changed since it was read (or already exists).
    Stale(String),
    SessionRejected,
}

#[async_trait]
pub trait TicketStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// # Errors
    /// Returns an error if the backend fails.
    async fn get(&self, id: &str) -> Result<Option<Ticket>, StoreError>;

    /// Apply a batch atomically.
    ///
    /// # Errors
    /// Returns an error if the backend fails; conflicts are reported as outcomes.
    async fn commit(&self, batch: TicketBatch) -> Result<CommitOutcome, StoreError>;

    /// Remove tickets; missing ids are ignored. Returns how many were removed.
    ///
    /// # Errors
    /// Returns an error if the backend fails.
    async fn delete(&self, ids: &[String]) -> Result<usize, StoreError>;

    /// # Errors
    /// Returns an error if the backend fails.
    async fn tickets(&self, kind: Option<TicketKind>) -> Result<Vec<Ticket>, StoreError>;

    /// # Errors
    /// Returns an error if the backend fails.
    async fn tickets_for_principal(&self, principal_id: &str) -> Result<Vec<Ticket>, StoreError>;

    /// # Errors
    /// Returns an error if the backend is unreachable.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Single-process store. One write lock serializes commits, which makes every commit,
/// including its session guard, linearizable.
#[derive(Debug, Default)]
pub struct MemoryTicketStore {
    tickets: RwLock<HashMap<String, Ticket>>,
}

impl MemoryTicketStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TicketStore for MemoryTicketStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, id: &str) -> Result<Option<Ticket>, StoreError> {
        Ok(self.tickets.read().await.get(id).cloned())
    }

    async fn commit(&self, batch: TicketBatch) -> Result<CommitOutcome, StoreError> {
        let span = info_span!(
            "store.commit",
            store = "memory",
            writes = batch.writes.len(),
            deletes = batch.deletes.len()
        );
        async move {
            let mut tickets = self.tickets.write().await;

            if let Some(guard) = &batch.guard {
                if guard.is_violated(tickets.values()) {
                    debug!(principal = guard.principal_id(), "session guard rejected commit");
                    return Ok(CommitOutcome::SessionRejected);
                }
            }

            for ticket in &batch.writes {
                let expected = tickets.get(&ticket.id).map_or(0, |existing| existing.version);
                if ticket.version != expected {
                    return Ok(CommitOutcome::Stale(ticket.id.clone()));
                }
            }

            for mut ticket in batch.writes {
                ticket.version += 1;
                tickets.insert(ticket.id.clone(), ticket);
            }
            for id in &batch.deletes {
                tickets.remove(id);
            }
            Ok(CommitOutcome::Committed)
        }
        .instrument(span)
        .await
    }

    async fn delete(&self, ids: &[String]) -> Result<usize, StoreError> {
        let mut tickets = self.tickets.write().await;
        Ok(ids.iter().filter(|id| tickets.remove(*id).is_some()).count())
    }

    async fn tickets(&self, kind: Option<TicketKind>) -> Result<Vec<Ticket>, StoreError> {
        Ok(self
            .tickets
            .read()
            .await
            .values()
            .filter(|ticket| kind.map_or(true, |kind| ticket.kind() == kind))
            .cloned()
            .collect())
    }

    async fn tickets_for_principal(&self, principal_id: &str) -> Result<Vec<Ticket>, StoreError> {
        Ok(self
            .tickets
            .read()
            .await
            .values()
            .filter(|ticket| ticket.principal_id == principal_id)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{
        authn::Authentication,
        principal::Principal,
        tickets::{ExpirationPolicy, TicketStatus},
    };
    use std::{collections::BTreeSet, sync::Arc};

    fn tgt(id: &str, principal: &str, sso: bool, origin: Option<&str>) -> Ticket {
        Ticket::new(
            id.to_string(),
            principal,
            ExpirationPolicy::NeverExpires,
            None,
            TicketData::TicketGranting {
                authentication: Authentication::new(Principal::new(principal), "t", "h", "pwd"),
                sso,
                origin_service: origin.map(str::to_string),
                services: BTreeSet::new(),
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn versions_guard_concurrent_writes() {
        let store = MemoryTicketStore::new();
        let ticket = tgt("TGT-1", "casuser", true, None);
        assert_eq!(
            store.commit(TicketBatch::new().write(ticket.clone())).await.unwrap(),
            CommitOutcome::Committed
        );
        // creating the same id twice is a conflict
        assert_eq!(
            store.commit(TicketBatch::new().write(ticket)).await.unwrap(),
            CommitOutcome::Stale("TGT-1".to_string())
        );

        let read = store.get("TGT-1").await.unwrap().unwrap();
        assert_eq!(read.version, 1);

        let mut first = read.clone();
        first.status = TicketStatus::Consumed;
        let mut second = read;
        second.status = TicketStatus::Revoked;

        assert_eq!(
            store.commit(TicketBatch::new().write(first)).await.unwrap(),
            CommitOutcome::Committed
        );
        assert_eq!(
            store.commit(TicketBatch::new().write(second)).await.unwrap(),
            CommitOutcome::Stale("TGT-1".to_string())
        );
        let stored = store.get("TGT-1").await.unwrap().unwrap();
        assert_eq!(stored.status, TicketStatus::Consumed);
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn failed_batch_writes_nothing() {
        let store = MemoryTicketStore::new();
        store
            .commit(TicketBatch::new().write(tgt("TGT-1", "a", true, None)))
            .await
            .unwrap();
        let outcome = store
            .commit(
                TicketBatch::new()
                    .write(tgt("TGT-2", "a", true, None))
                    .write(tgt("TGT-1", "a", true, None)),
            )
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Stale("TGT-1".to_string()));
        assert!(store.get("TGT-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unique_principal_guard() {
        let store = MemoryTicketStore::new();
        store
            .commit(TicketBatch::new().write(tgt("TGT-1", "casuser", true, None)))
            .await
            .unwrap();

        let guard = SessionGuard::UniquePrincipal {
            principal_id: "casuser".to_string(),
            exclude: vec![],
            now: Utc::now(),
        };
        let outcome = store
            .commit(
                TicketBatch::new()
                    .write(tgt("TGT-2", "casuser", true, None))
                    .guarded(Some(guard.clone())),
            )
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::SessionRejected);

        // other principals are unaffected
        let other = SessionGuard::UniquePrincipal {
            principal_id: "other".to_string(),
            exclude: vec![],
            now: Utc::now(),
        };
        assert_eq!(
            store
                .commit(
                    TicketBatch::new()
                        .write(tgt("TGT-3", "other", true, None))
                        .guarded(Some(other))
                )
                .await
                .unwrap(),
            CommitOutcome::Committed
        );
    }

    #[test]
    fn per_service_guard_only_matches_same_service() {
        let existing = [tgt("TGT-1", "casuser", true, Some("https://a.example.org"))];
        let same = SessionGuard::UniquePrincipalPerService {
            principal_id: "casuser".to_string(),
            service: Some("https://a.example.org".to_string()),
            exclude: vec![],
            now: Utc::now(),
        };
        let other = SessionGuard::UniquePrincipalPerService {
            principal_id: "casuser".to_string(),
            service: Some("https://b.example.org".to_string()),
            exclude: vec![],
            now: Utc::now(),
        };
        let no_service = SessionGuard::UniquePrincipalPerService {
            principal_id: "casuser".to_string(),
            service: None,
            exclude: vec![],
            now: Utc::now(),
        };
        assert!(same.is_violated(&existing));
        assert!(!other.is_violated(&existing));
        assert!(!no_service.is_violated(&existing));
    }

    #[test]
    fn guard_ignores_non_sso_and_excluded_sessions() {
        let existing = [
            tgt("TGT-1", "casuser", false, None),
            tgt("TGT-2", "casuser", true, None),
        ];
        let guard = SessionGuard::UniquePrincipal {
            principal_id: "casuser".to_string(),
            exclude: vec!["TGT-2".to_string()],
            now: Utc::now(),
        };
        assert!(!guard.is_violated(&existing));
    }

    #[tokio::test]
    async fn concurrent_guarded_commits_admit_one() {
        let store = Arc::new(MemoryTicketStore::new());
        let mut handles = Vec::new();
        for n in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let guard = SessionGuard::UniquePrincipal {
                    principal_id: "casuser".to_string(),
                    exclude: vec![],
                    now: Utc::now(),
                };
                store
                    .commit(
                        TicketBatch::new()
                            .write(tgt(&format!("TGT-{n}"), "casuser", true, None))
                            .guarded(Some(guard)),
                    )
                    .await
                    .unwrap()
            }));
        }
        let mut committed = 0;
        for handle in handles {
            if handle.await.unwrap() == CommitOutcome::Committed {
                committed += 1;
            }
        }
        assert_eq!(committed, 1);
        assert_eq!(store.tickets_for_principal("casuser").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_and_list() {
        let store = MemoryTicketStore::new();
        store
            .commit(
                TicketBatch::new()
                    .write(tgt("TGT-1", "a", true, None))
                    .write(tgt("TGT-2", "b", true, None)),
            )
            .await
            .unwrap();
        assert_eq!(
            store
                .tickets(Some(TicketKind::TicketGranting))
                .await
                .unwrap()
                .len(),
            2
        );
        assert!(store.tickets(Some(TicketKind::Service)).await.unwrap().is_empty());
        assert_eq!(
            store
                .delete(&["TGT-1".to_string(), "missing".to_string()])
                .await
                .unwrap(),
            1
        );
        assert!(store.get("TGT-1").await.unwrap().is_none());
    }
}

//! Ticket-granting engine: creates SSO sessions, grants service and proxy tickets,
//! consumes single-use tickets and cascades revocation.
//!
//! Every read re-checks the whole granting chain, so a ticket is only valid while its
//! TGT (and any intermediate PGT) still exists and is usable.

pub mod sso;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::Arc,
};
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;

use crate::{
    authn::Authentication,
    error::CasError,
    registry::RegisteredService,
    tickets::{
        ExpirationPolicies, ExpirationPolicy, Ticket, TicketData, TicketKind, TicketState,
        TicketStatus,
        id::TicketIdGenerator,
        retry::RetryPolicy,
        store::{CommitOutcome, TicketBatch, TicketStore},
    },
};

pub use self::sso::{ConcurrentSessionPolicy, SsoPolicy};

/// Optimistic update attempts before giving up on a contended ticket.
const MAX_CAS_ATTEMPTS: usize = 5;
/// Longest granting chain followed (TGT, PGT, PGT, ...).
const MAX_CHAIN_DEPTH: usize = 16;

/// How a new SSO session is being established.
#[derive(Clone, Debug, Default)]
pub struct SessionRequest {
    pub service: Option<String>,
    /// Holder receives a `TGC` cookie.
    pub sso: bool,
    /// TGT the browser held before this login; it is revoked once the new one is stored.
    pub replaces: Option<String>,
}

impl SessionRequest {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sso: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_service(mut self, service: Option<String>) -> Self {
        self.service = service;
        self
    }

    #[must_use]
    pub fn with_sso(mut self, sso: bool) -> Self {
        self.sso = sso;
        self
    }

    #[must_use]
    pub fn replacing(mut self, tgt_id: Option<String>) -> Self {
        self.replaces = tgt_id;
        self
    }
}

/// A usable ticket together with the authentication at the root of its chain.
#[derive(Clone, Debug)]
pub struct ValidatedTicket {
    pub ticket: Ticket,
    pub authentication: Authentication,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TicketStats {
    pub unexpired_tgts: usize,
    pub expired_tgts: usize,
    pub unexpired_sts: usize,
    pub expired_sts: usize,
    pub ticket_suffix: Option<String>,
}

pub struct TicketEngine {
    store: Arc<dyn TicketStore>,
    ids: TicketIdGenerator,
    policies: ExpirationPolicies,
    sso: SsoPolicy,
    retry: RetryPolicy,
}

impl TicketEngine {
    #[must_use]
    pub fn new(store: Arc<dyn TicketStore>) -> Self {
        Self {
            store,
            ids: TicketIdGenerator::default(),
            policies: ExpirationPolicies::default(),
            sso: SsoPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_ids(mut self, ids: TicketIdGenerator) -> Self {
        self.ids = ids;
        self
    }

    #[must_use]
    pub fn with_policies(mut self, policies: ExpirationPolicies) -> Self {
        self.policies = policies;
        self
    }

    #[must_use]
    pub fn with_sso(mut self, sso: SsoPolicy) -> Self {
        self.sso = sso;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn TicketStore> {
        &self.store
    }

    #[must_use]
    pub const fn ids(&self) -> &TicketIdGenerator {
        &self.ids
    }

    #[must_use]
    pub const fn policies(&self) -> &ExpirationPolicies {
        &self.policies
    }

    #[must_use]
    pub const fn sso(&self) -> &SsoPolicy {
        &self.sso
    }

    async fn load(&self, id: &str) -> Result<Option<Ticket>, CasError> {
        self.retry.run("get", || self.store.get(id)).await
    }

    async fn commit(&self, operation: &str, batch: TicketBatch) -> Result<CommitOutcome, CasError> {
        self.retry
            .run(operation, || self.store.commit(batch.clone()))
            .await
    }

    /// Load a ticket of `kind` that is currently usable, without its chain.
    async fn usable(
        &self,
        id: &str,
        kind: TicketKind,
        now: DateTime<Utc>,
    ) -> Result<Ticket, CasError> {
        let ticket = self
            .load(id)
            .await?
            .filter(|ticket| ticket.kind() == kind)
            .ok_or_else(|| CasError::TicketNotFound(id.to_string()))?;
        check_state(&ticket, now)?;
        Ok(ticket)
    }

    /// Walk the granting chain, requiring every ancestor to exist and be usable, and
    /// return the authentication closest to `ticket`.
    async fn chain_authentication(
        &self,
        ticket: &Ticket,
        now: DateTime<Utc>,
    ) -> Result<Authentication, CasError> {
        let mut authentication = ticket.authentication().cloned();
        let mut next = ticket.granting_ticket_id.clone();
        let mut depth = 0;
        while let Some(parent_id) = next {
            depth += 1;
            if depth > MAX_CHAIN_DEPTH {
                return Err(CasError::Internal(format!(
                    "granting chain of {} is too deep",
                    ticket.id
                )));
            }
            let parent = self
                .load(&parent_id)
                .await?
                .ok_or_else(|| CasError::TicketNotFound(ticket.id.clone()))?;
            match parent.state(now) {
                TicketState::Created | TicketState::Active => {}
                TicketState::Expired => return Err(CasError::TicketExpired(ticket.id.clone())),
                TicketState::Revoked | TicketState::Consumed => {
                    return Err(CasError::TicketNotFound(ticket.id.clone()));
                }
            }
            if authentication.is_none() {
                authentication = parent.authentication().cloned();
            }
            next = parent.granting_ticket_id;
        }
        authentication.ok_or_else(|| {
            CasError::Internal(format!("ticket {} has no authentication", ticket.id))
        })
    }

    /// Look up a usable ticket without consuming it.
    ///
    /// # Errors
    /// `TicketNotFound` / `TicketExpired` / `TicketAlreadyConsumed` for unusable tickets or
    /// chains, `StoreUnavailable` when the store cannot be reached.
    pub async fn find_usable(&self, id: &str, kind: TicketKind) -> Result<ValidatedTicket, CasError> {
        let now = Utc::now();
        let ticket = self.usable(id, kind, now).await?;
        let authentication = self.chain_authentication(&ticket, now).await?;
        Ok(ValidatedTicket {
            ticket,
            authentication,
        })
    }

    /// Create a ticket-granting ticket for a completed authentication.
    ///
    /// # Errors
    /// `AuthenticationFailed` without a principal, `ConcurrentSessionRejected` when the
    /// SSO policy forbids another session, `StoreUnavailable` on store failure.
    #[instrument(skip_all, fields(principal = %authentication.principal.id))]
    pub async fn create_ticket_granting_ticket(
        &self,
        authentication: Authentication,
        request: &SessionRequest,
    ) -> Result<Ticket, CasError> {
        let principal_id = authentication.principal.id.trim().to_string();
        if principal_id.is_empty() {
            return Err(CasError::AuthenticationFailed);
        }

        let now = Utc::now();
        let mut authentication = authentication;
        let mut exclude = Vec::new();
        if let Some(previous_id) = &request.replaces {
            if let Some(previous) = self.load(previous_id).await? {
                if let Some(previous_auth) = previous.authentication().filter(|previous_auth| {
                    previous_auth.principal.id == authentication.principal.id
                }) {
                    authentication = authentication.renewed_after(previous_auth.auth_time);
                }
                exclude.push(previous.id);
            }
        }

        let ticket = Ticket::new(
            self.ids.next(TicketKind::TicketGranting)?,
            principal_id.clone(),
            self.policies.ticket_granting_ticket,
            None,
            TicketData::TicketGranting {
                authentication,
                sso: request.sso,
                origin_service: request.service.clone(),
                services: BTreeSet::new(),
            },
            now,
        );
        let guard = if request.sso {
            self.sso
                .login_guard(&principal_id, request.service.as_deref(), exclude, now)
        } else {
            None
        };

        match self
            .commit(
                "create_tgt",
                TicketBatch::new().write(ticket.clone()).guarded(guard),
            )
            .await?
        {
            CommitOutcome::Committed => {}
            CommitOutcome::SessionRejected => {
                warn!(
                    policy = %self.sso.concurrent(),
                    "rejected login, principal already has an active session"
                );
                return Err(CasError::ConcurrentSessionRejected);
            }
            CommitOutcome::Stale(id) => {
                return Err(CasError::Internal(format!("duplicate ticket id {id}")));
            }
        }

        if let Some(previous_id) = &request.replaces {
            self.revoke_ticket_granting_ticket(previous_id).await?;
        }
        info!(tgt = %ticket.id, sso = request.sso, "created ticket-granting ticket");
        Ok(ticket)
    }

    /// Grant a service ticket from an SSO session.
    ///
    /// # Errors
    /// `TicketNotFound` / `TicketExpired` for an unusable TGT, `ServiceUnauthorized` when
    /// the service's access strategy denies the principal, `ConcurrentSessionRejected`
    /// under the per-service policy.
    #[instrument(skip(self, registered), fields(registered_service = registered.id))]
    pub async fn grant_service_ticket(
        &self,
        tgt_id: &str,
        service: &str,
        registered: &RegisteredService,
    ) -> Result<Ticket, CasError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = Utc::now();
            let mut tgt = self.usable(tgt_id, TicketKind::TicketGranting, now).await?;
            let Some(authentication) = tgt.authentication() else {
                return Err(CasError::Internal(format!("{tgt_id} has no authentication")));
            };
            registered.access_strategy.authorize(&authentication.principal)?;

            let from_new_login = tgt.is_new();
            let (sso, first_visit) = match &mut tgt.data {
                TicketData::TicketGranting { sso, services, .. } => {
                    (*sso, services.insert(service.to_string()))
                }
                _ => return Err(CasError::TicketNotFound(tgt_id.to_string())),
            };
            tgt.touch(now);

            let ticket = Ticket::new(
                self.ids.next(TicketKind::Service)?,
                tgt.principal_id.clone(),
                self.policies.service_ticket,
                Some(tgt.id.clone()),
                TicketData::Service {
                    service: service.to_string(),
                    from_new_login,
                },
                now,
            );
            let guard = if sso && first_visit {
                self.sso
                    .grant_guard(&tgt.principal_id, service, vec![tgt.id.clone()], now)
            } else {
                None
            };

            match self
                .commit(
                    "grant_st",
                    TicketBatch::new()
                        .write(tgt)
                        .write(ticket.clone())
                        .guarded(guard),
                )
                .await?
            {
                CommitOutcome::Committed => {
                    debug!(st = %ticket.id, "granted service ticket");
                    return Ok(ticket);
                }
                CommitOutcome::SessionRejected => return Err(CasError::ConcurrentSessionRejected),
                CommitOutcome::Stale(id) => debug!(ticket = %id, "ticket changed, retrying grant"),
            }
        }
        Err(CasError::Internal(format!("{tgt_id} is contended")))
    }

    /// Persist a proxy-granting ticket for a validated service or proxy ticket once its
    /// callback has been confirmed.
    ///
    /// # Errors
    /// `StoreUnavailable` on store failure.
    pub async fn grant_proxy_granting_ticket(
        &self,
        pgt_id: String,
        validated: &ValidatedTicket,
        callback_url: &str,
    ) -> Result<Ticket, CasError> {
        let mut proxies = vec![callback_url.to_string()];
        if let TicketData::Proxy { proxies: chain, .. } = &validated.ticket.data {
            proxies.extend(chain.iter().cloned());
        }
        let ticket = Ticket::new(
            pgt_id,
            validated.ticket.principal_id.clone(),
            self.policies.proxy_granting_ticket,
            validated.ticket.granting_ticket_id.clone(),
            TicketData::ProxyGranting {
                authentication: validated.authentication.clone(),
                proxies,
            },
            Utc::now(),
        );
        match self
            .commit("grant_pgt", TicketBatch::new().write(ticket.clone()))
            .await?
        {
            CommitOutcome::Committed => {
                debug!(pgt = %ticket.id, "granted proxy-granting ticket");
                Ok(ticket)
            }
            outcome => Err(CasError::Internal(format!(
                "unexpected outcome {outcome:?} storing {}",
                ticket.id
            ))),
        }
    }

    /// Grant a proxy ticket for `target_service`.
    ///
    /// # Errors
    /// `TicketNotFound` / `TicketExpired` for an unusable PGT or chain,
    /// `ServiceUnauthorized` when the target service denies the principal.
    pub async fn grant_proxy_ticket(
        &self,
        pgt_id: &str,
        target_service: &str,
        registered: &RegisteredService,
    ) -> Result<Ticket, CasError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = Utc::now();
            let mut pgt = self.usable(pgt_id, TicketKind::ProxyGranting, now).await?;
            let authentication = self.chain_authentication(&pgt, now).await?;
            registered.access_strategy.authorize(&authentication.principal)?;

            let proxies = match &pgt.data {
                TicketData::ProxyGranting { proxies, .. } => proxies.clone(),
                _ => return Err(CasError::TicketNotFound(pgt_id.to_string())),
            };
            pgt.touch(now);
            let ticket = Ticket::new(
                self.ids.next(TicketKind::Proxy)?,
                pgt.principal_id.clone(),
                self.policies.proxy_ticket,
                Some(pgt.id.clone()),
                TicketData::Proxy {
                    service: target_service.to_string(),
                    proxies,
                },
                now,
            );
            match self
                .commit("grant_pt", TicketBatch::new().write(pgt).write(ticket.clone()))
                .await?
            {
                CommitOutcome::Committed => {
                    debug!(pt = %ticket.id, "granted proxy ticket");
                    return Ok(ticket);
                }
                CommitOutcome::Stale(_) => {}
                CommitOutcome::SessionRejected => return Err(CasError::ConcurrentSessionRejected),
            }
        }
        Err(CasError::Internal(format!("{pgt_id} is contended")))
    }

    /// Consume a single-use ticket. Concurrent callers race on the ticket version, so
    /// exactly one of them succeeds.
    ///
    /// # Errors
    /// `TicketNotFound`, `TicketExpired` or `TicketAlreadyConsumed`.
    #[instrument(skip(self))]
    pub async fn consume(&self, id: &str, kinds: &[TicketKind]) -> Result<ValidatedTicket, CasError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = Utc::now();
            let ticket = self
                .load(id)
                .await?
                .filter(|ticket| kinds.contains(&ticket.kind()))
                .ok_or_else(|| CasError::TicketNotFound(id.to_string()))?;
            check_state(&ticket, now)?;
            let authentication = self.chain_authentication(&ticket, now).await?;

            let mut updated = ticket;
            updated.touch(now);
            let uses = match updated.expiration {
                ExpirationPolicy::MultiTimeUseOrTimeout { uses, .. } => uses,
                _ => 1,
            };
            if updated.use_count >= uses {
                updated.status = TicketStatus::Consumed;
            }

            match self
                .commit("consume", TicketBatch::new().write(updated.clone()))
                .await?
            {
                CommitOutcome::Committed => {
                    debug!(ticket = %updated.id, "consumed ticket");
                    return Ok(ValidatedTicket {
                        ticket: updated,
                        authentication,
                    });
                }
                CommitOutcome::Stale(_) => debug!(ticket = id, "lost consume race, re-reading"),
                CommitOutcome::SessionRejected => {
                    return Err(CasError::Internal("unexpected session guard".to_string()));
                }
            }
        }
        Err(CasError::TicketAlreadyConsumed(id.to_string()))
    }

    /// Issue an OAuth code or token. A granting TGT, when given, must be usable.
    ///
    /// # Errors
    /// `TicketNotFound` / `TicketExpired` for an unusable granting ticket.
    pub async fn issue(
        &self,
        kind: TicketKind,
        granting_ticket_id: Option<&str>,
        principal_id: &str,
        data: TicketData,
    ) -> Result<Ticket, CasError> {
        let now = Utc::now();
        if let Some(granting) = granting_ticket_id {
            self.usable(granting, TicketKind::TicketGranting, now).await?;
        }
        let ticket = Ticket::new(
            self.ids.next(kind)?,
            principal_id,
            self.policies.for_kind(kind),
            granting_ticket_id.map(str::to_string),
            data,
            now,
        );
        match self
            .commit("issue", TicketBatch::new().write(ticket.clone()))
            .await?
        {
            CommitOutcome::Committed => {
                debug!(ticket = %ticket.id, "issued ticket");
                Ok(ticket)
            }
            outcome => Err(CasError::Internal(format!(
                "unexpected outcome {outcome:?} storing {}",
                ticket.id
            ))),
        }
    }

    /// Revoke a TGT and everything granted from it. Missing tickets are not an error.
    /// The TGT is removed first, so descendants fail their chain check immediately.
    ///
    /// # Errors
    /// `StoreUnavailable` on store failure.
    #[instrument(skip(self))]
    pub async fn revoke_ticket_granting_ticket(&self, tgt_id: &str) -> Result<Vec<String>, CasError> {
        let Some(root) = self
            .load(tgt_id)
            .await?
            .filter(|ticket| ticket.kind() == TicketKind::TicketGranting)
        else {
            return Ok(Vec::new());
        };

        let related = self
            .retry
            .run("tickets_for_principal", || {
                self.store.tickets_for_principal(&root.principal_id)
            })
            .await?;
        let descendants = descendants(&root.id, &related);

        self.retry
            .run("revoke", || self.store.delete(std::slice::from_ref(&root.id)))
            .await?;
        if !descendants.is_empty() {
            self.retry
                .run("revoke", || self.store.delete(&descendants))
                .await?;
        }

        info!(
            tgt = %root.id,
            principal = %root.principal_id,
            descendants = descendants.len(),
            "revoked ticket-granting ticket"
        );
        let mut removed = vec![root.id];
        removed.extend(descendants);
        Ok(removed)
    }

    /// Revoke every session of a principal. Returns how many TGTs were revoked.
    ///
    /// # Errors
    /// `StoreUnavailable` on store failure.
    pub async fn revoke_sessions_for(&self, principal_id: &str) -> Result<usize, CasError> {
        let sessions = self.sessions(Some(principal_id)).await?;
        for session in &sessions {
            self.revoke_ticket_granting_ticket(&session.id).await?;
        }
        Ok(sessions.len())
    }

    /// Usable ticket-granting tickets, optionally for one principal.
    ///
    /// # Errors
    /// `StoreUnavailable` on store failure.
    pub async fn sessions(&self, principal_id: Option<&str>) -> Result<Vec<Ticket>, CasError> {
        let now = Utc::now();
        let tickets = match principal_id {
            Some(principal_id) => {
                self.retry
                    .run("tickets_for_principal", || {
                        self.store.tickets_for_principal(principal_id)
                    })
                    .await?
            }
            None => {
                self.retry
                    .run("tickets", || {
                        self.store.tickets(Some(TicketKind::TicketGranting))
                    })
                    .await?
            }
        };
        let mut sessions: Vec<Ticket> = tickets
            .into_iter()
            .filter(|ticket| ticket.kind() == TicketKind::TicketGranting && ticket.is_usable(now))
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    /// # Errors
    /// `StoreUnavailable` on store failure.
    pub async fn tickets(
        &self,
        kind: Option<TicketKind>,
        principal_id: Option<&str>,
    ) -> Result<Vec<Ticket>, CasError> {
        let mut tickets = self.retry.run("tickets", || self.store.tickets(kind)).await?;
        if let Some(principal_id) = principal_id {
            tickets.retain(|ticket| ticket.principal_id == principal_id);
        }
        tickets.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tickets)
    }

    /// # Errors
    /// `StoreUnavailable` on store failure.
    pub async fn stats(&self) -> Result<TicketStats, CasError> {
        let now = Utc::now();
        let tickets = self.retry.run("tickets", || self.store.tickets(None)).await?;
        let mut stats = TicketStats {
            ticket_suffix: self.ids.suffix().map(str::to_string),
            ..TicketStats::default()
        };
        for ticket in &tickets {
            let usable = ticket.is_usable(now);
            match (ticket.kind(), usable) {
                (TicketKind::TicketGranting, true) => stats.unexpired_tgts += 1,
                (TicketKind::TicketGranting, false) => stats.expired_tgts += 1,
                (TicketKind::Service, true) => stats.unexpired_sts += 1,
                (TicketKind::Service, false) => stats.expired_sts += 1,
                _ => {}
            }
        }
        Ok(stats)
    }
}

impl std::fmt::Debug for TicketEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketEngine")
            .field("store", &self.store.name())
            .field("policies", &self.policies)
            .field("sso", &self.sso)
            .finish_non_exhaustive()
    }
}

fn check_state(ticket: &Ticket, now: DateTime<Utc>) -> Result<(), CasError> {
    match ticket.state(now) {
        TicketState::Created | TicketState::Active => Ok(()),
        TicketState::Expired => Err(CasError::TicketExpired(ticket.id.clone())),
        TicketState::Consumed => Err(CasError::TicketAlreadyConsumed(ticket.id.clone())),
        TicketState::Revoked => Err(CasError::TicketNotFound(ticket.id.clone())),
    }
}

/// Every ticket whose granting chain reaches `root`, breadth first.
fn descendants(root: &str, tickets: &[Ticket]) -> Vec<String> {
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    for ticket in tickets {
        if let Some(parent) = ticket.granting_ticket_id.as_deref() {
            children.entry(parent).or_default().push(ticket.id.as_str());
        }
    }
    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(id) = queue.pop_front() {
        for child in children.get(id).into_iter().flatten() {
            found.push((*child).to_string());
            queue.push_back(*child);
        }
    }
    found
}

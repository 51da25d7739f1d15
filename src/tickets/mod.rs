//! Ticket records and their storage.
//!
//! Every ticket kind shares one [`Ticket`] record; the kind-specific payload lives in the
//! [`TicketData`] variant. A ticket's `status` only records explicit transitions (consumed,
//! revoked); expiry is derived on read, see [`Ticket::state`].

pub mod expiration;
pub mod id;
pub mod postgres;
pub mod reaper;
pub mod retry;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt, str::FromStr};
use utoipa::ToSchema;

use crate::authn::Authentication;

pub use self::expiration::{ExpirationPolicies, ExpirationPolicy};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum TicketKind {
    TicketGranting,
    Service,
    ProxyGranting,
    Proxy,
    OAuthCode,
    AccessToken,
    RefreshToken,
}

impl TicketKind {
    pub const ALL: [Self; 7] = [
        Self::TicketGranting,
        Self::Service,
        Self::ProxyGranting,
        Self::Proxy,
        Self::OAuthCode,
        Self::AccessToken,
        Self::RefreshToken,
    ];

    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::TicketGranting => "TGT",
            Self::Service => "ST",
            Self::ProxyGranting => "PGT",
            Self::Proxy => "PT",
            Self::OAuthCode => "OC",
            Self::AccessToken => "AT",
            Self::RefreshToken => "RT",
        }
    }

    /// Kind from the identifier prefix.
    #[must_use]
    pub fn from_id(id: &str) -> Option<Self> {
        let (prefix, _) = id.split_once('-')?;
        Self::ALL.into_iter().find(|kind| kind.prefix() == prefix)
    }
}

impl fmt::Display for TicketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

impl FromStr for TicketKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.prefix().eq_ignore_ascii_case(value))
            .ok_or_else(|| format!("unknown ticket type: {value}"))
    }
}

/// Explicit, persisted status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Active,
    Consumed,
    Revoked,
}

/// Derived lifecycle state. `Expired`, `Revoked` and `Consumed` are absorbing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TicketState {
    Created,
    Active,
    Expired,
    Revoked,
    Consumed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TicketData {
    TicketGranting {
        authentication: Authentication,
        /// Holder received a `TGC` cookie.
        sso: bool,
        /// Service the session was established for, if any.
        origin_service: Option<String>,
        /// Services that received a ticket from this session.
        services: BTreeSet<String>,
    },
    Service {
        service: String,
        from_new_login: bool,
    },
    ProxyGranting {
        authentication: Authentication,
        /// Services the authentication was proxied through, most recent first.
        proxies: Vec<String>,
    },
    Proxy {
        service: String,
        proxies: Vec<String>,
    },
    OAuthCode {
        client_id: String,
        redirect_uri: String,
        scopes: BTreeSet<String>,
        nonce: Option<String>,
        code_challenge: Option<String>,
        code_challenge_method: Option<String>,
    },
    AccessToken {
        client_id: String,
        scopes: BTreeSet<String>,
        authentication: Authentication,
    },
    RefreshToken {
        client_id: String,
        scopes: BTreeSet<String>,
        authentication: Authentication,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub principal_id: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub use_count: u32,
    pub expiration: ExpirationPolicy,
    pub status: TicketStatus,
    /// Optimistic concurrency version; bumped by the store on every write.
    pub version: u64,
    pub granting_ticket_id: Option<String>,
    pub data: TicketData,
}

impl Ticket {
    #[must_use]
    pub fn new(
        id: String,
        principal_id: impl Into<String>,
        expiration: ExpirationPolicy,
        granting_ticket_id: Option<String>,
        data: TicketData,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            principal_id: principal_id.into(),
            created_at: now,
            last_used_at: now,
            use_count: 0,
            expiration,
            status: TicketStatus::Active,
            version: 0,
            granting_ticket_id,
            data,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> TicketKind {
        match self.data {
            TicketData::TicketGranting { .. } => TicketKind::TicketGranting,
            TicketData::Service { .. } => TicketKind::Service,
            TicketData::ProxyGranting { .. } => TicketKind::ProxyGranting,
            TicketData::Proxy { .. } => TicketKind::Proxy,
            TicketData::OAuthCode { .. } => TicketKind::OAuthCode,
            TicketData::AccessToken { .. } => TicketKind::AccessToken,
            TicketData::RefreshToken { .. } => TicketKind::RefreshToken,
        }
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration
            .is_expired(self.created_at, self.last_used_at, self.use_count, now)
    }

    /// Derived state; explicit transitions win over expiry so a consumed ticket keeps
    /// reporting `Consumed` after its lifetime ends.
    #[must_use]
    pub fn state(&self, now: DateTime<Utc>) -> TicketState {
        match self.status {
            TicketStatus::Revoked => TicketState::Revoked,
            TicketStatus::Consumed => TicketState::Consumed,
            TicketStatus::Active if self.is_expired(now) => TicketState::Expired,
            TicketStatus::Active if self.use_count == 0 => TicketState::Created,
            TicketStatus::Active => TicketState::Active,
        }
    }

    /// Valid for use: neither expired nor explicitly terminated.
    #[must_use]
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state(now), TicketState::Created | TicketState::Active)
    }

    /// A TGT that has not granted anything yet.
    #[must_use]
    pub const fn is_new(&self) -> bool {
        self.use_count == 0
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_used_at = now;
        self.use_count = self.use_count.saturating_add(1);
    }

    /// Authentication carried by session-bearing tickets.
    #[must_use]
    pub const fn authentication(&self) -> Option<&Authentication> {
        match &self.data {
            TicketData::TicketGranting { authentication, .. }
            | TicketData::ProxyGranting { authentication, .. }
            | TicketData::AccessToken { authentication, .. }
            | TicketData::RefreshToken { authentication, .. } => Some(authentication),
            _ => None,
        }
    }

    /// Service a service or proxy ticket was issued for.
    #[must_use]
    pub fn service(&self) -> Option<&str> {
        match &self.data {
            TicketData::Service { service, .. } | TicketData::Proxy { service, .. } => {
                Some(service)
            }
            _ => None,
        }
    }

    /// Hard expiry instant used for storage housekeeping.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expiration.hard_deadline(self.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::principal::Principal;
    use chrono::Duration;

    fn service_ticket(now: DateTime<Utc>) -> Ticket {
        Ticket::new(
            "ST-1-abc".to_string(),
            "casuser",
            ExpirationPolicy::MultiTimeUseOrTimeout {
                uses: 1,
                time_to_live_seconds: 10,
            },
            Some("TGT-1-abc".to_string()),
            TicketData::Service {
                service: "https://app.example.org".to_string(),
                from_new_login: true,
            },
            now,
        )
    }

    #[test]
    fn kind_from_prefix() {
        assert_eq!(TicketKind::from_id("TGT-1-x"), Some(TicketKind::TicketGranting));
        assert_eq!(TicketKind::from_id("ST-9-x-node"), Some(TicketKind::Service));
        assert_eq!(TicketKind::from_id("PGT-1-x"), Some(TicketKind::ProxyGranting));
        assert_eq!(TicketKind::from_id("bogus"), None);
        assert_eq!(TicketKind::from_id("XX-1"), None);
        assert_eq!("tgt".parse::<TicketKind>(), Ok(TicketKind::TicketGranting));
    }

    #[test]
    fn state_machine() {
        let now = Utc::now();
        let mut ticket = service_ticket(now);
        assert_eq!(ticket.state(now), TicketState::Created);
        assert!(ticket.is_usable(now));
        assert_eq!(
            ticket.state(now + Duration::seconds(11)),
            TicketState::Expired
        );

        ticket.touch(now);
        ticket.status = TicketStatus::Consumed;
        assert_eq!(ticket.state(now), TicketState::Consumed);
        // terminal states stay terminal once the lifetime passes
        assert_eq!(
            ticket.state(now + Duration::seconds(60)),
            TicketState::Consumed
        );
    }

    #[test]
    fn authentication_accessor() {
        let now = Utc::now();
        let authentication = Authentication::new(Principal::new("casuser"), "t", "h", "pwd");
        let tgt = Ticket::new(
            "TGT-1-abc".to_string(),
            "casuser",
            ExpirationPolicy::NeverExpires,
            None,
            TicketData::TicketGranting {
                authentication,
                sso: true,
                origin_service: None,
                services: BTreeSet::new(),
            },
            now,
        );
        assert_eq!(tgt.kind(), TicketKind::TicketGranting);
        assert!(tgt.authentication().is_some());
        assert!(service_ticket(now).authentication().is_none());
        assert_eq!(
            service_ticket(now).service(),
            Some("https://app.example.org")
        );
    }

    #[test]
    fn serde_tagged_record() {
        let json = serde_json::to_value(service_ticket(Utc::now())).unwrap_or_default();
        assert_eq!(json["data"]["type"], "service");
        assert_eq!(json["status"], "active");
    }
}

//! Expiration policies, evaluated lazily against a ticket's usage record.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ExpirationPolicy {
    NeverExpires,
    /// Expires after a period without use.
    Timeout { time_to_idle_seconds: i64 },
    /// Expires a fixed time after creation.
    HardTimeout { time_to_live_seconds: i64 },
    /// Expires after `uses` uses or a fixed time after creation, whichever comes first.
    MultiTimeUseOrTimeout { uses: u32, time_to_live_seconds: i64 },
    /// SSO session: hard maximum lifetime plus an idle timeout.
    TicketGranting {
        max_time_to_live_seconds: i64,
        time_to_idle_seconds: i64,
    },
}

impl ExpirationPolicy {
    #[must_use]
    pub fn is_expired(
        &self,
        created_at: DateTime<Utc>,
        last_used_at: DateTime<Utc>,
        use_count: u32,
        now: DateTime<Utc>,
    ) -> bool {
        match *self {
            Self::NeverExpires => false,
            Self::Timeout {
                time_to_idle_seconds,
            } => now >= last_used_at + Duration::seconds(time_to_idle_seconds),
            Self::HardTimeout {
                time_to_live_seconds,
            } => now >= created_at + Duration::seconds(time_to_live_seconds),
            Self::MultiTimeUseOrTimeout {
                uses,
                time_to_live_seconds,
            } => use_count >= uses || now >= created_at + Duration::seconds(time_to_live_seconds),
            Self::TicketGranting {
                max_time_to_live_seconds,
                time_to_idle_seconds,
            } => {
                now >= created_at + Duration::seconds(max_time_to_live_seconds)
                    || now >= last_used_at + Duration::seconds(time_to_idle_seconds)
            }
        }
    }

    /// Latest instant the ticket could still be valid, ignoring use counts.
    #[must_use]
    pub fn hard_deadline(&self, created_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match *self {
            Self::NeverExpires | Self::Timeout { .. } => None,
            Self::HardTimeout {
                time_to_live_seconds,
            }
            | Self::MultiTimeUseOrTimeout {
                time_to_live_seconds,
                ..
            } => Some(created_at + Duration::seconds(time_to_live_seconds)),
            Self::TicketGranting {
                max_time_to_live_seconds,
                ..
            } => Some(created_at + Duration::seconds(max_time_to_live_seconds)),
        }
    }

    /// Lifetime in seconds advertised to clients (`expires_in`).
    #[must_use]
    pub fn time_to_live_seconds(&self) -> Option<i64> {
        match *self {
            Self::NeverExpires => None,
            Self::Timeout {
                time_to_idle_seconds,
            } => Some(time_to_idle_seconds),
            Self::HardTimeout {
                time_to_live_seconds,
            }
            | Self::MultiTimeUseOrTimeout {
                time_to_live_seconds,
                ..
            } => Some(time_to_live_seconds),
            Self::TicketGranting {
                max_time_to_live_seconds,
                ..
            } => Some(max_time_to_live_seconds),
        }
    }
}

/// Policy per ticket kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ExpirationPolicies {
    pub ticket_granting_ticket: ExpirationPolicy,
    pub service_ticket: ExpirationPolicy,
    pub proxy_granting_ticket: ExpirationPolicy,
    pub proxy_ticket: ExpirationPolicy,
    pub oauth_code: ExpirationPolicy,
    pub access_token: ExpirationPolicy,
    pub refresh_token: ExpirationPolicy,
}

impl Default for ExpirationPolicies {
    fn default() -> Self {
        Self {
            ticket_granting_ticket: ExpirationPolicy::TicketGranting {
                max_time_to_live_seconds: 8 * 60 * 60,
                time_to_idle_seconds: 2 * 60 * 60,
            },
            service_ticket: ExpirationPolicy::MultiTimeUseOrTimeout {
                uses: 1,
                time_to_live_seconds: 10,
            },
            proxy_granting_ticket: ExpirationPolicy::TicketGranting {
                max_time_to_live_seconds: 8 * 60 * 60,
                time_to_idle_seconds: 2 * 60 * 60,
            },
            proxy_ticket: ExpirationPolicy::MultiTimeUseOrTimeout {
                uses: 1,
                time_to_live_seconds: 10,
            },
            oauth_code: ExpirationPolicy::MultiTimeUseOrTimeout {
                uses: 1,
                time_to_live_seconds: 30,
            },
            access_token: ExpirationPolicy::HardTimeout {
                time_to_live_seconds: 8 * 60 * 60,
            },
            refresh_token: ExpirationPolicy::HardTimeout {
                time_to_live_seconds: 30 * 24 * 60 * 60,
            },
        }
    }
}

impl ExpirationPolicies {
    #[must_use]
    pub const fn for_kind(&self, kind: super::TicketKind) -> ExpirationPolicy {
        use super::TicketKind;
        match kind {
            TicketKind::TicketGranting => self.ticket_granting_ticket,
            TicketKind::Service => self.service_ticket,
            TicketKind::ProxyGranting => self.proxy_granting_ticket,
            TicketKind::Proxy => self.proxy_ticket,
            TicketKind::OAuthCode => self.oauth_code,
            TicketKind::AccessToken => self.access_token,
            TicketKind::RefreshToken => self.refresh_token,
        }
    }

    #[must_use]
    pub const fn with_ticket_granting_ticket(mut self, policy: ExpirationPolicy) -> Self {
        self.ticket_granting_ticket = policy;
        self
    }

    #[must_use]
    pub const fn with_service_ticket(mut self, policy: ExpirationPolicy) -> Self {
        self.service_ticket = policy;
        self
    }

    #[must_use]
    pub const fn with_proxy_granting_ticket(mut self, policy: ExpirationPolicy) -> Self {
        self.proxy_granting_ticket = policy;
        self
    }

    #[must_use]
    pub const fn with_proxy_ticket(mut self, policy: ExpirationPolicy) -> Self {
        self.proxy_ticket = policy;
        self
    }

    #[must_use]
    pub const fn with_oauth_code(mut self, policy: ExpirationPolicy) -> Self {
        self.oauth_code = policy;
        self
    }

    #[must_use]
    pub const fn with_access_token(mut self, policy: ExpirationPolicy) -> Self {
        self.access_token = policy;
        self
    }

    #[must_use]
    pub const fn with_refresh_token(mut self, policy: ExpirationPolicy) -> Self {
        self.refresh_token = policy;
        self
    }
}

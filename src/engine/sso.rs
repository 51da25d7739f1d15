//! Single sign-on participation and concurrent-session rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt, str::FromStr};

use crate::{registry::RegisteredService, tickets::store::SessionGuard};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConcurrentSessionPolicy {
    #[default]
    Allow,
    /// At most one live SSO session per principal.
    #[serde(rename = "unique")]
    UniquePrincipal,
    /// At most one live SSO session per principal and service.
    #[serde(rename = "unique-per-service")]
    UniquePrincipalPerService,
}

impl ConcurrentSessionPolicy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::UniquePrincipal => "unique",
            Self::UniquePrincipalPerService => "unique-per-service",
        }
    }
}

impl fmt::Display for ConcurrentSessionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConcurrentSessionPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "allow" => Ok(Self::Allow),
            "unique" => Ok(Self::UniquePrincipal),
            "unique-per-service" => Ok(Self::UniquePrincipalPerService),
            _ => Err(format!(
                "invalid concurrent session policy: {value}, expected allow|unique|unique-per-service"
            )),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SsoPolicy {
    concurrent: ConcurrentSessionPolicy,
    excluded_principals: BTreeSet<String>,
}

impl SsoPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_concurrent(mut self, policy: ConcurrentSessionPolicy) -> Self {
        self.concurrent = policy;
        self
    }

    #[must_use]
    pub fn with_excluded_principal(mut self, principal_id: impl Into<String>) -> Self {
        self.excluded_principals.insert(principal_id.into());
        self
    }

    #[must_use]
    pub const fn concurrent(&self) -> ConcurrentSessionPolicy {
        self.concurrent
    }

    /// Whether a login should establish a reusable SSO session (`TGC` cookie).
    #[must_use]
    pub fn participates(&self, principal_id: &str, service: Option<&RegisteredService>) -> bool {
        !self.excluded_principals.contains(principal_id)
            && service.map_or(true, |service| service.access_strategy.sso_enabled)
    }

    /// Guard evaluated when a new SSO session is created.
    #[must_use]
    pub fn login_guard(
        &self,
        principal_id: &str,
        service: Option<&str>,
        exclude: Vec<String>,
        now: DateTime<Utc>,
    ) -> Option<SessionGuard> {
        match self.concurrent {
            ConcurrentSessionPolicy::Allow => None,
            ConcurrentSessionPolicy::UniquePrincipal => Some(SessionGuard::UniquePrincipal {
                principal_id: principal_id.to_string(),
                exclude,
                now,
            }),
            ConcurrentSessionPolicy::UniquePrincipalPerService => {
                Some(SessionGuard::UniquePrincipalPerService {
                    principal_id: principal_id.to_string(),
                    service: service.map(str::to_string),
                    exclude,
                    now,
                })
            }
        }
    }

    /// Guard evaluated when an existing session first visits `service`.
    #[must_use]
    pub fn grant_guard(
        &self,
        principal_id: &str,
        service: &str,
        exclude: Vec<String>,
        now: DateTime<Utc>,
    ) -> Option<SessionGuard> {
        match self.concurrent {
            ConcurrentSessionPolicy::UniquePrincipalPerService => {
                Some(SessionGuard::UniquePrincipalPerService {
                    principal_id: principal_id.to_string(),
                    service: Some(service.to_string()),
                    exclude,
                    now,
                })
            }
            _ => None,
        }
    }
}

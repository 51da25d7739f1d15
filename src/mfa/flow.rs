//! Login flow state carried between requests in a sealed `execution` token.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use ulid::Ulid;

use crate::{authn::Authentication, crypto::Sealer, error::CasError};

const PURPOSE: &str = "flow";
pub const DEFAULT_FLOW_TTL_SECONDS: i64 = 600;

/// What the flow waits for next. Primary authentication has no flow token yet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum FlowStep {
    MfaChallenge {
        provider: String,
    },
    MfaRegistration {
        provider: String,
        secret: String,
        scratch_codes: Vec<String>,
    },
    TrustDevice,
    Complete,
}

impl FlowStep {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::MfaChallenge { .. } => "mfa_challenge",
            Self::MfaRegistration { .. } => "mfa_registration",
            Self::TrustDevice => "trust_device",
            Self::Complete => "complete",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowState {
    pub id: String,
    pub step: FlowStep,
    pub authentication: Authentication,
    /// Service the login was started for.
    pub service: Option<String>,
    /// TGT replaced by a forced renewal.
    pub replaces: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl FlowState {
    #[must_use]
    pub fn advance(mut self, step: FlowStep) -> Self {
        self.step = step;
        self
    }
}

#[derive(Clone, Debug)]
pub struct FlowCodec {
    sealer: Arc<Sealer>,
    ttl: Duration,
}

impl FlowCodec {
    #[must_use]
    pub fn new(sealer: Arc<Sealer>) -> Self {
        Self {
            sealer,
            ttl: Duration::seconds(DEFAULT_FLOW_TTL_SECONDS),
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// New flow after primary authentication. The deadline is fixed here and kept
    /// across steps.
    #[must_use]
    pub fn start(
        &self,
        step: FlowStep,
        authentication: Authentication,
        service: Option<String>,
        replaces: Option<String>,
    ) -> FlowState {
        FlowState {
            id: Ulid::new().to_string(),
            step,
            authentication,
            service,
            replaces,
            expires_at: Utc::now() + self.ttl,
        }
    }

    /// # Errors
    /// Returns `Internal` if sealing fails.
    pub fn seal(&self, state: &FlowState) -> Result<String, CasError> {
        Ok(self.sealer.seal_json(state, PURPOSE)?)
    }

    /// # Errors
    /// Returns `FlowExpired` for tokens that are forged, tampered or past their deadline.
    pub fn open(&self, token: &str) -> Result<FlowState, CasError> {
        let state: FlowState = self
            .sealer
            .open_json(token, PURPOSE)
            .map_err(|_| CasError::FlowExpired)?;
        if state.expires_at <= Utc::now() {
            return Err(CasError::FlowExpired);
        }
        Ok(state)
    }
}

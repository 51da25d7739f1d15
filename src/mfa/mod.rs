//! Multifactor orchestration between primary authentication and TGT issuance.
//!
//! After a primary credential succeeds, [`MfaOrchestrator::begin`] decides whether a
//! second factor is needed and which provider handles it. Each later request carries the
//! sealed flow token and moves the flow one step forward until it reaches
//! [`FlowStep::Complete`].

pub mod duo;
pub mod flow;
pub mod gauth;
pub mod trusted;

use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::{debug, info, warn};

use crate::{
    authn::{ACR_MFA, Authentication, AuthenticationHandler, Credential},
    error::CasError,
    registry::RegisteredService,
};

use self::{
    duo::DuoProvider,
    flow::{FlowCodec, FlowState, FlowStep},
    gauth::{GauthRegistration, GoogleAuthenticator},
    trusted::{TimeUnit, TrustedDeviceStore},
};

pub const MAX_MFA_ATTEMPTS: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Closed {
    /// Ran out of attempts.
    Abandoned,
    /// Completed; the execution cannot be presented again.
    Used,
}

/// Attempt counters and closed steps, keyed by flow id and step. Entries live until the
/// flow token itself expires.
#[derive(Debug, Default)]
struct FlowLedger {
    attempts: HashMap<String, (u32, DateTime<Utc>)>,
    closed: HashMap<String, (Closed, DateTime<Utc>)>,
}

impl FlowLedger {
    fn prune(&mut self, now: DateTime<Utc>) {
        self.attempts.retain(|_, (_, expires_at)| *expires_at > now);
        self.closed.retain(|_, (_, expires_at)| *expires_at > now);
    }
}

fn step_key(state: &FlowState) -> String {
    format!("{}:{}", state.id, state.step.name())
}

/// Whether `authentication` already satisfies the service's MFA providers and the
/// requested context classes.
#[must_use]
pub fn is_satisfied(
    registered: &RegisteredService,
    requested_contexts: &[String],
    authentication: &Authentication,
) -> bool {
    let provider_ok = registered.mfa_providers.is_empty()
        || authentication
            .mfa_provider
            .as_ref()
            .is_some_and(|provider| registered.mfa_providers.contains(provider));
    let context_ok =
        !requested_contexts.iter().any(|context| context == ACR_MFA) || authentication.is_mfa();
    provider_ok && context_ok
}

/// Inputs that can demand a second factor.
#[derive(Clone, Copy, Debug, Default)]
pub struct MfaTrigger<'a> {
    /// `authn_method` request parameter.
    pub requested_method: Option<&'a str>,
    pub service: Option<&'a RegisteredService>,
    /// Requested authentication context classes (SAML `RequestedAuthnContext`, OIDC `acr_values`).
    pub requested_contexts: &'a [String],
}

#[derive(Clone, Debug)]
pub struct TrustRequest {
    pub device_name: String,
    pub expiration: i64,
    pub unit: TimeUnit,
}

#[derive(Debug)]
pub enum MfaOutcome {
    Complete(FlowState),
    Challenge {
        provider: String,
        execution: String,
    },
    Registration {
        provider: String,
        execution: String,
        registration: GauthRegistration,
    },
    TrustDevice {
        execution: String,
    },
}

pub struct MfaOrchestrator {
    global_provider: Option<String>,
    gauth: Arc<GoogleAuthenticator>,
    duo: Option<Arc<DuoProvider>>,
    trusted: Option<Arc<TrustedDeviceStore>>,
    flows: FlowCodec,
    ledger: Mutex<FlowLedger>,
}

impl MfaOrchestrator {
    #[must_use]
    pub fn new(gauth: Arc<GoogleAuthenticator>, flows: FlowCodec) -> Self {
        Self {
            global_provider: None,
            gauth,
            duo: None,
            trusted: None,
            flows,
            ledger: Mutex::new(FlowLedger::default()),
        }
    }

    #[must_use]
    pub fn with_global_provider(mut self, provider: Option<String>) -> Self {
        self.global_provider = provider;
        self
    }

    #[must_use]
    pub fn with_duo(mut self, duo: Arc<DuoProvider>) -> Self {
        self.duo = Some(duo);
        self
    }

    #[must_use]
    pub fn with_trusted_devices(mut self, store: Arc<TrustedDeviceStore>) -> Self {
        self.trusted = Some(store);
        self
    }

    #[must_use]
    pub fn gauth(&self) -> &GoogleAuthenticator {
        &self.gauth
    }

    #[must_use]
    pub fn trusted_devices(&self) -> Option<&TrustedDeviceStore> {
        self.trusted.as_deref()
    }

    #[must_use]
    pub const fn flows(&self) -> &FlowCodec {
        &self.flows
    }

    fn is_known(&self, provider: &str) -> bool {
        provider == gauth::PROVIDER_ID || (provider == duo::PROVIDER_ID && self.duo.is_some())
    }

    fn handler(&self, provider: &str) -> Result<Arc<dyn AuthenticationHandler>, CasError> {
        match provider {
            gauth::PROVIDER_ID => Ok(self.gauth.clone()),
            duo::PROVIDER_ID => self
                .duo
                .clone()
                .map(|duo| duo as Arc<dyn AuthenticationHandler>)
                .ok_or_else(|| CasError::InvalidRequest(format!("unknown MFA provider {provider}"))),
            _ => Err(CasError::InvalidRequest(format!(
                "unknown MFA provider {provider}"
            ))),
        }
    }

    /// Provider demanded by the request, the service, the requested context or the
    /// global setting, in that order.
    ///
    /// # Errors
    /// Returns `InvalidRequest` when the chosen provider is not available.
    pub fn required_provider(&self, trigger: &MfaTrigger<'_>) -> Result<Option<String>, CasError> {
        let provider = trigger
            .requested_method
            .map(str::to_string)
            .or_else(|| {
                trigger
                    .service
                    .and_then(|service| service.mfa_providers.first().cloned())
            })
            .or_else(|| {
                trigger
                    .requested_contexts
                    .iter()
                    .any(|context| context == ACR_MFA)
                    .then(|| {
                        self.global_provider
                            .clone()
                            .unwrap_or_else(|| gauth::PROVIDER_ID.to_string())
                    })
            })
            .or_else(|| self.global_provider.clone());

        match provider {
            Some(provider) if !self.is_known(&provider) => Err(CasError::InvalidRequest(format!(
                "unknown MFA provider {provider}"
            ))),
            provider => Ok(provider),
        }
    }

    /// Start the second step after primary authentication.
    ///
    /// # Errors
    /// Returns an error if the provider is unknown or the flow cannot be sealed.
    pub fn begin(
        &self,
        authentication: Authentication,
        trigger: &MfaTrigger<'_>,
        device_fingerprint: Option<&str>,
        service: Option<String>,
        replaces: Option<String>,
    ) -> Result<MfaOutcome, CasError> {
        let Some(provider) = self.required_provider(trigger)? else {
            return Ok(MfaOutcome::Complete(self.flows.start(
                FlowStep::Complete,
                authentication,
                service,
                replaces,
            )));
        };

        if authentication.mfa_provider.as_deref() == Some(provider.as_str()) {
            return Ok(MfaOutcome::Complete(self.flows.start(
                FlowStep::Complete,
                authentication,
                service,
                replaces,
            )));
        }

        let principal = authentication.principal.id.clone();
        if let (Some(store), Some(fingerprint)) = (&self.trusted, device_fingerprint) {
            if store.is_trusted(&principal, fingerprint)? {
                info!(principal = %principal, provider = %provider, "trusted device bypasses MFA");
                let authentication = authentication.with_mfa(&provider, trusted::HANDLER_NAME);
                return Ok(MfaOutcome::Complete(self.flows.start(
                    FlowStep::Complete,
                    authentication,
                    service,
                    replaces,
                )));
            }
        }

        if provider == gauth::PROVIDER_ID && !self.gauth.is_registered(&principal)? {
            let registration = self.gauth.prepare_registration(&principal)?;
            let state = self.flows.start(
                FlowStep::MfaRegistration {
                    provider: provider.clone(),
                    secret: registration.secret_key.clone(),
                    scratch_codes: registration.scratch_codes.clone(),
                },
                authentication,
                service,
                replaces,
            );
            debug!(principal = %principal, "MFA registration required");
            return Ok(MfaOutcome::Registration {
                provider,
                execution: self.flows.seal(&state)?,
                registration,
            });
        }

        let state = self.flows.start(
            FlowStep::MfaChallenge {
                provider: provider.clone(),
            },
            authentication,
            service,
            replaces,
        );
        Ok(MfaOutcome::Challenge {
            provider,
            execution: self.flows.seal(&state)?,
        })
    }

    fn ledger(&self) -> Result<MutexGuard<'_, FlowLedger>, CasError> {
        self.ledger
            .lock()
            .map_err(|_| CasError::Internal("MFA flow lock poisoned".to_string()))
    }

    /// Open `execution` unless its step was already completed or abandoned.
    fn open_step(&self, execution: &str) -> Result<FlowState, CasError> {
        let state = self.flows.open(execution)?;
        let mut ledger = self.ledger()?;
        ledger.prune(Utc::now());
        match ledger.closed.get(&step_key(&state)) {
            Some((Closed::Abandoned, _)) => Err(CasError::MfaFailed),
            Some((Closed::Used, _)) => Err(CasError::FlowExpired),
            None => Ok(state),
        }
    }

    /// Mark the step done; only the first caller wins.
    fn close_step(&self, state: &FlowState) -> Result<(), CasError> {
        let mut ledger = self.ledger()?;
        let key = step_key(state);
        if ledger.closed.contains_key(&key) {
            return Err(CasError::FlowExpired);
        }
        ledger.attempts.remove(&key);
        ledger.closed.insert(key, (Closed::Used, state.expires_at));
        Ok(())
    }

    /// Count a failed attempt; `MfaFailed` once the flow runs out of attempts.
    fn record_failure(&self, state: &FlowState) -> Result<CasError, CasError> {
        let mut ledger = self.ledger()?;
        ledger.prune(Utc::now());
        let key = step_key(state);
        if let Some((Closed::Abandoned, _)) = ledger.closed.get(&key) {
            return Ok(CasError::MfaFailed);
        }
        let entry = ledger
            .attempts
            .entry(key.clone())
            .or_insert((0, state.expires_at));
        entry.0 += 1;
        if entry.0 >= MAX_MFA_ATTEMPTS {
            ledger.attempts.remove(&key);
            ledger
                .closed
                .insert(key, (Closed::Abandoned, state.expires_at));
            warn!(
                principal = %state.authentication.principal.id,
                "MFA abandoned after too many failures"
            );
            return Ok(CasError::MfaFailed);
        }
        Ok(CasError::BadCredentials)
    }

    fn after_mfa(&self, state: FlowState, provider: &str, handler: &str) -> Result<MfaOutcome, CasError> {
        self.close_step(&state)?;
        let mut state = state;
        state.authentication = state.authentication.with_mfa(provider, handler);
        info!(
            principal = %state.authentication.principal.id,
            provider,
            "multifactor authentication succeeded"
        );
        if self.trusted.is_some() {
            let state = state.advance(FlowStep::TrustDevice);
            return Ok(MfaOutcome::TrustDevice {
                execution: self.flows.seal(&state)?,
            });
        }
        Ok(MfaOutcome::Complete(state.advance(FlowStep::Complete)))
    }

    /// Submit a one-time token for the flow's challenge or registration step.
    ///
    /// # Errors
    /// `BadCredentials` for a wrong token (the same `execution` may be retried),
    /// `MfaFailed` once attempts are exhausted, `FlowExpired` for an unusable or already
    /// completed token.
    pub async fn submit_token(&self, execution: &str, token: &str) -> Result<MfaOutcome, CasError> {
        let state = self.open_step(execution)?;
        let principal_id = state.authentication.principal.id.clone();

        let verified = match &state.step {
            FlowStep::MfaChallenge { provider } => {
                let handler = self.handler(provider)?;
                let credential = Credential::OneTimeToken {
                    provider: provider.clone(),
                    principal_id: principal_id.clone(),
                    token: token.to_string(),
                };
                handler
                    .authenticate(&credential)
                    .await
                    .map(|_| (provider.clone(), handler.name().to_string()))
            }
            FlowStep::MfaRegistration {
                provider,
                secret,
                scratch_codes,
            } => self
                .gauth
                .confirm_registration(&principal_id, secret, scratch_codes.clone(), token)
                .map(|()| (provider.clone(), gauth::HANDLER_NAME.to_string())),
            FlowStep::TrustDevice | FlowStep::Complete => {
                return Err(CasError::InvalidRequest(format!(
                    "flow is at step {}",
                    state.step.name()
                )));
            }
        };

        match verified {
            Ok((provider, handler)) => self.after_mfa(state, &provider, &handler),
            Err(CasError::BadCredentials) => Err(self.record_failure(&state)?),
            Err(err) => Err(err),
        }
    }

    /// Finish the trust-device step, registering the device when asked to.
    ///
    /// # Errors
    /// `InvalidRequest` when the flow is not waiting for this step, `FlowExpired` when
    /// the step was already finished.
    pub fn trust_device(
        &self,
        execution: &str,
        request: Option<&TrustRequest>,
        device_fingerprint: &str,
    ) -> Result<FlowState, CasError> {
        let state = self.open_step(execution)?;
        if state.step != FlowStep::TrustDevice {
            return Err(CasError::InvalidRequest(format!(
                "flow is at step {}",
                state.step.name()
            )));
        }
        self.close_step(&state)?;
        if let (Some(store), Some(request)) = (&self.trusted, request) {
            store.register(
                &state.authentication.principal.id,
                &request.device_name,
                device_fingerprint.to_string(),
                request.expiration,
                request.unit,
            )?;
        }
        Ok(state.advance(FlowStep::Complete))
    }
}

impl fmt::Debug for MfaOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MfaOrchestrator")
            .field("global_provider", &self.global_provider)
            .field("duo", &self.duo.is_some())
            .field("trusted_devices", &self.trusted.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{
        crypto::{KEY_LEN, Sealer},
        principal::Principal,
    };
    use std::time::Duration;
    use totp_rs::{Algorithm, Secret, TOTP};

    fn orchestrator() -> MfaOrchestrator {
        let sealer = Arc::new(Sealer::new([5u8; KEY_LEN]));
        MfaOrchestrator::new(
            Arc::new(GoogleAuthenticator::new("Tessera", sealer.clone())),
            FlowCodec::new(sealer),
        )
    }

    fn authentication() -> Authentication {
        Authentication::new(Principal::new("casuser"), "t", "AcceptUsersHandler", "pwd")
    }

    fn current_token(secret: &str) -> String {
        let bytes = Secret::Encoded(secret.to_string()).to_bytes().unwrap();
        TOTP::new(Algorithm::SHA1, 6, 1, 30, bytes, Some("Tessera".to_string()), "casuser".to_string())
            .unwrap()
            .generate_current()
            .unwrap()
    }

    #[test]
    fn no_trigger_completes_immediately() {
        let outcome = orchestrator()
            .begin(authentication(), &MfaTrigger::default(), None, None, None)
            .unwrap();
        let MfaOutcome::Complete(state) = outcome else {
            panic!("expected completion");
        };
        assert!(!state.authentication.is_mfa());
    }

    #[test]
    fn provider_resolution_order() {
        let orchestrator = orchestrator().with_global_provider(Some("mfa-gauth".to_string()));
        let contexts = [ACR_MFA.to_string()];
        let trigger = MfaTrigger {
            requested_contexts: &contexts,
            ..MfaTrigger::default()
        };
        assert_eq!(
            orchestrator.required_provider(&trigger).unwrap().as_deref(),
            Some("mfa-gauth")
        );
        let trigger = MfaTrigger {
            requested_method: Some("mfa-duo"),
            ..MfaTrigger::default()
        };
        // duo is not configured
        assert!(orchestrator.required_provider(&trigger).is_err());
    }

    #[tokio::test]
    async fn registration_then_challenge() {
        let orchestrator = orchestrator().with_global_provider(Some("mfa-gauth".to_string()));
        let outcome = orchestrator
            .begin(authentication(), &MfaTrigger::default(), None, None, None)
            .unwrap();
        let MfaOutcome::Registration {
            execution,
            registration,
            ..
        } = outcome
        else {
            panic!("expected registration");
        };
        assert_eq!(registration.scratch_codes.len(), 5);

        let token = current_token(&registration.secret_key);
        let MfaOutcome::Complete(state) = orchestrator.submit_token(&execution, &token).await.unwrap()
        else {
            panic!("expected completion");
        };
        assert_eq!(state.authentication.context_class, ACR_MFA);
        assert_eq!(state.authentication.mfa_provider.as_deref(), Some("mfa-gauth"));
        assert_eq!(
            orchestrator.submit_token(&execution, &token).await.unwrap_err(),
            CasError::FlowExpired
        );

        // registered now, so the next login is challenged
        let outcome = orchestrator
            .begin(authentication(), &MfaTrigger::default(), None, None, None)
            .unwrap();
        let MfaOutcome::Challenge { execution, .. } = outcome else {
            panic!("expected challenge");
        };
        let scratch = &registration.scratch_codes[0];
        assert!(matches!(
            orchestrator.submit_token(&execution, scratch).await.unwrap(),
            MfaOutcome::Complete(_)
        ));
        assert_eq!(
            orchestrator
                .submit_token(&execution, &registration.scratch_codes[1])
                .await
                .unwrap_err(),
            CasError::FlowExpired
        );
    }

    #[tokio::test]
    async fn failures_reprompt_then_abandon() {
        let orchestrator = orchestrator().with_global_provider(Some("mfa-gauth".to_string()));
        let MfaOutcome::Registration {
            execution,
            registration,
            ..
        } = orchestrator
            .begin(authentication(), &MfaTrigger::default(), None, None, None)
            .unwrap()
        else {
            panic!("expected registration");
        };
        for _ in 1..MAX_MFA_ATTEMPTS {
            assert_eq!(
                orchestrator.submit_token(&execution, "000000x").await.unwrap_err(),
                CasError::BadCredentials
            );
        }
        assert_eq!(
            orchestrator.submit_token(&execution, "000000x").await.unwrap_err(),
            CasError::MfaFailed
        );

        // the abandoned flow stays closed, even for the right token
        for token in ["000000x", current_token(&registration.secret_key).as_str()] {
            assert_eq!(
                orchestrator.submit_token(&execution, token).await.unwrap_err(),
                CasError::MfaFailed
            );
        }
        assert!(!orchestrator.gauth().is_registered("casuser").unwrap());
    }

    #[tokio::test]
    async fn trusted_device_bypasses_second_login() {
        let store = Arc::new(TrustedDeviceStore::new());
        let duo = Arc::new(DuoProvider::new(None, Duration::from_secs(1)));
        duo.add_bypass_codes("casuser", vec!["12345".to_string()]).unwrap();
        let orchestrator = orchestrator()
            .with_global_provider(Some("mfa-duo".to_string()))
            .with_duo(duo)
            .with_trusted_devices(store);
        let print = trusted::fingerprint("10.0.0.1", "Firefox", "laptop");

        let MfaOutcome::Challenge { execution, .. } = orchestrator
            .begin(authentication(), &MfaTrigger::default(), Some(&print), None, None)
            .unwrap()
        else {
            panic!("expected challenge");
        };
        let MfaOutcome::TrustDevice { execution } =
            orchestrator.submit_token(&execution, "12345").await.unwrap()
        else {
            panic!("expected trust step");
        };
        let request = TrustRequest {
            device_name: "laptop".to_string(),
            expiration: 30,
            unit: TimeUnit::Days,
        };
        let state = orchestrator
            .trust_device(&execution, Some(&request), &print)
            .unwrap();
        assert_eq!(state.step, FlowStep::Complete);
        assert_eq!(
            orchestrator
                .trust_device(&execution, Some(&request), &print)
                .unwrap_err(),
            CasError::FlowExpired
        );

        let MfaOutcome::Complete(state) = orchestrator
            .begin(authentication(), &MfaTrigger::default(), Some(&print), None, None)
            .unwrap()
        else {
            panic!("expected bypass");
        };
        assert!(state
            .authentication
            .handlers
            .contains(&trusted::HANDLER_NAME.to_string()));
        assert_eq!(state.authentication.context_class, ACR_MFA);
    }

    #[test]
    fn satisfaction_follows_service_and_context() {
        let service = RegisteredService::new(1, "app", "https://app\\.example\\.org/.*")
            .unwrap()
            .with_mfa_provider(gauth::PROVIDER_ID);
        let plain = authentication();
        let mfa = authentication().with_mfa(gauth::PROVIDER_ID, gauth::HANDLER_NAME);
        assert!(!is_satisfied(&service, &[], &plain));
        assert!(is_satisfied(&service, &[], &mfa));

        let open = RegisteredService::new(2, "open", ".*").unwrap();
        assert!(is_satisfied(&open, &[], &plain));
        assert!(!is_satisfied(&open, &[ACR_MFA.to_string()], &plain));
        let duo = authentication().with_mfa(duo::PROVIDER_ID, duo::HANDLER_NAME);
        assert!(!is_satisfied(&service, &[], &duo));
    }
}

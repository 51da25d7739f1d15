//! Error taxonomy shared by the engine and every protocol adapter.
//!
//! Each variant carries three renderings: a CAS protocol code, an OAuth2 error code and an
//! HTTP status. `Display` is the user-visible message and never reveals account existence.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;

pub const MSG_CONCURRENT_SESSION: &str =
    "You cannot login at this time, since you have another active single sign-on session in progress";
pub const MSG_ACCOUNT_LOCKED: &str = "This account has been locked.";
pub const MSG_BAD_CREDENTIALS: &str = "Invalid credentials.";
pub const MSG_MFA_NOT_REGISTERED: &str = "Your account is not registered";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CasError {
    #[error("Authentication failed")]
    AuthenticationFailed,
    #[error("{}", MSG_BAD_CREDENTIALS)]
    BadCredentials,
    #[error("{}", MSG_ACCOUNT_LOCKED)]
    AccountLocked,
    #[error("This account has been disabled.")]
    AccountDisabled,
    #[error("You must change your password.")]
    MustChangePassword,
    #[error("Too many failed login attempts. Try again later.")]
    Throttled,
    #[error("Application is not authorized to use this service.")]
    ServiceUnauthorized,
    #[error("{}", MSG_CONCURRENT_SESSION)]
    ConcurrentSessionRejected,
    #[error("Ticket '{0}' not recognized")]
    TicketNotFound(String),
    #[error("Ticket '{0}' has expired")]
    TicketExpired(String),
    #[error("Ticket '{0}' has already been used")]
    TicketAlreadyConsumed(String),
    #[error("Ticket '{0}' was not issued from a new login")]
    TicketNotFromNewLogin(String),
    #[error("Ticket '{0}' is not valid for this endpoint")]
    InvalidTicketSpec(String),
    #[error("Ticket was not issued for the presented service")]
    ServiceMismatch,
    #[error("The proxy callback URL is not acceptable")]
    InvalidProxyCallback,
    #[error("The service is not allowed to proxy")]
    UnauthorizedProxy,
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Client authentication failed")]
    InvalidClient,
    #[error("Invalid grant: {0}")]
    InvalidGrant(String),
    #[error("Unsupported grant type")]
    UnsupportedGrantType,
    #[error("Unsupported response type")]
    UnsupportedResponseType,
    #[error("Requested scope is not allowed")]
    InvalidScope,
    #[error("Redirect URI is not registered for this client")]
    InvalidRedirectUri,
    #[error("{}", MSG_MFA_NOT_REGISTERED)]
    MfaRegistrationRequired,
    #[error("Multifactor authentication failed.")]
    MfaFailed,
    #[error("The login flow has expired. Please start again.")]
    FlowExpired,
    #[error("Identity provider '{0}' did not respond in time")]
    ExternalProviderTimeout(String),
    #[error("Identity provider '{0}' rejected the request")]
    ExternalProvider(String),
    #[error("Ticket store is unavailable")]
    StoreUnavailable,
    #[error("Internal error")]
    Internal(String),
}

impl CasError {
    /// CAS protocol error code used in `authenticationFailure` responses.
    #[must_use]
    pub const fn cas_code(&self) -> &'static str {
        match self {
            Self::TicketNotFound(_)
            | Self::TicketExpired(_)
            | Self::TicketAlreadyConsumed(_)
            | Self::TicketNotFromNewLogin(_) => "INVALID_TICKET",
            Self::InvalidTicketSpec(_) => "INVALID_TICKET_SPEC",
            Self::ServiceMismatch => "INVALID_SERVICE",
            Self::ServiceUnauthorized => "UNAUTHORIZED_SERVICE",
            Self::UnauthorizedProxy => "UNAUTHORIZED_SERVICE_PROXY",
            Self::InvalidProxyCallback => "INVALID_PROXY_CALLBACK",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            _ => "INTERNAL_ERROR",
        }
    }

    /// OAuth2 `error` value for token and authorize endpoints.
    #[must_use]
    pub const fn oauth_code(&self) -> &'static str {
        match self {
            Self::InvalidClient => "invalid_client",
            Self::InvalidGrant(_)
            | Self::TicketNotFound(_)
            | Self::TicketExpired(_)
            | Self::TicketAlreadyConsumed(_) => "invalid_grant",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::UnsupportedResponseType => "unsupported_response_type",
            Self::InvalidScope => "invalid_scope",
            Self::ServiceUnauthorized => "unauthorized_client",
            Self::AuthenticationFailed
            | Self::BadCredentials
            | Self::AccountLocked
            | Self::AccountDisabled
            | Self::MustChangePassword
            | Self::ConcurrentSessionRejected
            | Self::MfaFailed => "access_denied",
            Self::StoreUnavailable | Self::ExternalProviderTimeout(_) => "temporarily_unavailable",
            Self::Internal(_) | Self::ExternalProvider(_) => "server_error",
            _ => "invalid_request",
        }
    }

    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::AuthenticationFailed
            | Self::BadCredentials
            | Self::MfaFailed
            | Self::InvalidClient => StatusCode::UNAUTHORIZED,
            Self::AccountLocked => StatusCode::LOCKED,
            Self::AccountDisabled
            | Self::MustChangePassword
            | Self::ServiceUnauthorized
            | Self::UnauthorizedProxy
            | Self::ConcurrentSessionRejected => StatusCode::FORBIDDEN,
            Self::Throttled => StatusCode::TOO_MANY_REQUESTS,
            Self::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::ExternalProviderTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::ExternalProvider(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Failures the caller may retry as-is.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable | Self::ExternalProviderTimeout(_)
        )
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub code: &'static str,
    pub message: String,
}

impl From<&CasError> for ErrorBody {
    fn from(err: &CasError) -> Self {
        Self {
            error: err.oauth_code(),
            code: err.cas_code(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for CasError {
    fn into_response(self) -> Response {
        if let Self::Internal(detail) = &self {
            tracing::error!("Internal error: {}", detail);
        }
        (self.status(), Json(ErrorBody::from(&self))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_message_is_stable() {
        assert_eq!(CasError::AccountLocked.to_string(), "This account has been locked.");
        assert_eq!(CasError::AccountLocked.status(), StatusCode::LOCKED);
    }

    #[test]
    fn concurrent_session_message() {
        assert_eq!(
            CasError::ConcurrentSessionRejected.to_string(),
            MSG_CONCURRENT_SESSION
        );
    }

    #[test]
    fn ticket_failures_map_to_invalid_ticket() {
        for err in [
            CasError::TicketNotFound("ST-1".into()),
            CasError::TicketExpired("ST-1".into()),
            CasError::TicketAlreadyConsumed("ST-1".into()),
        ] {
            assert_eq!(err.cas_code(), "INVALID_TICKET");
            assert_eq!(err.oauth_code(), "invalid_grant");
        }
        assert_eq!(CasError::ServiceMismatch.cas_code(), "INVALID_SERVICE");
    }

    #[test]
    fn retryable_failures() {
        assert!(CasError::StoreUnavailable.is_retryable());
        assert!(CasError::ExternalProviderTimeout("duo".into()).is_retryable());
        assert!(!CasError::BadCredentials.is_retryable());
        assert_eq!(
            CasError::StoreUnavailable.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
